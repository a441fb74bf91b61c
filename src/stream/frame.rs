//! Streaming wire frames
//!
//! Outbound: `{"type": "jsonapi/sendtx", "data": {"id", "tx_type", "tx_info"}}`
//! and the batch variant with parallel `tx_types`/`tx_infos` arrays.
//!
//! Inbound frames are decoded once into [`InboundFrame`] so the session loop
//! only matches on variants.

use crate::error::ClientError;

use serde_json::{json, Value};

pub const SEND_TX: &str = "jsonapi/sendtx";
pub const SEND_TX_BATCH: &str = "jsonapi/sendtxbatch";

/// Largest batch the ledger accepts on the stream
pub const MAX_BATCH_SIZE: usize = 50;

/// Encoding of the batch arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFormat {
    /// Native JSON arrays
    Array,
    /// Arrays serialized into strings, accepted by older gateways
    Encoded,
}

/// Signed payloads travel as objects; anything unparsable is passed through as text
fn payload_value(tx_info: &str) -> Value {
    serde_json::from_str::<Value>(tx_info)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::String(tx_info.to_string()))
}

pub fn send_tx(id: &str, tx_type: u8, tx_info: &str) -> String {
    json!({
        "type": SEND_TX,
        "data": {
            "id": id,
            "tx_type": tx_type,
            "tx_info": payload_value(tx_info),
        }
    })
    .to_string()
}

pub fn send_tx_batch(id: &str, tx_types: &[u8], tx_infos: &[String], format: BatchFormat) -> String {
    let infos: Vec<Value> = tx_infos.iter().map(|i| payload_value(i)).collect();
    let (types, infos) = match format {
        BatchFormat::Array => (json!(tx_types), Value::Array(infos)),
        BatchFormat::Encoded => (
            Value::String(json!(tx_types).to_string()),
            Value::String(Value::Array(infos).to_string()),
        ),
    };

    json!({
        "type": SEND_TX_BATCH,
        "data": {
            "id": id,
            "tx_types": types,
            "tx_infos": infos,
        }
    })
    .to_string()
}

pub fn pong() -> String {
    json!({"type": "pong"}).to_string()
}

/// Error reported by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<i64>,
    pub message: String,
}

impl RemoteError {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self {
                code: None,
                message: s.clone(),
            },
            Value::Object(map) => Self {
                code: map.get("code").and_then(Value::as_i64),
                message: map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string()),
            },
            other => Self {
                code: None,
                message: other.to_string(),
            },
        }
    }

    /// Errors sent by the ledger are rejections, classified by code and text
    pub fn into_error(self) -> ClientError {
        ClientError::from_ledger(self.code.unwrap_or_default(), self.message)
    }
}

/// Outcome carried by a correlated reply
#[derive(Debug, Clone, PartialEq)]
pub enum StreamReply {
    Ok(Value),
    Err(RemoteError),
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Ping,
    Pong,
    Connected,
    /// Reply naming its request id
    Correlated { id: String, reply: StreamReply },
    /// Result with a hash but no request id
    UncorrelatedResult(Value),
    /// Error with no request id
    UncorrelatedError(RemoteError),
    Other(Value),
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let message: Value = serde_json::from_str(text)?;

        match message.get("type").and_then(Value::as_str) {
            Some(t) if t.eq_ignore_ascii_case("ping") => return Ok(InboundFrame::Ping),
            Some(t) if t.eq_ignore_ascii_case("pong") => return Ok(InboundFrame::Pong),
            Some("connected") => return Ok(InboundFrame::Connected),
            _ => {}
        }

        let id = message
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let error = match message.get("error") {
            Some(Value::Null) | None => None,
            Some(err) => Some(RemoteError::from_value(err)),
        };
        let failed = message.get("success").and_then(Value::as_bool) == Some(false);

        let reply = match (error, failed) {
            (Some(err), _) => StreamReply::Err(err),
            (None, true) => StreamReply::Err(RemoteError {
                code: message.get("code").and_then(Value::as_i64),
                message: message
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string(),
            }),
            (None, false) => {
                StreamReply::Ok(message.get("result").cloned().unwrap_or_else(|| message.clone()))
            }
        };

        Ok(match (id, reply) {
            (Some(id), reply) => InboundFrame::Correlated { id, reply },
            (None, StreamReply::Err(err)) => InboundFrame::UncorrelatedError(err),
            (None, StreamReply::Ok(value)) if carries_hash(&value) => {
                InboundFrame::UncorrelatedResult(value)
            }
            (None, StreamReply::Ok(_)) => InboundFrame::Other(message),
        })
    }
}

fn carries_hash(value: &Value) -> bool {
    ["hash", "tx_hash"].iter().any(|k| value.get(*k).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_tx_embeds_payload_object() {
        let frame: Value = serde_json::from_str(&send_tx("tx_1_1", 14, r#"{"Nonce":5}"#)).unwrap();
        assert_eq!(frame["type"], SEND_TX);
        assert_eq!(frame["data"]["tx_info"]["Nonce"], 5);
        assert_eq!(frame["data"]["tx_type"], 14);
    }

    #[test]
    fn test_encoded_batch_uses_strings() {
        let infos = vec![r#"{"Nonce":1}"#.to_string()];
        let frame: Value =
            serde_json::from_str(&send_tx_batch("b", &[15], &infos, BatchFormat::Encoded)).unwrap();
        assert_eq!(frame["data"]["tx_types"], "[15]");
        assert_eq!(frame["data"]["tx_infos"], r#"[{"Nonce":1}]"#);
    }

    #[test]
    fn test_decode_control_frames() {
        assert_eq!(InboundFrame::decode(r#"{"type":"ping"}"#).unwrap(), InboundFrame::Ping);
        assert_eq!(InboundFrame::decode(r#"{"type":"PONG"}"#).unwrap(), InboundFrame::Pong);
        assert_eq!(
            InboundFrame::decode(r#"{"type":"connected","session_id":"x"}"#).unwrap(),
            InboundFrame::Connected
        );
    }

    #[test]
    fn test_decode_replies() {
        match InboundFrame::decode(r#"{"id":"tx_1_2","success":true,"result":{"hash":"0xa"}}"#)
            .unwrap()
        {
            InboundFrame::Correlated {
                id,
                reply: StreamReply::Ok(v),
            } => {
                assert_eq!(id, "tx_1_2");
                assert_eq!(v["hash"], "0xa");
            }
            other => panic!("unexpected frame {:?}", other),
        }

        match InboundFrame::decode(r#"{"id":"tx_1_3","error":{"code":21104,"message":"invalid nonce"}}"#)
            .unwrap()
        {
            InboundFrame::Correlated {
                reply: StreamReply::Err(err),
                ..
            } => {
                assert_eq!(err.code, Some(21104));
                assert!(err.into_error().is_nonce_error());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_bare_records() {
        assert!(matches!(
            InboundFrame::decode(r#"{"code":200,"hash":"0xb"}"#).unwrap(),
            InboundFrame::UncorrelatedResult(_)
        ));
        assert!(matches!(
            InboundFrame::decode(r#"{"error":"margin too low"}"#).unwrap(),
            InboundFrame::UncorrelatedError(RemoteError { code: None, .. })
        ));
        assert!(matches!(
            InboundFrame::decode(r#"{"channel":"market_stats"}"#).unwrap(),
            InboundFrame::Other(_)
        ));
    }
}
