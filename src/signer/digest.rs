//! In-process engine producing canonical payloads with a keccak digest
//!
//! No key material is involved. Used for dry runs and local testing where
//! the ledger side is simulated.

use super::{EngineOutput, SignRequest, SigningEngine};
use crate::error::{ClientError, ClientResult};
use crate::ledger::TxType;

use async_trait::async_trait;
use serde_json::Value;
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;

pub struct DigestEngine;

impl DigestEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DigestEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SigningEngine for DigestEngine {
    fn name(&self) -> &'static str {
        "digest"
    }

    async fn sign(&self, request: &SignRequest) -> ClientResult<EngineOutput> {
        let fields = match &request.params {
            Value::Object(map) => map.clone(),
            Value::Null => Default::default(),
            other => {
                return Err(ClientError::Signing(format!(
                    "params must be an object, got {}",
                    other
                )))
            }
        };

        // Sorted keys give one byte representation per transaction
        let mut body: BTreeMap<String, Value> = fields.into_iter().collect();
        let ctx = &request.context;
        body.insert("AccountIndex".to_string(), ctx.account_index.into());
        body.insert("ApiKeyIndex".to_string(), ctx.api_key_index.into());
        body.insert("Nonce".to_string(), ctx.nonce.into());
        body.insert("ExpiredAt".to_string(), ctx.expired_at.into());

        let tx_info = serde_json::to_string(&body)?;

        let mut hasher = Keccak256::new();
        hasher.update([request.tx_type.code()]);
        hasher.update(tx_info.as_bytes());
        let tx_hash = hex::encode(hasher.finalize());

        Ok(EngineOutput {
            tx_type: request.tx_type.code(),
            message_to_sign: cosign_message(request, &body),
            tx_info,
            tx_hash,
            nonce: Some(request.context.nonce),
            error: None,
        })
    }
}

fn cosign_message(request: &SignRequest, body: &BTreeMap<String, Value>) -> Option<String> {
    let ctx = &request.context;
    let field = |name: &str| body.get(name).map(Value::to_string).unwrap_or_default();

    match request.tx_type {
        TxType::Transfer => Some(format!(
            "Transfer\n\nnonce: {}\nfrom: {} (key {})\nto: {}\namount: {}\nfee: {}\nmemo: {}\nOnly sign this message for a trusted client!",
            ctx.nonce,
            ctx.account_index,
            ctx.api_key_index,
            field("ToAccountIndex"),
            field("USDCAmount"),
            field("Fee"),
            field("Memo").trim_matches('"'),
        )),
        TxType::ChangePubKey => Some(format!(
            "Register API key\n\npubkey: {}\nnonce: {}\naccount index: {}\napi key index: {}\nOnly sign this message for a trusted client!",
            field("PubKey").trim_matches('"'),
            ctx.nonce,
            ctx.account_index,
            ctx.api_key_index,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::TxContext;
    use serde_json::json;

    fn request(tx_type: TxType, params: Value) -> SignRequest {
        SignRequest {
            tx_type,
            context: TxContext {
                account_index: 1,
                api_key_index: 2,
                nonce: 3,
                expired_at: 4_000,
            },
            params,
        }
    }

    #[tokio::test]
    async fn test_identical_requests_hash_identically() {
        let engine = DigestEngine::new();
        let a = engine
            .sign(&request(TxType::CancelOrder, json!({"MarketIndex": 0, "Index": 7})))
            .await
            .unwrap();
        let b = engine
            .sign(&request(TxType::CancelOrder, json!({"Index": 7, "MarketIndex": 0})))
            .await
            .unwrap();

        assert_eq!(a.tx_info, b.tx_info);
        assert_eq!(a.tx_hash, b.tx_hash);
        assert_eq!(a.tx_hash.len(), 64);
        assert!(a.message_to_sign.is_none());
    }

    #[tokio::test]
    async fn test_nonce_changes_hash() {
        let engine = DigestEngine::new();
        let first = engine
            .sign(&request(TxType::Withdraw, json!({"USDCAmount": 5})))
            .await
            .unwrap();
        let mut req = request(TxType::Withdraw, json!({"USDCAmount": 5}));
        req.context.nonce = 4;
        let second = engine.sign(&req).await.unwrap();

        assert_ne!(first.tx_hash, second.tx_hash);
    }

    #[tokio::test]
    async fn test_key_rotation_has_cosign_message() {
        let out = DigestEngine::new()
            .sign(&request(TxType::ChangePubKey, json!({"PubKey": "0xabcd"})))
            .await
            .unwrap();
        let message = out.message_to_sign.unwrap();
        assert!(message.contains("pubkey: 0xabcd"));
        assert!(message.contains("nonce: 3"));
    }
}
