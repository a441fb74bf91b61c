//! Confirmation tracking for submitted transactions
//!
//! Status flow on the ledger:
//! - PENDING -> QUEUED -> COMMITTED -> EXECUTED | FAILED | REJECTED
//! - COMMITTED alone is not conclusive: the embedded event payload decides
//!   whether the transaction will execute or is failing downstream

use super::types::{TransactionRecord, TxStatus};
use super::LedgerApi;
use crate::config::ConfirmConfig;
use crate::error::{ClientError, ClientResult};

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

const GENERIC_FAILURE: &str = "transaction failed without a reason";

/// Classification of one observed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Success,
    Failure(String),
}

/// Polls the ledger until a hash reaches a terminal state
pub struct ConfirmationWatcher {
    ledger: Arc<dyn LedgerApi>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ConfirmationWatcher {
    pub fn new(ledger: Arc<dyn LedgerApi>, config: &ConfirmConfig) -> Self {
        Self {
            ledger,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    /// Wait for a terminal state using the configured timeout
    pub async fn wait(&self, hash: &str) -> ClientResult<TransactionRecord> {
        self.wait_with_timeout(hash, self.timeout).await
    }

    /// Wait for a terminal state
    ///
    /// Returns the final record on success, `Rejected` when the ledger marks
    /// the transaction failed, and `ConfirmationTimeout` when the outcome is
    /// still unknown at the deadline.
    pub async fn wait_with_timeout(
        &self,
        hash: &str,
        limit: Duration,
    ) -> ClientResult<TransactionRecord> {
        let started = Instant::now();
        let deadline = started + limit;
        let mut last_status: Option<TxStatus> = None;

        loop {
            match timeout_at(deadline, self.ledger.get_transaction(hash)).await {
                Err(_) => break,
                Ok(Ok(Some(record))) => {
                    if last_status != Some(record.status) {
                        debug!("Transaction {} is {}", hash, record.status.as_str());
                        last_status = Some(record.status);
                    }
                    match classify(&record) {
                        Resolution::Success => {
                            info!(
                                "Transaction {} confirmed as {} after {:?}",
                                hash,
                                record.status.as_str(),
                                started.elapsed()
                            );
                            crate::metrics::record_confirmation("success", started.elapsed());
                            return Ok(record);
                        }
                        Resolution::Failure(reason) => {
                            warn!("Transaction {} failed on ledger: {}", hash, reason);
                            crate::metrics::record_confirmation("rejected", started.elapsed());
                            return Err(ClientError::Rejected {
                                hash: hash.to_string(),
                                reason,
                            });
                        }
                        Resolution::Pending => {}
                    }
                }
                // Not indexed yet
                Ok(Ok(None)) => debug!("Transaction {} not found yet", hash),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!("Status query for {} failed, will retry: {}", hash, e)
                }
                Ok(Err(e)) => return Err(e),
            }

            let next_poll = Instant::now() + self.poll_interval;
            if next_poll >= deadline {
                sleep_until(deadline).await;
                break;
            }
            sleep_until(next_poll).await;
        }

        warn!(
            "Confirmation of {} timed out (last status: {:?})",
            hash,
            last_status.map(TxStatus::as_str)
        );
        crate::metrics::record_confirmation("timeout", started.elapsed());

        Err(ClientError::ConfirmationTimeout {
            hash: hash.to_string(),
            waited_ms: limit.as_millis() as u64,
        })
    }
}

/// Decide whether a record is terminal
pub fn classify(record: &TransactionRecord) -> Resolution {
    match record.status {
        TxStatus::Executed => Resolution::Success,
        TxStatus::Failed | TxStatus::Rejected => Resolution::Failure(failure_reason(record)),
        TxStatus::Committed => {
            let event = record.event_info.as_ref().and_then(decode_embedded);
            match event {
                Some(event) => match actual_error(&event) {
                    Some(reason) => Resolution::Failure(reason),
                    None if is_empty_payload(&event) => Resolution::Pending,
                    None => Resolution::Success,
                },
                None => Resolution::Pending,
            }
        }
        TxStatus::Pending | TxStatus::Queued => Resolution::Pending,
    }
}

/// Human-readable reason for a failed record
///
/// Priority: response message, the event's actual error, generic error
/// fields of the info payload, then a generic message.
pub fn failure_reason(record: &TransactionRecord) -> String {
    if let Some(message) = record.message.as_deref().filter(|m| !m.trim().is_empty()) {
        return message.to_string();
    }

    if let Some(reason) = record
        .event_info
        .as_ref()
        .and_then(decode_embedded)
        .and_then(|event| actual_error(&event))
    {
        return reason;
    }

    if let Some(reason) = record
        .info
        .as_ref()
        .and_then(decode_embedded)
        .and_then(|info| generic_error(&info))
    {
        return reason;
    }

    GENERIC_FAILURE.to_string()
}

/// Embedded payloads arrive either as objects or as JSON strings
fn decode_embedded(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => serde_json::from_str::<Value>(s).ok(),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

fn actual_error(event: &Value) -> Option<String> {
    let raw = event.get("ae").or_else(|| event.get("actual_error"))?;
    match raw {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(nested @ Value::Object(_)) => {
                generic_error(&nested).or_else(|| Some(nested.to_string()))
            }
            _ => Some(s.clone()),
        },
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        nested @ Value::Object(_) => generic_error(nested).or_else(|| Some(nested.to_string())),
        other => Some(other.to_string()),
    }
}

fn generic_error(payload: &Value) -> Option<String> {
    ["error", "err", "message", "msg"].iter().find_map(|key| {
        match payload.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Object(inner) => inner
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    })
}
