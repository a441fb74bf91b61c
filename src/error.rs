//! Error types for the ledger transaction client

use thiserror::Error;

/// Ledger error code for a nonce that is stale or out of sequence
pub const INVALID_NONCE_CODE: i64 = 21104;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Nonce rejected by ledger (code {code}): {message}")]
    Nonce { code: i64, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    /// The request never left the client, so another transport may carry it
    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),

    /// The request may have reached the ledger; its nonce must not be reused
    #[error("Delivery unknown for {operation}: {reason}")]
    DeliveryUnknown { operation: String, reason: String },

    #[error("Rate limited by ledger, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Ledger error (code {code}): {message}")]
    Ledger { code: i64, message: String },

    #[error("Transaction {hash} rejected: {reason}")]
    Rejected { hash: String, reason: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Confirmation of {hash} timed out after {waited_ms}ms; outcome unknown")]
    ConfirmationTimeout { hash: String, waited_ms: u64 },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Classify an error returned by the ledger as a nonce error or a business rejection
    pub fn from_ledger(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == INVALID_NONCE_CODE || is_nonce_message(&message) {
            ClientError::Nonce { code, message }
        } else {
            ClientError::Ledger { code, message }
        }
    }

    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::Http(_)
                | ClientError::Stream(_)
                | ClientError::StreamUnavailable(_)
                | ClientError::Timeout { .. }
                | ClientError::RateLimited { .. }
        )
    }

    /// Check if a submission may have reached the ledger despite failing locally
    pub fn is_delivery_unknown(&self) -> bool {
        matches!(
            self,
            ClientError::DeliveryUnknown { .. }
                | ClientError::Timeout { .. }
                | ClientError::Stream(_)
        )
    }

    /// Check if the ledger rejected the nonce (triggers one hard refresh and retry)
    pub fn is_nonce_error(&self) -> bool {
        match self {
            ClientError::Nonce { .. } => true,
            ClientError::Stream(message) | ClientError::Transport(message) => {
                is_nonce_message(message)
            }
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            ClientError::Signing(_) | ClientError::Config(_) | ClientError::Internal(_)
        )
    }
}

fn is_nonce_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("invalid nonce")
        || lower.contains("nonce too low")
        || lower.contains("nonce mismatch")
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_code_classification() {
        assert!(ClientError::from_ledger(INVALID_NONCE_CODE, "bad").is_nonce_error());
        assert!(ClientError::from_ledger(21000, "Invalid Nonce: expected 7").is_nonce_error());

        let err = ClientError::from_ledger(21701, "insufficient margin");
        assert!(!err.is_nonce_error());
        assert!(!err.is_retryable());
        assert!(matches!(err, ClientError::Ledger { code: 21701, .. }));
    }

    #[test]
    fn test_delivery_unknown_classification() {
        let err = ClientError::DeliveryUnknown {
            operation: "POST /api/v1/sendTx".to_string(),
            reason: "body read timed out".to_string(),
        };
        assert!(err.is_delivery_unknown());
        assert!(!err.is_retryable());
        assert!(!ClientError::RateLimited { retry_after_ms: 10 }.is_delivery_unknown());
        assert!(!ClientError::Transport("connection refused".to_string()).is_delivery_unknown());
    }

    #[test]
    fn test_stream_message_with_nonce_text() {
        let err = ClientError::Stream("ws sendtx rejected: invalid nonce".to_string());
        assert!(err.is_nonce_error());
        assert!(err.is_retryable());
    }
}
