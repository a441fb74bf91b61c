//! Ledger module - remote operations consumed by the pipeline
//!
//! This module provides:
//! - The `LedgerApi` seam (next nonce, send, send batch, query)
//! - A request/response implementation with endpoint failover
//! - Confirmation tracking for submitted hashes

pub mod confirm;
pub mod http;
pub mod types;

pub use confirm::{ConfirmationWatcher, Resolution};
pub use http::HttpLedger;
pub use types::{BatchEntryResult, TransactionRecord, TxStatus, TxType};

use crate::error::ClientResult;

use async_trait::async_trait;

/// Remote operations the pipeline depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerApi: Send + Sync {
    /// Authoritative next nonce for an (account, key) pair
    async fn next_nonce(&self, account_index: i64, api_key_index: u8) -> ClientResult<i64>;

    /// Submit one signed transaction, returning its hash
    async fn send_tx(&self, tx_type: u8, tx_info: &str) -> ClientResult<String>;

    /// Submit independent transactions together; results are per entry
    async fn send_tx_batch(
        &self,
        tx_types: &[u8],
        tx_infos: &[String],
    ) -> ClientResult<Vec<BatchEntryResult>>;

    /// Status record for a hash, `None` while it is not indexed yet
    async fn get_transaction(&self, hash: &str) -> ClientResult<Option<TransactionRecord>>;
}
