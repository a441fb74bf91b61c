//! Wire-level types shared by both transports

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ledger success code
pub const CODE_OK: i64 = 200;

/// Ledger code returned while a hash has not been indexed yet
pub const TX_NOT_FOUND_CODE: i64 = 21500;

/// Transaction type codes understood by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TxType {
    ChangePubKey,
    CreateSubAccount,
    CreatePublicPool,
    UpdatePublicPool,
    Transfer,
    Withdraw,
    CreateOrder,
    CancelOrder,
    CancelAllOrders,
    ModifyOrder,
    MintShares,
    BurnShares,
    UpdateLeverage,
    CreateGroupedOrders,
    UpdateMargin,
}

impl TxType {
    pub fn code(self) -> u8 {
        match self {
            TxType::ChangePubKey => 8,
            TxType::CreateSubAccount => 9,
            TxType::CreatePublicPool => 10,
            TxType::UpdatePublicPool => 11,
            TxType::Transfer => 12,
            TxType::Withdraw => 13,
            TxType::CreateOrder => 14,
            TxType::CancelOrder => 15,
            TxType::CancelAllOrders => 16,
            TxType::ModifyOrder => 17,
            TxType::MintShares => 18,
            TxType::BurnShares => 19,
            TxType::UpdateLeverage => 20,
            TxType::CreateGroupedOrders => 28,
            TxType::UpdateMargin => 29,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TxType::ChangePubKey => "change_pub_key",
            TxType::CreateSubAccount => "create_sub_account",
            TxType::CreatePublicPool => "create_public_pool",
            TxType::UpdatePublicPool => "update_public_pool",
            TxType::Transfer => "transfer",
            TxType::Withdraw => "withdraw",
            TxType::CreateOrder => "create_order",
            TxType::CancelOrder => "cancel_order",
            TxType::CancelAllOrders => "cancel_all_orders",
            TxType::ModifyOrder => "modify_order",
            TxType::MintShares => "mint_shares",
            TxType::BurnShares => "burn_shares",
            TxType::UpdateLeverage => "update_leverage",
            TxType::CreateGroupedOrders => "create_grouped_orders",
            TxType::UpdateMargin => "update_margin",
        }
    }

    /// Operations whose payload must be co-signed by an external wallet
    pub fn requires_cosignature(self) -> bool {
        matches!(self, TxType::ChangePubKey | TxType::Transfer)
    }
}

impl From<TxType> for u8 {
    fn from(value: TxType) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for TxType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            8 => TxType::ChangePubKey,
            9 => TxType::CreateSubAccount,
            10 => TxType::CreatePublicPool,
            11 => TxType::UpdatePublicPool,
            12 => TxType::Transfer,
            13 => TxType::Withdraw,
            14 => TxType::CreateOrder,
            15 => TxType::CancelOrder,
            16 => TxType::CancelAllOrders,
            17 => TxType::ModifyOrder,
            18 => TxType::MintShares,
            19 => TxType::BurnShares,
            20 => TxType::UpdateLeverage,
            28 => TxType::CreateGroupedOrders,
            29 => TxType::UpdateMargin,
            other => return Err(format!("unknown transaction type {}", other)),
        })
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Remote transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Queued,
    Committed,
    Executed,
    Failed,
    Rejected,
}

impl TxStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => TxStatus::Pending,
            1 => TxStatus::Queued,
            2 => TxStatus::Committed,
            3 => TxStatus::Executed,
            4 => TxStatus::Failed,
            5 => TxStatus::Rejected,
            _ => return None,
        })
    }

    pub fn code(self) -> i64 {
        match self {
            TxStatus::Pending => 0,
            TxStatus::Queued => 1,
            TxStatus::Committed => 2,
            TxStatus::Executed => 3,
            TxStatus::Failed => 4,
            TxStatus::Rejected => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Queued => "queued",
            TxStatus::Committed => "committed",
            TxStatus::Executed => "executed",
            TxStatus::Failed => "failed",
            TxStatus::Rejected => "rejected",
        }
    }
}

/// Status record for one transaction hash
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub hash: String,
    pub tx_type: Option<u8>,
    pub status: TxStatus,
    /// Response-level message, when the ledger sends one
    pub message: Option<String>,
    /// Embedded transaction info, possibly string-encoded JSON
    pub info: Option<Value>,
    /// Embedded execution event, possibly string-encoded JSON
    pub event_info: Option<Value>,
    pub block_height: Option<i64>,
    pub queued_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(hash: impl Into<String>, status: TxStatus) -> Self {
        Self {
            hash: hash.into(),
            tx_type: None,
            status,
            message: None,
            info: None,
            event_info: None,
            block_height: None,
            queued_at: None,
            executed_at: None,
            observed_at: Utc::now(),
        }
    }
}

/// Raw `get-transaction` body
#[derive(Debug, Clone, Deserialize)]
pub struct TxQueryResponse {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, rename = "type")]
    pub tx_type: Option<u8>,
    #[serde(default)]
    pub info: Option<Value>,
    #[serde(default)]
    pub event_info: Option<Value>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub block_height: Option<i64>,
    #[serde(default)]
    pub queued_at: Option<i64>,
    #[serde(default)]
    pub executed_at: Option<i64>,
}

impl TxQueryResponse {
    /// Convert into a record; `None` when the ledger has not indexed the hash
    pub fn into_record(self, requested_hash: &str) -> Option<TransactionRecord> {
        if matches!(self.code, Some(code) if code == TX_NOT_FOUND_CODE) {
            return None;
        }
        let status = TxStatus::from_code(self.status?)?;

        let message = self
            .message
            .filter(|m| !m.is_empty() && self.code.map_or(true, |c| c != CODE_OK));

        Some(TransactionRecord {
            hash: self.hash.unwrap_or_else(|| requested_hash.to_string()),
            tx_type: self.tx_type,
            status,
            message,
            info: self.info.filter(|v| !v.is_null()),
            event_info: self.event_info.filter(|v| !v.is_null()),
            block_height: self.block_height,
            queued_at: self.queued_at.and_then(millis_to_datetime),
            executed_at: self.executed_at.and_then(millis_to_datetime),
            observed_at: Utc::now(),
        })
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Raw `next-nonce` body
#[derive(Debug, Clone, Deserialize)]
pub struct NextNonceResponse {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub nonce: Option<i64>,
}

/// Raw `send-transaction` body
#[derive(Debug, Clone, Deserialize)]
pub struct SendTxResponse {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

/// Raw `send-transaction-batch` body
#[derive(Debug, Clone, Deserialize)]
pub struct SendTxBatchResponse {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tx_hash: Vec<String>,
}

/// Per-entry outcome of a batch submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntryResult {
    pub hash: Option<String>,
    pub error: Option<String>,
}

impl BatchEntryResult {
    pub fn accepted(hash: impl Into<String>) -> Self {
        Self {
            hash: Some(hash.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            hash: None,
            error: Some(error.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.error.is_none() && self.hash.as_deref().is_some_and(|h| !h.is_empty())
    }
}
