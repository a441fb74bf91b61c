//! Typed inputs for each signed operation
//!
//! Every amount is already scaled to integer base units. Field names
//! serialize to the ledger's PascalCase transaction body.

use crate::error::{ClientError, ClientResult};

use serde::{Deserialize, Serialize, Serializer};

/// Expiry sentinel meaning "use the default window"; must be resolved before signing
pub const DEFAULT_EXPIRY: i64 = -1;

/// Expiry for orders that never rest on the book
pub const NIL_ORDER_EXPIRY: i64 = 0;

/// Key index reserved by the ledger
pub const RESERVED_API_KEY: u8 = 255;

/// Resting orders live 28 days unless told otherwise
pub const DEFAULT_ORDER_EXPIRY_WINDOW_MS: i64 = 28 * 24 * 60 * 60 * 1000;

/// Signatures are valid for 10 minutes unless told otherwise
pub const DEFAULT_TX_EXPIRY_WINDOW_MS: i64 = 10 * 60 * 1000;

/// Absolute transaction expiry for a possibly-sentinel value
pub fn resolve_tx_expiry(expired_at: i64, now_ms: i64) -> i64 {
    if expired_at == DEFAULT_EXPIRY {
        now_ms + DEFAULT_TX_EXPIRY_WINDOW_MS
    } else {
        expired_at
    }
}

macro_rules! u8_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "u8", try_from = "u8")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> Self {
                value.code()
            }
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(code: u8) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(format!("unknown {} {}", stringify!($name), other)),
                }
            }
        }
    };
}

u8_enum!(
    /// Order kind
    OrderType {
        Limit = 0,
        Market = 1,
        StopLoss = 2,
        StopLossLimit = 3,
        TakeProfit = 4,
        TakeProfitLimit = 5,
        Twap = 6,
    }
);

impl OrderType {
    /// Stop-loss and take-profit kinds that only fire on a trigger price
    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            OrderType::StopLoss
                | OrderType::StopLossLimit
                | OrderType::TakeProfit
                | OrderType::TakeProfitLimit
        )
    }

    pub fn is_stop_loss(self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::StopLossLimit)
    }

    pub fn is_take_profit(self) -> bool {
        matches!(self, OrderType::TakeProfit | OrderType::TakeProfitLimit)
    }
}

u8_enum!(
    TimeInForce {
        ImmediateOrCancel = 0,
        GoodTillTime = 1,
        PostOnly = 2,
    }
);

u8_enum!(
    /// Mode of a cancel-all request
    CancelAllMode {
        Immediate = 0,
        Scheduled = 1,
        Abort = 2,
    }
);

u8_enum!(
    MarginMode {
        Cross = 0,
        Isolated = 1,
    }
);

u8_enum!(
    MarginDirection {
        Remove = 0,
        Add = 1,
    }
);

fn bool_as_u8<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

/// Fields common to every transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxContext {
    pub account_index: i64,
    pub api_key_index: u8,
    pub nonce: i64,
    /// Absolute expiry of the signature in unix milliseconds
    pub expired_at: i64,
}

impl TxContext {
    pub fn validate(&self) -> ClientResult<()> {
        if self.account_index < 0 {
            return Err(ClientError::Validation(format!(
                "account index {} is negative",
                self.account_index
            )));
        }
        if self.api_key_index == RESERVED_API_KEY {
            return Err(ClientError::Validation(
                "api key index 255 is reserved".to_string(),
            ));
        }
        if self.nonce < 0 {
            return Err(ClientError::Validation(format!(
                "nonce {} is negative",
                self.nonce
            )));
        }
        if self.expired_at == DEFAULT_EXPIRY {
            return Err(ClientError::Validation(
                "transaction expiry sentinel must be resolved before signing".to_string(),
            ));
        }
        if self.expired_at <= 0 {
            return Err(ClientError::Validation(format!(
                "transaction expiry {} is not an absolute time",
                self.expired_at
            )));
        }
        Ok(())
    }
}

/// One order, standalone or as a leg of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderParams {
    pub market_index: u8,
    pub client_order_index: i64,
    pub base_amount: i64,
    pub price: u32,
    #[serde(serialize_with = "bool_as_u8")]
    pub is_ask: bool,
    #[serde(rename = "Type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(serialize_with = "bool_as_u8")]
    pub reduce_only: bool,
    pub trigger_price: u32,
    pub order_expiry: i64,
}

impl OrderParams {
    /// Replace the expiry sentinel; immediate orders never rest and take no expiry
    pub fn resolve_expiry(&mut self, now_ms: i64) {
        if self.order_expiry == DEFAULT_EXPIRY {
            self.order_expiry = match self.time_in_force {
                TimeInForce::ImmediateOrCancel => NIL_ORDER_EXPIRY,
                _ => now_ms + DEFAULT_ORDER_EXPIRY_WINDOW_MS,
            };
        }
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.client_order_index < 0 {
            return Err(ClientError::Validation(
                "client order index must not be negative".to_string(),
            ));
        }
        if self.base_amount < 0 {
            return Err(ClientError::Validation(
                "base amount must not be negative".to_string(),
            ));
        }
        if self.order_expiry == DEFAULT_EXPIRY {
            return Err(ClientError::Validation(
                "order expiry sentinel must be resolved before signing".to_string(),
            ));
        }
        if self.order_expiry < NIL_ORDER_EXPIRY {
            return Err(ClientError::Validation(format!(
                "order expiry {} is invalid",
                self.order_expiry
            )));
        }
        if self.order_type.is_conditional() && self.trigger_price == 0 {
            return Err(ClientError::Validation(
                "conditional orders need a trigger price".to_string(),
            ));
        }
        if self.order_type == OrderType::Limit && self.price == 0 {
            return Err(ClientError::Validation(
                "limit orders need a price".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelOrderParams {
    pub market_index: u8,
    #[serde(rename = "Index")]
    pub order_index: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyOrderParams {
    pub market_index: u8,
    #[serde(rename = "Index")]
    pub order_index: i64,
    pub base_amount: i64,
    pub price: u32,
    pub trigger_price: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelAllParams {
    #[serde(rename = "TimeInForce")]
    pub mode: CancelAllMode,
    /// Scheduled cancel time in unix milliseconds, 0 unless scheduled
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferParams {
    pub to_account_index: i64,
    #[serde(rename = "USDCAmount")]
    pub usdc_amount: i64,
    pub fee: i64,
    /// Hex encoded, at most 32 bytes
    pub memo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WithdrawParams {
    #[serde(rename = "USDCAmount")]
    pub usdc_amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateLeverageParams {
    pub market_index: u8,
    pub initial_margin_fraction: u16,
    pub margin_mode: MarginMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateMarginParams {
    pub market_index: u8,
    #[serde(rename = "USDCAmount")]
    pub usdc_amount: i64,
    pub direction: MarginDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreatePublicPoolParams {
    pub operator_fee: i64,
    pub initial_total_shares: i64,
    pub min_operator_share_rate: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdatePublicPoolParams {
    pub public_pool_index: i64,
    pub status: u8,
    pub operator_fee: i64,
    pub min_operator_share_rate: i64,
}

/// Mint or burn pool shares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoolSharesParams {
    pub public_pool_index: i64,
    pub share_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangePubKeyParams {
    /// Hex encoded public key of the new API key
    pub pub_key: String,
}

fn non_negative(name: &str, value: i64) -> ClientResult<()> {
    if value < 0 {
        return Err(ClientError::Validation(format!(
            "{} must not be negative",
            name
        )));
    }
    Ok(())
}

impl TransferParams {
    pub fn validate(&self) -> ClientResult<()> {
        non_negative("destination account", self.to_account_index)?;
        non_negative("fee", self.fee)?;
        if self.usdc_amount <= 0 {
            return Err(ClientError::Validation(
                "transfer amount must be positive".to_string(),
            ));
        }
        let memo = self.memo.trim_start_matches("0x");
        match hex::decode(memo) {
            Ok(bytes) if bytes.len() <= 32 => Ok(()),
            Ok(_) => Err(ClientError::Validation(
                "memo longer than 32 bytes".to_string(),
            )),
            Err(e) => Err(ClientError::Validation(format!("memo is not hex: {}", e))),
        }
    }
}

impl WithdrawParams {
    pub fn validate(&self) -> ClientResult<()> {
        if self.usdc_amount <= 0 {
            return Err(ClientError::Validation(
                "withdraw amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ModifyOrderParams {
    pub fn validate(&self) -> ClientResult<()> {
        non_negative("order index", self.order_index)?;
        non_negative("base amount", self.base_amount)
    }
}

impl CancelAllParams {
    pub fn validate(&self) -> ClientResult<()> {
        match self.mode {
            CancelAllMode::Scheduled if self.time <= 0 => Err(ClientError::Validation(
                "scheduled cancel-all needs an absolute time".to_string(),
            )),
            _ => non_negative("cancel-all time", self.time),
        }
    }
}

impl UpdateMarginParams {
    pub fn validate(&self) -> ClientResult<()> {
        if self.usdc_amount <= 0 {
            return Err(ClientError::Validation(
                "margin amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl UpdateLeverageParams {
    pub fn validate(&self) -> ClientResult<()> {
        if self.initial_margin_fraction == 0 {
            return Err(ClientError::Validation(
                "initial margin fraction must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl CreatePublicPoolParams {
    pub fn validate(&self) -> ClientResult<()> {
        non_negative("operator fee", self.operator_fee)?;
        non_negative("initial shares", self.initial_total_shares)?;
        non_negative("operator share rate", self.min_operator_share_rate)
    }
}

impl UpdatePublicPoolParams {
    pub fn validate(&self) -> ClientResult<()> {
        non_negative("pool index", self.public_pool_index)?;
        non_negative("operator fee", self.operator_fee)?;
        non_negative("operator share rate", self.min_operator_share_rate)
    }
}

impl PoolSharesParams {
    pub fn validate(&self) -> ClientResult<()> {
        non_negative("pool index", self.public_pool_index)?;
        if self.share_amount <= 0 {
            return Err(ClientError::Validation(
                "share amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ChangePubKeyParams {
    pub fn validate(&self) -> ClientResult<()> {
        let raw = self.pub_key.trim_start_matches("0x");
        if raw.is_empty() || hex::decode(raw).is_err() {
            return Err(ClientError::Validation(
                "new public key must be non-empty hex".to_string(),
            ));
        }
        Ok(())
    }
}
