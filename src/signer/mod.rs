//! Signing bridge - delegates transaction construction to a signing engine
//!
//! This module provides:
//! - Typed parameters for every signed operation
//! - The `SigningEngine` seam with an in-process and a sidecar engine
//! - `SigningBridge`, which validates inputs and packages engine output
//!
//! The bridge never allocates nonces and never talks to the ledger.

mod digest;
pub mod params;
mod sidecar;

pub use digest::DigestEngine;
pub use params::*;
pub use sidecar::SidecarEngine;

use crate::config::{SignerConfig, SignerEngineKind};
use crate::error::{ClientError, ClientResult};
use crate::ledger::TxType;
use crate::tx::GroupedOrderSpec;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request handed to a signing engine
#[derive(Debug, Clone, Serialize)]
pub struct SignRequest {
    pub tx_type: TxType,
    #[serde(flatten)]
    pub context: TxContext,
    /// Operation fields in ledger naming
    pub params: Value,
}

/// Raw engine result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    #[serde(default)]
    pub tx_type: u8,
    #[serde(default)]
    pub tx_info: String,
    #[serde(default)]
    pub tx_hash: String,
    #[serde(default)]
    pub message_to_sign: Option<String>,
    /// Nonce the engine signed with, when it reports one
    #[serde(default)]
    pub nonce: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Capability that turns a request into a signed payload
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SigningEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sign(&self, request: &SignRequest) -> ClientResult<EngineOutput>;
}

/// External wallet that co-signs key rotations and transfers
#[async_trait]
pub trait Cosigner: Send + Sync {
    async fn cosign(&self, message: &str) -> ClientResult<String>;
}

/// Signed transaction ready for submission
///
/// Immutable once produced; a co-signature yields a new package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransactionPackage {
    tx_type: TxType,
    tx_info: String,
    tx_hash: String,
    message_to_sign: Option<String>,
    nonce: i64,
}

impl SignedTransactionPackage {
    pub fn tx_type(&self) -> TxType {
        self.tx_type
    }

    pub fn tx_info(&self) -> &str {
        &self.tx_info
    }

    pub fn tx_hash(&self) -> &str {
        &self.tx_hash
    }

    /// Message the wallet must co-sign before submission
    pub fn message_to_sign(&self) -> Option<&str> {
        self.message_to_sign.as_deref()
    }

    pub fn nonce(&self) -> i64 {
        self.nonce
    }

    /// Attach an externally obtained co-signature
    pub fn with_cosignature(&self, signature: &str) -> ClientResult<Self> {
        if self.message_to_sign.is_none() {
            return Err(ClientError::Validation(format!(
                "{} does not take a co-signature",
                self.tx_type
            )));
        }
        if signature.trim().is_empty() {
            return Err(ClientError::Validation("empty co-signature".to_string()));
        }

        let mut info: Value = serde_json::from_str(&self.tx_info)?;
        let body = info.as_object_mut().ok_or_else(|| {
            ClientError::Signing("signed payload is not a JSON object".to_string())
        })?;
        body.insert("L1Sig".to_string(), Value::String(signature.to_string()));

        Ok(Self {
            tx_info: serde_json::to_string(&info)?,
            message_to_sign: None,
            ..self.clone()
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(tx_type: TxType, nonce: i64, hash: &str) -> Self {
        Self {
            tx_type,
            tx_info: format!("{{\"Nonce\":{}}}", nonce),
            tx_hash: hash.to_string(),
            message_to_sign: None,
            nonce,
        }
    }
}

/// Validating front of a signing engine, one method per operation
#[derive(Clone)]
pub struct SigningBridge {
    engine: Arc<dyn SigningEngine>,
}

impl SigningBridge {
    pub fn new(engine: Arc<dyn SigningEngine>) -> Self {
        Self { engine }
    }

    /// Build the engine selected in configuration
    pub fn from_config(config: &SignerConfig) -> ClientResult<Self> {
        let engine: Arc<dyn SigningEngine> = match config.engine {
            SignerEngineKind::Digest => {
                warn!("Using digest signing engine; payloads are not signed with a private key");
                Arc::new(DigestEngine::new())
            }
            SignerEngineKind::Sidecar => Arc::new(SidecarEngine::from_config(config)?),
        };
        info!("Signing bridge using {} engine", engine.name());
        Ok(Self::new(engine))
    }

    pub async fn sign_create_order(
        &self,
        params: &OrderParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::CreateOrder, ctx, params).await
    }

    pub async fn sign_cancel_order(
        &self,
        params: &CancelOrderParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        if params.order_index < 0 {
            return Err(ClientError::Validation(
                "order index must not be negative".to_string(),
            ));
        }
        self.sign_with(TxType::CancelOrder, ctx, params).await
    }

    pub async fn sign_modify_order(
        &self,
        params: &ModifyOrderParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::ModifyOrder, ctx, params).await
    }

    pub async fn sign_cancel_all_orders(
        &self,
        params: &CancelAllParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::CancelAllOrders, ctx, params).await
    }

    pub async fn sign_create_grouped_orders(
        &self,
        group: &GroupedOrderSpec,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        for leg in group.legs() {
            leg.validate()?;
        }
        let body = serde_json::json!({
            "GroupingType": group.mode().code(),
            "Orders": group.legs(),
        });
        self.sign_with(TxType::CreateGroupedOrders, ctx, &body).await
    }

    pub async fn sign_transfer(
        &self,
        params: &TransferParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::Transfer, ctx, params).await
    }

    pub async fn sign_withdraw(
        &self,
        params: &WithdrawParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::Withdraw, ctx, params).await
    }

    pub async fn sign_update_leverage(
        &self,
        params: &UpdateLeverageParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::UpdateLeverage, ctx, params).await
    }

    pub async fn sign_update_margin(
        &self,
        params: &UpdateMarginParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::UpdateMargin, ctx, params).await
    }

    pub async fn sign_create_sub_account(
        &self,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        self.sign_with(TxType::CreateSubAccount, ctx, &serde_json::json!({}))
            .await
    }

    pub async fn sign_create_public_pool(
        &self,
        params: &CreatePublicPoolParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::CreatePublicPool, ctx, params).await
    }

    pub async fn sign_update_public_pool(
        &self,
        params: &UpdatePublicPoolParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::UpdatePublicPool, ctx, params).await
    }

    pub async fn sign_mint_shares(
        &self,
        params: &PoolSharesParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::MintShares, ctx, params).await
    }

    pub async fn sign_burn_shares(
        &self,
        params: &PoolSharesParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::BurnShares, ctx, params).await
    }

    pub async fn sign_change_pub_key(
        &self,
        params: &ChangePubKeyParams,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        params.validate()?;
        self.sign_with(TxType::ChangePubKey, ctx, params).await
    }

    async fn sign_with<P: Serialize + ?Sized>(
        &self,
        tx_type: TxType,
        ctx: TxContext,
        params: &P,
    ) -> ClientResult<SignedTransactionPackage> {
        ctx.validate()?;

        let request = SignRequest {
            tx_type,
            context: ctx,
            params: serde_json::to_value(params)?,
        };
        let output = self.engine.sign(&request).await.map_err(|e| match e {
            ClientError::Signing(_) | ClientError::Validation(_) => e,
            other => ClientError::Signing(other.to_string()),
        })?;

        let package = package_output(tx_type, ctx.nonce, output)?;
        debug!(
            "Signed {} with nonce {} -> {}",
            tx_type, ctx.nonce, package.tx_hash
        );
        Ok(package)
    }
}

fn package_output(
    tx_type: TxType,
    nonce: i64,
    output: EngineOutput,
) -> ClientResult<SignedTransactionPackage> {
    if let Some(error) = output.error.filter(|e| !e.trim().is_empty()) {
        return Err(ClientError::Signing(error));
    }
    if let Some(signed) = output.nonce.filter(|n| *n != nonce) {
        return Err(ClientError::Signing(format!(
            "engine signed {} with nonce {} instead of {}",
            tx_type, signed, nonce
        )));
    }
    if output.tx_type != tx_type.code() {
        return Err(ClientError::Signing(format!(
            "engine returned type {} for {}",
            output.tx_type, tx_type
        )));
    }
    if output.tx_info.is_empty() || output.tx_hash.is_empty() {
        return Err(ClientError::Signing(format!(
            "engine returned an incomplete package for {}",
            tx_type
        )));
    }

    let message_to_sign = output.message_to_sign.filter(|m| !m.is_empty());
    if tx_type.requires_cosignature() && message_to_sign.is_none() {
        return Err(ClientError::Signing(format!(
            "{} needs a co-sign message but the engine returned none",
            tx_type
        )));
    }

    Ok(SignedTransactionPackage {
        tx_type,
        tx_info: output.tx_info,
        tx_hash: output.tx_hash,
        message_to_sign,
        nonce,
    })
}
