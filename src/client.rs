//! Order client - one call per ledger operation
//!
//! Each operation resolves expiry sentinels, allocates a nonce, signs through
//! the bridge, submits with the nonce retry policy and, when confirmation is
//! enabled, waits for the ledger to reach a terminal state.

use crate::config::Settings;
use crate::error::{ClientError, ClientResult};
use crate::ledger::{ConfirmationWatcher, HttpLedger, LedgerApi, TransactionRecord, TxType};
use crate::signer::{
    resolve_tx_expiry, CancelAllMode, CancelAllParams, CancelOrderParams, ChangePubKeyParams,
    Cosigner, CreatePublicPoolParams, ModifyOrderParams, OrderParams, PoolSharesParams,
    SignedTransactionPackage, SigningBridge, TransferParams, TxContext, UpdateLeverageParams,
    UpdateMarginParams, UpdatePublicPoolParams, WithdrawParams, DEFAULT_EXPIRY,
    DEFAULT_TX_EXPIRY_WINDOW_MS, RESERVED_API_KEY,
};
use crate::stream::{StreamTransport, MAX_BATCH_SIZE};
use crate::tx::{
    build_batch, BracketSpec, GroupedOrderSpec, NonceAllocator, NonceKey, Submission,
    TransactionSubmitter,
};

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What is known about a submitted transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Accepted by the ledger; confirmation was not requested
    Accepted,
    /// Reached a successful terminal state
    Confirmed,
    /// The ledger marked it failed
    Rejected { reason: String },
    /// Still unresolved when the watcher gave up
    Unconfirmed,
}

/// Result of one submitted transaction; the hash is always present
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    pub hash: String,
    pub nonce: i64,
    pub tx_type: TxType,
    pub outcome: Outcome,
    /// Last record observed by the watcher
    pub record: Option<TransactionRecord>,
}

impl SubmissionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Accepted | Outcome::Confirmed)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Rejected { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Operation that may travel in a batch
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Create(OrderParams),
    Cancel(CancelOrderParams),
    Modify(ModifyOrderParams),
}

/// Per-entry outcome of a batch: either a hash or an error
#[derive(Debug, Clone)]
pub enum BatchEntryOutcome {
    Submitted(SubmissionResult),
    Failed { nonce: i64, error: String },
}

/// Composes the pipeline for one account and API key
#[derive(Clone)]
pub struct OrderClient {
    account_index: i64,
    api_key_index: u8,
    bridge: SigningBridge,
    submitter: Arc<TransactionSubmitter>,
    watcher: Option<Arc<ConfirmationWatcher>>,
    stream: Option<Arc<StreamTransport>>,
    cosigner: Option<Arc<dyn Cosigner>>,
}

impl OrderClient {
    pub fn new(
        account_index: i64,
        api_key_index: u8,
        bridge: SigningBridge,
        submitter: Arc<TransactionSubmitter>,
        watcher: Option<Arc<ConfirmationWatcher>>,
    ) -> Self {
        Self {
            account_index,
            api_key_index,
            bridge,
            submitter,
            watcher,
            stream: None,
            cosigner: None,
        }
    }

    /// Build the full pipeline from settings; the stream is created but not started
    pub fn from_settings(settings: &Settings) -> ClientResult<Self> {
        let ledger: Arc<dyn LedgerApi> = Arc::new(HttpLedger::new(&settings.ledger)?);
        let stream = settings
            .stream
            .enabled
            .then(|| Arc::new(StreamTransport::new(settings.stream.clone())));
        let nonces = Arc::new(NonceAllocator::new(ledger.clone(), settings.nonce.clone()));
        let submitter = Arc::new(TransactionSubmitter::new(
            ledger.clone(),
            stream.clone(),
            nonces,
            settings.submit.transport,
        ));
        let watcher = settings
            .confirm
            .enabled
            .then(|| Arc::new(ConfirmationWatcher::new(ledger, &settings.confirm)));
        let bridge = SigningBridge::from_config(&settings.signer)?;

        let mut client = Self::new(
            settings.ledger.account_index,
            settings.ledger.default_api_key(),
            bridge,
            submitter,
            watcher,
        );
        client.stream = stream;
        Ok(client)
    }

    pub fn with_cosigner(mut self, cosigner: Arc<dyn Cosigner>) -> Self {
        self.cosigner = Some(cosigner);
        self
    }

    /// Same pipeline signing with another API key of the account
    pub fn with_api_key(&self, api_key_index: u8) -> ClientResult<Self> {
        if api_key_index == RESERVED_API_KEY {
            return Err(ClientError::Validation(format!(
                "API key index {} is reserved",
                RESERVED_API_KEY
            )));
        }
        Ok(Self {
            api_key_index,
            ..self.clone()
        })
    }

    pub fn key(&self) -> NonceKey {
        NonceKey::new(self.account_index, self.api_key_index)
    }

    pub fn nonces(&self) -> &Arc<NonceAllocator> {
        self.submitter.nonces()
    }

    pub fn stream(&self) -> Option<&Arc<StreamTransport>> {
        self.stream.as_ref()
    }

    pub async fn create_order(&self, params: OrderParams) -> ClientResult<SubmissionResult> {
        let mut params = params;
        params.resolve_expiry(now_ms());
        let params = &params;
        self.execute(|ctx| self.bridge.sign_create_order(params, ctx))
            .await
    }

    pub async fn cancel_order(&self, params: CancelOrderParams) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_cancel_order(&params, ctx))
            .await
    }

    pub async fn modify_order(&self, params: ModifyOrderParams) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_modify_order(&params, ctx))
            .await
    }

    /// Cancel every open order; a scheduled cancel with the sentinel time fires in 10 minutes
    pub async fn cancel_all_orders(
        &self,
        params: CancelAllParams,
    ) -> ClientResult<SubmissionResult> {
        let mut params = params;
        if params.time == DEFAULT_EXPIRY {
            params.time = match params.mode {
                CancelAllMode::Scheduled => now_ms() + DEFAULT_TX_EXPIRY_WINDOW_MS,
                _ => 0,
            };
        }
        self.execute(|ctx| self.bridge.sign_cancel_all_orders(&params, ctx))
            .await
    }

    pub async fn create_grouped_orders(
        &self,
        group: GroupedOrderSpec,
    ) -> ClientResult<SubmissionResult> {
        let group = group.resolve_expiry(now_ms());
        let group = &group;
        self.execute(|ctx| self.bridge.sign_create_grouped_orders(group, ctx))
            .await
    }

    /// Entry with take-profit and stop-loss legs as one grouped transaction
    pub async fn create_bracket(&self, bracket: BracketSpec) -> ClientResult<SubmissionResult> {
        self.create_grouped_orders(bracket.into_group()?).await
    }

    pub async fn transfer(&self, params: TransferParams) -> ClientResult<SubmissionResult> {
        let params = &params;
        self.execute(|ctx| async move {
            let package = self.bridge.sign_transfer(params, ctx).await?;
            self.cosign(package).await
        })
        .await
    }

    pub async fn withdraw(&self, params: WithdrawParams) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_withdraw(&params, ctx))
            .await
    }

    pub async fn update_leverage(
        &self,
        params: UpdateLeverageParams,
    ) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_update_leverage(&params, ctx))
            .await
    }

    pub async fn update_margin(&self, params: UpdateMarginParams) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_update_margin(&params, ctx))
            .await
    }

    pub async fn create_sub_account(&self) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_create_sub_account(ctx))
            .await
    }

    pub async fn create_public_pool(
        &self,
        params: CreatePublicPoolParams,
    ) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_create_public_pool(&params, ctx))
            .await
    }

    pub async fn update_public_pool(
        &self,
        params: UpdatePublicPoolParams,
    ) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_update_public_pool(&params, ctx))
            .await
    }

    pub async fn mint_shares(&self, params: PoolSharesParams) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_mint_shares(&params, ctx))
            .await
    }

    pub async fn burn_shares(&self, params: PoolSharesParams) -> ClientResult<SubmissionResult> {
        self.execute(|ctx| self.bridge.sign_burn_shares(&params, ctx))
            .await
    }

    /// Rotate the key behind this client's API key index
    pub async fn change_pub_key(
        &self,
        params: ChangePubKeyParams,
    ) -> ClientResult<SubmissionResult> {
        let params = &params;
        self.execute(|ctx| async move {
            let package = self.bridge.sign_change_pub_key(params, ctx).await?;
            self.cosign(package).await
        })
        .await
    }

    /// Sign and submit independent operations together
    ///
    /// Nonces are allocated as one consecutive run. Any failure leaves gaps the
    /// allocator cannot repair entry by entry, so the slot is refreshed instead.
    pub async fn submit_batch(
        &self,
        operations: Vec<BatchOperation>,
    ) -> ClientResult<Vec<BatchEntryOutcome>> {
        if operations.is_empty() || operations.len() > MAX_BATCH_SIZE {
            return Err(ClientError::Validation(format!(
                "batch must hold 1..={} operations, got {}",
                MAX_BATCH_SIZE,
                operations.len()
            )));
        }

        let key = self.key();
        let nonces = self.nonces().allocate_batch(key, operations.len()).await?;
        let expired_at = resolve_tx_expiry(DEFAULT_EXPIRY, now_ms());

        let mut packages = Vec::with_capacity(operations.len());
        for (operation, nonce) in operations.into_iter().zip(nonces) {
            let ctx = self.context(nonce, expired_at);
            match self.sign_batch_entry(operation, ctx).await {
                Ok(package) => packages.push(package),
                Err(e) => {
                    warn!("Signing batch entry with nonce {} failed: {}", nonce, e);
                    self.nonces().hard_refresh(key).await;
                    return Err(e);
                }
            }
        }

        let batch = match build_batch(packages) {
            Ok(batch) => batch,
            Err(e) => {
                self.nonces().hard_refresh(key).await;
                return Err(e);
            }
        };
        let entries = match self.submitter.submit_batch(batch.packages()).await {
            Ok(entries) => entries,
            Err(e) => {
                self.nonces().hard_refresh(key).await;
                return Err(e);
            }
        };
        if entries.len() != batch.len() {
            self.nonces().hard_refresh(key).await;
            return Err(ClientError::Internal(format!(
                "batch of {} answered with {} results",
                batch.len(),
                entries.len()
            )));
        }

        if entries.iter().any(|e| !e.is_accepted()) {
            debug!("Batch for {} had rejected entries, refreshing nonces", key);
            self.nonces().hard_refresh(key).await;
        }

        let outcomes = batch
            .packages()
            .iter()
            .zip(entries)
            .map(|(package, entry)| async move {
                match (entry.is_accepted(), entry.hash) {
                    (true, Some(hash)) => {
                        let submission = Submission {
                            hash,
                            package: package.clone(),
                        };
                        BatchEntryOutcome::Submitted(self.confirm(submission).await)
                    }
                    _ => BatchEntryOutcome::Failed {
                        nonce: package.nonce(),
                        error: entry
                            .error
                            .unwrap_or_else(|| "no hash returned".to_string()),
                    },
                }
            });
        Ok(join_all(outcomes).await)
    }

    async fn sign_batch_entry(
        &self,
        operation: BatchOperation,
        ctx: TxContext,
    ) -> ClientResult<SignedTransactionPackage> {
        match operation {
            BatchOperation::Create(mut params) => {
                params.resolve_expiry(now_ms());
                self.bridge.sign_create_order(&params, ctx).await
            }
            BatchOperation::Cancel(params) => self.bridge.sign_cancel_order(&params, ctx).await,
            BatchOperation::Modify(params) => self.bridge.sign_modify_order(&params, ctx).await,
        }
    }

    fn context(&self, nonce: i64, expired_at: i64) -> TxContext {
        TxContext {
            account_index: self.account_index,
            api_key_index: self.api_key_index,
            nonce,
            expired_at,
        }
    }

    async fn execute<F, Fut>(&self, sign: F) -> ClientResult<SubmissionResult>
    where
        F: Fn(TxContext) -> Fut,
        Fut: Future<Output = ClientResult<SignedTransactionPackage>>,
    {
        let expired_at = resolve_tx_expiry(DEFAULT_EXPIRY, now_ms());
        let submission = self
            .submitter
            .sign_and_submit(self.key(), |nonce| sign(self.context(nonce, expired_at)))
            .await?;
        Ok(self.confirm(submission).await)
    }

    async fn cosign(
        &self,
        package: SignedTransactionPackage,
    ) -> ClientResult<SignedTransactionPackage> {
        let Some(message) = package.message_to_sign() else {
            return Ok(package);
        };
        let cosigner = self.cosigner.as_ref().ok_or_else(|| {
            ClientError::Validation(format!(
                "{} needs a co-signature but no cosigner is configured",
                package.tx_type()
            ))
        })?;
        let signature = cosigner.cosign(message).await?;
        package.with_cosignature(&signature)
    }

    async fn confirm(&self, submission: Submission) -> SubmissionResult {
        let Submission { hash, package } = submission;
        let mut result = SubmissionResult {
            hash,
            nonce: package.nonce(),
            tx_type: package.tx_type(),
            outcome: Outcome::Accepted,
            record: None,
        };
        let Some(watcher) = &self.watcher else {
            return result;
        };

        match watcher.wait(&result.hash).await {
            Ok(record) => {
                result.outcome = Outcome::Confirmed;
                result.record = Some(record);
            }
            Err(ClientError::Rejected { reason, .. }) => {
                result.outcome = Outcome::Rejected { reason };
            }
            Err(ClientError::ConfirmationTimeout { .. }) => {
                result.outcome = Outcome::Unconfirmed;
            }
            Err(e) => {
                warn!("Could not confirm {}: {}", result.hash, e);
                result.outcome = Outcome::Unconfirmed;
            }
        }
        info!(
            "{} nonce {} resolved as {:?}",
            result.tx_type, result.nonce, result.outcome
        );
        result
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
