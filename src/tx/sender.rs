//! Transaction submitter with transport selection and nonce retry policy

use super::nonce::{NonceAllocator, NonceKey};
use crate::config::TransportPreference;
use crate::error::{ClientError, ClientResult};
use crate::ledger::{BatchEntryResult, LedgerApi};
use crate::signer::SignedTransactionPackage;
use crate::stream::{StreamTransport, MAX_BATCH_SIZE};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A package the ledger acknowledged
#[derive(Debug, Clone)]
pub struct Submission {
    pub hash: String,
    pub package: SignedTransactionPackage,
}

/// Delivers signed packages over the preferred transport
pub struct TransactionSubmitter {
    ledger: Arc<dyn LedgerApi>,
    stream: Option<Arc<StreamTransport>>,
    nonces: Arc<NonceAllocator>,
    preference: TransportPreference,
}

impl TransactionSubmitter {
    pub fn new(
        ledger: Arc<dyn LedgerApi>,
        stream: Option<Arc<StreamTransport>>,
        nonces: Arc<NonceAllocator>,
        preference: TransportPreference,
    ) -> Self {
        Self {
            ledger,
            stream,
            nonces,
            preference,
        }
    }

    pub fn nonces(&self) -> &Arc<NonceAllocator> {
        &self.nonces
    }

    fn preferred_stream(&self) -> Option<&StreamTransport> {
        match self.preference {
            TransportPreference::Stream => self.stream.as_deref(),
            TransportPreference::Http => None,
        }
    }

    /// Deliver one package and return its hash
    ///
    /// The streaming transport is used when preferred; if the request never
    /// left the client it is sent over request/response instead.
    pub async fn submit(&self, package: &SignedTransactionPackage) -> ClientResult<String> {
        ensure_submittable(package)?;

        let started = Instant::now();
        let tx_type = package.tx_type().code();

        let (transport, result) = match self.preferred_stream() {
            Some(stream) => match stream.send_tx(tx_type, package.tx_info()).await {
                Ok(ack) => (
                    "stream",
                    Ok(ack.unwrap_or_else(|| package.tx_hash().to_string())),
                ),
                Err(ClientError::StreamUnavailable(reason)) => {
                    debug!("Stream unavailable ({}), sending over http", reason);
                    ("http", self.ledger.send_tx(tx_type, package.tx_info()).await)
                }
                Err(e) => ("stream", Err(e)),
            },
            None => ("http", self.ledger.send_tx(tx_type, package.tx_info()).await),
        };

        match &result {
            Ok(hash) => {
                if hash != package.tx_hash() {
                    debug!(
                        "Ledger hash {} differs from signed hash {}",
                        hash,
                        package.tx_hash()
                    );
                }
                info!(
                    "Submitted {} nonce {} via {}: {}",
                    package.tx_type(),
                    package.nonce(),
                    transport,
                    hash
                );
                crate::metrics::record_tx_submitted(transport, tx_type, started.elapsed());
            }
            Err(e) => {
                warn!(
                    "Submission of {} nonce {} via {} failed: {}",
                    package.tx_type(),
                    package.nonce(),
                    transport,
                    e
                );
                crate::metrics::record_tx_failed(transport, e);
            }
        }

        result
    }

    /// Deliver independent packages together; results are per entry
    pub async fn submit_batch(
        &self,
        packages: &[SignedTransactionPackage],
    ) -> ClientResult<Vec<BatchEntryResult>> {
        if packages.is_empty() || packages.len() > MAX_BATCH_SIZE {
            return Err(ClientError::Validation(format!(
                "batch must hold 1..={} transactions, got {}",
                MAX_BATCH_SIZE,
                packages.len()
            )));
        }
        for package in packages {
            ensure_submittable(package)?;
        }

        let tx_types: Vec<u8> = packages.iter().map(|p| p.tx_type().code()).collect();
        let tx_infos: Vec<String> = packages.iter().map(|p| p.tx_info().to_string()).collect();

        let (transport, result) = match self.preferred_stream() {
            Some(stream) => match stream.send_tx_batch(&tx_types, &tx_infos).await {
                Err(ClientError::StreamUnavailable(reason)) => {
                    debug!("Stream unavailable ({}), sending batch over http", reason);
                    ("http", self.ledger.send_tx_batch(&tx_types, &tx_infos).await)
                }
                other => ("stream", other),
            },
            None => ("http", self.ledger.send_tx_batch(&tx_types, &tx_infos).await),
        };

        match &result {
            Ok(entries) => {
                let accepted = entries.iter().filter(|e| e.is_accepted()).count();
                info!(
                    "Batch of {} via {}: {} accepted",
                    entries.len(),
                    transport,
                    accepted
                );
            }
            Err(e) => {
                warn!("Batch via {} failed: {}", transport, e);
                crate::metrics::record_tx_failed(transport, e);
            }
        }

        result
    }

    /// Allocate, sign and submit with the nonce retry policy
    ///
    /// A nonce error triggers exactly one hard refresh, re-sign with a fresh
    /// nonce and resubmit. Any other failure, or a failed retry, releases the
    /// nonce in use once.
    pub async fn sign_and_submit<F, Fut>(&self, key: NonceKey, sign: F) -> ClientResult<Submission>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = ClientResult<SignedTransactionPackage>>,
    {
        let nonce = self.nonces.allocate(key).await?;

        let error = match self.attempt(&sign, nonce).await {
            Ok(submission) => return Ok(submission),
            Err(e) => e,
        };

        if !error.is_nonce_error() {
            self.release(key, nonce, &error).await;
            return Err(error);
        }

        warn!(
            "Nonce {} for {} rejected ({}), refreshing and retrying once",
            nonce, key, error
        );
        crate::metrics::record_nonce_retry();
        self.nonces.hard_refresh(key).await;

        let retry_nonce = self.nonces.allocate(key).await?;
        match self.attempt(&sign, retry_nonce).await {
            Ok(submission) => Ok(submission),
            Err(e) => {
                self.release(key, retry_nonce, &e).await;
                Err(e)
            }
        }
    }

    async fn attempt<F, Fut>(&self, sign: &F, nonce: i64) -> ClientResult<Submission>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = ClientResult<SignedTransactionPackage>>,
    {
        let package = sign(nonce).await?;
        if package.nonce() != nonce {
            return Err(ClientError::Internal(format!(
                "package signed with nonce {} instead of {}",
                package.nonce(),
                nonce
            )));
        }
        let hash = self.submit(&package).await?;
        Ok(Submission { hash, package })
    }

    /// Give a nonce back when the transaction cannot have landed
    async fn release(&self, key: NonceKey, nonce: i64, error: &ClientError) {
        if error.is_delivery_unknown() {
            // The request may have reached the ledger; only the ledger knows
            warn!(
                "Delivery of nonce {} for {} is unknown, refreshing",
                nonce, key
            );
            self.nonces.hard_refresh(key).await;
        } else {
            self.nonces.acknowledge_failure(key, nonce).await;
        }
    }
}

fn ensure_submittable(package: &SignedTransactionPackage) -> ClientResult<()> {
    if package.message_to_sign().is_some() {
        return Err(ClientError::Validation(format!(
            "{} still needs its co-signature",
            package.tx_type()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NonceConfig, StreamConfig};
    use crate::error::INVALID_NONCE_CODE;
    use crate::ledger::{TransactionRecord, TxType};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Ledger with scripted nonce and send results
    #[derive(Default)]
    struct ScriptedLedger {
        next_nonces: Mutex<VecDeque<i64>>,
        fetches: AtomicUsize,
        send_results: Mutex<VecDeque<ClientResult<String>>>,
        sent: Mutex<Vec<i64>>,
    }

    impl ScriptedLedger {
        fn new(nonces: &[i64], results: Vec<ClientResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                next_nonces: Mutex::new(nonces.iter().copied().collect()),
                send_results: Mutex::new(results.into_iter().collect()),
                ..Default::default()
            })
        }

        fn sent(&self) -> Vec<i64> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LedgerApi for ScriptedLedger {
        async fn next_nonce(&self, _account_index: i64, _api_key_index: u8) -> ClientResult<i64> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut queue = self.next_nonces.lock().unwrap();
            // Last value repeats
            let value = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().copied()
            };
            value.ok_or_else(|| ClientError::Transport("no nonce scripted".to_string()))
        }

        async fn send_tx(&self, _tx_type: u8, tx_info: &str) -> ClientResult<String> {
            let body: serde_json::Value = serde_json::from_str(tx_info)?;
            let nonce = body["Nonce"].as_i64().unwrap_or(-1);
            self.sent.lock().unwrap().push(nonce);
            self.send_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("0x{}", nonce)))
        }

        async fn send_tx_batch(
            &self,
            _tx_types: &[u8],
            tx_infos: &[String],
        ) -> ClientResult<Vec<BatchEntryResult>> {
            Ok(tx_infos
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    if i == 1 {
                        BatchEntryResult::failed("order would cross")
                    } else {
                        BatchEntryResult::accepted(format!("0xb{}", i))
                    }
                })
                .collect())
        }

        async fn get_transaction(&self, _hash: &str) -> ClientResult<Option<TransactionRecord>> {
            Ok(None)
        }
    }

    const KEY: NonceKey = NonceKey {
        account_index: 1,
        api_key_index: 4,
    };

    fn submitter(ledger: Arc<ScriptedLedger>, preference: TransportPreference) -> TransactionSubmitter {
        let nonces = Arc::new(NonceAllocator::new(
            ledger.clone(),
            NonceConfig {
                prefetch: 5,
                low_water_mark: 0,
                freshness_secs: 30,
            },
        ));
        let stream = Arc::new(StreamTransport::new(StreamConfig::default()));
        TransactionSubmitter::new(ledger, Some(stream), nonces, preference)
    }

    fn sign_order(nonce: i64) -> impl Future<Output = ClientResult<SignedTransactionPackage>> {
        async move {
            Ok(SignedTransactionPackage::for_test(
                TxType::CreateOrder,
                nonce,
                &format!("0xsigned{}", nonce),
            ))
        }
    }

    fn invalid_nonce() -> ClientError {
        ClientError::from_ledger(INVALID_NONCE_CODE, "invalid nonce")
    }

    #[tokio::test]
    async fn test_nonce_error_retries_once_with_fresh_nonce() {
        let ledger = ScriptedLedger::new(&[100, 103], vec![Err(invalid_nonce())]);
        let submitter = submitter(ledger.clone(), TransportPreference::Http);

        let submission = submitter.sign_and_submit(KEY, sign_order).await.unwrap();

        assert_eq!(submission.hash, "0x103");
        assert_eq!(submission.package.nonce(), 103);
        assert_eq!(ledger.sent(), vec![100, 103]);
        assert_eq!(ledger.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_retry_releases_nonce_once() {
        let ledger = ScriptedLedger::new(
            &[100, 103],
            vec![
                Err(invalid_nonce()),
                Err(ClientError::from_ledger(21701, "not enough margin")),
            ],
        );
        let submitter = submitter(ledger.clone(), TransportPreference::Http);

        let err = submitter.sign_and_submit(KEY, sign_order).await.unwrap_err();
        assert!(matches!(err, ClientError::Ledger { code: 21701, .. }));
        assert_eq!(ledger.sent(), vec![100, 103]);

        // Exactly one reuse of the released value, no extra fetch
        assert_eq!(submitter.nonces().allocate(KEY).await.unwrap(), 103);
        assert_eq!(submitter.nonces().allocate(KEY).await.unwrap(), 104);
        assert_eq!(ledger.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let ledger = ScriptedLedger::new(
            &[100],
            vec![Err(ClientError::from_ledger(21701, "not enough margin"))],
        );
        let submitter = submitter(ledger.clone(), TransportPreference::Http);

        assert!(submitter.sign_and_submit(KEY, sign_order).await.is_err());
        assert_eq!(ledger.sent(), vec![100]);
        assert_eq!(submitter.nonces().allocate(KEY).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_sign_failure_on_retry_releases_retry_nonce() {
        let ledger = ScriptedLedger::new(&[100, 103], vec![Err(invalid_nonce())]);
        let submitter = submitter(ledger.clone(), TransportPreference::Http);

        let sign = |nonce: i64| async move {
            if nonce == 103 {
                Err(ClientError::Signing("engine crashed".to_string()))
            } else {
                sign_order(nonce).await
            }
        };

        let err = submitter.sign_and_submit(KEY, sign).await.unwrap_err();
        assert!(matches!(err, ClientError::Signing(_)));
        assert_eq!(submitter.nonces().allocate(KEY).await.unwrap(), 103);
    }

    #[tokio::test]
    async fn test_unknown_delivery_refreshes_instead_of_reuse() {
        let ledger = ScriptedLedger::new(
            &[100, 101],
            vec![Err(ClientError::Timeout {
                operation: "POST /api/v1/sendTx".to_string(),
            })],
        );
        let submitter = submitter(ledger.clone(), TransportPreference::Http);

        assert!(submitter.sign_and_submit(KEY, sign_order).await.is_err());
        assert_eq!(submitter.nonces().allocate(KEY).await.unwrap(), 101);
        assert_eq!(ledger.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreadable_reply_refreshes_instead_of_reuse() {
        let ledger = ScriptedLedger::new(
            &[100, 101],
            vec![Err(ClientError::DeliveryUnknown {
                operation: "POST /api/v1/sendTx".to_string(),
                reason: "connection reset mid-body".to_string(),
            })],
        );
        let submitter = submitter(ledger.clone(), TransportPreference::Http);

        assert!(submitter.sign_and_submit(KEY, sign_order).await.is_err());
        assert_eq!(submitter.nonces().allocate(KEY).await.unwrap(), 101);
        assert_eq!(ledger.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_submission_reuses_nonce() {
        let ledger = ScriptedLedger::new(
            &[100],
            vec![Err(ClientError::RateLimited { retry_after_ms: 3000 })],
        );
        let submitter = submitter(ledger.clone(), TransportPreference::Http);

        let err = submitter.sign_and_submit(KEY, sign_order).await.unwrap_err();
        assert!(matches!(err, ClientError::RateLimited { .. }));
        assert_eq!(submitter.nonces().allocate(KEY).await.unwrap(), 100);
        assert_eq!(ledger.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnected_stream_falls_back_to_http() {
        let ledger = ScriptedLedger::new(&[7], Vec::new());
        let submitter = submitter(ledger.clone(), TransportPreference::Stream);

        let package = SignedTransactionPackage::for_test(TxType::CancelOrder, 7, "0xsigned");
        assert_eq!(submitter.submit(&package).await.unwrap(), "0x7");
        assert_eq!(ledger.sent(), vec![7]);
    }

    #[tokio::test]
    async fn test_batch_reports_per_entry() {
        let ledger = ScriptedLedger::new(&[1], Vec::new());
        let submitter = submitter(ledger, TransportPreference::Http);

        let packages: Vec<_> = (1..=3)
            .map(|n| SignedTransactionPackage::for_test(TxType::CreateOrder, n, "0x"))
            .collect();
        let results = submitter.submit_batch(&packages).await.unwrap();

        assert!(results[0].is_accepted());
        assert_eq!(results[1].error.as_deref(), Some("order would cross"));
        assert!(results[2].is_accepted());
    }

    #[tokio::test]
    async fn test_oversized_batch_is_validation_error() {
        let ledger = ScriptedLedger::new(&[1], Vec::new());
        let submitter = submitter(ledger, TransportPreference::Http);

        let packages: Vec<_> = (0..51)
            .map(|n| SignedTransactionPackage::for_test(TxType::CreateOrder, n, "0x"))
            .collect();
        assert!(matches!(
            submitter.submit_batch(&packages).await,
            Err(ClientError::Validation(_))
        ));
    }
}
