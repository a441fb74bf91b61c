//! Request/response ledger transport with multi-endpoint failover

use super::types::{
    BatchEntryResult, NextNonceResponse, SendTxBatchResponse, SendTxResponse, TransactionRecord,
    TxQueryResponse, CODE_OK,
};
use super::LedgerApi;
use crate::config::LedgerConfig;
use crate::error::{ClientError, ClientResult};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

const NEXT_NONCE_PATH: &str = "/api/v1/nextNonce";
const SEND_TX_PATH: &str = "/api/v1/sendTx";
const SEND_TX_BATCH_PATH: &str = "/api/v1/sendTxBatch";
const TX_PATH: &str = "/api/v1/tx";

/// Form-encoded request/response transport
pub struct HttpLedger {
    /// Base URLs (multiple for failover)
    base_urls: Vec<String>,
    /// Current active endpoint index
    current: AtomicUsize,
    client: Client,
    max_retries: u32,
    initial_backoff: Duration,
    /// No request is sent before this instant after a 429
    rate_limit_until: Mutex<Option<Instant>>,
}

impl HttpLedger {
    /// Create a new ledger client
    pub fn new(config: &LedgerConfig) -> ClientResult<Self> {
        let base_urls: Vec<String> = config
            .base_urls
            .iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect();

        if base_urls.is_empty() {
            return Err(ClientError::Config("No valid ledger endpoints".to_string()));
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            base_urls,
            current: AtomicUsize::new(0),
            client,
            max_retries: config.max_retries.max(1),
            initial_backoff: config.backoff(0),
            rate_limit_until: Mutex::new(None),
        })
    }

    /// Get the active base URL
    fn base(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        &self.base_urls[idx % self.base_urls.len()]
    }

    /// Switch to next available endpoint
    pub fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.base_urls.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Ledger failover to endpoint {} ({})", next, self.base());
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(1 << attempt.min(16))
    }

    /// Sleep out an active rate-limit window
    async fn respect_rate_limit(&self) {
        let until = *self.rate_limit_until.lock().await;
        if let Some(until) = until.filter(|u| *u > Instant::now()) {
            debug!(
                "Ledger rate-limited, waiting {:?}",
                until.saturating_duration_since(Instant::now())
            );
            sleep_until(until).await;
        }
    }

    async fn start_rate_limit(&self, backoff: Duration) {
        *self.rate_limit_until.lock().await = Some(Instant::now() + backoff);
    }

    /// GET with failover on any transport error; reads are idempotent
    async fn get_with_failover(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ClientResult<reqwest::Response> {
        let mut last_error = None;

        for _ in 0..self.base_urls.len() {
            let url = format!("{}{}", self.base(), path);
            match self.client.get(&url).query(query).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!("GET {} failed: {}", url, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error
            .map(ClientError::from)
            .unwrap_or_else(|| ClientError::Transport("All ledger endpoints failed".to_string())))
    }

    /// GET with backoff on rate limits and transient server errors
    ///
    /// Returns the final status and body text; 404 is passed through.
    async fn get_with_retry(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ClientResult<(StatusCode, String)> {
        let mut attempt = 0;
        loop {
            self.respect_rate_limit().await;

            let resp = self.get_with_failover(path, query).await?;
            let status = resp.status();
            let backoff = self.backoff(attempt);
            let last_attempt = attempt + 1 >= self.max_retries;

            if status == StatusCode::TOO_MANY_REQUESTS {
                self.start_rate_limit(backoff).await;
                warn!(
                    "GET {} rate-limited, backing off {:?} (attempt {}/{})",
                    path,
                    backoff,
                    attempt + 1,
                    self.max_retries
                );
                if last_attempt {
                    return Err(ClientError::RateLimited {
                        retry_after_ms: backoff.as_millis() as u64,
                    });
                }
            } else {
                let body = resp.text().await?;
                if !is_transient(status, &body) {
                    return Ok((status, body));
                }
                warn!(
                    "GET {} transient error (http {}), retrying in {:?} (attempt {}/{})",
                    path,
                    status,
                    backoff,
                    attempt + 1,
                    self.max_retries
                );
                if last_attempt {
                    return Err(ClientError::Transport(format!(
                        "GET {} failed after {} attempts (http {})",
                        path, self.max_retries, status
                    )));
                }
            }

            sleep(backoff).await;
            attempt += 1;
        }
    }

    /// POST a form and read the reply body
    ///
    /// Fails over only when the connection was never made. Once the request
    /// may have been written, every failure is reported as `DeliveryUnknown`.
    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> ClientResult<String> {
        self.respect_rate_limit().await;

        let mut last_error = None;
        for _ in 0..self.base_urls.len() {
            let url = format!("{}{}", self.base(), path);
            let resp = match self.client.post(&url).form(form).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() => {
                    warn!("POST {} could not connect: {}", url, e);
                    last_error = Some(e);
                    self.failover();
                    continue;
                }
                Err(e) => return Err(delivery_unknown(path, e)),
            };

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                // Refused before processing
                let backoff = self.backoff(0);
                self.start_rate_limit(backoff).await;
                warn!("POST {} rate-limited, backing off {:?}", path, backoff);
                return Err(ClientError::RateLimited {
                    retry_after_ms: backoff.as_millis() as u64,
                });
            }

            return resp.text().await.map_err(|e| delivery_unknown(path, e));
        }

        Err(last_error
            .map(ClientError::from)
            .unwrap_or_else(|| ClientError::Transport("All ledger endpoints failed".to_string())))
    }
}

fn delivery_unknown(path: &str, error: impl std::fmt::Display) -> ClientError {
    ClientError::DeliveryUnknown {
        operation: format!("POST {}", path),
        reason: error.to_string(),
    }
}

/// Decode a submission reply; an unreadable reply leaves delivery unknown
fn decode_submission<T: DeserializeOwned>(path: &str, body: &str) -> ClientResult<T> {
    serde_json::from_str(body).map_err(|e| delivery_unknown(path, format!("unreadable reply: {}", e)))
}

/// Server errors and the ledger's internal-error 400 are worth retrying
fn is_transient(status: StatusCode, body: &str) -> bool {
    match status.as_u16() {
        500 | 502 | 503 | 504 => true,
        400 => body.contains("29500") || body.to_ascii_lowercase().contains("internal server error"),
        _ => false,
    }
}

#[async_trait]
impl LedgerApi for HttpLedger {
    async fn next_nonce(&self, account_index: i64, api_key_index: u8) -> ClientResult<i64> {
        let (status, text) = self
            .get_with_retry(
                NEXT_NONCE_PATH,
                &[
                    ("account_index", account_index.to_string()),
                    ("api_key_index", api_key_index.to_string()),
                ],
            )
            .await?;

        let body: NextNonceResponse = serde_json::from_str(&text).map_err(|e| {
            ClientError::Transport(format!("next nonce reply unreadable (http {}): {}", status, e))
        })?;
        if body.code != CODE_OK {
            return Err(ClientError::Transport(format!(
                "next nonce failed (http {}, code {}): {}",
                status,
                body.code,
                body.message.unwrap_or_default()
            )));
        }

        let nonce = body
            .nonce
            .ok_or_else(|| ClientError::Transport("next nonce response without nonce".to_string()))?;
        debug!(
            "Ledger next nonce for account {} key {}: {}",
            account_index, api_key_index, nonce
        );
        Ok(nonce)
    }

    async fn send_tx(&self, tx_type: u8, tx_info: &str) -> ClientResult<String> {
        let text = self
            .post_form(
                SEND_TX_PATH,
                &[
                    ("tx_type", tx_type.to_string()),
                    ("tx_info", tx_info.to_string()),
                ],
            )
            .await?;

        let body: SendTxResponse = decode_submission(SEND_TX_PATH, &text)?;
        if body.code != CODE_OK {
            return Err(ClientError::from_ledger(
                body.code,
                body.message.unwrap_or_else(|| "send transaction failed".to_string()),
            ));
        }

        body.tx_hash
            .filter(|h| !h.is_empty())
            .ok_or_else(|| delivery_unknown(SEND_TX_PATH, "accepted without a transaction hash"))
    }

    async fn send_tx_batch(
        &self,
        tx_types: &[u8],
        tx_infos: &[String],
    ) -> ClientResult<Vec<BatchEntryResult>> {
        if tx_types.len() != tx_infos.len() {
            return Err(ClientError::Validation(
                "tx_types and tx_infos must have same length".to_string(),
            ));
        }

        let text = self
            .post_form(
                SEND_TX_BATCH_PATH,
                &[
                    ("tx_types", serde_json::to_string(tx_types)?),
                    ("tx_infos", serde_json::to_string(tx_infos)?),
                ],
            )
            .await?;

        let body: SendTxBatchResponse = decode_submission(SEND_TX_BATCH_PATH, &text)?;
        if body.code != CODE_OK {
            return Err(ClientError::from_ledger(
                body.code,
                body.message.unwrap_or_else(|| "send batch failed".to_string()),
            ));
        }

        let reason = body
            .message
            .clone()
            .unwrap_or_else(|| "entry not accepted".to_string());
        let results = (0..tx_types.len())
            .map(|i| match body.tx_hash.get(i) {
                Some(hash) if !hash.is_empty() => BatchEntryResult::accepted(hash.clone()),
                _ => BatchEntryResult::failed(reason.clone()),
            })
            .collect();

        Ok(results)
    }

    async fn get_transaction(&self, hash: &str) -> ClientResult<Option<TransactionRecord>> {
        let (status, text) = self
            .get_with_retry(
                TX_PATH,
                &[("by", "hash".to_string()), ("value", hash.to_string())],
            )
            .await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: TxQueryResponse = serde_json::from_str(&text)?;
        Ok(body.into_record(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Scripted reply for one connection
    #[derive(Clone)]
    enum Reply {
        Status(u16, &'static str),
        /// Headers promise a body that never arrives
        StallBody,
    }

    struct TestLedgerServer {
        url: String,
        hits: Arc<AtomicUsize>,
    }

    impl TestLedgerServer {
        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    /// Serves one scripted reply per connection; the last reply repeats
    async fn serve(replies: Vec<Reply>) -> TestLedgerServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let reply = replies[n.min(replies.len() - 1)].clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    match reply {
                        Reply::Status(code, body) => {
                            let response = format!(
                                "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                code,
                                body.len(),
                                body
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.shutdown().await;
                        }
                        Reply::StallBody => {
                            let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 64\r\n\r\n{\"code\":";
                            let _ = socket.write_all(head.as_bytes()).await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                });
            }
        });

        TestLedgerServer { url, hits }
    }

    fn ledger(url: &str) -> HttpLedger {
        HttpLedger::new(&LedgerConfig {
            base_urls: vec![url.to_string()],
            account_index: 1,
            api_key_indices: vec![2],
            request_timeout_ms: 500,
            max_retries: 3,
            initial_backoff_ms: 10,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_stalled_reply_body_leaves_delivery_unknown() {
        let server = serve(vec![Reply::StallBody]).await;

        let err = ledger(&server.url).send_tx(14, "{}").await.unwrap_err();
        assert!(err.is_delivery_unknown(), "got {:?}", err);
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_submission_reply_leaves_delivery_unknown() {
        let server = serve(vec![Reply::Status(502, "<html>bad gateway</html>")]).await;

        let err = ledger(&server.url).send_tx(14, "{}").await.unwrap_err();
        assert!(matches!(err, ClientError::DeliveryUnknown { .. }));
        // Submissions are never repeated
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_post_is_typed_and_not_repeated() {
        let server = serve(vec![Reply::Status(429, "{}")]).await;

        let err = ledger(&server.url).send_tx(14, "{}").await.unwrap_err();
        assert!(matches!(err, ClientError::RateLimited { .. }));
        assert!(!err.is_delivery_unknown());
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_get_backs_off_on_rate_limit() {
        let server = serve(vec![
            Reply::Status(429, "{}"),
            Reply::Status(200, r#"{"code":200,"nonce":77}"#),
        ])
        .await;

        let nonce = ledger(&server.url).next_nonce(1, 2).await.unwrap();
        assert_eq!(nonce, 77);
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_get_retries_transient_server_errors() {
        let server = serve(vec![
            Reply::Status(503, "unavailable"),
            Reply::Status(400, r#"{"code":29500,"message":"internal server error"}"#),
            Reply::Status(200, r#"{"code":200,"hash":"0xab","status":3}"#),
        ])
        .await;

        let record = ledger(&server.url).get_transaction("0xab").await.unwrap().unwrap();
        assert_eq!(record.status, crate::ledger::TxStatus::Executed);
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn test_get_gives_up_after_max_retries() {
        let server = serve(vec![Reply::Status(429, "{}")]).await;

        let err = ledger(&server.url).next_nonce(1, 2).await.unwrap_err();
        assert!(matches!(err, ClientError::RateLimited { .. }));
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn test_business_rejection_is_not_transient() {
        let server = serve(vec![Reply::Status(
            200,
            r#"{"code":21701,"message":"not enough margin"}"#,
        )])
        .await;

        let err = ledger(&server.url).send_tx(14, "{}").await.unwrap_err();
        assert!(matches!(err, ClientError::Ledger { code: 21701, .. }));
    }
}
