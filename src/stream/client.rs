//! Persistent streaming transport
//!
//! Handles:
//! - Handshake with primary path probe and one fallback path on 404
//! - Request/response correlation over a pending-request table
//! - Heartbeat keepalives and server ping replies
//! - Bounded reconnect with fixed backoff
//! - Immediate failure of every pending request on disconnect

use super::frame::{self, BatchFormat, InboundFrame, StreamReply, MAX_BATCH_SIZE};
use crate::config::StreamConfig;
use crate::error::{ClientError, ClientResult};
use crate::ledger::types::CODE_OK;
use crate::ledger::BatchEntryResult;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 256;

/// One in-flight request awaiting its reply
struct PendingRequest {
    seq: u64,
    sent_at: Instant,
    reply: oneshot::Sender<ClientResult<Value>>,
}

/// State shared between callers and the connection supervisor
struct Shared {
    pending: DashMap<String, PendingRequest>,
    outbound: RwLock<Option<mpsc::Sender<Message>>>,
    health: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    seq: AtomicU64,
    /// Present when only one request may be in flight
    in_flight: Option<Semaphore>,
}

impl Shared {
    fn next_request_id(&self) -> (u64, String) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("tx_{}_{}", chrono::Utc::now().timestamp_millis(), seq);
        (seq, id)
    }

    fn set_connected(&self, connected: bool) {
        self.health.send_replace(connected);
        crate::metrics::record_stream_connected(connected);
    }

    async fn install_session(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *self.outbound.write().await = Some(tx);
        self.set_connected(true);
        rx
    }

    async fn teardown_session(&self, reason: &str) {
        *self.outbound.write().await = None;
        self.set_connected(false);
        self.fail_all_pending(reason);
    }

    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            warn!("Failing {} pending stream requests: {}", ids.len(), reason);
        }
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending
                    .reply
                    .send(Err(ClientError::Stream(format!("connection lost: {}", reason))));
            }
        }
        crate::metrics::record_stream_pending(0);
    }

    /// Route one inbound text frame; returns a frame to write back, if any
    fn dispatch(&self, text: &str) -> Option<Message> {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring undecodable stream frame: {}", e);
                return None;
            }
        };

        match frame {
            InboundFrame::Ping => return Some(Message::Text(frame::pong())),
            InboundFrame::Pong => {}
            InboundFrame::Connected => debug!("Stream session acknowledged"),
            InboundFrame::Correlated { id, reply } => match self.pending.remove(&id) {
                Some((_, pending)) => {
                    debug!("Reply for {} after {:?}", id, pending.sent_at.elapsed());
                    let _ = pending.reply.send(reply_result(reply));
                }
                None => debug!("Reply for unknown or expired request {}", id),
            },
            InboundFrame::UncorrelatedResult(value) => self.complete_oldest(Ok(value)),
            InboundFrame::UncorrelatedError(err) => {
                if self.pending.is_empty() {
                    error!("Stream error with no request in flight: {}", err.message);
                } else {
                    self.complete_oldest(Err(err.into_error()));
                }
            }
            InboundFrame::Other(value) => debug!("Unhandled stream frame: {}", value),
        }

        crate::metrics::record_stream_pending(self.pending.len());
        None
    }

    /// Workaround for replies that omit the request id: hand the result to
    /// the oldest request still waiting. Only exact with one request in
    /// flight, which `serialize_requests` guarantees.
    fn complete_oldest(&self, result: ClientResult<Value>) {
        let waiting = self.pending.len();
        let oldest = self
            .pending
            .iter()
            .min_by_key(|e| e.value().seq)
            .map(|e| e.key().clone());

        let Some(id) = oldest else {
            debug!("Uncorrelated reply with no request in flight");
            return;
        };
        if waiting > 1 {
            warn!(
                "Uncorrelated reply matched to oldest of {} pending requests ({})",
                waiting, id
            );
        }
        if let Some((_, pending)) = self.pending.remove(&id) {
            let _ = pending.reply.send(result);
        }
    }
}

fn reply_result(reply: StreamReply) -> ClientResult<Value> {
    match reply {
        StreamReply::Ok(value) => Ok(value),
        StreamReply::Err(err) => Err(err.into_error()),
    }
}

/// Acknowledgement of one streamed transaction
///
/// A non-200 code anywhere in the reply is a ledger rejection. The hash is
/// optional; callers fall back to the hash they signed.
pub fn parse_ack(payload: &Value) -> ClientResult<Option<String>> {
    let scopes = [Some(payload), payload.get("data")];

    for scope in scopes.iter().flatten() {
        if let Some(code) = scope.get("code").and_then(Value::as_i64) {
            if code != CODE_OK {
                let message = scope
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("transaction rejected");
                return Err(ClientError::from_ledger(code, message));
            }
        }
    }

    Ok(scopes.iter().flatten().find_map(|scope| {
        ["hash", "tx_hash"].iter().find_map(|k| {
            scope
                .get(*k)
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
        })
    }))
}

fn parse_batch_ack(payload: &Value, expected: usize) -> ClientResult<Vec<BatchEntryResult>> {
    let mut results: Vec<BatchEntryResult> = match payload {
        Value::Array(items) => items
            .iter()
            .map(|item| match parse_ack(item) {
                Ok(Some(hash)) => BatchEntryResult::accepted(hash),
                Ok(None) => BatchEntryResult::failed("no hash in reply"),
                Err(e) => BatchEntryResult::failed(e.to_string()),
            })
            .collect(),
        _ => {
            // Whole-batch rejection propagates
            parse_ack(payload)?;
            match payload.get("tx_hash").or_else(|| payload.get("hashes")) {
                Some(Value::Array(hashes)) => hashes
                    .iter()
                    .map(|h| match h.as_str().filter(|h| !h.is_empty()) {
                        Some(hash) => BatchEntryResult::accepted(hash),
                        None => BatchEntryResult::failed("entry not accepted"),
                    })
                    .collect(),
                _ => match parse_ack(payload)? {
                    Some(hash) if expected == 1 => vec![BatchEntryResult::accepted(hash)],
                    _ => Vec::new(),
                },
            }
        }
    };

    results.resize_with(expected, || BatchEntryResult::failed("no result for entry"));
    results.truncate(expected);
    Ok(results)
}

/// Gateway could not read the batch arrays; nothing was executed
fn is_format_refusal(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["tx_types", "tx_infos", "unmarshal", "cannot parse", "invalid format", "malformed"]
        .iter()
        .any(|marker| message.contains(marker))
}

/// Open the socket, probing the fallback path only when no path is configured
async fn open(config: &StreamConfig) -> ClientResult<(WsStream, String)> {
    let base = config.url.trim_end_matches('/');
    let paths: Vec<&str> = match config.path.as_deref() {
        Some(path) => vec![path],
        None => vec![config.primary_path.as_str(), config.fallback_path.as_str()],
    };

    let mut last_error = None;
    for (attempt, path) in paths.iter().enumerate() {
        let url = format!("{}{}", base, path);
        match timeout(config.connect_timeout(), connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => return Ok((stream, url)),
            Ok(Err(WsError::Http(resp)))
                if resp.status() == StatusCode::NOT_FOUND && attempt + 1 < paths.len() =>
            {
                warn!("Stream path {} not found, trying fallback", url);
                last_error = Some(format!("{} returned 404", url));
            }
            Ok(Err(e)) => {
                return Err(ClientError::StreamUnavailable(format!(
                    "handshake with {} failed: {}",
                    url, e
                )))
            }
            Err(_) => {
                return Err(ClientError::StreamUnavailable(format!(
                    "handshake with {} timed out",
                    url
                )))
            }
        }
    }

    Err(ClientError::StreamUnavailable(
        last_error.unwrap_or_else(|| "no stream path configured".to_string()),
    ))
}

/// Drive one connected session until it ends; returns the reason
async fn run_session(
    shared: &Shared,
    config: &StreamConfig,
    stream: WsStream,
    mut outbound: mpsc::Receiver<Message>,
) -> String {
    let (mut sink, mut source) = stream.split();
    let period = config.heartbeat_interval();
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = shared.dispatch(&text) {
                        if let Err(e) = sink.send(reply).await {
                            return format!("write failed: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        return format!("write failed: {}", e);
                    }
                }
                Some(Ok(Message::Close(close))) => {
                    return format!("closed by server: {:?}", close);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("read failed: {}", e),
                None => return "stream ended".to_string(),
            },
            Some(message) = outbound.recv() => {
                if let Err(e) = sink.send(message).await {
                    return format!("write failed: {}", e);
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Message::Text(frame::pong())).await {
                    return format!("heartbeat failed: {}", e);
                }
                debug!("Sent stream keepalive");
            }
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return "shutdown".to_string();
            }
        }
    }
}

/// Reconnect loop around sessions
async fn supervise(
    shared: Arc<Shared>,
    config: StreamConfig,
    first: WsStream,
    first_outbound: mpsc::Receiver<Message>,
) {
    let mut session = Some((first, first_outbound));
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        if let Some((stream, outbound)) = session.take() {
            let reason = run_session(&shared, &config, stream, outbound).await;
            shared.teardown_session(&reason).await;
            if *shared.shutdown.borrow() {
                break;
            }
            warn!("Stream session ended: {}", reason);
        }

        let mut attempt = 0;
        while attempt < config.max_reconnect_attempts {
            attempt += 1;
            tokio::select! {
                _ = sleep(config.reconnect_delay()) => {}
                _ = shutdown.changed() => return,
            }

            match open(&config).await {
                Ok((stream, url)) => {
                    info!("Stream reconnected to {} (attempt {})", url, attempt);
                    crate::metrics::record_stream_reconnect(true);
                    let outbound = shared.install_session().await;
                    session = Some((stream, outbound));
                    break;
                }
                Err(e) => {
                    crate::metrics::record_stream_reconnect(false);
                    warn!(
                        "Stream reconnect attempt {}/{} failed: {}",
                        attempt, config.max_reconnect_attempts, e
                    );
                }
            }
        }

        if session.is_none() {
            error!(
                "Stream reconnect gave up after {} attempts",
                config.max_reconnect_attempts
            );
            break;
        }
    }
}

/// Long-lived streaming connection with an async request/response façade
pub struct StreamTransport {
    config: StreamConfig,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    pub fn new(config: StreamConfig) -> Self {
        let (health, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        let in_flight = config.serialize_requests.then(|| Semaphore::new(1));

        Self {
            config,
            shared: Arc::new(Shared {
                pending: DashMap::new(),
                outbound: RwLock::new(None),
                health,
                shutdown,
                seq: AtomicU64::new(0),
                in_flight,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Connect and start the background session; no-op when already running
    pub async fn start(&self) -> ClientResult<()> {
        self.revive().await.map(|_| ())
    }

    /// Connect again once the supervisor has stopped, e.g. after reconnects gave up
    ///
    /// Returns `true` when a new session was started.
    pub async fn revive(&self) -> ClientResult<bool> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(false);
        }

        let (stream, url) = open(&self.config).await?;
        info!("Streaming transport connected to {}", url);

        self.shared.shutdown.send_replace(false);
        let outbound = self.shared.install_session().await;
        *supervisor = Some(tokio::spawn(supervise(
            self.shared.clone(),
            self.config.clone(),
            stream,
            outbound,
        )));
        Ok(true)
    }

    /// Close the connection and fail anything still waiting
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
        self.shared.teardown_session("transport shut down").await;
        info!("Streaming transport stopped");
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.health.borrow()
    }

    /// Connection health updates
    pub fn health(&self) -> watch::Receiver<bool> {
        self.shared.health.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Submit one signed transaction; returns the acknowledged hash if the reply carries one
    pub async fn send_tx(&self, tx_type: u8, tx_info: &str) -> ClientResult<Option<String>> {
        let reply = self
            .request(|id| frame::send_tx(id, tx_type, tx_info))
            .await?;
        parse_ack(&reply)
    }

    /// Submit independent transactions
    ///
    /// Retries once with encoded arrays when the gateway cannot read the
    /// array form. Any other rejection is returned as is.
    pub async fn send_tx_batch(
        &self,
        tx_types: &[u8],
        tx_infos: &[String],
    ) -> ClientResult<Vec<BatchEntryResult>> {
        if tx_types.len() != tx_infos.len() {
            return Err(ClientError::Validation(
                "tx_types and tx_infos must have same length".to_string(),
            ));
        }
        if tx_types.is_empty() || tx_types.len() > MAX_BATCH_SIZE {
            return Err(ClientError::Validation(format!(
                "stream batch must hold 1..={} transactions, got {}",
                MAX_BATCH_SIZE,
                tx_types.len()
            )));
        }

        let first = self
            .request(|id| frame::send_tx_batch(id, tx_types, tx_infos, BatchFormat::Array))
            .await
            .and_then(|reply| parse_batch_ack(&reply, tx_types.len()));

        match first {
            Err(ClientError::Ledger { code, message }) if is_format_refusal(&message) => {
                warn!(
                    "Batch refused in array format (code {}): {}; retrying encoded",
                    code, message
                );
                let reply = self
                    .request(|id| frame::send_tx_batch(id, tx_types, tx_infos, BatchFormat::Encoded))
                    .await?;
                parse_batch_ack(&reply, tx_types.len())
            }
            other => other,
        }
    }

    async fn request<F>(&self, build: F) -> ClientResult<Value>
    where
        F: FnOnce(&str) -> String,
    {
        let _permit = match &self.shared.in_flight {
            Some(gate) => Some(
                gate.acquire()
                    .await
                    .map_err(|_| ClientError::StreamUnavailable("transport closed".to_string()))?,
            ),
            None => None,
        };

        let sender = self.shared.outbound.read().await.clone();
        let sender = match sender {
            Some(sender) if self.is_connected() => sender,
            _ => {
                return Err(ClientError::StreamUnavailable(
                    "stream not connected".to_string(),
                ))
            }
        };

        let (seq, id) = self.shared.next_request_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(
            id.clone(),
            PendingRequest {
                seq,
                sent_at: Instant::now(),
                reply: reply_tx,
            },
        );
        crate::metrics::record_stream_pending(self.shared.pending.len());

        if sender.send(Message::Text(build(&id))).await.is_err() {
            self.shared.pending.remove(&id);
            return Err(ClientError::StreamUnavailable(
                "session closed before the request was written".to_string(),
            ));
        }
        debug!("Stream request {} queued", id);

        match timeout(self.config.request_timeout(), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Stream(format!(
                "request {} dropped without a reply",
                id
            ))),
            Err(_) => {
                self.shared.pending.remove(&id);
                crate::metrics::record_stream_pending(self.shared.pending.len());
                warn!("Stream request {} timed out", id);
                Err(ClientError::Timeout {
                    operation: format!("stream request {}", id),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Reply with the request id
        Echo,
        /// Reply with a bare hash record
        Bare,
        /// Drop the connection after reading a request
        Hangup,
        /// Drop the first connection, echo on later ones
        HangupFirst,
        /// Read requests and never answer
        Silent,
        /// Answer every request with a business rejection
        Reject,
        /// Refuse batches sent as native arrays
        RejectArrays,
    }

    struct TestServer {
        url: String,
        paths: Arc<StdMutex<Vec<String>>>,
        requests: Arc<AtomicUsize>,
    }

    impl TestServer {
        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    async fn spawn_server(accept_path: Option<&'static str>, behavior: Behavior) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let paths = Arc::new(StdMutex::new(Vec::new()));
        let seen = paths.clone();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let connections = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let seen = seen.clone();
                let counter = counter.clone();
                let connection = connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let path = req.uri().path().to_string();
                        seen.lock().unwrap().push(path.clone());
                        if Some(path.as_str()) == accept_path {
                            Ok(resp)
                        } else {
                            Err(Response::builder().status(404).body(None).unwrap())
                        }
                    };
                    let Ok(mut ws) = accept_hdr_async(tcp, callback).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let request: Value = serde_json::from_str(&text).unwrap();
                        if request["type"] == "pong" {
                            continue;
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                        let id = request["data"]["id"].as_str().unwrap_or_default().to_string();
                        let echo = json!({
                            "id": id,
                            "success": true,
                            "result": {"code": 200, "hash": format!("0x{}", id)}
                        });
                        let reply = match behavior {
                            Behavior::Echo => echo,
                            Behavior::Bare => json!({"code": 200, "hash": "0xbare"}),
                            Behavior::Hangup => return,
                            Behavior::HangupFirst if connection == 0 => return,
                            Behavior::HangupFirst => echo,
                            Behavior::Silent => continue,
                            Behavior::Reject => json!({
                                "id": id,
                                "success": false,
                                "error": {"code": 21701, "message": "not enough margin"}
                            }),
                            Behavior::RejectArrays if request["data"]["tx_types"].is_array() => json!({
                                "id": id,
                                "success": false,
                                "error": {"code": 21000, "message": "invalid tx_types: cannot unmarshal array"}
                            }),
                            Behavior::RejectArrays => echo,
                        };
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        TestServer {
            url,
            paths,
            requests,
        }
    }

    fn config(url: &str, path: Option<&str>) -> StreamConfig {
        StreamConfig {
            enabled: true,
            url: url.to_string(),
            path: path.map(str::to_string),
            max_reconnect_attempts: 0,
            request_timeout_ms: 5_000,
            ..StreamConfig::default()
        }
    }

    #[tokio::test]
    async fn test_not_found_probes_fallback_once() {
        let server = spawn_server(None, Behavior::Echo).await;
        let transport = StreamTransport::new(config(&server.url, None));

        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, ClientError::StreamUnavailable(_)));
        assert_eq!(
            *server.paths.lock().unwrap(),
            vec!["/jsonapi".to_string(), "/stream".to_string()]
        );
    }

    #[tokio::test]
    async fn test_explicit_path_never_falls_back() {
        let server = spawn_server(None, Behavior::Echo).await;
        let transport = StreamTransport::new(config(&server.url, Some("/custom")));

        assert!(transport.start().await.is_err());
        assert_eq!(*server.paths.lock().unwrap(), vec!["/custom".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_path_connects() {
        let server = spawn_server(Some("/stream"), Behavior::Echo).await;
        let transport = StreamTransport::new(config(&server.url, None));

        transport.start().await.unwrap();
        assert!(transport.is_connected());
        transport.shutdown().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_correlated_reply_returns_hash() {
        let server = spawn_server(Some("/jsonapi"), Behavior::Echo).await;
        let transport = StreamTransport::new(config(&server.url, None));
        transport.start().await.unwrap();

        let hash = transport.send_tx(14, r#"{"Nonce":1}"#).await.unwrap().unwrap();
        assert!(hash.starts_with("0xtx_"));
        assert_eq!(transport.pending_requests(), 0);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_bare_reply_matches_oldest_pending() {
        let server = spawn_server(Some("/jsonapi"), Behavior::Bare).await;
        let mut cfg = config(&server.url, None);
        cfg.serialize_requests = true;
        let transport = StreamTransport::new(cfg);
        transport.start().await.unwrap();

        let hash = transport.send_tx(15, "{}").await.unwrap();
        assert_eq!(hash.as_deref(), Some("0xbare"));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_immediately() {
        let server = spawn_server(Some("/jsonapi"), Behavior::Hangup).await;
        let transport = StreamTransport::new(config(&server.url, None));
        transport.start().await.unwrap();

        // Far below the 5s request timeout
        let result = timeout(Duration::from_secs(2), transport.send_tx(14, "{}"))
            .await
            .expect("pending request should fail on disconnect");
        assert!(matches!(result, Err(ClientError::Stream(_))));
    }

    #[tokio::test]
    async fn test_request_timeout_frees_pending_slot() {
        let server = spawn_server(Some("/jsonapi"), Behavior::Silent).await;
        let mut cfg = config(&server.url, None);
        cfg.request_timeout_ms = 200;
        let transport = StreamTransport::new(cfg);
        transport.start().await.unwrap();

        let err = transport.send_tx(14, "{}").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
        assert!(err.is_delivery_unknown());
        assert_eq!(transport.pending_requests(), 0);
        assert!(transport.is_connected());
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_drop_and_serves_requests() {
        let server = spawn_server(Some("/jsonapi"), Behavior::HangupFirst).await;
        let mut cfg = config(&server.url, None);
        cfg.max_reconnect_attempts = 3;
        cfg.reconnect_delay_ms = 50;
        let transport = StreamTransport::new(cfg);
        transport.start().await.unwrap();

        let err = transport.send_tx(14, "{}").await.unwrap_err();
        assert!(matches!(err, ClientError::Stream(_)));

        let mut health = transport.health();
        timeout(Duration::from_secs(2), health.wait_for(|connected| *connected))
            .await
            .expect("stream should reconnect")
            .unwrap();

        let hash = transport.send_tx(14, "{}").await.unwrap().unwrap();
        assert!(hash.starts_with("0xtx_"));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_revive_after_reconnects_gave_up() {
        let server = spawn_server(Some("/jsonapi"), Behavior::HangupFirst).await;
        let transport = StreamTransport::new(config(&server.url, None));
        transport.start().await.unwrap();
        assert!(!transport.revive().await.unwrap());

        // No reconnect attempts configured, so the supervisor stops
        assert!(transport.send_tx(14, "{}").await.is_err());
        sleep(Duration::from_millis(100)).await;
        assert!(!transport.is_connected());

        assert!(transport.revive().await.unwrap());
        assert!(transport.is_connected());
        assert!(transport.send_tx(14, "{}").await.unwrap().is_some());
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_business_rejection_of_batch_is_not_resent() {
        let server = spawn_server(Some("/jsonapi"), Behavior::Reject).await;
        let transport = StreamTransport::new(config(&server.url, None));
        transport.start().await.unwrap();

        let err = transport
            .send_tx_batch(&[14], &[r#"{"Nonce":1}"#.to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Ledger { code: 21701, .. }));
        assert_eq!(server.requests(), 1);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_array_format_refusal_retries_encoded() {
        let server = spawn_server(Some("/jsonapi"), Behavior::RejectArrays).await;
        let transport = StreamTransport::new(config(&server.url, None));
        transport.start().await.unwrap();

        let results = transport
            .send_tx_batch(&[14], &[r#"{"Nonce":1}"#.to_string()])
            .await
            .unwrap();
        assert!(results[0].is_accepted());
        assert_eq!(server.requests(), 2);
        transport.shutdown().await;
    }

    #[test]
    fn test_format_refusal_detection() {
        assert!(is_format_refusal("invalid tx_infos: cannot unmarshal string"));
        assert!(!is_format_refusal("not enough margin"));
        assert!(!is_format_refusal("order not found"));
    }

    #[tokio::test]
    async fn test_not_connected_is_unavailable() {
        let transport = StreamTransport::new(config("ws://127.0.0.1:9", None));
        let err = transport.send_tx(14, "{}").await.unwrap_err();
        assert!(matches!(err, ClientError::StreamUnavailable(_)));
    }

    #[test]
    fn test_ack_rejection_and_hash() {
        let err = parse_ack(&json!({"code": 21104, "message": "invalid nonce"})).unwrap_err();
        assert!(err.is_nonce_error());

        let nested = parse_ack(&json!({"data": {"code": 200, "tx_hash": "0xd"}})).unwrap();
        assert_eq!(nested.as_deref(), Some("0xd"));

        assert_eq!(parse_ack(&json!({"code": 200})).unwrap(), None);
    }

    #[test]
    fn test_batch_ack_pads_missing_entries() {
        let results = parse_batch_ack(&json!({"code": 200, "tx_hash": ["0x1", ""]}), 3).unwrap();
        assert!(results[0].is_accepted());
        assert!(!results[1].is_accepted());
        assert!(!results[2].is_accepted());

        let listed = parse_batch_ack(
            &json!([{"hash": "0xa"}, {"code": 21701, "message": "not enough margin"}]),
            2,
        )
        .unwrap();
        assert!(listed[0].is_accepted());
        assert!(listed[1].error.as_deref().unwrap().contains("not enough margin"));
    }
}
