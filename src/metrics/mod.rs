//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce refills, rollbacks and hard refreshes
//! - Submissions per transport and nonce retries
//! - Streaming connection health and pending requests
//! - Confirmation outcomes and latency

use crate::error::{ClientError, ClientResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Nonce metrics
    pub static ref NONCE_REFILLS: CounterVec = register_counter_vec!(
        "ledger_client_nonce_refills_total",
        "Nonce buffer refills from the ledger",
        &["api_key"]
    ).unwrap();

    pub static ref NONCE_ROLLBACKS: CounterVec = register_counter_vec!(
        "ledger_client_nonce_rollbacks_total",
        "Nonces released after a failed submission",
        &["api_key"]
    ).unwrap();

    pub static ref NONCE_HARD_REFRESHES: CounterVec = register_counter_vec!(
        "ledger_client_nonce_hard_refreshes_total",
        "Nonce buffers discarded and re-fetched",
        &["api_key"]
    ).unwrap();

    // Submission metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "ledger_client_transactions_submitted_total",
        "Transactions accepted by the ledger",
        &["transport", "tx_type"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "ledger_client_transactions_failed_total",
        "Submissions that returned an error",
        &["transport", "kind"]
    ).unwrap();

    pub static ref NONCE_RETRIES: Counter = register_counter!(
        "ledger_client_nonce_retries_total",
        "Submissions re-signed after an invalid nonce"
    ).unwrap();

    pub static ref SUBMIT_LATENCY: HistogramVec = register_histogram_vec!(
        "ledger_client_submit_latency_seconds",
        "Time from submit to ledger acknowledgement",
        &["transport"],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // Stream metrics
    pub static ref STREAM_CONNECTED: Gauge = register_gauge!(
        "ledger_client_stream_connected",
        "Streaming connection status (1=connected, 0=disconnected)"
    ).unwrap();

    pub static ref STREAM_RECONNECTS: CounterVec = register_counter_vec!(
        "ledger_client_stream_reconnects_total",
        "Streaming reconnect attempts",
        &["result"]
    ).unwrap();

    pub static ref STREAM_PENDING: Gauge = register_gauge!(
        "ledger_client_stream_pending_requests",
        "Streaming requests awaiting a response"
    ).unwrap();

    // Confirmation metrics
    pub static ref CONFIRMATIONS: CounterVec = register_counter_vec!(
        "ledger_client_confirmations_total",
        "Confirmation outcomes",
        &["outcome"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "ledger_client_confirmation_latency_seconds",
        "Time until a confirmation outcome was known",
        &["outcome"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "ledger_client_health_checks_total",
        "Periodic health checks",
        &["result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> ClientResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ClientError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ClientError::Internal(format!("Metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Encode every registered metric in the text exposition format
pub fn render() -> ClientResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ClientError::Internal(format!("Metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| ClientError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_nonce_refill(api_key_index: u8) {
    NONCE_REFILLS
        .with_label_values(&[&api_key_index.to_string()])
        .inc();
}

pub fn record_nonce_rollback(api_key_index: u8) {
    NONCE_ROLLBACKS
        .with_label_values(&[&api_key_index.to_string()])
        .inc();
}

pub fn record_nonce_hard_refresh(api_key_index: u8) {
    NONCE_HARD_REFRESHES
        .with_label_values(&[&api_key_index.to_string()])
        .inc();
}

pub fn record_tx_submitted(transport: &str, tx_type: u8, latency: Duration) {
    TX_SUBMITTED
        .with_label_values(&[transport, &tx_type.to_string()])
        .inc();
    SUBMIT_LATENCY
        .with_label_values(&[transport])
        .observe(latency.as_secs_f64());
}

pub fn record_tx_failed(transport: &str, error: &ClientError) {
    let kind = match error {
        ClientError::Nonce { .. } => "nonce",
        ClientError::Ledger { .. } | ClientError::Rejected { .. } => "ledger",
        ClientError::Timeout { .. } | ClientError::DeliveryUnknown { .. } => "timeout",
        ClientError::RateLimited { .. } => "rate_limited",
        ClientError::Validation(_) => "validation",
        ClientError::Signing(_) => "signing",
        e if e.is_retryable() => "transport",
        _ => "other",
    };
    TX_FAILED.with_label_values(&[transport, kind]).inc();
}

pub fn record_nonce_retry() {
    NONCE_RETRIES.inc();
}

pub fn record_stream_connected(connected: bool) {
    STREAM_CONNECTED.set(if connected { 1.0 } else { 0.0 });
}

pub fn record_stream_reconnect(success: bool) {
    STREAM_RECONNECTS
        .with_label_values(&[if success { "success" } else { "failure" }])
        .inc();
}

pub fn record_stream_pending(count: usize) {
    STREAM_PENDING.set(count as f64);
}

pub fn record_confirmation(outcome: &str, elapsed: Duration) {
    CONFIRMATIONS.with_label_values(&[outcome]).inc();
    CONFIRMATION_LATENCY
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}

pub fn record_health_check(healthy: bool) {
    HEALTH_CHECKS
        .with_label_values(&[if healthy { "success" } else { "failure" }])
        .inc();
}
