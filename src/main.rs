//! Ledger transaction client daemon
//!
//! Keeps nonce buffers warm for the configured API keys, holds the streaming
//! connection open and serves metrics until asked to stop.

use anyhow::Result;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use ledger_tx_client::metrics::{self, MetricsServer};
use ledger_tx_client::tx::NonceKey;
use ledger_tx_client::{OrderClient, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting ledger transaction client v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for account {} with {} API keys",
        settings.ledger.account_index,
        settings.ledger.api_key_indices.len()
    );

    let client = OrderClient::from_settings(&settings)?;
    let keys: Vec<NonceKey> = settings
        .ledger
        .api_key_indices
        .iter()
        .map(|k| NonceKey::new(settings.ledger.account_index, *k))
        .collect();

    // Prime nonce buffers
    for key in &keys {
        if let Err(e) = client.nonces().prime(*key).await {
            warn!("Could not prime nonces for {}: {}", key, e);
        }
    }

    // Connect the streaming transport
    if let Some(stream) = client.stream() {
        if let Err(e) = stream.start().await {
            warn!("Streaming transport not connected, using request/response: {}", e);
        }
    }

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let client = client.clone();
        let keys = keys.clone();
        let interval = Duration::from_secs(settings.metrics.health_check_interval_secs.max(1));
        async move {
            loop {
                tokio::time::sleep(interval).await;

                let mut healthy = true;
                if let Some(stream) = client.stream() {
                    if !stream.is_connected() {
                        warn!("Streaming transport is disconnected");
                        healthy = false;
                        // Only acts once the reconnect loop has given up
                        match stream.revive().await {
                            Ok(true) => info!("Streaming transport restarted"),
                            Ok(false) => {}
                            Err(e) => warn!("Streaming transport restart failed: {}", e),
                        }
                    }
                }

                // Refetches only buffers that went stale
                for key in &keys {
                    if let Err(e) = client.nonces().prime(*key).await {
                        warn!("Nonce refresh for {} failed: {}", key, e);
                        healthy = false;
                    }
                }

                metrics::record_health_check(healthy);
            }
        }
    });

    info!("Ledger transaction client is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    health_handle.abort();
    if let Some(stream) = client.stream() {
        stream.shutdown().await;
    }

    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Ledger transaction client stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ledger_tx_client=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
