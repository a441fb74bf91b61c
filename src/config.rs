//! Configuration management for the ledger transaction client
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub confirm: ConfirmConfig,
    #[serde(default)]
    pub submit: SubmitConfig,
    pub signer: SignerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Request/response endpoints, tried in order on connection failure
    pub base_urls: Vec<String>,
    pub account_index: i64,
    /// API keys owned by this client; the first one is the default
    pub api_key_indices: Vec<u8>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Attempts for idempotent reads hitting rate limits or transient server errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff step, doubled per attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    /// Scheme and host, without a path (e.g. `wss://ledger.example/`)
    pub url: String,
    /// Explicit path; disables the fallback probe when set
    pub path: Option<String>,
    pub primary_path: String,
    pub fallback_path: String,
    pub heartbeat_interval_secs: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Allow only one request in flight so uncorrelated replies are unambiguous
    pub serialize_requests: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Values materialized per refill
    pub prefetch: usize,
    /// Buffer depth that triggers a background top-up (0 disables)
    pub low_water_mark: usize,
    /// Age after which a buffer is no longer trusted
    pub freshness_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfirmConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitConfig {
    pub transport: TransportPreference,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    Http,
    Stream,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub engine: SignerEngineKind,
    /// Sidecar executable
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variable holding the API private key handed to the sidecar
    pub private_key_env: Option<String>,
    /// Wait for one sidecar reply before the process is replaced
    #[serde(default = "default_signer_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignerEngineKind {
    Digest,
    Sidecar,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub health_check_interval_secs: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_signer_response_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    3_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            path: None,
            primary_path: "/jsonapi".to_string(),
            fallback_path: "/stream".to_string(),
            heartbeat_interval_secs: 30,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            serialize_requests: false,
        }
    }
}

impl StreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            prefetch: 20,
            low_water_mark: 2,
            freshness_secs: 30,
        }
    }
}

impl NonceConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
            timeout_ms: 30_000,
        }
    }
}

impl ConfirmConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            transport: TransportPreference::Http,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
            health_check_interval_secs: 30,
        }
    }
}

impl LedgerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff before retry `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    /// Default API key used when the caller does not pick one
    pub fn default_api_key(&self) -> u8 {
        self.api_key_indices.first().copied().unwrap_or(0)
    }
}

impl Settings {
    /// Load settings from the file named by `LEDGER_CLIENT_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("LEDGER_CLIENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.ledger.base_urls.is_empty() {
            anyhow::bail!("At least one ledger base URL must be configured");
        }
        if self.ledger.account_index < 0 {
            anyhow::bail!("Account index must be non-negative");
        }
        if self.ledger.api_key_indices.is_empty() {
            anyhow::bail!("At least one API key index must be configured");
        }
        if self.ledger.api_key_indices.iter().any(|k| *k == u8::MAX) {
            anyhow::bail!("API key index 255 is reserved");
        }

        if self.nonce.prefetch == 0 {
            anyhow::bail!("nonce.prefetch must be at least 1");
        }
        if self.nonce.low_water_mark >= self.nonce.prefetch {
            tracing::warn!(
                "nonce.low_water_mark {} >= prefetch {} - every allocation will top up",
                self.nonce.low_water_mark,
                self.nonce.prefetch
            );
        }

        if self.stream.enabled && self.stream.url.is_empty() {
            anyhow::bail!("Streaming transport enabled without a URL");
        }
        if self.submit.transport == TransportPreference::Stream && !self.stream.enabled {
            anyhow::bail!("Stream transport preferred but stream is disabled");
        }

        if self.signer.engine == SignerEngineKind::Sidecar && self.signer.command.is_none() {
            anyhow::bail!("Sidecar signer selected without a command");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [ledger]
        base_urls = ["https://ledger.example"]
        account_index = 42
        api_key_indices = [4, 5]

        [signer]
        engine = "digest"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("LEDGER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${LEDGER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.ledger.default_api_key(), 4);
        assert_eq!(settings.ledger.request_timeout_ms, 10_000);
        assert_eq!(settings.ledger.max_retries, 3);
        assert_eq!(settings.ledger.backoff(2), Duration::from_millis(12_000));
        assert_eq!(settings.nonce.low_water_mark, 2);
        assert_eq!(settings.stream.primary_path, "/jsonapi");
        assert_eq!(settings.stream.fallback_path, "/stream");
        assert_eq!(settings.submit.transport, TransportPreference::Http);
        assert!(settings.confirm.enabled);
    }

    #[test]
    fn test_stream_preference_requires_stream() {
        let raw = format!("{}\n[submit]\ntransport = \"stream\"\n", MINIMAL);
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn test_sidecar_requires_command() {
        let raw = MINIMAL.replace("engine = \"digest\"", "engine = \"sidecar\"");
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.ledger.account_index, 42);
        assert_eq!(settings.ledger.api_key_indices, vec![4, 5]);
    }
}
