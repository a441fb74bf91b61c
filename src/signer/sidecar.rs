//! External signer process speaking line-delimited JSON
//!
//! The process is spawned on first use and reused while healthy. Requests are
//! written one at a time; each request line is answered by exactly one
//! response line. A process that times out, closes its pipes or fails a
//! write is killed, and the next request starts a fresh one so a late reply
//! can never be read as the answer to a different request.

use super::{EngineOutput, SignRequest, SigningEngine};
use crate::config::SignerConfig;
use crate::error::{ClientError, ClientResult};

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const PRIVATE_KEY_VAR: &str = "SIGNER_PRIVATE_KEY";

struct SidecarProcess {
    // Killed on drop
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl SidecarProcess {
    /// Write one request line and read its answer
    async fn exchange(&mut self, line: &str, wait: Duration) -> ClientResult<String> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ClientError::Signing(format!("signer write failed: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ClientError::Signing(format!("signer flush failed: {}", e)))?;

        timeout(wait, self.stdout.next_line())
            .await
            .map_err(|_| ClientError::Timeout {
                operation: "signer response".to_string(),
            })?
            .map_err(|e| ClientError::Signing(format!("signer read failed: {}", e)))?
            .ok_or_else(|| ClientError::Signing("signer process exited".to_string()))
    }
}

pub struct SidecarEngine {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    response_timeout: Duration,
    /// `None` until first use and after a failed exchange
    process: Mutex<Option<SidecarProcess>>,
}

impl SidecarEngine {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            process: Mutex::new(None),
        }
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Build from configuration, forwarding the key from the configured variable
    pub fn from_config(config: &SignerConfig) -> ClientResult<Self> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| ClientError::Config("sidecar signer needs a command".to_string()))?;
        let mut engine = Self::new(command, config.args.clone())
            .with_response_timeout(Duration::from_millis(config.response_timeout_ms));

        if let Some(var) = &config.private_key_env {
            let key = std::env::var(var).map_err(|_| {
                ClientError::Config(format!("signer key variable {} is not set", var))
            })?;
            engine.env.push((PRIVATE_KEY_VAR.to_string(), key));
        }

        Ok(engine)
    }

    fn spawn(&self) -> ClientResult<SidecarProcess> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClientError::Signing(format!("cannot start signer {}: {}", self.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Signing("signer stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Signing("signer stdout unavailable".to_string()))?;

        info!("Started signer process {} (pid {:?})", self.command, child.id());
        Ok(SidecarProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

#[async_trait]
impl SigningEngine for SidecarEngine {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    async fn sign(&self, request: &SignRequest) -> ClientResult<EngineOutput> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let mut guard = self.process.lock().await;
        let mut process = match guard.take() {
            Some(mut process) => match process.child.try_wait() {
                Ok(None) => process,
                status => {
                    warn!("Signer process exited ({:?}), restarting", status);
                    self.spawn()?
                }
            },
            None => self.spawn()?,
        };

        let response = match process.exchange(&line, self.response_timeout).await {
            Ok(response) => response,
            Err(e) => {
                // Dropping kills the process along with any reply still in flight
                warn!(
                    "Discarding signer process (pid {:?}): {}",
                    process.child.id(),
                    e
                );
                return Err(e);
            }
        };
        *guard = Some(process);

        debug!("Signer answered {} request", request.tx_type);
        serde_json::from_str(&response)
            .map_err(|e| ClientError::Signing(format!("malformed signer response: {}", e)))
    }
}
