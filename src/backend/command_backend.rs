use std::process::Output;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::sleep;
use tokio::time::timeout;
use tonic::async_trait;
use tracing::debug;
use tracing::warn;

use crate::BackendCapabilities;
use crate::BackendConfig;
use crate::BackendError;
use crate::BackendExecutor;
use crate::BackoffPolicy;
use crate::FailureReason;
use crate::Outcome;
use crate::ProbeReport;
use crate::Result;

/// Reply framing of the helper binary: one JSON document on stdout
#[derive(Debug, Deserialize)]
struct HelperReply {
    /// "success" or "failure"
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    backend_id: Option<String>,
    #[serde(default)]
    exists: Option<bool>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    mapped_nodes: Option<Vec<String>>,
    #[serde(default)]
    online_snapshot: Option<bool>,
}

/// Drives the SAN tooling through an operator-supplied helper binary.
///
/// Each command is one helper invocation: subcommand plus flags on argv,
/// a JSON reply on stdout. The helper owns idempotency per token; this
/// adapter owns the deadline, the outcome classification, and a bounded
/// backoff retry when the helper fails to spawn (a definite no-op). A
/// helper that exits abnormally without a reply counts as `Unknown`,
/// because the side effect may or may not have happened.
pub struct CommandBackend {
    config: BackendConfig,
    retry: BackoffPolicy,
    capabilities: ArcSwap<BackendCapabilities>,
}

impl CommandBackend {
    pub fn new(
        config: BackendConfig,
        retry: BackoffPolicy,
    ) -> Self {
        let capabilities = ArcSwap::from_pointee(BackendCapabilities {
            online_snapshot: config.online_snapshot,
        });
        Self {
            config,
            retry,
            capabilities,
        }
    }

    /// Asks the helper for its capability report and caches it. Best
    /// effort: a helper without the subcommand keeps the configured
    /// defaults.
    pub async fn refresh_capabilities(&self) -> Result<()> {
        match self.invoke("capabilities", &[]).await? {
            Outcome::Success(reply) => {
                if let Some(online_snapshot) = reply.online_snapshot {
                    self.capabilities
                        .store(std::sync::Arc::new(BackendCapabilities { online_snapshot }));
                }
                Ok(())
            }
            _ => {
                warn!("capability probe inconclusive, keeping configured defaults");
                Ok(())
            }
        }
    }

    async fn invoke(
        &self,
        subcommand: &'static str,
        args: &[(&str, String)],
    ) -> Result<Outcome<HelperReply>> {
        debug!("backend helper: {} {:?}", subcommand, args);

        let deadline = Duration::from_millis(self.config.command_deadline_ms);
        let mut spawn_attempts = 0;
        let mut delay = Duration::from_millis(self.retry.base_delay_ms);

        let output = loop {
            let mut command = Command::new(&self.config.helper_path);
            command.arg(subcommand);
            for (flag, value) in args {
                command.arg(flag).arg(value);
            }
            command.kill_on_drop(true);

            match timeout(deadline, command.output()).await {
                Ok(Ok(output)) => break output,
                Ok(Err(e)) => {
                    // The helper never started, so nothing can have
                    // happened; safe to retry
                    spawn_attempts += 1;
                    if spawn_attempts >= self.retry.max_retries {
                        return Err(BackendError::Unavailable(format!(
                            "helper {} failed to spawn: {}",
                            self.config.helper_path.display(),
                            e
                        ))
                        .into());
                    }
                    warn!(
                        "backend helper spawn failed (attempt {}): {}",
                        spawn_attempts, e
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(self.retry.max_delay_ms));
                }
                Err(_) => {
                    warn!("backend helper {} timed out after {:?}", subcommand, deadline);
                    return Ok(Outcome::Unknown);
                }
            }
        };

        Self::classify(subcommand, output)
    }

    fn classify(
        subcommand: &'static str,
        output: Output,
    ) -> Result<Outcome<HelperReply>> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: HelperReply = match serde_json::from_str(stdout.trim()) {
            Ok(reply) => reply,
            Err(_) if !output.status.success() => {
                // Abnormal exit without a reply: the command may have
                // partially run
                warn!(
                    "backend helper {} exited {:?} without a reply",
                    subcommand, output.status
                );
                return Ok(Outcome::Unknown);
            }
            Err(e) => {
                return Err(BackendError::MalformedReply(format!(
                    "{}: {} in {:?}",
                    subcommand, e, stdout
                ))
                .into());
            }
        };

        match reply.status.as_str() {
            "success" => Ok(Outcome::Success(reply)),
            "failure" => Ok(Outcome::Failure(Self::failure_reason(&reply))),
            other => Err(BackendError::MalformedReply(format!(
                "{}: unexpected status {:?}",
                subcommand, other
            ))
            .into()),
        }
    }

    fn failure_reason(reply: &HelperReply) -> FailureReason {
        match reply.reason.as_deref() {
            Some("capacity-exceeded") => FailureReason::CapacityExceeded,
            Some("fenced") => FailureReason::Fenced,
            Some("not-found") => FailureReason::NotFound,
            _ => FailureReason::Other(
                reply
                    .message
                    .clone()
                    .or_else(|| reply.reason.clone())
                    .unwrap_or_else(|| "unspecified".to_string()),
            ),
        }
    }

    fn expect_backend_id(
        subcommand: &'static str,
        outcome: Outcome<HelperReply>,
    ) -> Result<Outcome<String>> {
        match outcome {
            Outcome::Success(reply) => match reply.backend_id {
                Some(id) => Ok(Outcome::Success(id)),
                None => Err(BackendError::MalformedReply(format!(
                    "{}: success reply without backend_id",
                    subcommand
                ))
                .into()),
            },
            Outcome::Failure(reason) => Ok(Outcome::Failure(reason)),
            Outcome::Unknown => Ok(Outcome::Unknown),
        }
    }
}

#[async_trait]
impl BackendExecutor for CommandBackend {
    async fn create_volume(
        &self,
        size: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<String>> {
        let outcome = self
            .invoke(
                "create",
                &[
                    ("--size", size.to_string()),
                    ("--token", idempotency_token.to_string()),
                ],
            )
            .await?;
        Self::expect_backend_id("create", outcome)
    }

    async fn delete_volume(
        &self,
        backend_id: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let outcome = self
            .invoke(
                "delete",
                &[
                    ("--volume", backend_id.to_string()),
                    ("--token", idempotency_token.to_string()),
                ],
            )
            .await?;
        Ok(outcome.map_unit())
    }

    async fn map_volume(
        &self,
        backend_id: &str,
        node: &str,
        fencing_token: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let outcome = self
            .invoke(
                "map",
                &[
                    ("--volume", backend_id.to_string()),
                    ("--node", node.to_string()),
                    ("--fencing-token", fencing_token.to_string()),
                    ("--token", idempotency_token.to_string()),
                ],
            )
            .await?;
        Ok(outcome.map_unit())
    }

    async fn unmap_volume(
        &self,
        backend_id: &str,
        node: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let outcome = self
            .invoke(
                "unmap",
                &[
                    ("--volume", backend_id.to_string()),
                    ("--node", node.to_string()),
                    ("--token", idempotency_token.to_string()),
                ],
            )
            .await?;
        Ok(outcome.map_unit())
    }

    async fn resize_volume(
        &self,
        backend_id: &str,
        size: u64,
        idempotency_token: &str,
    ) -> Result<Outcome<()>> {
        let outcome = self
            .invoke(
                "resize",
                &[
                    ("--volume", backend_id.to_string()),
                    ("--size", size.to_string()),
                    ("--token", idempotency_token.to_string()),
                ],
            )
            .await?;
        Ok(outcome.map_unit())
    }

    async fn snapshot_volume(
        &self,
        backend_id: &str,
        idempotency_token: &str,
    ) -> Result<Outcome<String>> {
        let outcome = self
            .invoke(
                "snapshot",
                &[
                    ("--volume", backend_id.to_string()),
                    ("--token", idempotency_token.to_string()),
                ],
            )
            .await?;
        Self::expect_backend_id("snapshot", outcome)
    }

    async fn probe_volume(
        &self,
        backend_id: &str,
    ) -> Result<ProbeReport> {
        match self
            .invoke("probe", &[("--volume", backend_id.to_string())])
            .await?
        {
            Outcome::Success(reply) => Ok(ProbeReport {
                exists: reply.exists.unwrap_or(false),
                size: reply.size.unwrap_or(0),
                mapped_nodes: reply.mapped_nodes.unwrap_or_default(),
            }),
            Outcome::Failure(FailureReason::NotFound) => Ok(ProbeReport::absent()),
            Outcome::Failure(reason) => {
                Err(BackendError::CommandFailed(format!("probe: {:?}", reason)).into())
            }
            Outcome::Unknown => Err(BackendError::Unknown {
                operation: "probe",
                volume_id: backend_id.to_string(),
            }
            .into()),
        }
    }

    fn capabilities(&self) -> BackendCapabilities {
        **self.capabilities.load()
    }
}
