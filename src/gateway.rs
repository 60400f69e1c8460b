//! Command gateway: operator command execution inside a live container.
//!
//! Two hard limits bound every call: the first token of a plain command
//! must be on a fixed allow-list, and the whole exchange must finish
//! within 30 seconds of wall clock. Commands starting with `/` are
//! shortcuts expanded here instead; `/help` never touches the container.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tracing::debug;

use crate::engine::demux::{FrameDecoder, StreamKind};
use crate::engine::{ContainerEngine, ExecSession};
use crate::errors::DeployError;

/// Wall-clock budget for one command, shortcut expansion included.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// First-token allow-list: read-oriented tools and the common runtime
/// CLIs. Everything else is rejected before any engine call.
const ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "pwd", "echo", "env", "whoami", "df", "du", "ps", "top", "head", "tail", "grep",
    "find", "wc", "date", "uptime", "which", "printenv", "hostname", "uname", "id", "free",
    "stat", "file", "sort", "uniq", "tr", "cut", "awk", "sed", "less", "more", "mkdir", "touch",
    "cp", "mv", "cd", "npm", "node", "python", "pip", "curl", "wget",
];

/// Shortcut registry: name, what it expands to, and the `/help` blurb.
const SHORTCUTS: &[(&str, &str)] = &[
    ("/show-logs", "last 500 lines of container output"),
    ("/tail-logs", "last 100 lines of container output"),
    ("/env", "environment variables, sorted"),
    ("/files", "directory listing of the working directory"),
    ("/help", "this listing"),
];

#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

pub struct CommandGateway {
    engine: Arc<dyn ContainerEngine>,
    prefix: String,
    timeout: Duration,
}

impl CommandGateway {
    pub fn new(engine: Arc<dyn ContainerEngine>, prefix: &str) -> Self {
        Self {
            engine,
            prefix: prefix.to_string(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dispatch on the leading `/`: shortcut or allow-listed command.
    pub async fn run(
        &self,
        container_name: &str,
        command: &str,
    ) -> Result<ExecOutcome, DeployError> {
        if command.trim_start().starts_with('/') {
            self.execute_shortcut(container_name, command).await
        } else {
            self.execute(container_name, command).await
        }
    }

    /// Run an allow-listed shell command inside the container.
    pub async fn execute(
        &self,
        container_name: &str,
        command: &str,
    ) -> Result<ExecOutcome, DeployError> {
        validate_command(command)?;
        let container = self.resolve_container(container_name).await?;
        self.run_shell(&container, command).await
    }

    /// Expand and run a `/`-prefixed shortcut.
    pub async fn execute_shortcut(
        &self,
        container_name: &str,
        command: &str,
    ) -> Result<ExecOutcome, DeployError> {
        let name = command.trim();
        match name {
            "/help" => Ok(ExecOutcome {
                stdout: help_text(),
                stderr: String::new(),
                exit_code: 0,
            }),
            "/show-logs" => self.fetch_logs(container_name, 500).await,
            "/tail-logs" => self.fetch_logs(container_name, 100).await,
            "/env" => {
                let container = self.resolve_container(container_name).await?;
                self.run_shell(&container, "env | sort").await
            }
            "/files" => {
                let container = self.resolve_container(container_name).await?;
                self.run_shell(&container, "ls -la").await
            }
            other => Err(DeployError::Validation(format!(
                "unknown shortcut '{}'; available: {}",
                other,
                SHORTCUTS
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    async fn fetch_logs(&self, container_name: &str, tail: u32) -> Result<ExecOutcome, DeployError> {
        let container = self.resolve_container(container_name).await?;
        let stdout = tokio::time::timeout(self.timeout, self.engine.logs(&container, tail))
            .await
            .map_err(|_| DeployError::Timeout {
                seconds: self.timeout.as_secs(),
            })??;
        Ok(ExecOutcome {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    /// Exact name first; otherwise any running container whose image is
    /// `<prefix>/<slug>:latest` for the normalized slug.
    async fn resolve_container(&self, container_name: &str) -> Result<String, DeployError> {
        if self.engine.container_running(container_name).await? {
            return Ok(container_name.to_string());
        }

        let slug = container_name
            .strip_prefix(&format!("{}-", self.prefix))
            .unwrap_or(container_name)
            .replace('_', "-");
        let image = format!("{}/{}:latest", self.prefix, slug);
        if let Some(found) = self.engine.find_running_by_image(&image).await? {
            debug!(requested = container_name, resolved = %found, "matched container by image");
            return Ok(found);
        }

        Err(DeployError::NotFound(format!(
            "no running container named '{}' and no container serving image '{}'; \
             deploy the project first",
            container_name, image
        )))
    }

    async fn run_shell(&self, container: &str, command: &str) -> Result<ExecOutcome, DeployError> {
        let session = self
            .engine
            .exec(
                container,
                vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
            )
            .await?;

        let exec_id = session.exec_id.clone();
        let (stdout, stderr) =
            match tokio::time::timeout(self.timeout, drain_session(session)).await {
                Ok(buffers) => buffers?,
                // Dropping the timed-out future tears down the stream.
                Err(_) => {
                    return Err(DeployError::Timeout {
                        seconds: self.timeout.as_secs(),
                    });
                }
            };

        // The buffers are still worth returning when the exit-code lookup
        // fails; -1 marks the unknown status.
        let exit_code = match self.engine.exec_exit_code(&exec_id).await {
            Ok(Some(code)) => code,
            Ok(None) => -1,
            Err(_) => -1,
        };

        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

/// Demultiplex the session's framed stream into stdout and stderr buffers.
async fn drain_session(mut session: ExecSession) -> Result<(Vec<u8>, Vec<u8>), DeployError> {
    let mut decoder = FrameDecoder::new();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    while let Some(chunk) = session.output.next().await {
        for frame in decoder.push(&chunk?)? {
            match frame.kind {
                StreamKind::Stdout => stdout.extend_from_slice(&frame.payload),
                StreamKind::Stderr => stderr.extend_from_slice(&frame.payload),
            }
        }
    }

    Ok((stdout, stderr))
}

/// Reject any command whose first whitespace-delimited token is not on the
/// allow-list.
fn validate_command(command: &str) -> Result<(), DeployError> {
    let token = command.split_whitespace().next().ok_or_else(|| {
        DeployError::Validation("empty command".to_string())
    })?;
    if ALLOWED_COMMANDS.contains(&token) {
        Ok(())
    } else {
        Err(DeployError::Validation(format!(
            "command '{}' is not permitted; allowed commands: {}",
            token,
            ALLOWED_COMMANDS.join(" ")
        )))
    }
}

fn help_text() -> String {
    let mut out = String::from("Available shortcuts:\n");
    for (name, description) in SHORTCUTS {
        out.push_str(&format!("  {:<12} {}\n", name, description));
    }
    out
}
