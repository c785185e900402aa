//! OS process control collaborator.
//!
//! The enforcement loop is the only consumer. Every call shells out
//! with an explicit timeout so a hung OS command cannot stall the
//! enforcement timer.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AgentError;

/// A running process matched by name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Process id.
    pub pid: u32,
    /// Process name as matched.
    pub name: String,
}

/// Process enumeration and termination, per OS.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Whether any process with the given name is running.
    async fn is_process_running(&self, name: &str) -> Result<bool, AgentError>;

    /// Kill all processes with the given name. Returns false when
    /// nothing matched; errors when the kill itself failed.
    async fn kill_process(&self, name: &str) -> Result<bool, AgentError>;

    /// PIDs of all processes with the given name.
    async fn get_process_info(&self, name: &str) -> Result<Vec<ProcessInfo>, AgentError>;
}

/// Unix implementation shelling out to `pgrep`/`pkill`.
#[cfg(unix)]
pub struct UnixPlatform {
    /// Timeout applied to every spawned command.
    timeout: Duration,
}

#[cfg(unix)]
impl UnixPlatform {
    /// Create a platform with the given per-command timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a command with the configured timeout, returning its output.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        process_name: &str,
    ) -> Result<std::process::Output, AgentError> {
        let command = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, command).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(AgentError::EnforcementError {
                process_name: process_name.to_string(),
                message: format!("{program} failed to spawn: {e}"),
            }),
            Err(_) => Err(AgentError::EnforcementError {
                process_name: process_name.to_string(),
                message: format!("{program} timed out after {:?}", self.timeout),
            }),
        }
    }
}

#[cfg(unix)]
impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(unix)]
#[async_trait]
impl Platform for UnixPlatform {
    async fn is_process_running(&self, name: &str) -> Result<bool, AgentError> {
        // pgrep exits 0 on match, 1 on no match.
        let output = self.run("pgrep", &["-x", name], name).await?;
        Ok(output.status.success())
    }

    async fn kill_process(&self, name: &str) -> Result<bool, AgentError> {
        let output = self.run("pkill", &["-x", name], name).await?;

        match output.status.code() {
            Some(0) => {
                debug!(process = %name, "Process killed");
                Ok(true)
            },
            Some(1) => Ok(false),
            code => {
                warn!(process = %name, code = ?code, "pkill failed");
                Err(AgentError::EnforcementError {
                    process_name: name.to_string(),
                    message: format!(
                        "pkill exited with {code:?}: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                })
            },
        }
    }

    async fn get_process_info(&self, name: &str) -> Result<Vec<ProcessInfo>, AgentError> {
        let output = self.run("pgrep", &["-x", name], name).await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }

        let pids = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .map(|pid| ProcessInfo {
                pid,
                name: name.to_string(),
            })
            .collect();
        Ok(pids)
    }
}
