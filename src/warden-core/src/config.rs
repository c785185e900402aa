//! Configuration for the agent core.

use std::time::Duration;

/// Configuration for the warden agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the parent controller.
    pub parent_url: String,
    /// Timeout for every network and OS call.
    pub request_timeout: Duration,
    /// Enforcement and online sync cadence.
    pub check_interval: Duration,
    /// How long a successful handshake is trusted before re-verification.
    pub trust_window: Duration,
    /// Maximum handshake timestamp age before it is treated as a replay.
    pub replay_window: Duration,
    /// Minimum violation-report spacing per policy id.
    pub report_window: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            parent_url: "http://localhost:3080".into(),
            request_timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(30),
            trust_window: Duration::from_secs(24 * 60 * 60),
            replay_window: Duration::from_secs(30),
            report_window: Duration::from_secs(60),
        }
    }
}
