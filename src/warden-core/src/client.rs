//! HTTP client for the parent controller API.
//!
//! All agent-to-parent traffic goes through this collaborator:
//!
//! - `POST /api/agent/handshake` - challenge-response material
//! - `GET /api/agent/policies` - current policy list (bearer-authenticated)
//! - `POST /api/agent/violations` - violation reports (bearer-authenticated)
//!
//! Every request carries aggressive timeouts so a hung parent cannot
//! stall the sync or enforcement timers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::AgentError;
use crate::policy::{Policy, ViolationRecord};

/// Handshake material returned by the parent.
///
/// All fields are optional at the wire level; the trust verifier
/// rejects a payload with anything missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Base64 nonce chosen by the parent.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Epoch-millisecond timestamp the nonce was issued at.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Base64 signature over `"<nonce>:<timestamp>"`.
    #[serde(default)]
    pub signature: Option<String>,
    /// Parent software version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Body of the policy list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyListResponse {
    policies: Vec<Policy>,
}

/// Network collaborator for parent endpoints.
///
/// A trait seam so the sync and enforcement paths can be exercised
/// in tests without a live parent.
#[async_trait]
pub trait ParentApi: Send + Sync {
    /// Fetch handshake material from the parent.
    async fn fetch_handshake(&self, parent_url: &str) -> Result<HandshakeResponse, AgentError>;

    /// Fetch the parent's current policy list.
    async fn fetch_policies(
        &self,
        parent_url: &str,
        token: &str,
    ) -> Result<Vec<Policy>, AgentError>;

    /// Report a violation to the parent.
    async fn report_violation(
        &self,
        parent_url: &str,
        token: &str,
        record: &ViolationRecord,
    ) -> Result<(), AgentError>;
}

/// `reqwest`-backed parent client.
pub struct HttpParentClient {
    client: Client,
}

impl HttpParentClient {
    /// Create a new client with the given total request timeout.
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        // Fail fast on unreachable hosts; a hung TCP connect must not
        // consume the whole sync tick.
        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(3).min(timeout))
            .pool_idle_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(1)
            .tcp_nodelay(true)
            .user_agent(format!("warden-agent/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    fn endpoint(parent_url: &str, path: &str) -> String {
        format!("{}{}", parent_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ParentApi for HttpParentClient {
    #[instrument(skip(self))]
    async fn fetch_handshake(&self, parent_url: &str) -> Result<HandshakeResponse, AgentError> {
        let url = Self::endpoint(parent_url, "/api/agent/handshake");
        debug!(url = %url, "Requesting handshake");

        let response = self.client.post(&url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Handshake request failed");
            AgentError::network(format!("Request to {url} failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "Handshake: non-success status");
            return Err(AgentError::network(format!("HTTP {status} from {url}")));
        }

        response
            .json::<HandshakeResponse>()
            .await
            .map_err(|e| AgentError::network(format!("Failed to parse handshake from {url}: {e}")))
    }

    #[instrument(skip(self, token))]
    async fn fetch_policies(
        &self,
        parent_url: &str,
        token: &str,
    ) -> Result<Vec<Policy>, AgentError> {
        let url = Self::endpoint(parent_url, "/api/agent/policies");
        debug!(url = %url, "Fetching policies");

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AgentError::network(format!("Request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::network(format!("HTTP {status} from {url}")));
        }

        let body = response
            .json::<PolicyListResponse>()
            .await
            .map_err(|e| AgentError::network(format!("Failed to parse policies from {url}: {e}")))?;

        info!(url = %url, count = body.policies.len(), "Policies received");
        Ok(body.policies)
    }

    #[instrument(skip(self, token, record), fields(policy_id = %record.policy_id))]
    async fn report_violation(
        &self,
        parent_url: &str,
        token: &str,
        record: &ViolationRecord,
    ) -> Result<(), AgentError> {
        let url = Self::endpoint(parent_url, "/api/agent/violations");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(record)
            .send()
            .await
            .map_err(|e| AgentError::network(format!("Request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::network(format!("HTTP {status} from {url}")));
        }

        debug!(policy_id = %record.policy_id, "Violation reported");
        Ok(())
    }
}
