//! Parent trust verification.
//!
//! Before any policy payload from the parent is accepted, the agent
//! proves the remote peer holds the private key matching the public
//! key pinned during pairing. The proof is a challenge-response
//! handshake: the parent returns `{nonce, timestamp, signature,
//! version}` where `signature` is ECDSA P-256 (SHA-256) over the UTF-8
//! bytes of `"<nonce>:<timestamp>"`.
//!
//! ## Security Properties
//!
//! - **Pinned key**: only the key placed during out-of-band pairing is
//!   accepted; a DNS/mDNS spoof or MITM without the private key cannot
//!   pass.
//! - **Replay window**: timestamps older than 30s are rejected, so a
//!   captured handshake cannot be replayed later.
//! - **Future skew**: timestamps ahead of local time are rejected.
//! - **Rolling window**: a successful handshake is trusted for 24h,
//!   bounding the blast radius of a late-discovered key compromise.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::Engine;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::client::{HandshakeResponse, ParentApi};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::store::{keys, ConfigStore};

/// Observability snapshot of the trust verifier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustStatus {
    /// Whether a pinned key is loaded (always true once constructed).
    pub has_trusted_key: bool,
    /// Epoch-millisecond timestamp of the last successful handshake.
    pub last_verification: Option<i64>,
    /// Whether the parent is currently trusted.
    pub is_trusted: bool,
    /// Milliseconds until re-verification is due; `None` if never verified.
    pub time_until_reverification_ms: Option<u64>,
}

/// Verifies parent authenticity against the pinned public key.
pub struct TrustVerifier {
    /// Public key pinned during pairing.
    pinned_key: VerifyingKey,
    /// Epoch-millisecond timestamp of the last successful handshake.
    last_verification: RwLock<Option<i64>>,
    /// How long a successful handshake remains valid.
    trust_window: Duration,
    /// Maximum accepted handshake timestamp age.
    replay_window: Duration,
    /// Network collaborator.
    client: Arc<dyn ParentApi>,
}

impl std::fmt::Debug for TrustVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustVerifier").finish_non_exhaustive()
    }
}

impl TrustVerifier {
    /// Create a verifier, loading the pinned key from the store.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the key is absent or not a well-formed
    /// public-key PEM.
    pub fn new(
        store: &dyn ConfigStore,
        client: Arc<dyn ParentApi>,
        config: &AgentConfig,
    ) -> Result<Self, AgentError> {
        let pem = store
            .get(keys::PUBLIC_KEY)?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| AgentError::config("No pinned parent public key - pair first"))?;

        let pinned_key = VerifyingKey::from_public_key_pem(&pem)
            .map_err(|e| AgentError::config(format!("Invalid pinned public key: {e}")))?;

        info!("TrustVerifier: pinned key loaded");

        Ok(Self {
            pinned_key,
            last_verification: RwLock::new(None),
            trust_window: config.trust_window,
            replay_window: config.replay_window,
            client,
        })
    }

    /// Create a verifier from an already-parsed key.
    ///
    /// Useful for tests with freshly generated keypairs.
    pub fn with_key(
        pinned_key: VerifyingKey,
        client: Arc<dyn ParentApi>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            pinned_key,
            last_verification: RwLock::new(None),
            trust_window: config.trust_window,
            replay_window: config.replay_window,
            client,
        }
    }

    /// Perform one handshake round trip and verify the result.
    ///
    /// A single network call, fail fast - never retried inside this
    /// method. On success the trust window restarts from now.
    #[instrument(skip(self))]
    pub async fn verify_parent(&self, parent_url: &str) -> Result<(), AgentError> {
        let handshake = self.client.fetch_handshake(parent_url).await?;
        let now_ms = now_millis();

        self.validate_handshake(&handshake, now_ms).map_err(|e| {
            warn!(parent_url = %parent_url, error = %e, "Handshake rejected");
            e
        })?;

        if let Ok(mut last) = self.last_verification.write() {
            *last = Some(now_ms);
        }

        info!(
            parent_url = %parent_url,
            parent_version = handshake.version.as_deref().unwrap_or("?"),
            "Parent verified"
        );
        Ok(())
    }

    /// Validate handshake material against the pinned key at a given
    /// local time.
    ///
    /// Pure over `(handshake, now_ms)` - no network, no clock reads.
    pub fn validate_handshake(
        &self,
        handshake: &HandshakeResponse,
        now_ms: i64,
    ) -> Result<(), AgentError> {
        let nonce = handshake
            .nonce
            .as_deref()
            .ok_or(AgentError::HandshakeFieldMissing { field: "nonce" })?;
        let timestamp = handshake
            .timestamp
            .ok_or(AgentError::HandshakeFieldMissing { field: "timestamp" })?;
        let signature_b64 = handshake
            .signature
            .as_deref()
            .ok_or(AgentError::HandshakeFieldMissing { field: "signature" })?;
        if handshake.version.is_none() {
            return Err(AgentError::HandshakeFieldMissing { field: "version" });
        }

        if timestamp > now_ms {
            return Err(AgentError::HandshakeFromFuture {
                skew_secs: (timestamp - now_ms) / 1000,
            });
        }

        let age_ms = now_ms - timestamp;
        if age_ms > self.replay_window.as_millis() as i64 {
            return Err(AgentError::HandshakeExpired {
                age_secs: age_ms / 1000,
            });
        }

        let signature_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|e| AgentError::SignatureRejected {
                reason: format!("invalid base64: {e}"),
            })?;

        // Accept DER or raw r||s encoding.
        let signature = Signature::from_der(&signature_bytes)
            .or_else(|_| Signature::from_slice(&signature_bytes))
            .map_err(|e| AgentError::SignatureRejected {
                reason: format!("malformed signature: {e}"),
            })?;

        let challenge = format!("{nonce}:{timestamp}");
        self.pinned_key
            .verify(challenge.as_bytes(), &signature)
            .map_err(|_| AgentError::SignatureRejected {
                reason: "signature does not match pinned key".into(),
            })?;

        debug!(age_ms = age_ms, "Handshake signature verified");
        Ok(())
    }

    /// Whether the last successful handshake is within the trust
    /// window. The bound is inclusive: a verification exactly one
    /// window ago still counts.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.is_trusted_at(now_millis())
    }

    /// [`Self::is_trusted`] evaluated at an explicit instant.
    #[must_use]
    pub fn is_trusted_at(&self, now_ms: i64) -> bool {
        let last = match self.last_verification.read() {
            Ok(last) => *last,
            Err(_) => None,
        };
        let Some(last) = last else { return false };

        let elapsed_ms = (now_ms - last).max(0) as u128;
        elapsed_ms <= self.trust_window.as_millis()
    }

    /// Time remaining in the trust window.
    ///
    /// `None` if the parent was never verified; `Duration::ZERO` when
    /// re-verification is overdue.
    #[must_use]
    pub fn time_until_reverification(&self) -> Option<Duration> {
        let last = (*self.last_verification.read().ok()?)?;
        let elapsed_ms = (now_millis() - last).max(0) as u128;
        let window_ms = self.trust_window.as_millis();

        if elapsed_ms >= window_ms {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis((window_ms - elapsed_ms) as u64))
        }
    }

    /// Drop trust immediately, forcing a fresh handshake before the
    /// next sync.
    pub fn invalidate_trust(&self) {
        if let Ok(mut last) = self.last_verification.write() {
            if last.take().is_some() {
                warn!("Trust invalidated - re-verification required");
            }
        }
    }

    /// Observability snapshot.
    #[must_use]
    pub fn status(&self) -> TrustStatus {
        TrustStatus {
            has_trusted_key: true,
            last_verification: self.last_verification.read().ok().and_then(|l| *l),
            is_trusted: self.is_trusted(),
            time_until_reverification_ms: self
                .time_until_reverification()
                .map(|d| d.as_millis() as u64),
        }
    }
}

/// Current Unix time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
