//! Error types for agent operations.

use thiserror::Error;

/// Errors that can occur in the agent core.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration problem - missing pinned key, interval below floor.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },

    /// Handshake payload is missing a required field.
    #[error("Handshake rejected: missing field '{field}'")]
    HandshakeFieldMissing {
        /// Name of the missing field.
        field: &'static str,
    },

    /// Handshake timestamp is too old - possible replay of a captured handshake.
    #[error("Handshake rejected: timestamp too old ({age_secs}s)")]
    HandshakeExpired {
        /// Age of the timestamp in seconds.
        age_secs: i64,
    },

    /// Handshake timestamp is in the future - clock skew or a forged token.
    #[error("Handshake rejected: timestamp in the future ({skew_secs}s ahead)")]
    HandshakeFromFuture {
        /// How far ahead of local time the timestamp is, in seconds.
        skew_secs: i64,
    },

    /// Handshake signature did not verify against the pinned key.
    #[error("Signature verification failed: {reason}")]
    SignatureRejected {
        /// Reason for failure.
        reason: String,
    },

    /// Network failure - timeout, non-2xx status, connection refused.
    #[error("Network error: {message}")]
    NetworkError {
        /// Error message.
        message: String,
    },

    /// Failed to terminate a prohibited process.
    #[error("Enforcement failed for '{process_name}': {message}")]
    EnforcementError {
        /// Process the agent attempted to kill.
        process_name: String,
        /// Error message.
        message: String,
    },

    /// Malformed policy input on a CRUD call.
    #[error("Validation error: {message}")]
    ValidationError {
        /// Error message.
        message: String,
    },

    /// Referenced policy id does not exist.
    #[error("Policy not found: {id}")]
    PolicyNotFound {
        /// The missing policy id.
        id: String,
    },

    /// Persistence failure in the config store.
    #[error("Store error: {message}")]
    StoreError {
        /// Error message.
        message: String,
    },
}

impl AgentError {
    /// Check if this error is a trust failure (handshake rejected).
    ///
    /// Trust failures abort the current sync attempt and leave the
    /// cached policy set untouched (fail-closed).
    #[must_use]
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFieldMissing { .. }
                | Self::HandshakeExpired { .. }
                | Self::HandshakeFromFuture { .. }
                | Self::SignatureRejected { .. }
        )
    }

    /// Check if this error is a transient network failure.
    ///
    /// Network failures are recorded on the connection monitor and
    /// retried only at the next scheduled tick.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::NetworkError { .. })
    }

    /// Check if this error is a configuration problem.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigError { .. })
    }

    /// Convenience constructor for network errors.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Convenience constructor for store errors.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError {
            message: message.into(),
        }
    }

    /// Convenience constructor for configuration errors.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }
}
