//! Key-value config store with JSON file persistence.
//!
//! The agent persists its mutable state (cached policies, connection
//! state, offline settings) and reads its pairing material (pinned
//! public key, auth token, agent id) through this collaborator.
//! `JsonFileStore` keeps everything in one JSON document on disk;
//! `MemoryStore` backs tests.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Well-known store keys.
pub mod keys {
    /// Persisted `{lastSuccessfulSync, offlineSince}` pair.
    pub const CONNECTION_STATE: &str = "connectionState";
    /// Persisted degraded/offline thresholds.
    pub const OFFLINE_SETTINGS: &str = "offlineModeSettings";
    /// Cached policy set.
    pub const POLICIES: &str = "policies";
    /// Pinned parent public key (PEM), placed during pairing.
    pub const PUBLIC_KEY: &str = "public_key";
    /// Bearer token for authenticated parent endpoints.
    pub const AUTH_TOKEN: &str = "authToken";
    /// This agent's identity, assigned during pairing.
    pub const AGENT_ID: &str = "agentId";
}

/// Key-value persistence collaborator.
pub trait ConfigStore: Send + Sync {
    /// Get a value by key. `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<Value>, AgentError>;

    /// Set a value, persisting it durably before returning.
    fn set(&self, key: &str, value: Value) -> Result<(), AgentError>;
}

/// File-backed store holding one JSON object.
pub struct JsonFileStore {
    /// Path of the backing file.
    path: PathBuf,
    /// In-memory copy of the document.
    entries: RwLock<HashMap<String, Value>>,
}

impl JsonFileStore {
    /// Open (or create) a store at the given path.
    ///
    /// An unreadable or corrupt file starts the store empty rather than
    /// failing - the agent must come up even if its state file was
    /// damaged, losing only cached state.
    pub fn open(path: PathBuf) -> Self {
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, Value>>(&bytes) {
                Ok(map) => {
                    debug!(path = %path.display(), entries = map.len(), "Store: loaded");
                    map
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Store: corrupt file, starting empty");
                    HashMap::new()
                },
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Store: no existing file");
                HashMap::new()
            },
        };

        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    /// Write the full document to disk via a temp file + rename.
    fn flush(&self, entries: &HashMap<String, Value>) -> Result<(), AgentError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| AgentError::store(e.to_string()))?;
        }

        let data =
            serde_json::to_vec_pretty(entries).map_err(|e| AgentError::store(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data).map_err(|e| AgentError::store(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| AgentError::store(e.to_string()))?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, AgentError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| AgentError::store("store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), AgentError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AgentError::store("store lock poisoned"))?;
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, AgentError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| AgentError::store("store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), AgentError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AgentError::store("store lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}
