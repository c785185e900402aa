//! Policy ownership, schedule resolution, and authenticated sync.
//!
//! The engine owns the canonical policy set: all creation, mutation,
//! and deletion goes through its API and is persisted after every
//! change. Remote updates are gated behind the trust verifier - an
//! unverified parent can never replace the cached set (fail-closed,
//! the agent prefers enforcing the last trusted snapshot over applying
//! an unverified update). Sync outcomes feed the connection monitor,
//! which dictates the retry cadence.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::client::ParentApi;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::state::ConnectionMonitor;
use crate::store::{keys, ConfigStore};
use crate::trust::{now_millis, TrustVerifier};

/// Day/time window restricting when a policy is eligible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Inclusive start of the daily window, zero-padded `"HH:MM"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// Inclusive end of the daily window, zero-padded `"HH:MM"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Days of week the policy applies (0 = Sunday .. 6 = Saturday).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<BTreeSet<u8>>,
}

/// A rule binding a process name to an allow/deny decision.
///
/// Identity is the `id`, not the process name: two policies may target
/// the same process, and the engine does not deduplicate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Unique, stable identifier.
    pub id: String,
    /// Process name the rule applies to.
    pub process_name: String,
    /// Whether the process is allowed to run.
    #[serde(default = "default_allowed")]
    pub allowed: bool,
    /// Optional day/time restriction; absent means always eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    /// Epoch-ms creation stamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Epoch-ms last-update stamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

fn default_allowed() -> bool {
    true
}

impl Policy {
    /// Create a policy allowing the given process, no schedule.
    #[must_use]
    pub fn new(id: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            process_name: process_name.into(),
            allowed: true,
            schedule: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Mark the process disallowed.
    #[must_use]
    pub fn disallowed(mut self) -> Self {
        self.allowed = false;
        self
    }

    /// Attach a schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Whether this policy is active at the given instant.
    ///
    /// A policy without a schedule is always active. With a schedule:
    /// the weekday must be in `days` (when present), and the wall
    /// clock `"HH:MM"` must fall lexically inside
    /// `[start_time, end_time]` inclusive (when both are present).
    /// Zero-padded 24-hour strings compare correctly as strings.
    ///
    /// Known limitation: a window with `start_time > end_time`
    /// (e.g. `22:00`-`02:00`) never matches; midnight wrap-around is
    /// not interpreted.
    #[must_use]
    pub fn is_active_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let Some(schedule) = &self.schedule else {
            return true;
        };

        if let Some(days) = &schedule.days {
            let today = now.weekday().num_days_from_sunday() as u8;
            if !days.contains(&today) {
                return false;
            }
        }

        if let (Some(start), Some(end)) = (&schedule.start_time, &schedule.end_time) {
            let current = format!("{:02}:{:02}", now.hour(), now.minute());
            if current < *start || current > *end {
                return false;
            }
        }

        true
    }
}

/// Partial update applied by `update_policy`. The policy id is
/// immutable and never part of a patch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPatch {
    /// New process name.
    #[serde(default)]
    pub process_name: Option<String>,
    /// New allow/deny decision.
    #[serde(default)]
    pub allowed: Option<bool>,
    /// New schedule.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Remove the existing schedule.
    #[serde(default)]
    pub clear_schedule: bool,
}

/// A detected violation, sent to the parent and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    /// Policy that was violated.
    pub policy_id: String,
    /// Offending process name.
    pub process_name: String,
    /// PIDs observed before termination.
    pub pids: Vec<u32>,
    /// Epoch-ms detection time.
    pub timestamp: i64,
}

/// Handle for unregistering a policies-updated listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyListenerHandle(u64);

type PolicyListener = Box<dyn Fn(&[Policy]) + Send + Sync>;

/// Observability snapshot of the policy engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEngineStatus {
    /// Total cached policies.
    pub policy_count: usize,
    /// Policies active right now.
    pub active_policy_count: usize,
    /// Active policies that disallow their process.
    pub active_disallowed_count: usize,
}

/// Owns the policy set and orchestrates trust-gated synchronization.
pub struct PolicyEngine {
    policies: RwLock<HashMap<String, Policy>>,
    store: Arc<dyn ConfigStore>,
    trust: Arc<TrustVerifier>,
    monitor: Arc<ConnectionMonitor>,
    client: Arc<dyn ParentApi>,
    parent_url: String,
    listeners: Mutex<Vec<(u64, PolicyListener)>>,
    next_listener_id: Mutex<u64>,
}

impl PolicyEngine {
    /// Create an engine, reloading the cached policy set from the store.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        trust: Arc<TrustVerifier>,
        monitor: Arc<ConnectionMonitor>,
        client: Arc<dyn ParentApi>,
        config: &AgentConfig,
    ) -> Self {
        let cached: Vec<Policy> = store
            .get(keys::POLICIES)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        info!(cached = cached.len(), "PolicyEngine: loaded cached policies");

        let policies = cached.into_iter().map(|p| (p.id.clone(), p)).collect();

        Self {
            policies: RwLock::new(policies),
            store,
            trust,
            monitor,
            client,
            parent_url: config.parent_url.clone(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: Mutex::new(0),
        }
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Create a policy. Requires a non-empty `id` and `process_name`;
    /// rejects an id that already exists. Stamps `created_at` and
    /// persists before returning.
    pub fn create_policy(&self, mut policy: Policy) -> Result<Policy, AgentError> {
        if policy.id.trim().is_empty() {
            return Err(AgentError::ValidationError {
                message: "policy id is required".into(),
            });
        }
        if policy.process_name.trim().is_empty() {
            return Err(AgentError::ValidationError {
                message: "processName is required".into(),
            });
        }

        policy.created_at = Some(now_millis());

        {
            let mut policies = self.write_policies()?;
            if policies.contains_key(&policy.id) {
                return Err(AgentError::ValidationError {
                    message: format!("policy '{}' already exists", policy.id),
                });
            }
            policies.insert(policy.id.clone(), policy.clone());
        }

        self.persist()?;
        self.notify_updated();
        debug!(policy_id = %policy.id, process = %policy.process_name, "Policy created");
        Ok(policy)
    }

    /// Merge a patch into an existing policy. The id is immutable.
    pub fn update_policy(&self, id: &str, patch: PolicyPatch) -> Result<Policy, AgentError> {
        let updated = {
            let mut policies = self.write_policies()?;
            let policy = policies.get_mut(id).ok_or_else(|| AgentError::PolicyNotFound {
                id: id.to_string(),
            })?;

            if let Some(process_name) = patch.process_name {
                policy.process_name = process_name;
            }
            if let Some(allowed) = patch.allowed {
                policy.allowed = allowed;
            }
            if patch.clear_schedule {
                policy.schedule = None;
            } else if let Some(schedule) = patch.schedule {
                policy.schedule = Some(schedule);
            }
            policy.updated_at = Some(now_millis());
            policy.clone()
        };

        self.persist()?;
        self.notify_updated();
        debug!(policy_id = %id, "Policy updated");
        Ok(updated)
    }

    /// Delete a policy. Returns false (not an error) when the id is
    /// absent.
    pub fn delete_policy(&self, id: &str) -> Result<bool, AgentError> {
        let removed = self.write_policies()?.remove(id).is_some();
        if removed {
            self.persist()?;
            self.notify_updated();
            debug!(policy_id = %id, "Policy deleted");
        }
        Ok(removed)
    }

    /// Get one policy by id.
    #[must_use]
    pub fn get_policy(&self, id: &str) -> Option<Policy> {
        self.policies.read().ok()?.get(id).cloned()
    }

    /// All cached policies, in stable id order.
    #[must_use]
    pub fn all_policies(&self) -> Vec<Policy> {
        let mut policies: Vec<Policy> = self
            .policies
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        policies
    }

    /// Policies active at the current local time.
    #[must_use]
    pub fn active_policies(&self) -> Vec<Policy> {
        self.active_policies_at(&Local::now())
    }

    /// Policies active at a given instant.
    #[must_use]
    pub fn active_policies_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Vec<Policy> {
        let mut active: Vec<Policy> = self
            .policies
            .read()
            .map(|p| {
                p.values()
                    .filter(|policy| policy.is_active_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Effective decision for a process name: deny wins.
    ///
    /// When several active policies target the same process and
    /// disagree, the process is allowed only if none of them disallow
    /// it (most-restrictive-wins).
    #[must_use]
    pub fn is_process_allowed<Tz: TimeZone>(&self, process_name: &str, now: &DateTime<Tz>) -> bool {
        !self
            .active_policies_at(now)
            .iter()
            .any(|p| p.process_name == process_name && !p.allowed)
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Pull the parent's policy list and replace the cached set.
    ///
    /// Trust gate first: if the trust window has lapsed, one handshake
    /// attempt is made; failure aborts the sync fail-closed, with the
    /// cached set untouched. Every failure anywhere in the chain
    /// collapses to exactly one `on_sync_failure`. A successful sync
    /// with an empty list is a valid "no active policies" state.
    pub async fn sync_from_parent(&self, parent_url: &str) -> Result<usize, AgentError> {
        self.sync_from_parent_gated(parent_url, &|| true).await
    }

    /// Like [`Self::sync_from_parent`], with a commit gate checked
    /// after every network round trip and before any state is touched.
    ///
    /// When `commit` returns false the completed fetch is discarded:
    /// the cached set, the persisted snapshot, and the connection
    /// monitor all stay exactly as they were. The sync scheduler uses
    /// this so a fetch that was in flight when shutdown was requested
    /// cannot commit its result afterwards.
    #[instrument(skip(self, commit))]
    pub async fn sync_from_parent_gated(
        &self,
        parent_url: &str,
        commit: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<usize, AgentError> {
        if !self.trust.is_trusted() {
            if let Err(e) = self.trust.verify_parent(parent_url).await {
                warn!(error = %e, "Sync aborted: parent not trusted");
                if commit() {
                    self.monitor.on_sync_failure();
                }
                return Err(e);
            }
        }

        let fetched = self.fetch_policies(parent_url).await;
        if !commit() {
            debug!("Sync result discarded: commit refused after fetch");
            return fetched.map(|list| list.len());
        }

        let result = fetched.and_then(|list| self.apply_policies(list));
        match &result {
            Ok(count) => {
                self.monitor.on_sync_success();
                info!(policies = count, "Sync complete");
            },
            Err(e) => {
                warn!(error = %e, "Sync failed; keeping cached policy set");
                self.monitor.on_sync_failure();
            },
        }
        result
    }

    /// Authenticated fetch of the parent's policy list. Network only,
    /// nothing mutated.
    async fn fetch_policies(&self, parent_url: &str) -> Result<Vec<Policy>, AgentError> {
        let token = self.auth_token()?;
        self.client.fetch_policies(parent_url, &token).await
    }

    /// Replace the cached set wholesale and persist. Split from the
    /// fetch so the commit gate sits between the two, and so the sync
    /// records exactly one monitor outcome for the whole chain.
    fn apply_policies(&self, fetched: Vec<Policy>) -> Result<usize, AgentError> {
        let count = fetched.len();

        {
            let mut policies = self.write_policies()?;
            policies.clear();
            for policy in fetched {
                policies.insert(policy.id.clone(), policy);
            }
        }

        self.persist()?;
        self.notify_updated();
        Ok(count)
    }

    /// Forward a violation to the parent.
    ///
    /// No deduplication here - the enforcement loop rate-limits calls.
    /// A network failure is recorded as a sync failure on the monitor.
    pub async fn report_violation(&self, record: &ViolationRecord) -> Result<(), AgentError> {
        let token = self.auth_token()?;

        match self
            .client
            .report_violation(&self.parent_url, &token, record)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(policy_id = %record.policy_id, error = %e, "Violation report failed");
                self.monitor.on_sync_failure();
                Err(e)
            },
        }
    }

    // =========================================================================
    // Listeners and status
    // =========================================================================

    /// Register a listener invoked with the full policy set after
    /// every mutation or sync.
    pub fn add_policies_listener(&self, listener: PolicyListener) -> PolicyListenerHandle {
        let id = {
            let mut next = self.next_listener_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        PolicyListenerHandle(id)
    }

    /// Unregister a listener. Returns false if the handle is unknown.
    pub fn remove_policies_listener(&self, handle: PolicyListenerHandle) -> bool {
        if let Ok(mut listeners) = self.listeners.lock() {
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != handle.0);
            return listeners.len() < before;
        }
        false
    }

    /// Observability snapshot.
    #[must_use]
    pub fn status(&self) -> PolicyEngineStatus {
        let active = self.active_policies();
        PolicyEngineStatus {
            policy_count: self.policies.read().map(|p| p.len()).unwrap_or(0),
            active_policy_count: active.len(),
            active_disallowed_count: active.iter().filter(|p| !p.allowed).count(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn write_policies(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Policy>>, AgentError> {
        self.policies
            .write()
            .map_err(|_| AgentError::store("policy lock poisoned"))
    }

    /// Persist the full policy set after every mutation.
    fn persist(&self) -> Result<(), AgentError> {
        let snapshot = self.all_policies();
        let value =
            serde_json::to_value(&snapshot).map_err(|e| AgentError::store(e.to_string()))?;
        self.store.set(keys::POLICIES, value)
    }

    /// Invoke policies-updated listeners in registration order. A
    /// panicking listener is logged and skipped.
    fn notify_updated(&self) {
        let snapshot = self.all_policies();
        let listeners = match self.listeners.lock() {
            Ok(l) => l,
            Err(_) => return,
        };
        for (id, listener) in listeners.iter() {
            let call = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&snapshot)
            }));
            if call.is_err() {
                warn!(listener_id = id, "PolicyEngine: listener panicked");
            }
        }
    }

    fn auth_token(&self) -> Result<String, AgentError> {
        self.store
            .get(keys::AUTH_TOKEN)?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| AgentError::config("No auth token - pair first"))
    }
}
