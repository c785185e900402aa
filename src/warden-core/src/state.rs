//! Connection state tracking.
//!
//! Pure state machine with no network code: raw sync success/failure
//! signals come in, a stable connectivity state and the correct retry
//! cadence come out. Consecutive failures escalate `ONLINE` →
//! `DEGRADED` → `OFFLINE`; a single success recovers to `ONLINE`.
//! State survives process restarts through the config store.
//!
//! Escalation lengthens the retry interval, so failures produce
//! backoff without a separate retry subsystem.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{keys, ConfigStore};
use crate::trust::now_millis;

/// Agent-to-parent reachability health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Device has not completed pairing.
    Unconfigured,
    /// Paired, first sync not yet successful.
    Connecting,
    /// Last sync succeeded.
    Online,
    /// Several consecutive sync failures.
    Degraded,
    /// Sustained sync failures; parent considered unreachable.
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "UNCONFIGURED",
            Self::Connecting => "CONNECTING",
            Self::Online => "ONLINE",
            Self::Degraded => "DEGRADED",
            Self::Offline => "OFFLINE",
        };
        write!(f, "{s}")
    }
}

/// Tunable escalation thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSettings {
    /// Consecutive failures before entering `DEGRADED`.
    pub degraded_threshold: u32,
    /// Consecutive failures before entering `OFFLINE`.
    pub offline_threshold: u32,
    /// Days offline before the cached policy set is considered stale.
    pub max_offline_days: u32,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            degraded_threshold: 3,
            offline_threshold: 15,
            max_offline_days: 7,
        }
    }
}

/// Returned by `on_sync_success` when the agent comes back from `OFFLINE`.
#[derive(Debug, Clone, Copy)]
pub struct OfflineRecovery {
    /// State before the recovery (always `Offline`).
    pub previous_state: ConnectionState,
    /// How long the agent was offline.
    pub offline_duration: Duration,
}

/// Persisted slice of the state machine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedConnection {
    last_successful_sync: Option<i64>,
    offline_since: Option<i64>,
}

/// Mutable bookkeeping, behind one lock.
struct Inner {
    state: ConnectionState,
    consecutive_failures: u32,
    last_successful_sync: Option<i64>,
    offline_since: Option<i64>,
}

/// Handle for unregistering a state-change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

type StateListener = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Observability snapshot of the connection monitor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Current connectivity state.
    pub state: ConnectionState,
    /// Consecutive failed syncs since the last success.
    pub consecutive_failures: u32,
    /// Epoch-ms timestamp of the last successful sync.
    pub last_successful_sync: Option<i64>,
    /// Epoch-ms timestamp of the first failure of the current outage.
    pub offline_since: Option<i64>,
    /// Whether the outage exceeds `max_offline_days`.
    pub is_extended_offline: bool,
}

/// Converts sync outcomes into connectivity state and retry cadence.
pub struct ConnectionMonitor {
    inner: Mutex<Inner>,
    settings: RwLock<OfflineSettings>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_listener_id: Mutex<u64>,
    store: Arc<dyn ConfigStore>,
}

impl ConnectionMonitor {
    /// Create a monitor, reloading persisted timestamps and settings.
    ///
    /// The state itself starts at `UNCONFIGURED` until `initialize`
    /// confirms pairing; the persisted timestamps make a restart
    /// resume outage bookkeeping instead of forgetting it.
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        let persisted: PersistedConnection = store
            .get(keys::CONNECTION_STATE)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let settings: OfflineSettings = store
            .get(keys::OFFLINE_SETTINGS)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        debug!(
            last_successful_sync = ?persisted.last_successful_sync,
            offline_since = ?persisted.offline_since,
            "ConnectionMonitor: reloaded persisted state"
        );

        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Unconfigured,
                consecutive_failures: 0,
                last_successful_sync: persisted.last_successful_sync,
                offline_since: persisted.offline_since,
            }),
            settings: RwLock::new(settings),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: Mutex::new(0),
            store,
        }
    }

    /// Leave `UNCONFIGURED` once pairing credentials are present.
    ///
    /// Returns the state after the check. `UNCONFIGURED` is never
    /// re-entered once left.
    pub fn initialize(&self) -> ConnectionState {
        let paired = self.is_paired();

        let transition = {
            let mut inner = match self.inner.lock() {
                Ok(i) => i,
                Err(_) => return ConnectionState::Unconfigured,
            };
            if inner.state == ConnectionState::Unconfigured && paired {
                Self::transition(&mut inner, ConnectionState::Connecting)
            } else {
                None
            }
        };

        if let Some((new, prev)) = transition {
            info!(from = %prev, to = %new, "ConnectionMonitor: initialized");
            self.notify(new, prev);
            self.persist();
        }

        self.state()
    }

    /// Record a successful sync.
    ///
    /// Resets failure bookkeeping and moves to `ONLINE`. When the
    /// previous state was `OFFLINE`, returns recovery details so the
    /// caller can log or alert.
    pub fn on_sync_success(&self) -> Option<OfflineRecovery> {
        let now = now_millis();

        let (recovery, transition) = {
            let mut inner = self.inner.lock().ok()?;
            let prev = inner.state;

            let recovery = if prev == ConnectionState::Offline {
                inner.offline_since.map(|since| OfflineRecovery {
                    previous_state: prev,
                    offline_duration: Duration::from_millis((now - since).max(0) as u64),
                })
            } else {
                None
            };

            inner.consecutive_failures = 0;
            inner.last_successful_sync = Some(now);
            inner.offline_since = None;

            (recovery, Self::transition(&mut inner, ConnectionState::Online))
        };

        if let Some((new, prev)) = transition {
            self.notify(new, prev);
        }
        self.persist();

        if let Some(r) = &recovery {
            info!(
                offline_secs = r.offline_duration.as_secs(),
                "ConnectionMonitor: recovered from offline"
            );
        }
        recovery
    }

    /// Record a failed sync, escalating state at the configured
    /// thresholds. Returns the state after the failure.
    pub fn on_sync_failure(&self) -> ConnectionState {
        let settings = self.settings();
        let now = now_millis();

        let (state, failures, transition) = {
            let mut inner = match self.inner.lock() {
                Ok(i) => i,
                Err(_) => return ConnectionState::Unconfigured,
            };

            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            let failures = inner.consecutive_failures;
            let prev = inner.state;

            let transition = if failures >= settings.offline_threshold
                && prev != ConnectionState::Offline
            {
                if inner.offline_since.is_none() {
                    inner.offline_since = Some(now);
                }
                Self::transition(&mut inner, ConnectionState::Offline)
            } else if failures >= settings.degraded_threshold
                && matches!(prev, ConnectionState::Online | ConnectionState::Connecting)
            {
                if inner.offline_since.is_none() {
                    inner.offline_since = Some(now);
                }
                Self::transition(&mut inner, ConnectionState::Degraded)
            } else {
                None
            };

            (inner.state, failures, transition)
        };

        if let Some((new, prev)) = transition {
            warn!(from = %prev, to = %new, consecutive_failures = failures, "ConnectionMonitor: state escalated");
            self.notify(new, prev);
        } else {
            debug!(consecutive_failures = failures, state = %state, "ConnectionMonitor: sync failure recorded");
        }
        self.persist();

        state
    }

    /// Force a specific state, notifying listeners on change.
    ///
    /// `UNCONFIGURED` cannot be re-entered once left; such a request
    /// is logged and ignored.
    pub fn set_state(&self, new: ConnectionState) {
        let transition = {
            let mut inner = match self.inner.lock() {
                Ok(i) => i,
                Err(_) => return,
            };
            if new == ConnectionState::Unconfigured
                && inner.state != ConnectionState::Unconfigured
            {
                warn!(from = %inner.state, "ConnectionMonitor: UNCONFIGURED cannot be re-entered");
                return;
            }
            Self::transition(&mut inner, new)
        };

        if let Some((new, prev)) = transition {
            self.notify(new, prev);
            self.persist();
        }
    }

    /// Retry delay appropriate for the current state.
    ///
    /// `ONLINE` uses the caller-supplied check interval; escalated
    /// states lengthen the cadence.
    #[must_use]
    pub fn retry_interval(&self, online_interval: Duration) -> Duration {
        match self.state() {
            ConnectionState::Online => online_interval,
            ConnectionState::Unconfigured | ConnectionState::Connecting => {
                Duration::from_secs(30)
            },
            ConnectionState::Degraded => Duration::from_secs(120),
            ConnectionState::Offline => Duration::from_secs(600),
        }
    }

    /// Whether the current outage exceeds `max_offline_days`.
    ///
    /// A signal for callers to judge whether a long-stale cached
    /// policy set is still worth enforcing; the monitor itself does
    /// not act on it.
    #[must_use]
    pub fn is_extended_offline(&self) -> bool {
        let since = match self.inner.lock() {
            Ok(inner) => inner.offline_since,
            Err(_) => None,
        };
        let Some(since) = since else { return false };

        let max_ms = i64::from(self.settings().max_offline_days) * 24 * 60 * 60 * 1000;
        now_millis() - since > max_ms
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(ConnectionState::Unconfigured)
    }

    /// Consecutive failures since the last successful sync.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().map(|i| i.consecutive_failures).unwrap_or(0)
    }

    /// Current escalation settings.
    #[must_use]
    pub fn settings(&self) -> OfflineSettings {
        self.settings
            .read()
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Replace the escalation settings and persist them.
    pub fn update_settings(&self, settings: OfflineSettings) {
        if let Ok(mut current) = self.settings.write() {
            *current = settings;
        }
        if let Ok(value) = serde_json::to_value(settings) {
            if let Err(e) = self.store.set(keys::OFFLINE_SETTINGS, value) {
                warn!(error = %e, "ConnectionMonitor: failed to persist settings");
            }
        }
    }

    /// Register a state-change listener, invoked synchronously with
    /// `(new_state, previous_state)` on every transition.
    pub fn add_listener(&self, listener: StateListener) -> ListenerHandle {
        let id = {
            let mut next = self.next_listener_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        ListenerHandle(id)
    }

    /// Unregister a listener. Returns false if the handle is unknown.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        if let Ok(mut listeners) = self.listeners.lock() {
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != handle.0);
            return listeners.len() < before;
        }
        false
    }

    /// Observability snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let (state, failures, last_sync, offline_since) = self
            .inner
            .lock()
            .map(|i| {
                (
                    i.state,
                    i.consecutive_failures,
                    i.last_successful_sync,
                    i.offline_since,
                )
            })
            .unwrap_or((ConnectionState::Unconfigured, 0, None, None));

        ConnectionStatus {
            state,
            consecutive_failures: failures,
            last_successful_sync: last_sync,
            offline_since,
            is_extended_offline: self.is_extended_offline(),
        }
    }

    /// Apply a state change inside the lock, returning `(new, prev)`
    /// when it actually changed.
    fn transition(
        inner: &mut Inner,
        new: ConnectionState,
    ) -> Option<(ConnectionState, ConnectionState)> {
        if inner.state == new {
            return None;
        }
        let prev = inner.state;
        inner.state = new;
        Some((new, prev))
    }

    /// Invoke all listeners in registration order. A panicking
    /// listener is logged and skipped; delivery to the rest continues.
    fn notify(&self, new: ConnectionState, prev: ConnectionState) {
        let listeners = match self.listeners.lock() {
            Ok(l) => l,
            Err(_) => return,
        };
        for (id, listener) in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(new, prev))).is_err() {
                warn!(listener_id = id, "ConnectionMonitor: listener panicked");
            }
        }
    }

    /// Persist the timestamp pair. Non-fatal if it fails.
    fn persist(&self) {
        let persisted = match self.inner.lock() {
            Ok(inner) => PersistedConnection {
                last_successful_sync: inner.last_successful_sync,
                offline_since: inner.offline_since,
            },
            Err(_) => return,
        };

        match serde_json::to_value(persisted) {
            Ok(value) => {
                if let Err(e) = self.store.set(keys::CONNECTION_STATE, value) {
                    warn!(error = %e, "ConnectionMonitor: failed to persist state");
                }
            },
            Err(e) => warn!(error = %e, "ConnectionMonitor: failed to serialize state"),
        }
    }

    fn is_paired(&self) -> bool {
        let has = |key| matches!(self.store.get(key), Ok(Some(_)));
        has(keys::AUTH_TOKEN) && has(keys::AGENT_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn paired_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::AUTH_TOKEN, json!("token")).unwrap();
        store.set(keys::AGENT_ID, json!("agent-1")).unwrap();
        store
    }

    fn online_monitor() -> ConnectionMonitor {
        let monitor = ConnectionMonitor::new(paired_store());
        monitor.initialize();
        monitor.on_sync_success();
        monitor
    }

    #[test]
    fn test_unconfigured_is_never_reentered() {
        let monitor = online_monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        monitor.add_listener(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.set_state(ConnectionState::Unconfigured);
        assert_eq!(monitor.state(), ConnectionState::Online);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Other forced transitions still work afterwards.
        monitor.set_state(ConnectionState::Degraded);
        assert_eq!(monitor.state(), ConnectionState::Degraded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_initialize_requires_pairing() {
        let monitor = ConnectionMonitor::new(Arc::new(MemoryStore::new()));
        assert_eq!(monitor.initialize(), ConnectionState::Unconfigured);

        let monitor = ConnectionMonitor::new(paired_store());
        assert_eq!(monitor.initialize(), ConnectionState::Connecting);
        // Idempotent.
        assert_eq!(monitor.initialize(), ConnectionState::Connecting);
    }

    #[test]
    fn test_three_failures_degrade() {
        let monitor = online_monitor();

        monitor.on_sync_failure();
        monitor.on_sync_failure();
        assert_eq!(monitor.state(), ConnectionState::Online);

        monitor.on_sync_failure();
        assert_eq!(monitor.state(), ConnectionState::Degraded);
        assert!(monitor.status().offline_since.is_some());
    }

    #[test]
    fn test_fifteen_failures_offline() {
        let monitor = online_monitor();

        for _ in 0..15 {
            monitor.on_sync_failure();
        }
        assert_eq!(monitor.state(), ConnectionState::Offline);
        assert_eq!(monitor.consecutive_failures(), 15);
    }

    #[test]
    fn test_retry_intervals() {
        let online = Duration::from_secs(30);
        let monitor = ConnectionMonitor::new(paired_store());

        monitor.initialize();
        assert_eq!(monitor.retry_interval(online), Duration::from_secs(30));

        monitor.on_sync_success();
        assert_eq!(monitor.retry_interval(Duration::from_secs(45)), Duration::from_secs(45));

        monitor.set_state(ConnectionState::Degraded);
        assert_eq!(monitor.retry_interval(online), Duration::from_secs(120));

        monitor.set_state(ConnectionState::Offline);
        assert_eq!(monitor.retry_interval(online), Duration::from_secs(600));
    }

    #[test]
    fn test_offline_recovery() {
        let monitor = online_monitor();
        for _ in 0..15 {
            monitor.on_sync_failure();
        }
        assert_eq!(monitor.state(), ConnectionState::Offline);

        // Backdate the outage so the duration is measurably positive.
        {
            let mut inner = monitor.inner.lock().unwrap();
            inner.offline_since = Some(now_millis() - 5_000);
        }

        let recovery = monitor.on_sync_success().expect("recovery info");
        assert_eq!(recovery.previous_state, ConnectionState::Offline);
        assert!(recovery.offline_duration > Duration::ZERO);

        assert_eq!(monitor.state(), ConnectionState::Online);
        assert!(monitor.status().offline_since.is_none());
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_without_outage_returns_no_recovery() {
        let monitor = online_monitor();
        assert!(monitor.on_sync_success().is_none());
    }

    #[test]
    fn test_extended_offline() {
        let day_ms = 24 * 60 * 60 * 1000;
        let monitor = online_monitor();

        {
            let mut inner = monitor.inner.lock().unwrap();
            inner.offline_since = Some(now_millis() - day_ms);
        }
        assert!(!monitor.is_extended_offline());

        {
            let mut inner = monitor.inner.lock().unwrap();
            inner.offline_since = Some(now_millis() - 8 * day_ms);
        }
        assert!(monitor.is_extended_offline());
    }

    #[test]
    fn test_listeners_invoked_in_order_and_survive_panic() {
        let monitor = online_monitor();
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&calls);
        monitor.add_listener(Box::new(move |new, prev| {
            assert_ne!(new, prev);
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        monitor.add_listener(Box::new(|_, _| panic!("bad listener")));
        let c3 = Arc::clone(&calls);
        let handle = monitor.add_listener(Box::new(move |_, _| {
            c3.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.set_state(ConnectionState::Degraded);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // A panicking listener must not corrupt state bookkeeping.
        assert_eq!(monitor.state(), ConnectionState::Degraded);

        assert!(monitor.remove_listener(handle));
        assert!(!monitor.remove_listener(handle));

        monitor.set_state(ConnectionState::Online);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_persistence_across_restart() {
        let store = paired_store();
        {
            let monitor = ConnectionMonitor::new(Arc::clone(&store) as Arc<dyn ConfigStore>);
            monitor.initialize();
            monitor.on_sync_success();
            for _ in 0..3 {
                monitor.on_sync_failure();
            }
        }

        let reloaded = ConnectionMonitor::new(store);
        let status = reloaded.status();
        assert!(status.last_successful_sync.is_some());
        assert!(status.offline_since.is_some());
    }

    #[test]
    fn test_settings_persist() {
        let store = paired_store();
        let monitor = ConnectionMonitor::new(Arc::clone(&store) as Arc<dyn ConfigStore>);
        monitor.update_settings(OfflineSettings {
            degraded_threshold: 2,
            offline_threshold: 5,
            max_offline_days: 1,
        });

        let reloaded = ConnectionMonitor::new(store);
        assert_eq!(reloaded.settings().degraded_threshold, 2);
        assert_eq!(reloaded.settings().offline_threshold, 5);

        let m = reloaded;
        m.initialize();
        m.on_sync_success();
        m.on_sync_failure();
        assert_eq!(m.state(), ConnectionState::Online);
        m.on_sync_failure();
        assert_eq!(m.state(), ConnectionState::Degraded);
    }
}
