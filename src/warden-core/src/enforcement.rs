//! Process enforcement loop.
//!
//! One re-armed timer polls the active policies, kills disallowed
//! running processes through the platform collaborator, and reports
//! violations through the policy engine. The next tick is armed only
//! after the current cycle completes, so cycles never overlap.
//!
//! Violation reports are rate limited per policy id: at most one
//! report per 60 seconds no matter how many cycles re-detect the same
//! process, and independent across policy ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::platform::Platform;
use crate::policy::{Policy, PolicyEngine, ViolationRecord};
use crate::trust::now_millis;

/// Lowest accepted check interval.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(5000);

/// Observability snapshot of the enforcement loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementStatus {
    /// Whether the timer task is running.
    pub running: bool,
    /// Current check cadence in milliseconds.
    pub check_interval_ms: u64,
}

/// Polls active policies and terminates disallowed processes.
pub struct EnforcementLoop {
    engine: Arc<PolicyEngine>,
    platform: Arc<dyn Platform>,
    check_interval: Mutex<Duration>,
    report_window: Duration,
    /// Per-policy-id "last reported at" stamps for rate limiting.
    last_reported: Mutex<HashMap<String, Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    interval_changed: Notify,
    stopping: AtomicBool,
}

impl std::fmt::Debug for EnforcementLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcementLoop").finish_non_exhaustive()
    }
}

impl EnforcementLoop {
    /// Create a loop with the given check cadence.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the interval is below the 5000ms floor.
    pub fn new(
        engine: Arc<PolicyEngine>,
        platform: Arc<dyn Platform>,
        check_interval: Duration,
        report_window: Duration,
    ) -> Result<Self, AgentError> {
        Self::validate_interval(check_interval)?;

        Ok(Self {
            engine,
            platform,
            check_interval: Mutex::new(check_interval),
            report_window,
            last_reported: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
            shutdown: Notify::new(),
            interval_changed: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Start the timer task. Calling while already running is a
    /// warning no-op - never a second timer.
    pub fn start(self: &Arc<Self>) {
        let mut task = match self.task.lock() {
            Ok(t) => t,
            Err(e) => e.into_inner(),
        };
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("Enforcement loop already running; start ignored");
            return;
        }

        self.stopping.store(false, Ordering::SeqCst);
        let this = Arc::clone(self);
        info!(
            check_interval_ms = this.check_interval().as_millis() as u64,
            "Enforcement loop started"
        );

        *task = Some(tokio::spawn(async move {
            loop {
                this.check_policies().await;

                // Re-arm only after the cycle completes; a mid-wait
                // interval change restarts the wait at the new cadence.
                let stop = loop {
                    let interval = this.check_interval();
                    tokio::select! {
                        () = tokio::time::sleep(interval) => break false,
                        () = this.interval_changed.notified() => continue,
                        () = this.shutdown.notified() => break true,
                    }
                };
                if stop || this.stopping.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!("Enforcement loop exited");
        }));
    }

    /// Stop the timer and wait for the in-flight cycle to finish.
    ///
    /// Once requested, an in-flight cycle will not commit further
    /// kills or reports.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();

        let task = match self.task.lock() {
            Ok(mut t) => t.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
            info!("Enforcement loop stopped");
        }
    }

    /// Whether the timer task is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// Current check cadence.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        self.check_interval
            .lock()
            .map(|i| *i)
            .unwrap_or(MIN_CHECK_INTERVAL)
    }

    /// Change the check cadence. A running timer is re-armed at the
    /// new interval without losing its running state.
    pub fn set_check_interval(&self, interval: Duration) -> Result<(), AgentError> {
        Self::validate_interval(interval)?;

        if let Ok(mut current) = self.check_interval.lock() {
            *current = interval;
        }
        self.interval_changed.notify_one();
        info!(check_interval_ms = interval.as_millis() as u64, "Check interval updated");
        Ok(())
    }

    /// Observability snapshot.
    #[must_use]
    pub fn status(&self) -> EnforcementStatus {
        EnforcementStatus {
            running: self.is_running(),
            check_interval_ms: self.check_interval().as_millis() as u64,
        }
    }

    /// One enforcement cycle over all active disallowed policies.
    ///
    /// Per-policy failures are logged and skipped so one failing check
    /// cannot blind enforcement of the rest.
    pub async fn check_policies(&self) {
        let active = self.engine.active_policies();
        let disallowed: Vec<Policy> = active.into_iter().filter(|p| !p.allowed).collect();
        debug!(disallowed = disallowed.len(), "Enforcement cycle");

        for policy in &disallowed {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.check_policy(policy).await {
                warn!(policy_id = %policy.id, process = %policy.process_name, error = %e,
                    "Policy check failed");
            }
        }
    }

    /// Check one policy: kill the process when it is running, or clear
    /// the stale rate-limit stamp when it is not.
    pub async fn check_policy(&self, policy: &Policy) -> Result<(), AgentError> {
        let running = self.platform.is_process_running(&policy.process_name).await?;

        if !running {
            // Next detection, even immediately after, reports fresh.
            if let Ok(mut stamps) = self.last_reported.lock() {
                stamps.remove(&policy.id);
            }
            return Ok(());
        }

        self.enforce_policy(policy).await
    }

    /// Terminate the process and report the violation, rate limited
    /// per policy id.
    pub async fn enforce_policy(&self, policy: &Policy) -> Result<(), AgentError> {
        let pids: Vec<u32> = match self.platform.get_process_info(&policy.process_name).await {
            Ok(info) => info.iter().map(|p| p.pid).collect(),
            Err(e) => {
                warn!(process = %policy.process_name, error = %e,
                    "Could not enumerate PIDs for report");
                Vec::new()
            },
        };

        self.platform.kill_process(&policy.process_name).await?;
        info!(policy_id = %policy.id, process = %policy.process_name, pids = ?pids,
            "Disallowed process terminated");

        // Shutdown was requested while the kill was in flight; do not
        // commit a report or rate-limit bookkeeping.
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }

        let due = self
            .last_reported
            .lock()
            .map(|stamps| {
                stamps
                    .get(&policy.id)
                    .is_none_or(|at| at.elapsed() >= self.report_window)
            })
            .unwrap_or(true);

        if !due {
            debug!(policy_id = %policy.id, "Violation report suppressed (rate limit)");
            return Ok(());
        }

        let record = ViolationRecord {
            policy_id: policy.id.clone(),
            process_name: policy.process_name.clone(),
            pids,
            timestamp: now_millis(),
        };

        // Stamp only on success so a failed report retries next tick.
        match self.engine.report_violation(&record).await {
            Ok(()) => {
                if let Ok(mut stamps) = self.last_reported.lock() {
                    stamps.insert(policy.id.clone(), Instant::now());
                }
            },
            Err(e) => {
                warn!(policy_id = %policy.id, error = %e, "Violation report failed; will retry");
            },
        }

        Ok(())
    }

    fn validate_interval(interval: Duration) -> Result<(), AgentError> {
        if interval < MIN_CHECK_INTERVAL {
            return Err(AgentError::config(format!(
                "check interval {}ms is below the {}ms floor",
                interval.as_millis(),
                MIN_CHECK_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HandshakeResponse, ParentApi};
    use crate::config::AgentConfig;
    use crate::platform::ProcessInfo;
    use crate::state::ConnectionMonitor;
    use crate::store::{keys, ConfigStore, MemoryStore};
    use crate::trust::TrustVerifier;
    use async_trait::async_trait;
    use p256::ecdsa::SigningKey;
    use p256::elliptic_curve::rand_core::OsRng;
    use serde_json::json;
    use std::collections::HashSet;

    /// Parent stub capturing violation reports.
    #[derive(Default)]
    struct RecordingParent {
        reports: Mutex<Vec<ViolationRecord>>,
        fail_reports: AtomicBool,
    }

    #[async_trait]
    impl ParentApi for RecordingParent {
        async fn fetch_handshake(&self, _url: &str) -> Result<HandshakeResponse, AgentError> {
            Err(AgentError::network("not used"))
        }

        async fn fetch_policies(&self, _url: &str, _t: &str) -> Result<Vec<Policy>, AgentError> {
            Ok(vec![])
        }

        async fn report_violation(
            &self,
            _url: &str,
            _t: &str,
            record: &ViolationRecord,
        ) -> Result<(), AgentError> {
            if self.fail_reports.load(Ordering::SeqCst) {
                return Err(AgentError::network("report refused"));
            }
            self.reports.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    /// Platform stub with a scriptable set of running processes.
    #[derive(Default)]
    struct FakePlatform {
        running: Mutex<HashSet<String>>,
        kills: Mutex<Vec<String>>,
        fail_kills: AtomicBool,
    }

    impl FakePlatform {
        fn spawn(&self, name: &str) {
            self.running.lock().unwrap().insert(name.to_string());
        }
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn is_process_running(&self, name: &str) -> Result<bool, AgentError> {
            Ok(self.running.lock().unwrap().contains(name))
        }

        async fn kill_process(&self, name: &str) -> Result<bool, AgentError> {
            if self.fail_kills.load(Ordering::SeqCst) {
                return Err(AgentError::EnforcementError {
                    process_name: name.to_string(),
                    message: "permission denied".into(),
                });
            }
            self.kills.lock().unwrap().push(name.to_string());
            Ok(self.running.lock().unwrap().remove(name))
        }

        async fn get_process_info(&self, name: &str) -> Result<Vec<ProcessInfo>, AgentError> {
            if self.running.lock().unwrap().contains(name) {
                Ok(vec![ProcessInfo {
                    pid: 4242,
                    name: name.to_string(),
                }])
            } else {
                Ok(vec![])
            }
        }
    }

    struct Fixture {
        enforcement: Arc<EnforcementLoop>,
        engine: Arc<PolicyEngine>,
        platform: Arc<FakePlatform>,
        parent: Arc<RecordingParent>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        store.set(keys::AUTH_TOKEN, json!("token")).unwrap();
        store.set(keys::AGENT_ID, json!("agent-1")).unwrap();

        let parent = Arc::new(RecordingParent::default());
        let key = SigningKey::random(&mut OsRng);
        let trust = Arc::new(TrustVerifier::with_key(
            *key.verifying_key(),
            Arc::clone(&parent) as Arc<dyn ParentApi>,
            &AgentConfig::default(),
        ));
        let monitor = Arc::new(ConnectionMonitor::new(Arc::clone(&store)));
        monitor.initialize();

        let engine = Arc::new(PolicyEngine::new(
            store,
            trust,
            monitor,
            Arc::clone(&parent) as Arc<dyn ParentApi>,
            &AgentConfig::default(),
        ));

        let platform = Arc::new(FakePlatform::default());
        let enforcement = Arc::new(
            EnforcementLoop::new(
                Arc::clone(&engine),
                Arc::clone(&platform) as Arc<dyn Platform>,
                Duration::from_secs(5),
                Duration::from_secs(60),
            )
            .unwrap(),
        );

        Fixture {
            enforcement,
            engine,
            platform,
            parent,
        }
    }

    #[test]
    fn test_interval_floor() {
        let f = fixture();
        let err = EnforcementLoop::new(
            Arc::clone(&f.engine),
            Arc::clone(&f.platform) as Arc<dyn Platform>,
            Duration::from_millis(4999),
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(err.is_config());

        assert!(f
            .enforcement
            .set_check_interval(Duration::from_millis(100))
            .unwrap_err()
            .is_config());
        assert!(f
            .enforcement
            .set_check_interval(Duration::from_secs(10))
            .is_ok());
        assert_eq!(f.enforcement.check_interval(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cycle_kills_disallowed_running_process() {
        let f = fixture();
        f.engine
            .create_policy(Policy::new("deny-game", "game").disallowed())
            .unwrap();
        f.engine.create_policy(Policy::new("allow-editor", "editor")).unwrap();
        f.platform.spawn("game");
        f.platform.spawn("editor");

        f.enforcement.check_policies().await;

        assert_eq!(*f.platform.kills.lock().unwrap(), vec!["game"]);
        assert!(f.platform.running.lock().unwrap().contains("editor"));

        let reports = f.parent.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].process_name, "game");
        assert_eq!(reports[0].pids, vec![4242]);
    }

    #[tokio::test]
    async fn test_violation_rate_limited_per_policy() {
        let f = fixture();
        let policy = f
            .engine
            .create_policy(Policy::new("deny-game", "game").disallowed())
            .unwrap();

        f.platform.spawn("game");
        f.enforcement.enforce_policy(&policy).await.unwrap();
        f.platform.spawn("game");
        f.enforcement.enforce_policy(&policy).await.unwrap();

        // Two enforcements inside the window, one report.
        assert_eq!(f.parent.reports.lock().unwrap().len(), 1);

        // Reopen the window and enforce again.
        f.enforcement
            .last_reported
            .lock()
            .unwrap()
            .insert(policy.id.clone(), Instant::now() - Duration::from_secs(61));
        f.platform.spawn("game");
        f.enforcement.enforce_policy(&policy).await.unwrap();
        assert_eq!(f.parent.reports.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limits_independent_across_policies() {
        let f = fixture();
        let a = f
            .engine
            .create_policy(Policy::new("deny-a", "proc-a").disallowed())
            .unwrap();
        let b = f
            .engine
            .create_policy(Policy::new("deny-b", "proc-b").disallowed())
            .unwrap();

        f.platform.spawn("proc-a");
        f.platform.spawn("proc-b");
        f.enforcement.enforce_policy(&a).await.unwrap();
        f.enforcement.enforce_policy(&b).await.unwrap();

        assert_eq!(f.parent.reports.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_stamp_cleared_when_process_absent() {
        let f = fixture();
        let policy = f
            .engine
            .create_policy(Policy::new("deny-game", "game").disallowed())
            .unwrap();

        f.platform.spawn("game");
        f.enforcement.enforce_policy(&policy).await.unwrap();
        assert_eq!(f.parent.reports.lock().unwrap().len(), 1);

        // Process gone: the stamp is cleared...
        f.enforcement.check_policy(&policy).await.unwrap();
        assert!(f.enforcement.last_reported.lock().unwrap().is_empty());

        // ...so an immediate re-detection reports fresh.
        f.platform.spawn("game");
        f.enforcement.check_policy(&policy).await.unwrap();
        assert_eq!(f.parent.reports.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_kill_failure_isolated_per_policy() {
        let f = fixture();
        f.engine
            .create_policy(Policy::new("deny-a", "proc-a").disallowed())
            .unwrap();
        f.engine
            .create_policy(Policy::new("deny-b", "proc-b").disallowed())
            .unwrap();
        f.platform.spawn("proc-a");
        f.platform.spawn("proc-b");
        f.platform.fail_kills.store(true, Ordering::SeqCst);

        // Neither failing kill aborts the cycle.
        f.enforcement.check_policies().await;
        assert!(f.parent.reports.lock().unwrap().is_empty());
        assert!(f.platform.running.lock().unwrap().contains("proc-a"));
        assert!(f.platform.running.lock().unwrap().contains("proc-b"));
    }

    #[tokio::test]
    async fn test_failed_report_retries_next_cycle() {
        let f = fixture();
        let policy = f
            .engine
            .create_policy(Policy::new("deny-game", "game").disallowed())
            .unwrap();

        f.parent.fail_reports.store(true, Ordering::SeqCst);
        f.platform.spawn("game");
        f.enforcement.enforce_policy(&policy).await.unwrap();
        assert!(f.parent.reports.lock().unwrap().is_empty());

        // Stamp was not committed, so the next enforcement reports.
        f.parent.fail_reports.store(false, Ordering::SeqCst);
        f.platform.spawn("game");
        f.enforcement.enforce_policy(&policy).await.unwrap();
        assert_eq!(f.parent.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins() {
        let f = fixture();

        f.enforcement.start();
        assert!(f.enforcement.is_running());
        f.enforcement.start(); // no-op, no second timer
        assert!(f.enforcement.is_running());

        f.enforcement.stop().await;
        assert!(!f.enforcement.is_running());

        // Restart after stop works.
        f.enforcement.start();
        assert!(f.enforcement.is_running());
        f.enforcement.stop().await;
    }

    #[tokio::test]
    async fn test_no_commit_after_stop_requested() {
        let f = fixture();
        let policy = f
            .engine
            .create_policy(Policy::new("deny-game", "game").disallowed())
            .unwrap();
        f.platform.spawn("game");

        f.enforcement.stopping.store(true, Ordering::SeqCst);
        f.enforcement.enforce_policy(&policy).await.unwrap();

        // The kill completed but nothing was committed afterwards.
        assert!(f.parent.reports.lock().unwrap().is_empty());
        assert!(f.enforcement.last_reported.lock().unwrap().is_empty());
    }
}
