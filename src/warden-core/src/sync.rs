//! Background policy sync scheduler.
//!
//! Drives [`PolicyEngine::sync_from_parent`] on a re-armed timer whose
//! cadence follows the connection state: the configured interval while
//! ONLINE, backed off to the CONNECTING, DEGRADED and OFFLINE retry
//! intervals as the connection monitor escalates. Because the timer is
//! re-armed after each attempt, an escalation mid-outage takes effect
//! on the very next wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::policy::PolicyEngine;
use crate::state::ConnectionMonitor;

/// Periodically pulls policies from the parent.
pub struct SyncScheduler {
    engine: Arc<PolicyEngine>,
    monitor: Arc<ConnectionMonitor>,
    parent_url: String,
    online_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    stopping: AtomicBool,
}

impl SyncScheduler {
    /// Create a scheduler over the given engine and monitor.
    pub fn new(
        engine: Arc<PolicyEngine>,
        monitor: Arc<ConnectionMonitor>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            engine,
            monitor,
            parent_url: config.parent_url.clone(),
            online_interval: config.check_interval,
            task: Mutex::new(None),
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Start the timer task. Calling while already running is a
    /// warning no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = match self.task.lock() {
            Ok(t) => t,
            Err(e) => e.into_inner(),
        };
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("Sync scheduler already running; start ignored");
            return;
        }

        self.stopping.store(false, Ordering::SeqCst);
        let this = Arc::clone(self);
        info!(parent_url = %this.parent_url, "Sync scheduler started");

        *task = Some(tokio::spawn(async move {
            loop {
                let _ = this.sync_now().await;
                if this.stopping.load(Ordering::SeqCst) {
                    break;
                }

                let interval = this.monitor.retry_interval(this.online_interval);
                debug!(next_sync_ms = interval.as_millis() as u64, state = %this.monitor.state(),
                    "Sync re-armed");
                tokio::select! {
                    () = tokio::time::sleep(interval) => {},
                    () = this.shutdown.notified() => break,
                }
            }
            debug!("Sync scheduler exited");
        }));
    }

    /// Stop the timer and wait for an in-flight attempt to finish.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();

        let task = match self.task.lock() {
            Ok(mut t) => t.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
            info!("Sync scheduler stopped");
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

    /// One sync attempt, outside the timer cadence.
    ///
    /// Failures are already accounted by the connection monitor; the
    /// cached policies stay in force either way. A fetch that is in
    /// flight when [`Self::stop`] is requested completes but commits
    /// nothing.
    pub async fn sync_now(&self) -> Result<usize, AgentError> {
        let result = self
            .engine
            .sync_from_parent_gated(&self.parent_url, &|| {
                !self.stopping.load(Ordering::SeqCst)
            })
            .await;
        if result.is_err() && self.monitor.is_extended_offline() {
            warn!("Parent unreachable beyond the offline grace period");
        }
        result
    }
}
