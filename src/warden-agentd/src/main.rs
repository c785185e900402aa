//! warden-agentd - Warden endpoint agent daemon.
//!
//! Enforces process-level usage policies pushed by a remote parent
//! controller. The daemon keeps a local policy cache, verifies the
//! parent against a pinned public key before applying any update, and
//! keeps enforcing the cached set through any outage.
//!
//! ## Usage
//!
//! ```bash
//! # Run against a paired parent with the default cadence
//! warden-agentd --data-dir /var/lib/warden
//!
//! # Point at a non-default parent and sync every 60 seconds
//! warden-agentd --data-dir /var/lib/warden \
//!     --parent-url http://controller.lan:3080 \
//!     --check-interval 60
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_core::{
    AgentConfig, AgentError, ConfigStore, ConnectionMonitor, ConnectionState, EnforcementLoop,
    HttpParentClient, JsonFileStore, ParentApi, Platform, PolicyEngine, SyncScheduler,
    TrustVerifier, UnixPlatform,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Warden endpoint agent daemon.
///
/// Requires a paired data directory: the store must already hold the
/// parent's pinned public key and the agent credentials.
#[derive(Parser)]
#[command(name = "warden-agentd")]
#[command(version = VERSION)]
#[command(about = "Process usage policy enforcement agent")]
struct Cli {
    /// Directory holding the agent's persistent state
    #[arg(short, long, default_value = "/var/lib/warden")]
    data_dir: PathBuf,

    /// Parent controller base URL
    #[arg(short, long)]
    parent_url: Option<String>,

    /// Sync and enforcement cadence in seconds while online
    #[arg(short, long, default_value_t = 30)]
    check_interval: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = AgentConfig::default();
    if let Some(url) = cli.parent_url {
        config.parent_url = url;
    }
    config.check_interval = Duration::from_secs(cli.check_interval);

    info!(version = VERSION, data_dir = %cli.data_dir.display(), parent_url = %config.parent_url,
        "warden-agentd starting");

    let store: Arc<dyn ConfigStore> =
        Arc::new(JsonFileStore::open(cli.data_dir.join("agent.json")));
    let client: Arc<dyn ParentApi> = Arc::new(HttpParentClient::new(config.request_timeout)?);

    // Refuses to run unpaired: without a pinned key every sync would
    // fail closed and there would be nothing trustworthy to enforce.
    let trust = Arc::new(TrustVerifier::new(
        store.as_ref(),
        Arc::clone(&client),
        &config,
    )?);

    let monitor = Arc::new(ConnectionMonitor::new(Arc::clone(&store)));
    let engine = Arc::new(PolicyEngine::new(
        Arc::clone(&store),
        trust,
        Arc::clone(&monitor),
        Arc::clone(&client),
        &config,
    ));
    let platform: Arc<dyn Platform> = Arc::new(UnixPlatform::default());
    // A --check-interval below the enforcement floor is a
    // configuration error, not something to silently round up.
    let enforcement = Arc::new(EnforcementLoop::new(
        Arc::clone(&engine),
        platform,
        config.check_interval,
        config.report_window,
    )?);
    let scheduler = Arc::new(SyncScheduler::new(
        Arc::clone(&engine),
        Arc::clone(&monitor),
        &config,
    ));

    let monitor_for_listener = Arc::clone(&monitor);
    monitor.add_listener(Box::new(move |new, previous| {
        info!(from = %previous, to = %new, "Connection state changed");
        if new == ConnectionState::Offline && monitor_for_listener.is_extended_offline() {
            warn!("Offline beyond the configured grace period");
        }
    }));

    let state = monitor.initialize();
    if state == ConnectionState::Unconfigured {
        warn!("Agent has no stored credentials; staying UNCONFIGURED until paired");
    }

    scheduler.start();
    enforcement.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Signal listener failed; shutting down");
    }
    info!("Shutdown requested");

    enforcement.stop().await;
    scheduler.stop().await;
    info!("warden-agentd stopped");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
