//! # warden-core
//!
//! Core logic for the Warden endpoint agent - a persistent daemon that
//! enforces process-level usage policies pushed by a remote parent
//! controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       warden agent                           │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │ TrustVerifier│  │  Connection  │  │  ConfigStore │      │
//! │  │ (pinned key) │  │   Monitor    │  │ (JSON file)  │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐      │
//! │  │                 PolicyEngine                      │      │
//! │  │   (CRUD, schedule resolution, trust-gated sync)   │      │
//! │  └──────────────────────────────────────────────────┘      │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐      │
//! │  │               EnforcementLoop                     │      │
//! │  │   (kill disallowed processes, report violations)  │      │
//! │  └──────────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! - **Fail-closed sync**: Policies are never applied from an
//!   unverified parent; the cached set stays in force
//! - **Pinned trust**: Handshakes verify against a locally pinned
//!   public key, never a key supplied by the network
//! - **Bounded replay**: Handshake timestamps outside a narrow window
//!   are rejected in either direction
//! - **Graceful degradation**: Connection loss backs off retry cadence
//!   but never suspends local enforcement

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::missing_panics_doc)] // Panic documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod client;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod platform;
pub mod policy;
pub mod state;
pub mod store;
pub mod sync;
pub mod trust;

pub use client::{HandshakeResponse, HttpParentClient, ParentApi};
pub use config::AgentConfig;
pub use enforcement::{EnforcementLoop, EnforcementStatus, MIN_CHECK_INTERVAL};
pub use error::AgentError;
pub use platform::{Platform, ProcessInfo};
pub use policy::{
    Policy, PolicyEngine, PolicyEngineStatus, PolicyListenerHandle, PolicyPatch, Schedule,
    ViolationRecord,
};
pub use state::{
    ConnectionMonitor, ConnectionState, ListenerHandle, OfflineRecovery, OfflineSettings,
};
pub use store::{keys, ConfigStore, JsonFileStore, MemoryStore};
pub use sync::SyncScheduler;
pub use trust::{TrustStatus, TrustVerifier};

#[cfg(unix)]
pub use platform::UnixPlatform;
