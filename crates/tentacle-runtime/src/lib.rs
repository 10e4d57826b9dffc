//! # Tentacle Runtime
//!
//! Plugin lifecycle orchestration:
//! - Loading, unloading and reloading plugins with capability negotiation
//! - Periodic health checks and crash recovery with exponential backoff
//! - Startup reconciliation of persisted state against the plugins directory
//! - Cleanup of processes orphaned by an unclean shutdown
//! - Install, uninstall, enable and disable through the [`Manager`]

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod controller;
pub mod health;
pub mod loader;
pub mod manager;
pub mod pid_tracker;
pub mod reconciler;
pub mod record;
pub mod state_store;

pub use controller::{CapabilityController, ClientRegistry, ControllerRegistry};
pub use health::{HealthChecker, RecoveryOutcome, RecoveryTarget};
pub use loader::{CrashHandler, LoadOptions, Loader};
pub use manager::{InitReport, Manager, ManagerBuilder};
pub use pid_tracker::PidTracker;
pub use reconciler::{
    determine_initial_phase, reconcile, reconcile_from_filesystem, ReconcileError,
    ReconcileReport,
};
pub use record::{ExistingState, PluginInfo, PluginRecord, RecordTable};
pub use state_store::StateStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::controller::{CapabilityController, ClientRegistry};
    pub use crate::loader::LoadOptions;
    pub use crate::manager::{InitReport, Manager, ManagerBuilder};
    pub use crate::record::{ExistingState, PluginInfo};
}
