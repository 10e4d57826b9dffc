//! # Tentacle Core
//!
//! Shared building blocks for the Tentacle plugin host:
//!
//! - **Lifecycle**: [`PluginPhase`], its transition table, and the
//!   per-plugin [`PluginStateMachine`]
//! - **Recovery**: [`RetryPolicy`] / [`RetryState`] exponential backoff
//! - **Packages**: [`PluginMetadata`] and the on-disk layout helpers
//! - **Persistence**: [`PluginStateRecord`] and atomic JSON writes
//! - **Events**: the [`EventSink`] abstraction
//! - **Processes**: the platform [`ProcessController`]
//! - **Errors**: [`Error`] with its [`ErrorKind`] taxonomy

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod capability;
pub mod dev;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod lifecycle;
pub mod metadata;
pub mod phase;
pub mod process;
pub mod retry;
pub mod state;

pub use capability::Capability;
pub use dev::{
    DevModeHook, DevPlugin, ExternalConnection, ExternalPluginListener, ReloadCallback,
    ReloadFuture,
};
pub use error::{BuildError, Error, ErrorKind, Result, RPC_METHOD_NOT_FOUND};
pub use events::{BroadcastSink, Event, EventSink, NoopSink, RecordingSink, TracingSink};
pub use lifecycle::{PluginStateMachine, Transition, TransitionObserver, HISTORY_CAPACITY};
pub use metadata::PluginMetadata;
pub use phase::PluginPhase;
pub use process::{default_controller, ProcessController, SignalOutcome};
pub use retry::{RetryPolicy, RetryState};
pub use state::PluginStateRecord;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::capability::Capability;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::events::EventSink;
    pub use crate::lifecycle::{PluginStateMachine, Transition};
    pub use crate::metadata::PluginMetadata;
    pub use crate::phase::PluginPhase;
    pub use crate::state::PluginStateRecord;
}
