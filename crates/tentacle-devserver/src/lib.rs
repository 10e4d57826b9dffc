//! # Tentacle Dev Server
//!
//! Developer-mode pipeline for plugins run from source:
//! - Go source watching with per-path debounce
//! - Rebuild, binary transfer and live reload, with structured compiler diagnostics
//! - A Vite dev server per UI plugin, in its own process group, on an allocated port
//! - Ring-buffered logs of every dev process
//! - Discovery of plugins the developer runs outside the host, via handshake files

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod build;
pub mod diagnostics;
pub mod external;
pub mod instance;
pub mod log_buffer;
pub mod manager;
pub mod ports;
pub mod vite;
pub mod watcher;

pub use build::{BackendBuilder, BuildReport, GoBuilder};
pub use diagnostics::parse_go_build_output;
pub use external::{ExternalWatcher, Handshake};
pub use instance::{
    BackendStatus, DevEventHandler, DevServerInstance, DevServerState, EventSinkHandler,
    InstanceOptions,
};
pub use log_buffer::{LogEntry, LogRing, LogSource, LogStream};
pub use manager::DevServerManager;
pub use ports::PortAllocator;
pub use vite::{FrontendOptions, FrontendServer, FrontendStatus};
pub use watcher::{Debouncer, SourceWatcher};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::external::ExternalWatcher;
    pub use crate::instance::{DevServerState, EventSinkHandler};
    pub use crate::log_buffer::LogEntry;
    pub use crate::manager::DevServerManager;
}
