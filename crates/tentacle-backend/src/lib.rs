//! # Tentacle Backend
//!
//! A [`Backend`] is the host-side handle for "a running plugin". Two
//! families are provided:
//!
//! - [`ProcessBackend`]: spawns the plugin executable, reads its handshake
//!   line and talks newline-delimited JSON-RPC 2.0 over TCP. The same wire
//!   client backs [`AttachedBackend`], used for plugins a developer runs
//!   outside the host.
//! - [`InProcessBackend`]: capability clients living in the host process,
//!   for bundled plugins and tests.
//!
//! Backends are created through a [`BackendFactory`] so the loader can be
//! driven by test doubles.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod backend;
pub mod handshake;
pub mod in_process;
pub mod process;
pub mod rpc;

pub use backend::{
    AttachSpec, Backend, BackendFactory, BackendSpec, CapabilityClient, CapabilityDetector,
    ExitSignal,
};
pub use handshake::Handshake;
pub use in_process::{FnClient, InProcessBackend, InProcessBackendFactory};
pub use process::{
    AttachedBackend, ProcessBackend, ProcessBackendFactory, ProcessBackendOptions, COOKIE_ENV,
    PLUGIN_ID_ENV,
};
pub use rpc::{RpcConnection, RpcPluginClient};
