//! Backend abstraction

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tentacle_core::{Capability, Error, Result};
use tokio::sync::watch;

/// Carries the reason a plugin went away on its own; stays `None` while it
/// runs and across a requested stop
pub type ExitSignal = watch::Receiver<Option<String>>;

/// Handle over a running plugin
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Plugin this backend serves
    fn plugin_id(&self) -> &str;

    /// Get a client for one capability
    fn dispense(&self, capability: Capability) -> Result<Arc<dyn CapabilityClient>>;

    /// Whether the plugin currently answers as healthy
    async fn healthy(&self) -> bool;

    /// Graceful close, then forced termination if needed
    async fn stop(&self) -> Result<()>;

    /// Forced termination
    async fn kill(&self) -> Result<()>;

    /// Whether the plugin has gone away
    fn exited(&self) -> bool;

    /// OS process the host spawned and is responsible for cleaning up
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Signal for unrequested exits, for backends that can report them
    fn exit_signal(&self) -> Option<ExitSignal> {
        None
    }

    /// Capability detection, for backends that support it
    fn as_detector(&self) -> Option<&dyn CapabilityDetector> {
        None
    }
}

/// Optional backend capability: ask the plugin what it implements
#[async_trait]
pub trait CapabilityDetector: Send + Sync {
    /// Capabilities the running plugin actually serves
    async fn detect_capabilities(&self) -> Result<Vec<Capability>>;
}

/// Client for one capability surface of a plugin
#[async_trait]
pub trait CapabilityClient: Send + Sync + fmt::Debug {
    /// The capability this client speaks
    fn capability(&self) -> Capability;

    /// Invoke `method` (relative to the capability, e.g. `"types"`)
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// What to launch for a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    /// Plugin ID
    pub plugin_id: String,
    /// Executable path
    pub executable: PathBuf,
    /// Extra arguments
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: PathBuf,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl BackendSpec {
    /// Spec for `executable`, run from `working_dir`
    pub fn new(
        plugin_id: impl Into<String>,
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            executable: executable.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }
}

/// Where to find a plugin that is already running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachSpec {
    /// Plugin ID
    pub plugin_id: String,
    /// RPC address the plugin listens on
    pub addr: SocketAddr,
    /// Process ID the plugin declared
    pub pid: u32,
}

/// Creates backends; injectable so tests can substitute doubles
#[async_trait]
pub trait BackendFactory: Send + Sync + fmt::Debug {
    /// Launch a plugin
    async fn create(&self, spec: &BackendSpec) -> Result<Arc<dyn Backend>>;

    /// Attach to a plugin that is already running
    async fn attach(&self, spec: &AttachSpec) -> Result<Arc<dyn Backend>> {
        Err(Error::validation(format!(
            "backend factory cannot attach to external plugin '{}'",
            spec.plugin_id
        )))
    }
}
