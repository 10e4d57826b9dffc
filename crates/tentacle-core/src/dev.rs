//! Contract between the plugin manager and the dev-mode subsystem

use crate::error::Result;
use crate::metadata::PluginMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a [`ReloadCallback`]
pub type ReloadFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Callback that reloads a plugin by ID
pub type ReloadCallback = Arc<dyn Fn(String) -> ReloadFuture + Send + Sync>;

/// A plugin running from developer sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevPlugin {
    /// Plugin metadata
    pub metadata: PluginMetadata,
    /// Developer source tree
    pub dev_path: PathBuf,
    /// Installed plugin directory the build output is copied into
    pub install_dir: PathBuf,
}

impl DevPlugin {
    /// Plugin ID
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// Dev-mode orchestration as seen by the manager
#[async_trait]
pub trait DevModeHook: Send + Sync + fmt::Debug {
    /// Build the backend once and copy the result into `install_dir`
    async fn initial_build(&self, plugin: &DevPlugin) -> Result<()>;

    /// Start watching and serving the plugin in the background
    async fn start(&self, plugin: DevPlugin, reload: ReloadCallback) -> Result<()>;

    /// Stop everything running for `plugin_id`
    async fn stop(&self, plugin_id: &str) -> Result<()>;

    /// Stop every dev server
    async fn stop_all(&self);
}

/// A plugin the developer runs outside the host, announced by a handshake file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalConnection {
    /// Plugin ID
    pub plugin_id: String,
    /// Address the plugin serves RPC on
    pub addr: SocketAddr,
    /// Process ID of the external plugin
    pub pid: u32,
    /// Declared RPC protocol
    pub protocol: String,
    /// Declared protocol version
    pub protocol_version: u32,
    /// Port of the plugin's own front-end dev server
    pub vite_port: Option<u16>,
    /// Plugin version, if announced
    pub version: Option<String>,
    /// When the plugin started
    pub started_at: Option<DateTime<Utc>>,
}

/// Receives external plugin connects and disconnects
#[async_trait]
pub trait ExternalPluginListener: Send + Sync + fmt::Debug {
    /// A live external plugin appeared or changed its handshake
    async fn on_connected(&self, connection: ExternalConnection) -> Result<()>;

    /// The external plugin went away
    async fn on_disconnected(&self, plugin_id: &str) -> Result<()>;
}
