//! Persisted plugin state

use crate::metadata::PluginMetadata;
use crate::phase::PluginPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The durable projection of a loaded plugin.
///
/// Written to `plugin_state.json`; live handles (backend, negotiated
/// capabilities) are deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStateRecord {
    /// Plugin ID
    pub id: String,

    /// Phase at the time of the write
    pub phase: PluginPhase,

    /// Metadata as last read from disk
    pub metadata: PluginMetadata,

    /// Whether the plugin should be started at boot
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Whether the plugin runs from developer sources
    #[serde(default)]
    pub dev_mode: bool,

    /// Developer source directory (dev mode only)
    #[serde(default)]
    pub dev_path: Option<PathBuf>,

    /// Most recent error message
    #[serde(default)]
    pub last_error: Option<String>,

    /// Errors seen since install
    #[serde(default)]
    pub error_count: u32,

    /// When the plugin was installed
    pub installed_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl PluginStateRecord {
    /// New record for a freshly discovered plugin
    pub fn new(metadata: PluginMetadata, phase: PluginPhase) -> Self {
        Self {
            id: metadata.id.clone(),
            phase,
            metadata,
            enabled: true,
            dev_mode: false,
            dev_path: None,
            last_error: None,
            error_count: 0,
            installed_at: Utc::now(),
        }
    }
}
