//! Runtime plugin records

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tentacle_backend::Backend;
use tentacle_core::{Capability, PluginMetadata, PluginPhase, PluginStateMachine, PluginStateRecord};

/// The manager's record table.
///
/// Never held across an `.await`.
pub type RecordTable = Arc<RwLock<HashMap<String, PluginRecord>>>;

/// Persisted fields of a record, carried across unload/load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingState {
    /// Enabled flag
    pub enabled: bool,
    /// Dev mode flag
    pub dev_mode: bool,
    /// Developer source tree
    pub dev_path: Option<PathBuf>,
    /// Most recent error
    pub last_error: Option<String>,
    /// Error counter
    pub error_count: u32,
    /// Install time
    pub installed_at: DateTime<Utc>,
}

impl Default for ExistingState {
    fn default() -> Self {
        Self {
            enabled: true,
            dev_mode: false,
            dev_path: None,
            last_error: None,
            error_count: 0,
            installed_at: Utc::now(),
        }
    }
}

impl ExistingState {
    /// State for a plugin running from `dev_path`
    pub fn dev(dev_path: impl Into<PathBuf>) -> Self {
        Self {
            dev_mode: true,
            dev_path: Some(dev_path.into()),
            ..Self::default()
        }
    }
}

impl From<&PluginStateRecord> for ExistingState {
    fn from(record: &PluginStateRecord) -> Self {
        Self {
            enabled: record.enabled,
            dev_mode: record.dev_mode,
            dev_path: record.dev_path.clone(),
            last_error: record.last_error.clone(),
            error_count: record.error_count,
            installed_at: record.installed_at,
        }
    }
}

/// A plugin known to the host
#[derive(Clone)]
pub struct PluginRecord {
    /// Plugin metadata
    pub metadata: PluginMetadata,
    /// Persisted fields
    pub state: ExistingState,
    /// Phase tracker; survives reloads
    pub state_machine: Arc<PluginStateMachine>,
    /// Live backend, if the plugin is running one
    pub backend: Option<Arc<dyn Backend>>,
    /// Capabilities negotiated at load time
    pub capabilities: Vec<Capability>,
    /// Bumped on every load so stale completions can be detected
    pub generation: u64,
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.metadata.id)
            .field("phase", &self.phase())
            .field("dev_mode", &self.state.dev_mode)
            .field("capabilities", &self.capabilities)
            .field("has_backend", &self.backend.is_some())
            .field("generation", &self.generation)
            .finish()
    }
}

impl PluginRecord {
    /// Plugin ID
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Current phase
    pub fn phase(&self) -> PluginPhase {
        self.state_machine.phase()
    }

    /// Persisted projection
    pub fn to_state_record(&self) -> PluginStateRecord {
        PluginStateRecord {
            id: self.metadata.id.clone(),
            phase: self.phase(),
            metadata: self.metadata.clone(),
            enabled: self.state.enabled,
            dev_mode: self.state.dev_mode,
            dev_path: self.state.dev_path.clone(),
            last_error: self.state.last_error.clone(),
            error_count: self.state.error_count,
            installed_at: self.state.installed_at,
        }
    }

    /// Snapshot for callers
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.metadata.id.clone(),
            name: self.metadata.name.clone(),
            version: self.metadata.version.clone(),
            phase: self.phase(),
            enabled: self.state.enabled,
            dev_mode: self.state.dev_mode,
            dev_path: self.state.dev_path.clone(),
            declared: self.metadata.capabilities.clone(),
            capabilities: self.capabilities.clone(),
            last_error: self.state.last_error.clone(),
            error_count: self.state.error_count,
            installed_at: self.state.installed_at,
            pid: self.backend.as_ref().and_then(|b| b.pid()),
        }
    }
}

/// Read-only view of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    /// Plugin ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Version
    pub version: String,
    /// Current phase
    pub phase: PluginPhase,
    /// Enabled flag
    pub enabled: bool,
    /// Dev mode flag
    pub dev_mode: bool,
    /// Developer source tree
    pub dev_path: Option<PathBuf>,
    /// Capabilities declared in metadata
    pub declared: Vec<Capability>,
    /// Capabilities negotiated with the running backend
    pub capabilities: Vec<Capability>,
    /// Most recent error
    pub last_error: Option<String>,
    /// Error counter
    pub error_count: u32,
    /// Install time
    pub installed_at: DateTime<Utc>,
    /// Backend process ID
    pub pid: Option<u32>,
}
