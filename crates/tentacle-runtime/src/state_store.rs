//! Persisted lifecycle state (`plugin_state.json`)

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tentacle_core::fsutil::write_json_atomic;
use tentacle_core::{Error, PluginStateRecord, Result};
use tracing::debug;

/// Reads and atomically writes the persisted plugin state
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// State file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted records.
    ///
    /// `Ok(None)` when no state file exists yet; a corrupt file is a
    /// validation error.
    pub fn load(&self) -> Result<Option<Vec<PluginStateRecord>>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let records = serde_json::from_str(&content).map_err(|e| {
            Error::validation(format!(
                "corrupt plugin state file {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(records))
    }

    /// Replace the file with `records`, sorted by ID
    pub fn save(&self, records: &[PluginStateRecord]) -> Result<()> {
        let mut sorted: Vec<&PluginStateRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let _guard = self.write_lock.lock();
        write_json_atomic(&self.path, &sorted)?;
        debug!(path = %self.path.display(), count = sorted.len(), "Plugin state saved");
        Ok(())
    }

    /// Merge `in_memory` over what is on disk and write the result.
    ///
    /// In-memory records win. A persisted record with no in-memory
    /// counterpart survives only while its directory under `plugins_dir`
    /// still exists.
    pub fn save_merged(&self, in_memory: Vec<PluginStateRecord>, plugins_dir: &Path) -> Result<()> {
        let _guard = self.write_lock.lock();

        let persisted = match self.load() {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable state file while merging");
                Vec::new()
            }
        };

        let mut merged: BTreeMap<String, PluginStateRecord> = persisted
            .into_iter()
            .filter(|record| plugins_dir.join(&record.id).is_dir())
            .map(|record| (record.id.clone(), record))
            .collect();
        for record in in_memory {
            merged.insert(record.id.clone(), record);
        }

        let records: Vec<&PluginStateRecord> = merged.values().collect();
        write_json_atomic(&self.path, &records)?;
        debug!(path = %self.path.display(), count = records.len(), "Plugin state merged");
        Ok(())
    }
}
