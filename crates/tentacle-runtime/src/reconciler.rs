//! Startup reconciliation of persisted state against the plugins directory

use std::collections::{HashMap, HashSet};
use std::path::Path;
use tentacle_core::metadata::{read_metadata, validate_executable};
use tentacle_core::{Error, PluginPhase, PluginStateRecord};
use tracing::{debug, info, warn};

/// A plugin directory that could not be reconciled
#[derive(Debug)]
pub struct ReconcileError {
    /// Directory name (the plugin ID it would have had)
    pub plugin_id: String,
    /// What went wrong
    pub error: Error,
}

/// Outcome of a reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Records to load, sorted by ID
    pub records: Vec<PluginStateRecord>,
    /// Directories adopted without a persisted entry
    pub orphans: Vec<String>,
    /// Persisted entries whose directory is gone
    pub ghosts: Vec<String>,
    /// Directories skipped because they were unreadable
    pub errors: Vec<ReconcileError>,
}

/// Merge persisted records with what is installed under `plugins_dir`.
///
/// Every directory with valid metadata yields a record. Persisted
/// entries contribute their state; directories without one are adopted as
/// orphans in [`PluginPhase::Installed`]. Persisted entries with no
/// directory are reported as ghosts and dropped. A bad directory is
/// reported and skipped, never aborting the pass.
pub fn reconcile(plugins_dir: &Path, persisted: &[PluginStateRecord]) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let known: HashMap<&str, &PluginStateRecord> =
        persisted.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut seen: HashSet<String> = HashSet::new();

    let entries = match std::fs::read_dir(plugins_dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).collect::<Vec<_>>(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(dir = %plugins_dir.display(), error = %e, "Failed to read plugins directory");
            Vec::new()
        }
    };

    for entry in entries {
        let path = entry.path();
        let Some(dir_name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if dir_name.starts_with('.') || !path.is_dir() {
            continue;
        }

        let metadata = match read_metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(plugin = %dir_name, error = %error, "Skipping plugin directory");
                report.errors.push(ReconcileError {
                    plugin_id: dir_name,
                    error,
                });
                continue;
            }
        };
        if metadata.id != dir_name {
            let error = Error::validation(format!(
                "metadata id '{}' does not match directory '{dir_name}'",
                metadata.id
            ));
            warn!(plugin = %dir_name, error = %error, "Skipping plugin directory");
            report.errors.push(ReconcileError {
                plugin_id: dir_name,
                error,
            });
            continue;
        }
        seen.insert(dir_name.clone());

        let record = match known.get(dir_name.as_str()) {
            Some(state) => {
                let mut record = (*state).clone();
                record.metadata = metadata;
                record.phase = determine_initial_phase(&record, &path);
                record
            }
            None => {
                info!(plugin = %dir_name, "Adopting orphaned plugin directory");
                report.orphans.push(dir_name.clone());
                PluginStateRecord::new(metadata, PluginPhase::Installed)
            }
        };
        debug!(plugin = %record.id, phase = %record.phase, "Reconciled plugin");
        report.records.push(record);
    }

    for state in persisted {
        if !seen.contains(&state.id) {
            warn!(plugin = %state.id, "Dropping state for plugin with no directory");
            report.ghosts.push(state.id.clone());
        }
    }

    report.records.sort_by(|a, b| a.id.cmp(&b.id));
    report.orphans.sort();
    report.ghosts.sort();
    report
}

/// Degraded reconciliation used when the state file is unreadable
pub fn reconcile_from_filesystem(plugins_dir: &Path) -> ReconcileReport {
    warn!(dir = %plugins_dir.display(), "Rebuilding plugin state from the filesystem");
    reconcile(plugins_dir, &[])
}

/// Phase a reconciled plugin starts in.
///
/// Disabled plugins are [`PluginPhase::Stopped`]. A backend plugin with no
/// usable executable needs [`PluginPhase::Building`] in dev mode and is
/// [`PluginPhase::Failed`] otherwise. Everything else is
/// [`PluginPhase::Installed`].
pub fn determine_initial_phase(record: &PluginStateRecord, dir: &Path) -> PluginPhase {
    if !record.enabled {
        return PluginPhase::Stopped;
    }
    if record.metadata.has_backend() && validate_executable(dir).is_err() {
        return if record.dev_mode {
            PluginPhase::Building
        } else {
            PluginPhase::Failed
        };
    }
    PluginPhase::Installed
}
