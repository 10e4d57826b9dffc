//! Tracking of spawned plugin processes across host restarts

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tentacle_core::fsutil::write_json_atomic;
use tentacle_core::{ProcessController, Result, SignalOutcome};
use tracing::{debug, info, warn};

/// Persists plugin PIDs so orphans from an unclean shutdown can be killed
#[derive(Debug)]
pub struct PidTracker {
    path: PathBuf,
    pids: Mutex<HashMap<String, u32>>,
    controller: Arc<dyn ProcessController>,
}

impl PidTracker {
    /// Tracker persisting to `path`
    pub fn new(path: impl Into<PathBuf>, controller: Arc<dyn ProcessController>) -> Self {
        Self {
            path: path.into(),
            pids: Mutex::new(HashMap::new()),
            controller,
        }
    }

    /// PID file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remember the process running `plugin_id`
    pub fn record(&self, plugin_id: &str, pid: u32) {
        let mut pids = self.pids.lock();
        pids.insert(plugin_id.to_string(), pid);
        self.persist(&pids);
    }

    /// Forget `plugin_id`
    pub fn remove(&self, plugin_id: &str) {
        let mut pids = self.pids.lock();
        if pids.remove(plugin_id).is_some() {
            self.persist(&pids);
        }
    }

    /// PID recorded for `plugin_id`
    pub fn get(&self, plugin_id: &str) -> Option<u32> {
        self.pids.lock().get(plugin_id).copied()
    }

    /// Number of tracked processes
    pub fn len(&self) -> usize {
        self.pids.lock().len()
    }

    /// Whether no processes are tracked
    pub fn is_empty(&self) -> bool {
        self.pids.lock().is_empty()
    }

    /// Write the current map to disk
    pub fn save(&self) -> Result<()> {
        let pids = self.pids.lock();
        self.write(&pids)
    }

    fn write(&self, pids: &HashMap<String, u32>) -> Result<()> {
        let sorted: BTreeMap<&String, &u32> = pids.iter().collect();
        write_json_atomic(&self.path, &sorted)
    }

    fn persist(&self, pids: &HashMap<String, u32>) {
        if let Err(e) = self.write(pids) {
            warn!(path = %self.path.display(), error = %e, "Failed to write PID file");
        }
    }

    /// Kill processes left over from a previous run.
    ///
    /// Reads and deletes the PID file, then kills every listed process
    /// group. A process that no longer exists counts as cleaned up. Returns
    /// how many processes were signalled.
    pub fn cleanup_stale(&self) -> usize {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read PID file");
                return 0;
            }
        };
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to delete PID file");
        }

        let stale: HashMap<String, u32> = match serde_json::from_str(&content) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed PID file");
                return 0;
            }
        };

        let mut killed = 0;
        for (plugin_id, pid) in stale {
            let outcome = self
                .controller
                .kill_group(pid)
                .or_else(|_| self.controller.kill(pid));
            match outcome {
                Ok(SignalOutcome::Delivered) => {
                    info!(plugin = %plugin_id, pid, "Killed orphaned plugin process");
                    killed += 1;
                }
                Ok(SignalOutcome::NotRunning) => {
                    debug!(plugin = %plugin_id, pid, "Orphaned plugin process already gone");
                }
                Err(e) => {
                    warn!(plugin = %plugin_id, pid, error = %e, "Failed to kill orphaned plugin process");
                }
            }
        }
        killed
    }
}
