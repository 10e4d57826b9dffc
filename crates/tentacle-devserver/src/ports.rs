//! Port allocation for front-end dev servers

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use tentacle_core::{Error, Result};
use tracing::debug;

/// Hands out ports from a fixed range, one per plugin
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    assigned: Mutex<HashMap<String, u16>>,
}

impl PortAllocator {
    /// Allocator over `start..=end`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Port for `plugin_id`.
    ///
    /// Returns the plugin's existing port if it has one. Otherwise scans
    /// the range for a port that is neither claimed here nor bound by
    /// another process.
    pub fn allocate(&self, plugin_id: &str) -> Result<u16> {
        let mut assigned = self.assigned.lock();
        if let Some(port) = assigned.get(plugin_id) {
            return Ok(*port);
        }

        for port in self.start..=self.end {
            if assigned.values().any(|p| *p == port) || !is_free(port) {
                continue;
            }
            assigned.insert(plugin_id.to_string(), port);
            debug!(plugin = %plugin_id, port, "Port allocated");
            return Ok(port);
        }

        Err(Error::conflict(format!(
            "no free port in range {}-{}",
            self.start, self.end
        )))
    }

    /// Return `plugin_id`'s port to the pool
    pub fn release(&self, plugin_id: &str) -> Option<u16> {
        let released = self.assigned.lock().remove(plugin_id);
        if let Some(port) = released {
            debug!(plugin = %plugin_id, port, "Port released");
        }
        released
    }

    /// Port currently held by `plugin_id`
    pub fn port_of(&self, plugin_id: &str) -> Option<u16> {
        self.assigned.lock().get(plugin_id).copied()
    }

    /// Number of live allocations
    pub fn allocated(&self) -> usize {
        self.assigned.lock().len()
    }
}

fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
