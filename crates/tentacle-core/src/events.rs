//! Event emission
//!
//! The host publishes lifecycle, crash, install and dev-server events
//! through an [`EventSink`]. How events reach a UI is up to the sink.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Phase transition of a plugin
pub const PLUGIN_LIFECYCLE: &str = "plugin:lifecycle";
/// Plugin crash detected
pub const PLUGIN_CRASHED: &str = "plugin:crashed";
/// Crash recovery succeeded
pub const PLUGIN_RECOVERED: &str = "plugin:recovered";
/// Crash recovery gave up
pub const PLUGIN_RECOVERY_FAILED: &str = "plugin:recovery-failed";
/// Install progress update
pub const PLUGIN_INSTALL_PROGRESS: &str = "plugin:install-progress";
/// Plugin removed
pub const PLUGIN_UNINSTALLED: &str = "plugin:uninstalled";
/// Dev server status change
pub const DEVSERVER_STATUS: &str = "devserver:status";
/// Dev server log line
pub const DEVSERVER_LOG: &str = "devserver:log";
/// Dev build diagnostics
pub const DEVSERVER_BUILD_ERRORS: &str = "devserver:build-errors";
/// External dev plugin connected or disconnected
pub const DEVSERVER_EXTERNAL: &str = "devserver:external";

/// An emitted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event key
    pub key: String,
    /// JSON payload
    pub payload: Value,
}

/// Destination for host events
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Publish an event. Must not block.
    fn emit(&self, key: &str, payload: Value);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _key: &str, _payload: Value) {}
}

/// Writes events to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, key: &str, payload: Value) {
        debug!(event = key, payload = %payload, "Host event");
    }
}

/// Fans events out to any number of async subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Event>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, key: &str, payload: Value) {
        // No subscribers is not an error
        let _ = self.sender.send(Event {
            key: key.to_string(),
            payload,
        });
    }
}

/// Keeps every event in memory, in order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events with the given key
    pub fn events_with_key(&self, key: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.key == key)
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, key: &str, payload: Value) {
        self.events.lock().push(Event {
            key: key.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_sink() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(PLUGIN_CRASHED, json!({"pluginId": "demo"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, PLUGIN_CRASHED);
        assert_eq!(event.payload["pluginId"], "demo");
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let sink = BroadcastSink::new(1);
        sink.emit(PLUGIN_LIFECYCLE, json!(null));
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.emit(DEVSERVER_LOG, json!("a"));
        sink.emit(DEVSERVER_STATUS, json!("b"));
        sink.emit(DEVSERVER_LOG, json!("c"));
        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.events_with_key(DEVSERVER_LOG).len(), 2);
    }
}
