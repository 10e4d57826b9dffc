//! Externally-run dev plugins
//!
//! A developer can run a plugin outside the host (under a debugger, say).
//! The plugin announces itself by writing `<plugin-id>.json` into the
//! handshake directory. This watcher validates the file, hands the
//! connection to an [`ExternalPluginListener`], and checks the declared
//! process so that a dead plugin is disconnected even when it never
//! removes its file.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tentacle_core::events::DEVSERVER_EXTERNAL;
use tentacle_core::{
    Error, EventSink, ExternalConnection, ExternalPluginListener, ProcessController, Result,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Contents of a handshake file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Process ID of the running plugin
    pub pid: i64,
    /// RPC address, `host:port`
    pub addr: String,
    /// RPC protocol
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Protocol version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// Port of the plugin's own front-end dev server
    #[serde(default)]
    pub vite_port: Option<u16>,
    /// Plugin ID; must match the file name when present
    #[serde(default, rename = "pluginID")]
    pub plugin_id: Option<String>,
    /// Plugin version
    #[serde(default)]
    pub version: Option<String>,
    /// Start time of the plugin process
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

fn default_protocol() -> String {
    "grpc".to_string()
}

fn default_protocol_version() -> u32 {
    1
}

impl Handshake {
    /// Check the fields and turn them into a connection for `file_id`
    pub fn into_connection(self, file_id: &str) -> Result<ExternalConnection> {
        if let Some(declared) = &self.plugin_id {
            if declared != file_id {
                return Err(Error::validation(format!(
                    "handshake for '{file_id}' declares plugin ID '{declared}'"
                )));
            }
        }
        let pid = u32::try_from(self.pid)
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| Error::validation(format!("invalid pid {} in handshake", self.pid)))?;
        let addr: SocketAddr = self.addr.parse().map_err(|e| {
            Error::validation(format!("invalid addr '{}' in handshake: {e}", self.addr))
        })?;

        Ok(ExternalConnection {
            plugin_id: file_id.to_string(),
            addr,
            pid,
            protocol: self.protocol,
            protocol_version: self.protocol_version,
            vite_port: self.vite_port,
            version: self.version,
            started_at: self.started_at,
        })
    }
}

/// Plugin ID a handshake path belongs to
pub fn handshake_plugin_id(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

/// Watches the handshake directory for externally-run plugins
pub struct ExternalWatcher {
    dir: PathBuf,
    listener: Arc<dyn ExternalPluginListener>,
    events: Arc<dyn EventSink>,
    controller: Arc<dyn ProcessController>,
    liveness_interval: Duration,
    connected: DashMap<String, ExternalConnection>,
}

impl std::fmt::Debug for ExternalWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalWatcher")
            .field("dir", &self.dir)
            .field("liveness_interval", &self.liveness_interval)
            .field("connected", &self.connected.len())
            .finish_non_exhaustive()
    }
}

impl ExternalWatcher {
    /// Watcher over handshake directory `dir`
    pub fn new(
        dir: impl Into<PathBuf>,
        listener: Arc<dyn ExternalPluginListener>,
        events: Arc<dyn EventSink>,
        controller: Arc<dyn ProcessController>,
        liveness_interval: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            listener,
            events,
            controller,
            liveness_interval,
            connected: DashMap::new(),
        }
    }

    /// Handshake directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Live connections, sorted by plugin ID
    pub fn connections(&self) -> Vec<ExternalConnection> {
        let mut all: Vec<_> = self.connected.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        all
    }

    /// Whether `plugin_id` is connected
    pub fn is_connected(&self, plugin_id: &str) -> bool {
        self.connected.contains_key(plugin_id)
    }

    /// Process every handshake file currently in the directory.
    ///
    /// Returns the number of files that produced a live connection. Bad
    /// files are logged and discarded without stopping the scan.
    pub async fn scan(&self) -> Result<usize> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if handshake_plugin_id(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut live = 0;
        for path in paths {
            match self.handle_path(&path).await {
                Ok(()) => live += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Discarded handshake file"),
            }
        }
        Ok(live)
    }

    /// React to a created, changed or removed handshake file
    pub async fn handle_path(&self, path: &Path) -> Result<()> {
        let Some(plugin_id) = handshake_plugin_id(path) else {
            return Ok(());
        };

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.handle_removed(&plugin_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        let connection = match self.validate(&plugin_id, &content) {
            Ok(connection) => connection,
            Err(e) => {
                let _ = tokio::fs::remove_file(path).await;
                self.handle_removed(&plugin_id).await?;
                return Err(e);
            }
        };

        if let Some(current) = self.connected.get(&plugin_id) {
            if current.pid == connection.pid && current.addr == connection.addr {
                debug!(plugin = %plugin_id, "Handshake unchanged");
                return Ok(());
            }
        }

        info!(
            plugin = %plugin_id,
            addr = %connection.addr,
            pid = connection.pid,
            "External plugin connected"
        );
        self.connected.insert(plugin_id.clone(), connection.clone());
        if let Err(e) = self.listener.on_connected(connection.clone()).await {
            self.connected.remove(&plugin_id);
            return Err(e);
        }
        self.emit(&connection, true);
        Ok(())
    }

    /// Disconnect `plugin_id` if it is connected
    pub async fn handle_removed(&self, plugin_id: &str) -> Result<()> {
        let Some((_, connection)) = self.connected.remove(plugin_id) else {
            return Ok(());
        };
        info!(plugin = %plugin_id, pid = connection.pid, "External plugin disconnected");
        self.emit(&connection, false);
        self.listener.on_disconnected(plugin_id).await
    }

    /// Disconnect every plugin whose process has died and delete its file
    pub async fn check_liveness(&self) -> Vec<String> {
        let dead: Vec<String> = self
            .connected
            .iter()
            .filter(|entry| !self.controller.is_alive(entry.value().pid))
            .map(|entry| entry.key().clone())
            .collect();

        for plugin_id in &dead {
            warn!(plugin = %plugin_id, "External plugin process is gone");
            let _ = tokio::fs::remove_file(self.dir.join(format!("{plugin_id}.json"))).await;
            if let Err(e) = self.handle_removed(plugin_id).await {
                warn!(plugin = %plugin_id, error = %e, "Disconnect failed");
            }
        }
        dead
    }

    /// Scan once, then follow the directory and check liveness until `token` is
    /// cancelled
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Result<JoinHandle<()>> {
        std::fs::create_dir_all(&self.dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::internal(format!("failed to create file watcher: {e}")))?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::internal(format!("failed to watch {}: {e}", self.dir.display()))
            })?;

        info!(dir = %self.dir.display(), "External plugin watcher started");
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            this.run(watcher, rx, token).await;
        }))
    }

    async fn run(
        &self,
        _watcher: RecommendedWatcher,
        mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
        token: CancellationToken,
    ) {
        if let Err(e) = self.scan().await {
            warn!(dir = %self.dir.display(), error = %e, "Handshake scan failed");
        }

        let mut liveness = tokio::time::interval(self.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = liveness.tick() => {
                    self.check_liveness().await;
                }
                res = rx.recv() => match res {
                    Some(Ok(event)) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        for path in event.paths {
                            if let Err(e) = self.handle_path(&path).await {
                                warn!(path = %path.display(), error = %e, "Discarded handshake file");
                            }
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "Handshake watcher error"),
                    None => break,
                },
            }
        }
        debug!(dir = %self.dir.display(), "External plugin watcher stopped");
    }

    fn validate(&self, plugin_id: &str, content: &str) -> Result<ExternalConnection> {
        let handshake: Handshake = serde_json::from_str(content)
            .map_err(|e| Error::validation(format!("malformed handshake for '{plugin_id}': {e}")))?;
        let connection = handshake.into_connection(plugin_id)?;
        if !self.controller.is_alive(connection.pid) {
            return Err(Error::not_found(format!(
                "process {} for external plugin '{plugin_id}' is not running",
                connection.pid
            )));
        }
        Ok(connection)
    }

    fn emit(&self, connection: &ExternalConnection, connected: bool) {
        self.events.emit(
            DEVSERVER_EXTERNAL,
            json!({
                "pluginId": connection.plugin_id,
                "connected": connected,
                "addr": connection.addr.to_string(),
                "pid": connection.pid,
                "vitePort": connection.vite_port,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tentacle_core::{default_controller, ErrorKind, RecordingSink};

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        reject: bool,
    }

    #[async_trait]
    impl ExternalPluginListener for Recorder {
        async fn on_connected(&self, connection: ExternalConnection) -> Result<()> {
            self.calls
                .lock()
                .push(format!("connect {} {}", connection.plugin_id, connection.addr));
            if self.reject {
                return Err(Error::conflict("busy"));
            }
            Ok(())
        }

        async fn on_disconnected(&self, plugin_id: &str) -> Result<()> {
            self.calls.lock().push(format!("disconnect {plugin_id}"));
            Ok(())
        }
    }

    struct Fixture {
        tmp: TempDir,
        recorder: Arc<Recorder>,
        events: Arc<RecordingSink>,
        watcher: ExternalWatcher,
    }

    fn fixture(recorder: Recorder) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(recorder);
        let events = Arc::new(RecordingSink::new());
        let watcher = ExternalWatcher::new(
            tmp.path(),
            Arc::clone(&recorder) as Arc<dyn ExternalPluginListener>,
            Arc::clone(&events) as Arc<dyn EventSink>,
            default_controller(),
            Duration::from_secs(2),
        );
        Fixture {
            tmp,
            recorder,
            events,
            watcher,
        }
    }

    fn write(dir: &Path, id: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.join(format!("{id}.json"));
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    fn own_pid() -> i64 {
        i64::from(std::process::id())
    }

    #[test]
    fn test_handshake_defaults() {
        let handshake: Handshake =
            serde_json::from_str(r#"{"pid": 42, "addr": "127.0.0.1:9000"}"#).unwrap();
        let conn = handshake.into_connection("kube").unwrap();
        assert_eq!(conn.protocol, "grpc");
        assert_eq!(conn.protocol_version, 1);
        assert_eq!(conn.vite_port, None);
        assert_eq!(conn.plugin_id, "kube");
    }

    #[test]
    fn test_handshake_rejects_bad_fields() {
        let bad = |raw: &str| {
            serde_json::from_str::<Handshake>(raw)
                .map_err(Error::from)
                .and_then(|h| h.into_connection("kube"))
                .is_err()
        };
        assert!(bad(r#"{"addr": "127.0.0.1:9000"}"#));
        assert!(bad(r#"{"pid": 0, "addr": "127.0.0.1:9000"}"#));
        assert!(bad(r#"{"pid": -3, "addr": "127.0.0.1:9000"}"#));
        assert!(bad(r#"{"pid": 42, "addr": "localhost"}"#));
        assert!(bad(r#"{"pid": 42, "addr": "127.0.0.1:9000", "pluginID": "other"}"#));
    }

    #[test]
    fn test_handshake_plugin_id() {
        assert_eq!(handshake_plugin_id(Path::new("/d/kube.json")), Some("kube".to_string()));
        assert_eq!(handshake_plugin_id(Path::new("/d/kube.json.tmp")), None);
        assert_eq!(handshake_plugin_id(Path::new("/d/.kube.json")), None);
    }

    #[tokio::test]
    async fn test_connect_update_disconnect() {
        let fx = fixture(Recorder::default());
        let path = write(
            fx.tmp.path(),
            "kube",
            json!({"pid": own_pid(), "addr": "127.0.0.1:9000", "vitePort": 5174}),
        );

        fx.watcher.handle_path(&path).await.unwrap();
        assert!(fx.watcher.is_connected("kube"));
        assert_eq!(fx.watcher.connections()[0].vite_port, Some(5174));

        // Same pid and addr: no reconnect
        fx.watcher.handle_path(&path).await.unwrap();
        assert_eq!(fx.recorder.calls.lock().len(), 1);

        write(fx.tmp.path(), "kube", json!({"pid": own_pid(), "addr": "127.0.0.1:9001"}));
        fx.watcher.handle_path(&path).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        fx.watcher.handle_path(&path).await.unwrap();
        assert!(!fx.watcher.is_connected("kube"));

        assert_eq!(
            *fx.recorder.calls.lock(),
            vec![
                "connect kube 127.0.0.1:9000",
                "connect kube 127.0.0.1:9001",
                "disconnect kube",
            ]
        );
        let external = fx.events.events_with_key(DEVSERVER_EXTERNAL);
        assert_eq!(external.len(), 3);
        assert_eq!(external[2].payload["connected"], false);
    }

    #[tokio::test]
    async fn test_dead_or_malformed_files_are_deleted() {
        let fx = fixture(Recorder::default());
        let dead = write(
            fx.tmp.path(),
            "gone",
            json!({"pid": 2_000_000_000i64, "addr": "127.0.0.1:9000"}),
        );
        let malformed = fx.tmp.path().join("broken.json");
        std::fs::write(&malformed, "{not json").unwrap();
        write(fx.tmp.path(), "live", json!({"pid": own_pid(), "addr": "127.0.0.1:9000"}));

        assert_eq!(fx.watcher.scan().await.unwrap(), 1);
        assert!(!dead.exists());
        assert!(!malformed.exists());
        assert!(fx.watcher.is_connected("live"));

        let err = fx.watcher.handle_path(&write(
            fx.tmp.path(),
            "gone",
            json!({"pid": 2_000_000_000i64, "addr": "127.0.0.1:9000"}),
        ))
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_liveness_check_disconnects_dead_process() {
        let fx = fixture(Recorder::default());
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = i64::from(child.id().unwrap());
        let path = write(fx.tmp.path(), "kube", json!({"pid": pid, "addr": "127.0.0.1:9000"}));

        fx.watcher.handle_path(&path).await.unwrap();
        assert!(fx.watcher.check_liveness().await.is_empty());

        child.kill().await.unwrap();
        assert_eq!(fx.watcher.check_liveness().await, vec!["kube".to_string()]);
        assert!(!fx.watcher.is_connected("kube"));
        assert!(!path.exists());
        assert_eq!(fx.recorder.calls.lock().last().unwrap(), "disconnect kube");
    }

    #[tokio::test]
    async fn test_listener_failure_leaves_disconnected() {
        let fx = fixture(Recorder {
            reject: true,
            ..Recorder::default()
        });
        let path = write(fx.tmp.path(), "kube", json!({"pid": own_pid(), "addr": "127.0.0.1:9000"}));

        let err = fx.watcher.handle_path(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!fx.watcher.is_connected("kube"));
    }
}
