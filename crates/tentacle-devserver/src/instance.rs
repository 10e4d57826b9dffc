//! Per-plugin dev server
//!
//! A [`DevServerInstance`] owns the two dev processes of one plugin: the
//! source watcher that rebuilds and reloads the backend, and the Vite
//! server for its UI. Either can fail and be restarted without touching
//! the other. Status changes, log lines and diagnostics go to a
//! [`DevEventHandler`].

use crate::build::BackendBuilder;
use crate::log_buffer::{LogEntry, LogRing, LogSource, LogStream};
use crate::vite::{ui_source_dir, FrontendOptions, FrontendServer, FrontendStatus, LogCallback};
use crate::watcher::SourceWatcher;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tentacle_core::events::{DEVSERVER_BUILD_ERRORS, DEVSERVER_LOG, DEVSERVER_STATUS};
use tentacle_core::{
    BuildError, DevPlugin, Error, EventSink, ProcessController, ReloadCallback, Result,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backend build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Nothing built yet, or no backend
    Idle,
    /// Build in progress
    Building,
    /// Last build succeeded and the plugin was reloaded
    Ready,
    /// Last build or reload failed
    Error,
}

/// Dev-mode status of one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevServerState {
    /// Plugin ID
    pub plugin_id: String,
    /// Source tree
    pub dev_path: PathBuf,
    /// Backend build status
    pub backend: BackendStatus,
    /// Front-end dev server status
    pub frontend: FrontendStatus,
    /// Port of the front-end dev server
    pub vite_port: Option<u16>,
    /// Diagnostics of the last failed build
    pub build_errors: Vec<BuildError>,
    /// When the backend was last built successfully
    pub last_build_at: Option<DateTime<Utc>>,
    /// Last failure message
    pub last_error: Option<String>,
}

/// Receives dev server activity
pub trait DevEventHandler: Send + Sync + fmt::Debug {
    /// Status of a dev server changed
    fn on_status(&self, state: &DevServerState);

    /// A dev process printed a line
    fn on_log(&self, plugin_id: &str, entry: &LogEntry);

    /// A build finished; `errors` is empty on success
    fn on_build_errors(&self, plugin_id: &str, errors: &[BuildError]);
}

/// Forwards dev server activity to an [`EventSink`]
#[derive(Debug, Clone)]
pub struct EventSinkHandler {
    events: Arc<dyn EventSink>,
}

impl EventSinkHandler {
    /// Handler emitting into `events`
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }
}

impl DevEventHandler for EventSinkHandler {
    fn on_status(&self, state: &DevServerState) {
        match serde_json::to_value(state) {
            Ok(payload) => self.events.emit(DEVSERVER_STATUS, payload),
            Err(e) => warn!(plugin = %state.plugin_id, error = %e, "Failed to encode dev status"),
        }
    }

    fn on_log(&self, plugin_id: &str, entry: &LogEntry) {
        self.events.emit(
            DEVSERVER_LOG,
            json!({ "pluginId": plugin_id, "entry": entry }),
        );
    }

    fn on_build_errors(&self, plugin_id: &str, errors: &[BuildError]) {
        self.events.emit(
            DEVSERVER_BUILD_ERRORS,
            json!({ "pluginId": plugin_id, "errors": errors }),
        );
    }
}

/// Settings shared by every instance
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Quiet window before a rebuild
    pub debounce: Duration,
    /// Lines kept in the log ring
    pub log_capacity: usize,
    /// Front-end tool paths and timings
    pub frontend: FrontendOptions,
}

/// Dev processes of one plugin
pub struct DevServerInstance {
    plugin: DevPlugin,
    builder: Arc<dyn BackendBuilder>,
    reload: ReloadCallback,
    handler: Arc<dyn DevEventHandler>,
    controller: Arc<dyn ProcessController>,
    options: InstanceOptions,
    state: Mutex<DevServerState>,
    logs: Arc<Mutex<LogRing>>,
    frontend: tokio::sync::Mutex<Option<Arc<FrontendServer>>>,
    build_lock: tokio::sync::Mutex<()>,
    token: CancellationToken,
}

impl fmt::Debug for DevServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevServerInstance")
            .field("plugin", &self.plugin.id())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl DevServerInstance {
    /// New, not yet started instance. `token` is cancelled on stop;
    /// pass a child of the host's root token.
    pub fn new(
        plugin: DevPlugin,
        builder: Arc<dyn BackendBuilder>,
        reload: ReloadCallback,
        handler: Arc<dyn DevEventHandler>,
        controller: Arc<dyn ProcessController>,
        options: InstanceOptions,
        token: CancellationToken,
    ) -> Arc<Self> {
        let state = DevServerState {
            plugin_id: plugin.id().to_string(),
            dev_path: plugin.dev_path.clone(),
            backend: BackendStatus::Idle,
            frontend: FrontendStatus::Disabled,
            vite_port: None,
            build_errors: Vec::new(),
            last_build_at: None,
            last_error: None,
        };
        let logs = Arc::new(Mutex::new(LogRing::new(options.log_capacity)));
        Arc::new(Self {
            plugin,
            builder,
            reload,
            handler,
            controller,
            options,
            state: Mutex::new(state),
            logs,
            frontend: tokio::sync::Mutex::new(None),
            build_lock: tokio::sync::Mutex::new(()),
            token,
        })
    }

    /// Plugin ID
    pub fn plugin_id(&self) -> &str {
        self.plugin.id()
    }

    /// Plugin being served
    pub fn plugin(&self) -> &DevPlugin {
        &self.plugin
    }

    /// Snapshot of the current status
    pub fn state(&self) -> DevServerState {
        self.state.lock().clone()
    }

    /// Every buffered log line, oldest first
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().entries()
    }

    /// The newest `n` log lines
    pub fn last_logs(&self, n: usize) -> Vec<LogEntry> {
        self.logs.lock().last(n)
    }

    /// Whether [`DevServerInstance::stop`] has run
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record a build failure that happened before the instance existed
    pub fn seed_build_failure(&self, message: &str, diagnostics: &[BuildError]) {
        self.update(|state| {
            state.backend = BackendStatus::Error;
            state.build_errors = diagnostics.to_vec();
            state.last_error = Some(message.to_string());
        });
    }

    /// Start watching sources and, when `vite_port` is given, the
    /// front-end dev server.
    ///
    /// A front-end failure is recorded in the state but does not fail the
    /// start; the backend watcher keeps running.
    pub async fn start(self: &Arc<Self>, vite_port: Option<u16>) -> Result<()> {
        if self.plugin.metadata.has_backend() {
            self.start_watcher()?;
        }

        if let Some(port) = vite_port {
            self.update(|state| state.vite_port = Some(port));
            if let Err(e) = self.start_frontend(port).await {
                warn!(plugin = %self.plugin_id(), error = %e, "Front-end dev server failed to start");
                self.update(|state| {
                    state.frontend = FrontendStatus::Error;
                    state.last_error = Some(e.to_string());
                });
            }
        }

        info!(plugin = %self.plugin_id(), ?vite_port, "Dev server started");
        Ok(())
    }

    /// Build the backend, install it and reload the plugin.
    ///
    /// Rebuilds never overlap; a call made during a build waits for it.
    pub async fn rebuild(&self) -> Result<()> {
        let _guard = self.build_lock.lock().await;
        self.update(|state| state.backend = BackendStatus::Building);
        self.system_log(format!("Building {}", self.plugin.dev_path.display()));

        let report = match self.builder.build(&self.plugin).await {
            Ok(report) => report,
            Err(e) => {
                let diagnostics = e.diagnostics().to_vec();
                for diagnostic in &diagnostics {
                    self.record_log(LogEntry::new(
                        LogSource::Build,
                        LogStream::Stderr,
                        diagnostic.to_string(),
                    ));
                }
                self.handler.on_build_errors(self.plugin_id(), &diagnostics);
                self.update(|state| {
                    state.backend = BackendStatus::Error;
                    state.build_errors = diagnostics;
                    state.last_error = Some(e.to_string());
                });
                return Err(e);
            }
        };

        for line in report.output {
            self.record_log(LogEntry::new(LogSource::Build, LogStream::Stdout, line));
        }
        self.handler.on_build_errors(self.plugin_id(), &[]);
        self.system_log(format!("Build finished in {:?}, reloading", report.duration));

        let reloaded = (self.reload)(self.plugin_id().to_string()).await;
        self.update(|state| {
            state.build_errors.clear();
            state.last_build_at = Some(Utc::now());
            match &reloaded {
                Ok(()) => {
                    state.backend = BackendStatus::Ready;
                    state.last_error = None;
                }
                Err(e) => {
                    state.backend = BackendStatus::Error;
                    state.last_error = Some(e.to_string());
                }
            }
        });
        reloaded
    }

    /// Stop and start the front-end dev server
    pub async fn restart_frontend(self: &Arc<Self>) -> Result<()> {
        let port = self
            .state
            .lock()
            .vite_port
            .ok_or_else(|| Error::validation(format!(
                "plugin '{}' has no front-end dev server",
                self.plugin_id()
            )))?;
        if let Some(frontend) = self.frontend.lock().await.take() {
            frontend.stop().await?;
        }
        self.start_frontend(port).await
    }

    /// Stop both dev processes
    pub async fn stop(&self) {
        self.token.cancel();
        if let Some(frontend) = self.frontend.lock().await.take() {
            if let Err(e) = frontend.stop().await {
                warn!(plugin = %self.plugin_id(), error = %e, "Failed to stop front-end dev server");
            }
        }
        self.update(|state| {
            if state.frontend != FrontendStatus::Disabled {
                state.frontend = FrontendStatus::Stopped;
            }
            if state.backend == BackendStatus::Building {
                state.backend = BackendStatus::Idle;
            }
        });
        info!(plugin = %self.plugin_id(), "Dev server stopped");
    }

    fn start_watcher(self: &Arc<Self>) -> Result<()> {
        let token = self.token.child_token();
        let mut batches =
            SourceWatcher::new(&self.plugin.dev_path, self.options.debounce).start(token)?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(changed) = batches.recv().await {
                this.system_log(format!("{} file(s) changed", changed.len()));
                if let Err(e) = this.rebuild().await {
                    warn!(plugin = %this.plugin_id(), error = %e, "Rebuild failed, waiting for the next change");
                }
            }
            debug!(plugin = %this.plugin_id(), "Rebuild loop finished");
        });
        Ok(())
    }

    async fn start_frontend(self: &Arc<Self>, port: u16) -> Result<()> {
        let ui_dir = ui_source_dir(&self.plugin.dev_path).ok_or_else(|| {
            Error::not_found(format!(
                "no ui/package.json under {}",
                self.plugin.dev_path.display()
            ))
        })?;

        let on_log: LogCallback = {
            let logs = Arc::clone(&self.logs);
            let handler = Arc::clone(&self.handler);
            let plugin_id = self.plugin_id().to_string();
            Arc::new(move |entry: LogEntry| {
                handler.on_log(&plugin_id, &entry);
                logs.lock().push(entry);
            })
        };
        let server = Arc::new(FrontendServer::new(
            self.plugin_id(),
            ui_dir,
            port,
            self.options.frontend.clone(),
            Arc::clone(&self.controller),
            on_log,
        ));

        self.follow_frontend(&server);
        *self.frontend.lock().await = Some(Arc::clone(&server));
        server.start().await
    }

    /// Mirror front-end status changes into the instance state
    fn follow_frontend(self: &Arc<Self>, server: &FrontendServer) {
        let mut rx = server.subscribe();
        let token = self.token.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *rx.borrow_and_update();
                        this.update(|state| {
                            state.frontend = status;
                            if status == FrontendStatus::Error {
                                state.last_error = Some("front-end dev server exited".to_string());
                            }
                        });
                    }
                }
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut DevServerState)) {
        let snapshot = {
            let mut state = self.state.lock();
            let before = state.clone();
            f(&mut *state);
            (*state != before).then(|| state.clone())
        };
        if let Some(state) = snapshot {
            self.handler.on_status(&state);
        }
    }

    fn system_log(&self, line: String) {
        self.record_log(LogEntry::new(LogSource::System, LogStream::Stdout, line));
    }

    fn record_log(&self, entry: LogEntry) {
        debug!(plugin = %self.plugin_id(), source = %entry.source, line = %entry.line, "dev");
        self.handler.on_log(self.plugin_id(), &entry);
        self.logs.lock().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildReport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tentacle_core::{
        default_controller, Capability, PluginMetadata, RecordingSink, ReloadFuture,
    };

    #[derive(Debug, Default)]
    struct ScriptedBuilder {
        fail: AtomicBool,
        builds: AtomicUsize,
    }

    #[async_trait]
    impl BackendBuilder for ScriptedBuilder {
        async fn build(&self, _plugin: &DevPlugin) -> Result<BuildReport> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::build(
                    "1 compile error",
                    vec![BuildError {
                        file: "main.go".to_string(),
                        line: 3,
                        column: 1,
                        message: "undefined: x".to_string(),
                    }],
                ));
            }
            Ok(BuildReport {
                duration: Duration::from_millis(5),
                output: vec!["ok".to_string()],
            })
        }
    }

    struct Fixture {
        _tmp: TempDir,
        builder: Arc<ScriptedBuilder>,
        reloads: Arc<AtomicUsize>,
        events: Arc<RecordingSink>,
        instance: Arc<DevServerInstance>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let plugin = DevPlugin {
            metadata: PluginMetadata {
                id: "kube".to_string(),
                name: "Kube".to_string(),
                version: "0.1.0".to_string(),
                description: String::new(),
                author: None,
                capabilities: vec![Capability::Resource],
            },
            dev_path: tmp.path().join("src"),
            install_dir: tmp.path().join("plugins/kube"),
        };
        let builder = Arc::new(ScriptedBuilder::default());
        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reloads);
        let reload: ReloadCallback = Arc::new(move |_id: String| -> ReloadFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let events = Arc::new(RecordingSink::new());
        let instance = DevServerInstance::new(
            plugin,
            Arc::clone(&builder) as Arc<dyn BackendBuilder>,
            reload,
            Arc::new(EventSinkHandler::new(Arc::clone(&events) as Arc<dyn EventSink>)),
            default_controller(),
            InstanceOptions {
                debounce: Duration::from_millis(50),
                log_capacity: 3,
                frontend: FrontendOptions {
                    node_path: PathBuf::from("node"),
                    package_manager: PathBuf::from("npm"),
                    stop_grace: Duration::from_secs(1),
                },
            },
            CancellationToken::new(),
        );
        Fixture {
            _tmp: tmp,
            builder,
            reloads,
            events,
            instance,
        }
    }

    #[tokio::test]
    async fn test_failed_build_then_fix() {
        let fx = fixture();
        fx.builder.fail.store(true, Ordering::SeqCst);

        let err = fx.instance.rebuild().await.unwrap_err();
        assert_eq!(err.diagnostics().len(), 1);
        let state = fx.instance.state();
        assert_eq!(state.backend, BackendStatus::Error);
        assert_eq!(state.build_errors[0].file, "main.go");
        assert_eq!(fx.reloads.load(Ordering::SeqCst), 0);

        fx.builder.fail.store(false, Ordering::SeqCst);
        fx.instance.rebuild().await.unwrap();
        let state = fx.instance.state();
        assert_eq!(state.backend, BackendStatus::Ready);
        assert!(state.build_errors.is_empty());
        assert!(state.last_build_at.is_some());
        assert_eq!(state.last_error, None);
        assert_eq!(fx.reloads.load(Ordering::SeqCst), 1);

        let reported = fx.events.events_with_key(DEVSERVER_BUILD_ERRORS);
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].payload["errors"][0]["line"], 3);
        assert_eq!(reported[1].payload["errors"].as_array().unwrap().len(), 0);
        assert!(!fx.events.events_with_key(DEVSERVER_STATUS).is_empty());
    }

    #[tokio::test]
    async fn test_log_ring_is_bounded() {
        let fx = fixture();
        fx.instance.rebuild().await.unwrap();
        fx.instance.rebuild().await.unwrap();

        assert_eq!(fx.instance.logs().len(), 3);
        assert_eq!(fx.instance.last_logs(1)[0].source, LogSource::System);
        assert!(fx.events.events_with_key(DEVSERVER_LOG).len() > 3);
    }

    #[tokio::test]
    async fn test_seeded_failure_and_stop() {
        let fx = fixture();
        fx.instance.seed_build_failure("initial build failed", &[]);
        assert_eq!(fx.instance.state().backend, BackendStatus::Error);

        fx.instance.stop().await;
        assert!(fx.instance.is_stopped());
        assert_eq!(fx.instance.state().frontend, FrontendStatus::Disabled);
        assert!(fx.instance.restart_frontend().await.is_err());
    }

    #[tokio::test]
    async fn test_watcher_triggers_rebuild() {
        let fx = fixture();
        let dev_path = fx.instance.plugin().dev_path.clone();
        std::fs::create_dir_all(&dev_path).unwrap();

        fx.instance.start(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dev_path.join("main.go"), "package main\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while fx.reloads.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(fx.builder.builds.load(Ordering::SeqCst) >= 1);
        assert!(fx.reloads.load(Ordering::SeqCst) >= 1);
        fx.instance.stop().await;
    }
}
