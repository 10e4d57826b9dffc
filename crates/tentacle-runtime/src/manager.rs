//! Top-level plugin host facade
//!
//! The [`Manager`] owns the record table, the loader, the health checker
//! and the persisted files. It runs the startup sequence (stale process
//! cleanup, reconciliation, loading), installs and removes plugins, and
//! performs the clean shutdown that leaves an empty PID file behind.

use crate::controller::{CapabilityController, ClientRegistry, ControllerRegistry};
use crate::health::{HealthChecker, RecoveryOutcome};
use crate::loader::{LoadOptions, Loader};
use crate::pid_tracker::PidTracker;
use crate::reconciler::{reconcile, reconcile_from_filesystem, ReconcileReport};
use crate::record::{ExistingState, PluginInfo};
use crate::state_store::StateStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tentacle_backend::{AttachSpec, BackendFactory, ProcessBackendFactory, ProcessBackendOptions};
use tentacle_config::HostConfig;
use tentacle_core::events::{PLUGIN_INSTALL_PROGRESS, PLUGIN_UNINSTALLED};
use tentacle_core::fsutil::copy_dir_all;
use tentacle_core::metadata::{read_metadata, write_metadata};
use tentacle_core::{
    default_controller, Capability, DevModeHook, DevPlugin, Error, EventSink, ExternalConnection,
    ExternalPluginListener, PluginMetadata, PluginPhase, PluginStateRecord, ProcessController,
    ReloadCallback, ReloadFuture, Result, TracingSink,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of [`Manager::initialize`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// Orphaned processes killed from the previous run
    pub stale_killed: usize,
    /// Plugins loaded to `Running`
    pub loaded: Vec<String>,
    /// Plugins that failed to build or load, with the error
    pub failed: Vec<(String, String)>,
    /// Plugins left idle (disabled or missing their executable)
    pub skipped: Vec<String>,
    /// Directories adopted without persisted state
    pub orphans: Vec<String>,
    /// Persisted entries dropped because their directory is gone
    pub ghosts: Vec<String>,
    /// Directories that could not be read
    pub unreadable: Vec<(String, String)>,
    /// Whether the state file was unreadable and rebuilt from disk
    pub rebuilt_from_filesystem: bool,
}

/// The plugin host
pub struct Manager {
    config: HostConfig,
    loader: Arc<Loader>,
    health: Arc<HealthChecker>,
    pids: Arc<PidTracker>,
    store: Arc<StateStore>,
    clients: Arc<ClientRegistry>,
    events: Arc<dyn EventSink>,
    dev: Option<Arc<dyn DevModeHook>>,
    root: CancellationToken,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("plugins_dir", &self.loader.plugins_dir())
            .field("loader", &self.loader)
            .field("health", &self.health)
            .field("dev_mode", &self.dev.is_some())
            .field("shut_down", &self.root.is_cancelled())
            .finish()
    }
}

impl Manager {
    /// Create a builder
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Host configuration
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The loader
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// The health checker
    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    /// Dispensed capability clients by plugin
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Directory plugins are installed into
    pub fn plugins_dir(&self) -> &Path {
        self.loader.plugins_dir()
    }

    /// Token cancelled when the host shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Snapshot of every plugin, sorted by ID
    pub fn list(&self) -> Vec<PluginInfo> {
        self.loader.list()
    }

    /// Snapshot of one plugin
    pub fn get(&self, plugin_id: &str) -> Result<PluginInfo> {
        self.loader
            .get(plugin_id)
            .ok_or_else(|| Error::not_found(format!("plugin '{plugin_id}' is not installed")))
    }

    /// Bring the host up.
    ///
    /// Kills processes left over from an unclean shutdown, reconciles
    /// persisted state with the plugins directory, loads every enabled
    /// plugin and starts health checking and dev servers. A plugin that
    /// fails is reported in the [`InitReport`] and never aborts startup.
    pub async fn initialize(&self) -> Result<InitReport> {
        let plugins_dir = self.loader.plugins_dir().to_path_buf();
        std::fs::create_dir_all(&plugins_dir)?;

        let mut report = InitReport {
            stale_killed: self.pids.cleanup_stale(),
            ..InitReport::default()
        };

        let reconciled: ReconcileReport = match self.store.load() {
            Ok(Some(persisted)) => reconcile(&plugins_dir, &persisted),
            Ok(None) => {
                info!(path = %self.store.path().display(), "No plugin state file, scanning plugins directory");
                reconcile(&plugins_dir, &[])
            }
            Err(e) => {
                warn!(error = %e, "Plugin state file is unreadable");
                report.rebuilt_from_filesystem = true;
                reconcile_from_filesystem(&plugins_dir)
            }
        };
        report.orphans = reconciled.orphans;
        report.ghosts = reconciled.ghosts;
        report.unreadable = reconciled
            .errors
            .into_iter()
            .map(|e| (e.plugin_id, e.error.to_string()))
            .collect();

        for record in &reconciled.records {
            self.loader.register_record(record, None);
        }
        if let Err(e) = self.loader.persist() {
            warn!(error = %e, "Failed to persist reconciled plugin state");
        }

        for record in reconciled.records {
            let plugin_id = record.id.clone();
            match self.start_reconciled(record).await {
                Ok(true) => report.loaded.push(plugin_id),
                Ok(false) => report.skipped.push(plugin_id),
                Err(e) => report.failed.push((plugin_id, e.to_string())),
            }
        }

        if self.config.health.enabled {
            self.health.start();
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            orphans = report.orphans.len(),
            ghosts = report.ghosts.len(),
            "Plugin host initialized"
        );
        Ok(report)
    }

    /// Bring one reconciled record up; `Ok(false)` if it stays idle
    async fn start_reconciled(&self, record: PluginStateRecord) -> Result<bool> {
        let plugin_id = record.id.clone();
        let dev_plugin = self.dev_plugin(&record);

        match record.phase {
            PluginPhase::Installed => {}
            PluginPhase::Building => {
                let (Some(dev), Some(plugin)) = (self.dev.clone(), dev_plugin.clone()) else {
                    debug!(plugin = %plugin_id, "Dev plugin needs a build but dev mode is unavailable");
                    return Ok(false);
                };
                if let Err(e) = self.initial_build(&dev, &plugin).await {
                    self.start_dev_server(plugin).await;
                    return Err(e);
                }
            }
            phase => {
                debug!(plugin = %plugin_id, phase = %phase, "Leaving plugin idle");
                return Ok(false);
            }
        }

        let result = self
            .loader
            .load_plugin(&plugin_id, LoadOptions::with_existing(ExistingState::from(&record)))
            .await;
        if let (Some(plugin), true) = (dev_plugin, self.config.dev.auto_start) {
            self.start_dev_server(plugin).await;
        }
        result.map(|_| true)
    }

    fn dev_plugin(&self, record: &PluginStateRecord) -> Option<DevPlugin> {
        if !record.dev_mode {
            return None;
        }
        let dev_path = record.dev_path.clone()?;
        Some(DevPlugin {
            metadata: record.metadata.clone(),
            dev_path,
            install_dir: self.loader.plugin_dir(&record.id),
        })
    }

    /// Build a dev plugin and move it to `Validating`, or to `BuildFailed`
    async fn initial_build(&self, dev: &Arc<dyn DevModeHook>, plugin: &DevPlugin) -> Result<()> {
        let plugin_id = plugin.id();
        let machine = self
            .loader
            .state_machine(plugin_id)
            .ok_or_else(|| Error::not_found(format!("plugin '{plugin_id}'")))?;
        if machine.phase() != PluginPhase::Building {
            machine.transition_to(PluginPhase::Building, "initial build")?;
        }

        info!(plugin = %plugin_id, dev_path = %plugin.dev_path.display(), "Running initial dev build");
        match dev.initial_build(plugin).await {
            Ok(()) => {
                machine.transition_to(PluginPhase::Validating, "build succeeded")?;
                Ok(())
            }
            Err(e) => {
                let _ = machine.transition_to(PluginPhase::BuildFailed, e.to_string());
                self.loader.record_error(plugin_id, &e.to_string());
                Err(e.with_context(
                    format!("Initial build of '{plugin_id}' failed"),
                    Some("Fix the reported errors; the plugin rebuilds when its sources change"),
                ))
            }
        }
    }

    async fn start_dev_server(&self, plugin: DevPlugin) {
        let Some(dev) = &self.dev else {
            return;
        };
        let plugin_id = plugin.id().to_string();
        if let Err(e) = dev.start(plugin, self.reload_callback()).await {
            warn!(plugin = %plugin_id, error = %e, "Failed to start dev server");
        }
    }

    /// Callback handed to the dev subsystem to reload a plugin after a rebuild
    pub fn reload_callback(&self) -> ReloadCallback {
        let loader = self.loader.clone();
        Arc::new(move |plugin_id: String| -> ReloadFuture {
            let loader = loader.clone();
            Box::pin(async move { loader.reload_plugin(&plugin_id).await.map(|_| ()) })
        })
    }

    fn progress(&self, plugin_id: &str, stage: &str, progress: f32) {
        self.events.emit(
            PLUGIN_INSTALL_PROGRESS,
            json!({ "pluginId": plugin_id, "stage": stage, "progress": progress }),
        );
    }

    fn ensure_not_installed(&self, plugin_id: &str) -> Result<()> {
        if self.loader.get(plugin_id).is_some() || self.loader.plugin_dir(plugin_id).exists() {
            return Err(Error::conflict(format!("plugin '{plugin_id}' is already installed"))
                .with_context("Plugin already installed", Some("Uninstall it first")));
        }
        Ok(())
    }

    /// Install the plugin package in `source` and load it
    pub async fn install_from_dir(&self, source: &Path) -> Result<PluginInfo> {
        let metadata = read_metadata(source)
            .and_then(|m| m.validate().map(|()| m))
            .map_err(|e| {
                e.with_context(
                    "Invalid plugin package",
                    Some("The directory must contain a valid plugin metadata file"),
                )
            })?;
        let plugin_id = metadata.id.clone();
        self.ensure_not_installed(&plugin_id)?;

        let machine = self
            .loader
            .register_record(&PluginStateRecord::new(metadata, PluginPhase::Uninstalled), None);
        machine.transition_to(PluginPhase::Installing, "install requested")?;
        self.progress(&plugin_id, "copying", 0.1);

        let destination = self.loader.plugin_dir(&plugin_id);
        let copied = {
            let source = source.to_path_buf();
            let destination = destination.clone();
            tokio::task::spawn_blocking(move || copy_dir_all(&source, &destination))
                .await
                .map_err(|e| Error::internal(format!("install task failed: {e}")))
                .and_then(|result| result)
        };
        if let Err(e) = copied {
            let _ = machine.transition_to(PluginPhase::Failed, e.to_string());
            self.loader.forget(&plugin_id);
            if let Err(cleanup) = std::fs::remove_dir_all(&destination) {
                debug!(plugin = %plugin_id, error = %cleanup, "No partial install to remove");
            }
            self.progress(&plugin_id, "failed", 1.0);
            return Err(e.with_context(
                format!("Failed to install '{plugin_id}'"),
                Some("Check that the plugins directory is writable"),
            ));
        }

        machine.transition_to(PluginPhase::Installed, "package copied")?;
        self.progress(&plugin_id, "loading", 0.6);
        info!(plugin = %plugin_id, dir = %destination.display(), "Plugin installed");

        let loaded = self
            .loader
            .load_plugin(&plugin_id, LoadOptions::default())
            .await;
        self.progress(&plugin_id, if loaded.is_ok() { "done" } else { "failed" }, 1.0);
        loaded.map_err(|e| {
            e.with_context(
                format!("Plugin '{plugin_id}' was installed but failed to start"),
                None,
            )
        })
    }

    /// Install a plugin from developer sources at `dev_path`.
    ///
    /// Backend plugins are built once before loading. The dev server keeps
    /// running even if that build or the load fails, so saving a fix
    /// retries automatically.
    pub async fn install_dev(&self, dev_path: &Path) -> Result<PluginInfo> {
        let dev = self.dev.clone().ok_or_else(|| {
            Error::validation("dev mode is not available in this host")
                .with_context("Cannot install from source", None)
        })?;
        let dev_path = dev_path.canonicalize().map_err(|e| {
            Error::not_found(format!("dev path {}: {e}", dev_path.display()))
        })?;
        let metadata = read_metadata(&dev_path)
            .and_then(|m| m.validate().map(|()| m))
            .map_err(|e| e.with_context("Invalid plugin sources", None))?;
        let plugin_id = metadata.id.clone();
        self.ensure_not_installed(&plugin_id)?;

        let install_dir = self.loader.plugin_dir(&plugin_id);
        write_metadata(&install_dir, &metadata)?;

        let mut state = PluginStateRecord::new(metadata.clone(), PluginPhase::Installed);
        state.dev_mode = true;
        state.dev_path = Some(dev_path.clone());
        let machine = self.loader.register_record(&state, None);
        let plugin = DevPlugin {
            metadata: metadata.clone(),
            dev_path: dev_path.clone(),
            install_dir,
        };

        if metadata.has_backend() {
            if let Err(e) = self.initial_build(&dev, &plugin).await {
                self.start_dev_server(plugin).await;
                return Err(e);
            }
        } else {
            machine.transition_to(PluginPhase::Validating, "front-end only")?;
        }

        let loaded = self
            .loader
            .load_plugin(&plugin_id, LoadOptions::with_existing(ExistingState::from(&state)))
            .await;
        self.start_dev_server(plugin).await;
        loaded
    }

    /// Stop and remove a plugin, including its files
    pub async fn uninstall(&self, plugin_id: &str) -> Result<()> {
        let info = self.get(plugin_id)?;
        let machine = self
            .loader
            .state_machine(plugin_id)
            .ok_or_else(|| Error::not_found(format!("plugin '{plugin_id}'")))?;

        self.health.cancel_recovery(plugin_id);
        if info.dev_mode {
            if let Some(dev) = &self.dev {
                if let Err(e) = dev.stop(plugin_id).await {
                    warn!(plugin = %plugin_id, error = %e, "Failed to stop dev server");
                }
            }
        }
        self.loader.unload_plugin(plugin_id).await?;

        if machine
            .transition_to(PluginPhase::Uninstalling, "uninstall requested")
            .is_err()
        {
            machine.force_phase(PluginPhase::Uninstalling, "uninstall requested");
        }
        let dir = self.loader.plugin_dir(plugin_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let _ = machine.transition_to(PluginPhase::Failed, e.to_string());
                return Err(Error::from(e).with_context(
                    format!("Failed to remove '{plugin_id}'"),
                    Some("Remove the plugin directory manually"),
                ));
            }
        }
        machine.transition_to(PluginPhase::Uninstalled, "files removed")?;

        if let Err(e) = self.loader.persist() {
            warn!(error = %e, "Failed to persist plugin state");
        }
        self.events
            .emit(PLUGIN_UNINSTALLED, json!({ "pluginId": plugin_id }));
        info!(plugin = %plugin_id, "Plugin uninstalled");
        Ok(())
    }

    /// Mark a plugin enabled and load it
    pub async fn enable(&self, plugin_id: &str) -> Result<PluginInfo> {
        self.loader
            .update_state(plugin_id, |state| state.enabled = true)?;
        let info = self.get(plugin_id)?;
        if info.phase.is_active() {
            return Ok(info);
        }
        self.loader
            .load_plugin(plugin_id, LoadOptions::default())
            .await
    }

    /// Stop a plugin and keep it stopped across restarts
    pub async fn disable(&self, plugin_id: &str) -> Result<PluginInfo> {
        let mut state = self
            .loader
            .state_record(plugin_id)
            .ok_or_else(|| Error::not_found(format!("plugin '{plugin_id}' is not installed")))?;
        let machine = self.loader.state_machine(plugin_id);

        self.health.cancel_recovery(plugin_id);
        if state.dev_mode {
            if let Some(dev) = &self.dev {
                if let Err(e) = dev.stop(plugin_id).await {
                    warn!(plugin = %plugin_id, error = %e, "Failed to stop dev server");
                }
            }
        }
        self.loader.unload_plugin(plugin_id).await?;

        state.enabled = false;
        state.phase = PluginPhase::Stopped;
        self.loader.register_record(&state, machine);
        self.loader.persist()?;
        info!(plugin = %plugin_id, "Plugin disabled");
        self.get(plugin_id)
    }

    /// Unload and load a plugin again
    pub async fn reload(&self, plugin_id: &str) -> Result<PluginInfo> {
        self.loader.reload_plugin(plugin_id).await
    }

    /// Report a crash noticed outside the health checker.
    ///
    /// The error is recorded here; the phase change and restarts are left
    /// entirely to [`HealthChecker::handle_crash_with_backoff`].
    pub fn handle_plugin_crash(&self, plugin_id: &str, reason: &str) -> JoinHandle<RecoveryOutcome> {
        error!(plugin = %plugin_id, reason = %reason, "Plugin crashed");
        self.health.handle_plugin_crash(plugin_id, reason)
    }

    /// Attach to a plugin the developer runs outside the host.
    ///
    /// A host-managed instance of the same plugin is unloaded first; its
    /// persisted fields carry over.
    pub async fn attach_external(
        &self,
        plugin_id: &str,
        addr: SocketAddr,
        pid: u32,
        version: Option<String>,
    ) -> Result<PluginInfo> {
        let metadata = match read_metadata(&self.loader.plugin_dir(plugin_id)) {
            Ok(metadata) => metadata,
            Err(_) => PluginMetadata {
                id: plugin_id.to_string(),
                name: plugin_id.to_string(),
                version: version.unwrap_or_default(),
                description: String::new(),
                author: None,
                capabilities: Vec::new(),
            },
        };

        let mut existing = self
            .loader
            .state_record(plugin_id)
            .map(|record| ExistingState::from(&record))
            .unwrap_or_default();
        existing.dev_mode = true;

        self.health.cancel_recovery(plugin_id);
        self.loader.unload_plugin(plugin_id).await?;
        info!(plugin = %plugin_id, addr = %addr, pid, "Attaching external plugin");
        self.loader
            .attach_plugin(
                AttachSpec {
                    plugin_id: plugin_id.to_string(),
                    addr,
                    pid,
                },
                metadata,
                LoadOptions::with_existing(existing),
            )
            .await
    }

    /// Drop an external plugin; an installed copy is loaded back in its place
    pub async fn detach_external(&self, plugin_id: &str) -> Result<()> {
        let existing = self
            .loader
            .state_record(plugin_id)
            .map(|record| ExistingState::from(&record));
        self.health.cancel_recovery(plugin_id);
        self.loader.unload_plugin(plugin_id).await?;
        info!(plugin = %plugin_id, "External plugin detached");

        if !self.loader.plugin_dir(plugin_id).is_dir() {
            return self.loader.persist();
        }
        let opts = existing.map(LoadOptions::with_existing).unwrap_or_default();
        if let Err(e) = self.loader.load_plugin(plugin_id, opts).await {
            warn!(plugin = %plugin_id, error = %e, "Installed copy failed to load after detach");
        }
        Ok(())
    }

    /// Stop everything and leave clean files behind
    pub async fn shutdown(&self) {
        info!("Shutting down plugin host");
        self.root.cancel();
        self.health.stop();
        if let Some(dev) = &self.dev {
            dev.stop_all().await;
        }
        if let Err(e) = self.loader.persist() {
            warn!(error = %e, "Failed to persist plugin state");
        }
        self.loader.unload_all().await;
        if let Err(e) = self.pids.save() {
            warn!(error = %e, "Failed to write PID file");
        }
        info!("Plugin host stopped");
    }
}

#[async_trait]
impl ExternalPluginListener for Manager {
    async fn on_connected(&self, connection: ExternalConnection) -> Result<()> {
        self.attach_external(
            &connection.plugin_id,
            connection.addr,
            connection.pid,
            connection.version,
        )
        .await
        .map(|_| ())
    }

    async fn on_disconnected(&self, plugin_id: &str) -> Result<()> {
        self.detach_external(plugin_id).await
    }
}

/// Builder for [`Manager`]
pub struct ManagerBuilder {
    config: Option<HostConfig>,
    factory: Option<Arc<dyn BackendFactory>>,
    events: Option<Arc<dyn EventSink>>,
    dev: Option<Arc<dyn DevModeHook>>,
    process_controller: Option<Arc<dyn ProcessController>>,
    controllers: Vec<(Capability, Arc<dyn CapabilityController>)>,
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("config", &self.config.is_some())
            .field("factory", &self.factory)
            .field("dev", &self.dev.is_some())
            .field("controllers", &self.controllers.len())
            .finish()
    }
}

impl ManagerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: None,
            factory: None,
            events: None,
            dev: None,
            process_controller: None,
            controllers: Vec::new(),
        }
    }

    /// Set configuration
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom backend factory instead of spawning processes
    pub fn backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Publish events to `sink` (default: tracing)
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Enable dev mode through `hook`
    pub fn dev_mode(mut self, hook: Arc<dyn DevModeHook>) -> Self {
        self.dev = Some(hook);
        self
    }

    /// Use a specific process controller for PID cleanup and backends
    pub fn process_controller(mut self, controller: Arc<dyn ProcessController>) -> Self {
        self.process_controller = Some(controller);
        self
    }

    /// Route `capability` to an additional controller
    pub fn controller(mut self, capability: Capability, controller: Arc<dyn CapabilityController>) -> Self {
        self.controllers.push((capability, controller));
        self
    }

    /// Build the manager
    pub fn build(self) -> Result<Manager> {
        let config = self
            .config
            .ok_or_else(|| Error::config("config is required"))?;
        tentacle_config::validate_config(&config)?;

        let process_controller = self.process_controller.unwrap_or_else(default_controller);
        let factory = self.factory.unwrap_or_else(|| {
            let options = ProcessBackendOptions {
                startup_timeout: config.backend.startup_timeout,
                stop_grace: config.backend.stop_grace,
                rpc_timeout: config.health.rpc_timeout,
                magic_cookie: config.backend.magic_cookie.clone(),
            };
            Arc::new(ProcessBackendFactory::with_controller(
                options,
                process_controller.clone(),
            ))
        });
        let events = self.events.unwrap_or_else(|| Arc::new(TracingSink));

        let clients = Arc::new(ClientRegistry::new());
        let mut controllers = ControllerRegistry::with_client_registry(clients.clone());
        for (capability, controller) in self.controllers {
            controllers.register(capability, controller);
        }

        let plugins_dir: PathBuf = config.paths.plugins_dir();
        let pids = Arc::new(PidTracker::new(config.paths.pid_file(), process_controller));
        let store = Arc::new(StateStore::new(config.paths.state_file()));
        let loader = Arc::new(Loader::new(
            plugins_dir,
            Arc::new(RwLock::new(HashMap::new())),
            factory,
            Arc::new(controllers),
            pids.clone(),
            store.clone(),
            events.clone(),
        ));

        let root = CancellationToken::new();
        let health = Arc::new(HealthChecker::new(
            loader.clone(),
            config.recovery.policy(),
            config.health.interval,
            events.clone(),
            root.clone(),
        ));

        // Backends that die between health polls are recovered right away
        let checker = Arc::downgrade(&health);
        loader.on_crash(Arc::new(move |plugin_id: &str, reason: &str| {
            if let Some(health) = checker.upgrade() {
                error!(plugin = %plugin_id, reason = %reason, "Plugin crashed");
                health.handle_plugin_crash(plugin_id, reason);
            }
        }));

        Ok(Manager {
            config,
            loader,
            health,
            pids,
            store,
            clients,
            events,
            dev: self.dev,
            root,
        })
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tentacle_backend::InProcessBackendFactory;
    use tentacle_config::HostConfigBuilder;
    use tentacle_core::ErrorKind;

    #[test]
    fn test_builder_requires_config() {
        let err = Manager::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_initialize_empty_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = HostConfigBuilder::new()
            .data_dir(tmp.path())
            .health_enabled(false)
            .build()
            .unwrap();
        let manager = Manager::builder()
            .config(config)
            .backend_factory(Arc::new(InProcessBackendFactory::new()))
            .build()
            .unwrap();

        let report = manager.initialize().await.unwrap();
        assert_eq!(report, InitReport::default());
        assert!(manager.plugins_dir().is_dir());
        assert!(manager.list().is_empty());

        let err = manager.get("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        manager.shutdown().await;
        assert!(manager.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_install_dev_requires_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = Manager::builder()
            .config(HostConfig::with_data_dir(tmp.path()))
            .backend_factory(Arc::new(InProcessBackendFactory::new()))
            .build()
            .unwrap();
        let err = manager.install_dev(tmp.path()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
