//! Plugin loading
//!
//! [`Loader::load_plugin`] turns a plugin ID into a running,
//! capability-negotiated [`PluginRecord`]. The record table is only locked
//! to check and update entries; the slow part (spawning the backend and
//! negotiating capabilities) runs unlocked against a `Starting` placeholder
//! whose generation number detects a concurrent unload.

use crate::controller::ControllerRegistry;
use crate::health::RecoveryTarget;
use crate::pid_tracker::PidTracker;
use crate::record::{ExistingState, PluginInfo, PluginRecord, RecordTable};
use crate::state_store::StateStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tentacle_backend::{AttachSpec, Backend, BackendFactory, BackendSpec};
use tentacle_core::events::PLUGIN_LIFECYCLE;
use tentacle_core::metadata::{
    has_ui_assets, read_metadata, validate_executable, UI_ASSETS_DIR,
};
use tentacle_core::{
    Capability, Error, EventSink, PluginMetadata, PluginPhase, PluginStateMachine,
    PluginStateRecord, Result, TransitionObserver,
};
use tracing::{debug, info, warn};

/// Called with the plugin ID and reason when a running backend exits on
/// its own
pub type CrashHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Options for [`Loader::load_plugin`]
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Persisted fields to restore; defaults to the stale record's, if any
    pub existing: Option<ExistingState>,
}

impl LoadOptions {
    /// Load restoring `existing`
    pub fn with_existing(existing: ExistingState) -> Self {
        Self {
            existing: Some(existing),
        }
    }
}

#[derive(Debug)]
enum Launch {
    Installed,
    Attach(AttachSpec, PluginMetadata),
}

struct Started {
    metadata: PluginMetadata,
    backend: Option<Arc<dyn Backend>>,
    capabilities: Vec<Capability>,
}

/// Loads, unloads and reloads plugins into the record table
pub struct Loader {
    plugins_dir: PathBuf,
    table: RecordTable,
    factory: Arc<dyn BackendFactory>,
    controllers: Arc<ControllerRegistry>,
    pids: Arc<PidTracker>,
    store: Arc<StateStore>,
    observers: RwLock<Vec<TransitionObserver>>,
    crash_handler: RwLock<Option<CrashHandler>>,
    generation: AtomicU64,
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("plugins_dir", &self.plugins_dir)
            .field("plugins", &self.table.read().len())
            .field("factory", &self.factory)
            .field("observers", &self.observers.read().len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl Loader {
    /// Create a loader; every state machine it creates reports transitions
    /// to `events`
    pub fn new(
        plugins_dir: impl Into<PathBuf>,
        table: RecordTable,
        factory: Arc<dyn BackendFactory>,
        controllers: Arc<ControllerRegistry>,
        pids: Arc<PidTracker>,
        store: Arc<StateStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let lifecycle: TransitionObserver = Arc::new(move |plugin_id, transition| {
            events.emit(
                PLUGIN_LIFECYCLE,
                json!({
                    "pluginId": plugin_id,
                    "from": transition.from,
                    "to": transition.to,
                    "reason": transition.reason,
                    "timestamp": transition.timestamp,
                }),
            );
        });

        Self {
            plugins_dir: plugins_dir.into(),
            table,
            factory,
            controllers,
            pids,
            store,
            observers: RwLock::new(vec![lifecycle]),
            crash_handler: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Directory plugins are installed into
    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Install directory of `plugin_id`
    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(plugin_id)
    }

    /// Shared record table
    pub fn table(&self) -> &RecordTable {
        &self.table
    }

    /// Attach `observer` to every state machine created from now on
    pub fn add_observer(&self, observer: TransitionObserver) {
        self.observers.write().push(observer);
    }

    /// Report backends that exit without being stopped to `handler`
    pub fn on_crash(&self, handler: CrashHandler) {
        *self.crash_handler.write() = Some(handler);
    }

    /// Forward an unrequested exit of `backend` to the crash handler while
    /// the load at `generation` is still the running one
    fn watch_exit(&self, plugin_id: &str, generation: u64, backend: &Arc<dyn Backend>) {
        let Some(handler) = self.crash_handler.read().clone() else {
            return;
        };
        let Some(mut signal) = backend.exit_signal() else {
            return;
        };
        let table = self.table.clone();
        let plugin_id = plugin_id.to_string();
        tokio::spawn(async move {
            let reason = match signal.wait_for(Option::is_some).await {
                Ok(reason) => reason.clone().unwrap_or_default(),
                Err(_) => return,
            };
            let current = table.read().get(&plugin_id).map_or(false, |record| {
                record.generation == generation && record.phase() == PluginPhase::Running
            });
            if current {
                warn!(plugin = %plugin_id, reason = %reason, "Plugin backend exited");
                handler(&plugin_id, &reason);
            } else {
                debug!(plugin = %plugin_id, reason = %reason, "Ignoring exit of a replaced backend");
            }
        });
    }

    fn new_state_machine(&self, plugin_id: &str, initial: PluginPhase) -> Arc<PluginStateMachine> {
        let machine = Arc::new(PluginStateMachine::new(plugin_id, initial));
        for observer in self.observers.read().iter() {
            machine.add_observer(observer.clone());
        }
        machine
    }

    /// Insert an idle record (nothing running) for `state`.
    ///
    /// `machine` is reused when given, so history survives; its phase is
    /// forced to `state.phase`.
    pub fn register_record(
        &self,
        state: &PluginStateRecord,
        machine: Option<Arc<PluginStateMachine>>,
    ) -> Arc<PluginStateMachine> {
        let machine = match machine {
            Some(machine) => {
                if machine.phase() != state.phase {
                    machine.force_phase(state.phase, "restored");
                }
                machine
            }
            None => self.new_state_machine(&state.id, state.phase),
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.table.write().insert(
            state.id.clone(),
            PluginRecord {
                metadata: state.metadata.clone(),
                state: ExistingState::from(state),
                state_machine: machine.clone(),
                backend: None,
                capabilities: Vec::new(),
                generation,
            },
        );
        machine
    }

    /// Snapshot of one plugin
    pub fn get(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.table.read().get(plugin_id).map(PluginRecord::info)
    }

    /// Snapshot of every plugin, sorted by ID
    pub fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self.table.read().values().map(PluginRecord::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Phase tracker of `plugin_id`
    pub fn state_machine(&self, plugin_id: &str) -> Option<Arc<PluginStateMachine>> {
        self.table
            .read()
            .get(plugin_id)
            .map(|record| record.state_machine.clone())
    }

    /// Persisted projection of one record
    pub fn state_record(&self, plugin_id: &str) -> Option<PluginStateRecord> {
        self.table
            .read()
            .get(plugin_id)
            .map(PluginRecord::to_state_record)
    }

    /// Drop an idle record without touching any backend
    pub fn forget(&self, plugin_id: &str) -> bool {
        self.table.write().remove(plugin_id).is_some()
    }

    /// Persisted projection of every record
    pub fn state_records(&self) -> Vec<PluginStateRecord> {
        self.table
            .read()
            .values()
            .map(PluginRecord::to_state_record)
            .collect()
    }

    /// Merge the table into the state file
    pub fn persist(&self) -> Result<()> {
        self.store.save_merged(self.state_records(), &self.plugins_dir)
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist plugin state");
        }
    }

    /// Apply `update` to the persisted fields of `plugin_id` and persist
    pub fn update_state<F>(&self, plugin_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut ExistingState),
    {
        {
            let mut table = self.table.write();
            let record = table
                .get_mut(plugin_id)
                .ok_or_else(|| Error::not_found(format!("plugin '{plugin_id}'")))?;
            update(&mut record.state);
        }
        self.persist()
    }

    /// Remember `message` as the plugin's latest error
    pub fn record_error(&self, plugin_id: &str, message: &str) {
        let updated = self.update_state(plugin_id, |state| {
            state.last_error = Some(message.to_string());
            state.error_count = state.error_count.saturating_add(1);
        });
        if let Err(e) = updated {
            debug!(plugin = %plugin_id, error = %e, "Could not record plugin error");
        }
    }

    /// Load `plugin_id` from its install directory.
    ///
    /// Returns the existing info unchanged if the plugin is already
    /// running and fails with a conflict if it is mid-start. On failure the
    /// record stays in the table in `Failed` with the error attached.
    pub async fn load_plugin(&self, plugin_id: &str, opts: LoadOptions) -> Result<PluginInfo> {
        self.load_with(plugin_id, opts, None, Launch::Installed).await
    }

    /// Attach to an externally started plugin and load it like any other
    pub async fn attach_plugin(
        &self,
        spec: AttachSpec,
        metadata: PluginMetadata,
        opts: LoadOptions,
    ) -> Result<PluginInfo> {
        let plugin_id = spec.plugin_id.clone();
        self.load_with(&plugin_id, opts, None, Launch::Attach(spec, metadata))
            .await
    }

    async fn load_with(
        &self,
        plugin_id: &str,
        opts: LoadOptions,
        carried: Option<Arc<PluginStateMachine>>,
        launch: Launch,
    ) -> Result<PluginInfo> {
        let dir = self.plugin_dir(plugin_id);
        let (generation, machine, stale_backend, existing) = {
            let mut table = self.table.write();
            if let Some(record) = table.get(plugin_id) {
                match record.phase() {
                    PluginPhase::Running => {
                        debug!(plugin = %plugin_id, "Plugin already running");
                        return Ok(record.info());
                    }
                    PluginPhase::Starting => {
                        return Err(Error::conflict(format!(
                            "plugin '{plugin_id}' is already starting"
                        )));
                    }
                    _ => {}
                }
            }
            if matches!(launch, Launch::Installed) && !dir.is_dir() {
                return Err(Error::not_found(format!(
                    "plugin directory {} does not exist",
                    dir.display()
                )));
            }

            let stale = table.remove(plugin_id);
            let machine = carried
                .or_else(|| stale.as_ref().map(|r| r.state_machine.clone()))
                .unwrap_or_else(|| self.new_state_machine(plugin_id, PluginPhase::Installed));
            let existing = opts
                .existing
                .or_else(|| stale.as_ref().map(|r| r.state.clone()))
                .unwrap_or_default();
            let metadata = match (&launch, &stale) {
                (Launch::Attach(_, metadata), _) => metadata.clone(),
                (_, Some(record)) => record.metadata.clone(),
                (_, None) => placeholder_metadata(plugin_id),
            };

            if machine.transition_to(PluginPhase::Starting, "loading").is_err() {
                machine.force_phase(PluginPhase::Starting, "loading");
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            table.insert(
                plugin_id.to_string(),
                PluginRecord {
                    metadata,
                    state: existing.clone(),
                    state_machine: machine.clone(),
                    backend: None,
                    capabilities: Vec::new(),
                    generation,
                },
            );
            (generation, machine, stale.and_then(|r| r.backend), existing)
        };

        if let Some(backend) = stale_backend {
            self.shutdown_backend(plugin_id, &backend).await;
        }

        let outcome = match launch {
            Launch::Installed => self.start_installed(plugin_id, &dir, &existing).await,
            Launch::Attach(spec, metadata) => self.start_attached(&spec, metadata).await,
        };

        match outcome {
            Ok(started) => {
                let committed = {
                    let mut table = self.table.write();
                    match table.get_mut(plugin_id) {
                        Some(record) if record.generation == generation => {
                            record.metadata = started.metadata.clone();
                            record.backend = started.backend.clone();
                            record.capabilities = started.capabilities.clone();
                            machine.force_phase(PluginPhase::Running, "loaded");
                            Some(record.info())
                        }
                        _ => None,
                    }
                };
                match committed {
                    Some(info) => {
                        if let Some(backend) = &started.backend {
                            self.watch_exit(plugin_id, generation, backend);
                        }
                        info!(
                            plugin = %plugin_id,
                            capabilities = ?info.capabilities,
                            dev_mode = info.dev_mode,
                            "Plugin loaded"
                        );
                        self.persist_logged();
                        Ok(info)
                    }
                    None => {
                        warn!(plugin = %plugin_id, "Plugin was unloaded while starting");
                        self.teardown(plugin_id, &started).await;
                        Err(Error::conflict(format!(
                            "load of plugin '{plugin_id}' was superseded"
                        )))
                    }
                }
            }
            Err(error) => {
                let recorded = {
                    let mut table = self.table.write();
                    match table.get_mut(plugin_id) {
                        Some(record) if record.generation == generation => {
                            if let Ok(metadata) = read_metadata(&dir) {
                                record.metadata = metadata;
                            }
                            record.state.last_error = Some(error.to_string());
                            record.state.error_count = record.state.error_count.saturating_add(1);
                            if machine
                                .transition_to(PluginPhase::Failed, error.to_string())
                                .is_err()
                            {
                                machine.force_phase(PluginPhase::Failed, error.to_string());
                            }
                            true
                        }
                        _ => false,
                    }
                };
                if recorded {
                    self.persist_logged();
                }
                warn!(plugin = %plugin_id, error = %error, "Plugin failed to load");
                Err(error)
            }
        }
    }

    async fn start_installed(
        &self,
        plugin_id: &str,
        dir: &Path,
        existing: &ExistingState,
    ) -> Result<Started> {
        let metadata = read_metadata(dir)?;
        if metadata.id != plugin_id {
            return Err(Error::validation(format!(
                "metadata id '{}' does not match plugin '{plugin_id}'",
                metadata.id
            )));
        }

        let executable = if metadata.has_backend() {
            Some(validate_executable(dir)?)
        } else {
            None
        };
        if !existing.dev_mode && metadata.has_ui() && !has_ui_assets(dir) {
            return Err(Error::validation(format!(
                "plugin '{plugin_id}' declares a UI but {} is empty",
                dir.join(UI_ASSETS_DIR).display()
            )));
        }

        let Some(executable) = executable else {
            return Ok(Started {
                metadata,
                backend: None,
                capabilities: Vec::new(),
            });
        };

        let spec = BackendSpec::new(plugin_id, executable, dir);
        let backend = self.factory.create(&spec).await?;
        if let Some(pid) = backend.pid() {
            self.pids.record(plugin_id, pid);
        }

        match self.negotiate(&metadata, &backend).await {
            Ok(capabilities) => Ok(Started {
                metadata,
                backend: Some(backend),
                capabilities,
            }),
            Err(e) => {
                self.shutdown_backend(plugin_id, &backend).await;
                Err(e)
            }
        }
    }

    async fn start_attached(&self, spec: &AttachSpec, metadata: PluginMetadata) -> Result<Started> {
        let backend = self.factory.attach(spec).await?;
        match self.negotiate(&metadata, &backend).await {
            Ok(capabilities) => Ok(Started {
                metadata,
                backend: Some(backend),
                capabilities,
            }),
            Err(e) => {
                self.shutdown_backend(&spec.plugin_id, &backend).await;
                Err(e)
            }
        }
    }

    /// Initialize controllers, detect capabilities and hand each confirmed
    /// capability's client to its controllers
    async fn negotiate(
        &self,
        metadata: &PluginMetadata,
        backend: &Arc<dyn Backend>,
    ) -> Result<Vec<Capability>> {
        let plugin_id = metadata.id.as_str();
        let declared = metadata.backend_capabilities();

        for capability in &declared {
            for controller in self.controllers.for_capability(*capability) {
                controller.on_plugin_init(metadata, *capability).await?;
            }
        }

        let candidates = match backend.as_detector() {
            Some(detector) => match detector.detect_capabilities().await {
                Ok(detected) if declared.is_empty() => detected,
                Ok(detected) => {
                    for capability in declared.iter().filter(|c| !detected.contains(c)) {
                        warn!(
                            plugin = %plugin_id,
                            capability = %capability,
                            "Declared capability is not implemented"
                        );
                    }
                    declared
                        .iter()
                        .copied()
                        .filter(|c| detected.contains(c))
                        .collect()
                }
                Err(e) => {
                    warn!(plugin = %plugin_id, error = %e, "Capability detection failed; trusting metadata");
                    declared.clone()
                }
            },
            None => declared.clone(),
        };

        let mut negotiated = Vec::with_capacity(candidates.len());
        for capability in candidates {
            let client = match backend.dispense(capability) {
                Ok(client) => client,
                Err(e) => {
                    warn!(
                        plugin = %plugin_id,
                        capability = %capability,
                        error = %e,
                        "Failed to dispense capability"
                    );
                    continue;
                }
            };
            for controller in self.controllers.for_capability(capability) {
                if let Err(e) = controller.on_plugin_start(plugin_id, client.clone()).await {
                    warn!(
                        plugin = %plugin_id,
                        capability = %capability,
                        error = %e,
                        "Controller rejected plugin capability"
                    );
                }
            }
            negotiated.push(capability);
        }
        Ok(negotiated)
    }

    async fn stop_controllers(&self, plugin_id: &str, capabilities: &[Capability]) {
        for capability in capabilities {
            for controller in self.controllers.for_capability(*capability) {
                if let Err(e) = controller.on_plugin_stop(plugin_id, *capability).await {
                    warn!(plugin = %plugin_id, capability = %capability, error = %e, "Controller stop failed");
                }
            }
        }
    }

    async fn shutdown_backend(&self, plugin_id: &str, backend: &Arc<dyn Backend>) {
        if let Err(e) = backend.stop().await {
            warn!(plugin = %plugin_id, error = %e, "Graceful stop failed, killing backend");
            if let Err(e) = backend.kill().await {
                warn!(plugin = %plugin_id, error = %e, "Failed to kill backend");
            }
        }
        self.pids.remove(plugin_id);
    }

    async fn teardown(&self, plugin_id: &str, started: &Started) {
        self.stop_controllers(plugin_id, &started.capabilities).await;
        if let Some(backend) = &started.backend {
            self.shutdown_backend(plugin_id, backend).await;
        }
    }

    /// Stop and remove `plugin_id`; a no-op if it is not loaded
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        let Some(record) = self.table.write().remove(plugin_id) else {
            return Ok(());
        };
        let machine = record.state_machine.clone();
        let was_running = record.phase() == PluginPhase::Running;
        if let Err(e) = machine.transition_to(PluginPhase::Stopping, "unloading") {
            debug!(plugin = %plugin_id, error = %e, "Unloading without passing through Stopping");
        }

        if was_running {
            self.stop_controllers(plugin_id, &record.capabilities).await;
        }
        if let Some(backend) = &record.backend {
            self.shutdown_backend(plugin_id, backend).await;
        }

        if machine.transition_to(PluginPhase::Stopped, "unloaded").is_err() {
            debug!(plugin = %plugin_id, phase = %machine.phase(), "Unloaded plugin left in its phase");
        }
        info!(plugin = %plugin_id, "Plugin unloaded");
        Ok(())
    }

    /// Unload and load again, restoring persisted fields and phase history
    pub async fn reload_plugin(&self, plugin_id: &str) -> Result<PluginInfo> {
        let (existing, machine, launch) = {
            let table = self.table.read();
            let record = table
                .get(plugin_id)
                .ok_or_else(|| Error::not_found(format!("plugin '{plugin_id}' is not loaded")))?;
            if record.phase() == PluginPhase::Starting {
                return Err(Error::conflict(format!(
                    "plugin '{plugin_id}' is already starting"
                )));
            }
            (record.state.clone(), record.state_machine.clone(), Launch::Installed)
        };

        info!(plugin = %plugin_id, "Reloading plugin");
        self.unload_plugin(plugin_id).await?;
        self.load_with(plugin_id, LoadOptions::with_existing(existing), Some(machine), launch)
            .await
    }

    /// Unload every plugin
    pub async fn unload_all(&self) {
        let ids: Vec<String> = self.table.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload_plugin(&id).await {
                warn!(plugin = %id, error = %e, "Failed to unload plugin");
            }
        }
    }
}

fn placeholder_metadata(plugin_id: &str) -> PluginMetadata {
    PluginMetadata {
        id: plugin_id.to_string(),
        name: plugin_id.to_string(),
        version: String::new(),
        description: String::new(),
        author: None,
        capabilities: Vec::new(),
    }
}

#[async_trait]
impl RecoveryTarget for Loader {
    fn running_backends(&self) -> Vec<(String, Arc<dyn Backend>)> {
        self.table
            .read()
            .values()
            .filter(|record| record.phase().is_active())
            .filter_map(|record| {
                record
                    .backend
                    .clone()
                    .map(|backend| (record.metadata.id.clone(), backend))
            })
            .collect()
    }

    fn state_machine(&self, plugin_id: &str) -> Option<Arc<PluginStateMachine>> {
        Loader::state_machine(self, plugin_id)
    }

    async fn reload(&self, plugin_id: &str) -> Result<()> {
        self.reload_plugin(plugin_id).await.map(|_| ())
    }

    fn record_error(&self, plugin_id: &str, message: &str) {
        Loader::record_error(self, plugin_id, message);
    }
}
