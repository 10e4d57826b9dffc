//! Dev server manager
//!
//! Keeps one [`DevServerInstance`] per dev-mode plugin and plugs into the
//! plugin manager as its [`DevModeHook`].

use crate::build::{BackendBuilder, GoBuilder};
use crate::instance::{
    DevEventHandler, DevServerInstance, DevServerState, EventSinkHandler, InstanceOptions,
};
use crate::log_buffer::LogEntry;
use crate::ports::PortAllocator;
use crate::vite::{ui_source_dir, FrontendOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tentacle_config::DevConfig;
use tentacle_core::{
    default_controller, BuildError, DevModeHook, DevPlugin, Error, EventSink, ProcessController,
    ReloadCallback, Result,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs dev servers for dev-mode plugins
pub struct DevServerManager {
    config: DevConfig,
    builder: Arc<dyn BackendBuilder>,
    handler: Arc<dyn DevEventHandler>,
    controller: Arc<dyn ProcessController>,
    ports: PortAllocator,
    instances: DashMap<String, Arc<DevServerInstance>>,
    failed_builds: DashMap<String, (String, Vec<BuildError>)>,
    root: CancellationToken,
}

impl std::fmt::Debug for DevServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevServerManager")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl DevServerManager {
    /// Manager building with the configured Go toolchain and reporting to
    /// `events`
    pub fn new(config: DevConfig, events: Arc<dyn EventSink>) -> Self {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        Self {
            builder: Arc::new(GoBuilder::new(&config.go_path)),
            handler: Arc::new(EventSinkHandler::new(events)),
            controller: default_controller(),
            ports,
            instances: DashMap::new(),
            failed_builds: DashMap::new(),
            root: CancellationToken::new(),
            config,
        }
    }

    /// Use a different backend builder
    pub fn with_builder(mut self, builder: Arc<dyn BackendBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Use a different event handler
    pub fn with_handler(mut self, handler: Arc<dyn DevEventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Use a different process controller
    pub fn with_process_controller(mut self, controller: Arc<dyn ProcessController>) -> Self {
        self.controller = controller;
        self
    }

    /// Parent every instance's token on `root`
    pub fn with_shutdown_token(mut self, root: CancellationToken) -> Self {
        self.root = root;
        self
    }

    /// Running instance for `plugin_id`
    pub fn instance(&self, plugin_id: &str) -> Option<Arc<DevServerInstance>> {
        self.instances.get(plugin_id).map(|i| Arc::clone(i.value()))
    }

    /// Status of `plugin_id`'s dev server
    pub fn state(&self, plugin_id: &str) -> Option<DevServerState> {
        self.instances.get(plugin_id).map(|i| i.state())
    }

    /// Status of every dev server, sorted by plugin ID
    pub fn states(&self) -> Vec<DevServerState> {
        let mut states: Vec<_> = self.instances.iter().map(|i| i.state()).collect();
        states.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        states
    }

    /// Buffered log lines of `plugin_id`; the newest `last` when given
    pub fn logs(&self, plugin_id: &str, last: Option<usize>) -> Result<Vec<LogEntry>> {
        let instance = self.require(plugin_id)?;
        Ok(match last {
            Some(n) => instance.last_logs(n),
            None => instance.logs(),
        })
    }

    /// Rebuild and reload `plugin_id` now
    pub async fn rebuild(&self, plugin_id: &str) -> Result<()> {
        self.require(plugin_id)?.rebuild().await
    }

    /// Restart only the front-end dev server of `plugin_id`
    pub async fn restart_frontend(&self, plugin_id: &str) -> Result<()> {
        self.require(plugin_id)?.restart_frontend().await
    }

    fn require(&self, plugin_id: &str) -> Result<Arc<DevServerInstance>> {
        self.instance(plugin_id)
            .ok_or_else(|| Error::not_found(format!("no dev server for plugin '{plugin_id}'")))
    }

    fn options(&self) -> InstanceOptions {
        InstanceOptions {
            debounce: self.config.debounce,
            log_capacity: self.config.log_capacity,
            frontend: FrontendOptions {
                node_path: self.config.node_path.clone(),
                package_manager: self.config.package_manager.clone(),
                stop_grace: self.config.stop_grace,
            },
        }
    }
}

#[async_trait]
impl DevModeHook for DevServerManager {
    async fn initial_build(&self, plugin: &DevPlugin) -> Result<()> {
        match self.builder.build(plugin).await {
            Ok(report) => {
                self.failed_builds.remove(plugin.id());
                info!(plugin = %plugin.id(), duration = ?report.duration, "Initial build finished");
                Ok(())
            }
            Err(e) => {
                let diagnostics = e.diagnostics().to_vec();
                self.handler.on_build_errors(plugin.id(), &diagnostics);
                self.failed_builds
                    .insert(plugin.id().to_string(), (e.to_string(), diagnostics));
                Err(e)
            }
        }
    }

    async fn start(&self, plugin: DevPlugin, reload: ReloadCallback) -> Result<()> {
        let plugin_id = plugin.id().to_string();
        if let Some((_, previous)) = self.instances.remove(&plugin_id) {
            previous.stop().await;
        }

        let vite_port = if plugin.metadata.has_ui() && ui_source_dir(&plugin.dev_path).is_some() {
            Some(self.ports.allocate(&plugin_id)?)
        } else {
            None
        };

        let instance = DevServerInstance::new(
            plugin,
            Arc::clone(&self.builder),
            reload,
            Arc::clone(&self.handler),
            Arc::clone(&self.controller),
            self.options(),
            self.root.child_token(),
        );
        if let Some((_, (message, diagnostics))) = self.failed_builds.remove(&plugin_id) {
            instance.seed_build_failure(&message, &diagnostics);
        }

        self.instances.insert(plugin_id.clone(), Arc::clone(&instance));
        if let Err(e) = instance.start(vite_port).await {
            self.instances.remove(&plugin_id);
            instance.stop().await;
            self.ports.release(&plugin_id);
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&self, plugin_id: &str) -> Result<()> {
        if let Some((_, instance)) = self.instances.remove(plugin_id) {
            instance.stop().await;
        }
        self.ports.release(plugin_id);
        self.failed_builds.remove(plugin_id);
        Ok(())
    }

    async fn stop_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|i| i.key().clone()).collect();
        for plugin_id in ids {
            if let Err(e) = self.stop(&plugin_id).await {
                warn!(plugin = %plugin_id, error = %e, "Failed to stop dev server");
            }
        }
    }
}
