//! In-process backends for bundled plugins and tests

use crate::backend::{
    Backend, BackendFactory, BackendSpec, CapabilityClient, CapabilityDetector, ExitSignal,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tentacle_core::{Capability, Error, Result};
use tokio::sync::watch;

type CallFn = Arc<dyn Fn(&str, Value) -> Result<Value> + Send + Sync>;

/// A [`CapabilityClient`] backed by a closure
#[derive(Clone)]
pub struct FnClient {
    capability: Capability,
    handler: CallFn,
}

impl fmt::Debug for FnClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClient")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl FnClient {
    /// Client answering every call with `handler(method, params)`
    pub fn new<F>(capability: Capability, handler: F) -> Self
    where
        F: Fn(&str, Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            capability,
            handler: Arc::new(handler),
        }
    }

    /// Client returning its params unchanged
    pub fn echo(capability: Capability) -> Self {
        Self::new(capability, |_, params| Ok(params))
    }
}

#[async_trait]
impl CapabilityClient for FnClient {
    fn capability(&self) -> Capability {
        self.capability
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        (self.handler)(method, params)
    }
}

/// A backend whose capability clients live in the host process
#[derive(Debug)]
pub struct InProcessBackend {
    plugin_id: String,
    clients: HashMap<Capability, Arc<dyn CapabilityClient>>,
    detected: Option<Vec<Capability>>,
    healthy: AtomicBool,
    exited: AtomicBool,
    exit_tx: watch::Sender<Option<String>>,
}

impl InProcessBackend {
    /// Backend with no clients
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            clients: HashMap::new(),
            detected: None,
            healthy: AtomicBool::new(true),
            exited: AtomicBool::new(false),
            exit_tx: watch::channel(None).0,
        }
    }

    /// Backend with an echo client for each of `capabilities`
    pub fn echoing(plugin_id: impl Into<String>, capabilities: &[Capability]) -> Self {
        capabilities
            .iter()
            .fold(Self::new(plugin_id), |backend, cap| {
                backend.with_client(Arc::new(FnClient::echo(*cap)))
            })
    }

    /// Register a client
    pub fn with_client(mut self, client: Arc<dyn CapabilityClient>) -> Self {
        self.clients.insert(client.capability(), client);
        self
    }

    /// Support capability detection, reporting `capabilities`
    pub fn with_detection(mut self, capabilities: Vec<Capability>) -> Self {
        self.detected = Some(capabilities);
        self
    }

    /// Change the health reported from now on
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Simulate the plugin going away unnoticed; only a health check sees it
    pub fn simulate_exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Simulate the plugin dying and report it through [`Backend::exit_signal`]
    pub fn simulate_crash(&self, reason: impl Into<String>) {
        self.exited.store(true, Ordering::SeqCst);
        self.exit_tx.send_replace(Some(reason.into()));
    }
}

#[async_trait]
impl Backend for InProcessBackend {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn dispense(&self, capability: Capability) -> Result<Arc<dyn CapabilityClient>> {
        if self.exited() {
            return Err(Error::crash(&self.plugin_id, "backend has stopped"));
        }
        self.clients.get(&capability).cloned().ok_or_else(|| {
            Error::not_found(format!(
                "plugin '{}' does not serve capability '{capability}'",
                self.plugin_id
            ))
        })
    }

    async fn healthy(&self) -> bool {
        !self.exited() && self.healthy.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<()> {
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.stop().await
    }

    fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn exit_signal(&self) -> Option<ExitSignal> {
        Some(self.exit_tx.subscribe())
    }

    fn as_detector(&self) -> Option<&dyn CapabilityDetector> {
        if self.detected.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl CapabilityDetector for InProcessBackend {
    async fn detect_capabilities(&self) -> Result<Vec<Capability>> {
        Ok(self.detected.clone().unwrap_or_default())
    }
}

type BuildFn = Arc<dyn Fn(&BackendSpec) -> Result<InProcessBackend> + Send + Sync>;

#[derive(Default)]
struct FactoryState {
    builders: HashMap<String, BuildFn>,
    failures: HashMap<String, u32>,
    created: HashMap<String, Arc<InProcessBackend>>,
}

/// Factory handing out [`InProcessBackend`]s.
///
/// Plugins without a registered builder get an echo client for every
/// backend capability. Failures can be scripted per plugin.
#[derive(Clone, Default)]
pub struct InProcessBackendFactory {
    state: Arc<Mutex<FactoryState>>,
    creates: Arc<AtomicU32>,
}

impl fmt::Debug for InProcessBackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InProcessBackendFactory")
            .field("builders", &state.builders.keys().collect::<Vec<_>>())
            .field("creates", &self.creates.load(Ordering::SeqCst))
            .finish()
    }
}

impl InProcessBackendFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `builder` for `plugin_id`
    pub fn register<F>(&self, plugin_id: impl Into<String>, builder: F)
    where
        F: Fn(&BackendSpec) -> Result<InProcessBackend> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .builders
            .insert(plugin_id.into(), Arc::new(builder));
    }

    /// Make the next `count` creates for `plugin_id` fail
    pub fn fail_next(&self, plugin_id: impl Into<String>, count: u32) {
        self.state.lock().failures.insert(plugin_id.into(), count);
    }

    /// Most recent backend created for `plugin_id`
    pub fn last(&self, plugin_id: &str) -> Option<Arc<InProcessBackend>> {
        self.state.lock().created.get(plugin_id).cloned()
    }

    /// Total successful and failed create calls
    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendFactory for InProcessBackendFactory {
    async fn create(&self, spec: &BackendSpec) -> Result<Arc<dyn Backend>> {
        self.creates.fetch_add(1, Ordering::SeqCst);

        let builder = {
            let mut state = self.state.lock();
            if let Some(remaining) = state.failures.get_mut(&spec.plugin_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::process(format!(
                        "scripted start failure for plugin '{}'",
                        spec.plugin_id
                    )));
                }
            }
            state.builders.get(&spec.plugin_id).cloned()
        };

        let backend = match builder {
            Some(build) => build(spec)?,
            None => InProcessBackend::echoing(spec.plugin_id.clone(), &Capability::BACKEND),
        };
        let backend = Arc::new(backend);
        self.state
            .lock()
            .created
            .insert(spec.plugin_id.clone(), backend.clone());
        Ok(backend)
    }
}
