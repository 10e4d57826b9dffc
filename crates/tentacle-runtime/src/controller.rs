//! Capability controllers
//!
//! A controller is the host subsystem that consumes one capability of
//! every plugin (the resource browser for `resource`, the terminal for
//! `exec`, ...). The [`ControllerRegistry`] is built once at startup and
//! maps each capability to the controllers interested in it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tentacle_backend::CapabilityClient;
use tentacle_core::{Capability, PluginMetadata, Result};
use tracing::debug;

/// Host-side consumer of one plugin capability
#[async_trait]
pub trait CapabilityController: Send + Sync + fmt::Debug {
    /// Called before the plugin's capabilities are negotiated
    async fn on_plugin_init(&self, _plugin: &PluginMetadata, _capability: Capability) -> Result<()> {
        Ok(())
    }

    /// Called with a dispensed client once the capability is confirmed
    async fn on_plugin_start(&self, plugin_id: &str, client: Arc<dyn CapabilityClient>) -> Result<()>;

    /// Called when the plugin is unloaded
    async fn on_plugin_stop(&self, plugin_id: &str, capability: Capability) -> Result<()>;
}

/// Capability → controllers mapping
#[derive(Debug, Default, Clone)]
pub struct ControllerRegistry {
    controllers: BTreeMap<Capability, Vec<Arc<dyn CapabilityController>>>,
}

impl ControllerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry routing every backend capability to `clients`
    pub fn with_client_registry(clients: Arc<ClientRegistry>) -> Self {
        let mut registry = Self::new();
        for capability in Capability::BACKEND {
            registry.register(capability, clients.clone());
        }
        registry
    }

    /// Route `capability` to `controller`
    pub fn register(&mut self, capability: Capability, controller: Arc<dyn CapabilityController>) {
        self.controllers
            .entry(capability)
            .or_default()
            .push(controller);
    }

    /// Controllers for `capability`
    pub fn for_capability(&self, capability: Capability) -> &[Arc<dyn CapabilityController>] {
        self.controllers
            .get(&capability)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

/// Stock controller that keeps every dispensed client for lookup
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<(String, Capability), Arc<dyn CapabilityClient>>,
}

impl ClientRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for `plugin_id`'s `capability`
    pub fn get(&self, plugin_id: &str, capability: Capability) -> Option<Arc<dyn CapabilityClient>> {
        self.clients
            .get(&(plugin_id.to_string(), capability))
            .map(|entry| entry.value().clone())
    }

    /// Plugins currently serving `capability`, sorted
    pub fn plugins_with(&self, capability: Capability) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .iter()
            .filter(|entry| entry.key().1 == capability)
            .map(|entry| entry.key().0.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are registered
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[async_trait]
impl CapabilityController for ClientRegistry {
    async fn on_plugin_start(&self, plugin_id: &str, client: Arc<dyn CapabilityClient>) -> Result<()> {
        debug!(plugin = %plugin_id, capability = %client.capability(), "Client registered");
        self.clients
            .insert((plugin_id.to_string(), client.capability()), client);
        Ok(())
    }

    async fn on_plugin_stop(&self, plugin_id: &str, capability: Capability) -> Result<()> {
        self.clients.remove(&(plugin_id.to_string(), capability));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tentacle_backend::FnClient;

    #[tokio::test]
    async fn test_client_registry_lifecycle() {
        let clients = Arc::new(ClientRegistry::new());
        let registry = ControllerRegistry::with_client_registry(clients.clone());
        assert_eq!(registry.for_capability(Capability::Exec).len(), 1);
        assert!(registry.for_capability(Capability::Ui).is_empty());

        for controller in registry.for_capability(Capability::Exec) {
            controller
                .on_plugin_start("k8s", Arc::new(FnClient::echo(Capability::Exec)))
                .await
                .unwrap();
        }
        assert!(clients.get("k8s", Capability::Exec).is_some());
        assert_eq!(clients.plugins_with(Capability::Exec), vec!["k8s".to_string()]);

        for controller in registry.for_capability(Capability::Exec) {
            controller.on_plugin_stop("k8s", Capability::Exec).await.unwrap();
        }
        assert!(clients.is_empty());
    }
}
