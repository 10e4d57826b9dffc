//! Configuration builder

use crate::types::HostConfig;
use std::path::PathBuf;
use std::time::Duration;
use tentacle_core::{Error, Result};

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
    data_dir_set: bool,
}

impl HostConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: HostConfig) -> Self {
        Self {
            config,
            data_dir_set: true,
        }
    }

    /// Set the data directory every default path is resolved against
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.data_dir = dir.into();
        self.data_dir_set = true;
        self
    }

    /// Override the plugins directory
    pub fn plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.plugins_dir = Some(dir.into());
        self
    }

    /// Set the health check interval
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.config.health.interval = interval;
        self
    }

    /// Enable or disable the periodic health checker
    pub fn health_enabled(mut self, enabled: bool) -> Self {
        self.config.health.enabled = enabled;
        self
    }

    /// Set recovery backoff bounds and attempt limit
    pub fn recovery(mut self, initial: Duration, max: Duration, attempts: u32) -> Self {
        self.config.recovery.initial_backoff = initial;
        self.config.recovery.max_backoff = max;
        self.config.recovery.max_attempts = attempts;
        self
    }

    /// Set the backend handshake timeout
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend.startup_timeout = timeout;
        self
    }

    /// Start dev servers for dev-mode plugins at boot
    pub fn dev_auto_start(mut self, enabled: bool) -> Self {
        self.config.dev.auto_start = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<HostConfig> {
        if !self.data_dir_set {
            return Err(Error::config("data_dir is required"));
        }
        crate::validator::validate_config(&self.config)?;
        Ok(self.config)
    }
}
