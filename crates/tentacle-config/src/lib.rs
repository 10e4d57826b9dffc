//! # Tentacle Configuration
//!
//! Host configuration with support for:
//! - Multiple formats (YAML, TOML, JSON)
//! - `${VAR}` / `${VAR:-default}` environment expansion
//! - Validation
//! - Default values rooted at a single data directory

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builder;
pub mod loader;
pub mod types;
pub mod validator;

pub use builder::HostConfigBuilder;
pub use loader::{load_config, load_from_file, load_from_str};
pub use types::{
    BackendConfig, DevConfig, HealthConfig, HostConfig, ObservabilityConfig, PathsConfig,
    RecoveryConfig,
};
pub use validator::validate_config;

use std::path::Path;
use tentacle_core::{Error, Result};

/// Load and validate configuration from a file
pub fn load<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    load_config(path)
}

/// Load configuration from a string
pub fn load_str(content: &str, format: ConfigFormat) -> Result<HostConfig> {
    load_from_str(content, format)
}

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::config("Unable to detect config format"))?;

        match ext {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(Error::config(format!("Unsupported config format: {ext}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_detect_format_from_path() {
        assert_eq!(
            ConfigFormat::from_path(&PathBuf::from("tentacle.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(&PathBuf::from("tentacle.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert_eq!(
            ConfigFormat::from_path(&PathBuf::from("tentacle.json")).unwrap(),
            ConfigFormat::Json
        );
    }

    #[test]
    fn test_unsupported_format() {
        assert!(ConfigFormat::from_path(&PathBuf::from("tentacle.ini")).is_err());
        assert!(ConfigFormat::from_path(&PathBuf::from("tentacle")).is_err());
    }
}
