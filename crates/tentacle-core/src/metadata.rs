//! Plugin package layout and metadata file
//!
//! A plugin package is a directory holding:
//!
//! - `plugin.json`: id, name, version and declared capabilities
//! - `bin/plugin` (`bin/plugin.exe` on Windows): the backend executable,
//!   required when any backend capability is declared
//! - `ui/dist/`: compiled front-end assets, required outside dev mode when
//!   the `ui` capability is declared

use crate::capability::Capability;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata file name inside a plugin directory
pub const METADATA_FILE: &str = "plugin.json";

/// Directory holding compiled UI assets, relative to the plugin directory
pub const UI_ASSETS_DIR: &str = "ui/dist";

/// Backend executable path relative to the plugin directory
#[cfg(windows)]
pub const EXECUTABLE_PATH: &str = "bin/plugin.exe";
/// Backend executable path relative to the plugin directory
#[cfg(not(windows))]
pub const EXECUTABLE_PATH: &str = "bin/plugin";

/// Contents of `plugin.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique plugin ID (also the install directory name)
    pub id: String,

    /// Display name
    pub name: String,

    /// Plugin version
    pub version: String,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Plugin author
    #[serde(default)]
    pub author: Option<String>,

    /// Declared capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl PluginMetadata {
    /// Whether any declared capability needs a backend process
    pub fn has_backend(&self) -> bool {
        self.capabilities.iter().any(|c| c.is_backend())
    }

    /// Whether the plugin ships a front end
    pub fn has_ui(&self) -> bool {
        self.capabilities.contains(&Capability::Ui)
    }

    /// Declared backend capabilities, deduplicated and sorted
    pub fn backend_capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self
            .capabilities
            .iter()
            .copied()
            .filter(|c| c.is_backend())
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// Check the fields a loader depends on
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("plugin id cannot be empty"));
        }
        if self
            .id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
            || self.id.starts_with('.')
        {
            return Err(Error::validation(format!(
                "plugin id '{}' may only contain letters, digits, '-', '_' and '.'",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(Error::validation(format!(
                "plugin '{}' has an empty version",
                self.id
            )));
        }
        Ok(())
    }
}

/// Path of the metadata file inside `dir`
pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

/// Path of the backend executable inside `dir`
pub fn executable_path(dir: &Path) -> PathBuf {
    dir.join(EXECUTABLE_PATH)
}

/// Read and validate `plugin.json` from `dir`.
///
/// A missing file is [`Error::NotFound`]; an unparseable or invalid one is
/// [`Error::Validation`].
pub fn read_metadata(dir: &Path) -> Result<PluginMetadata> {
    let path = metadata_path(dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!(
                "missing metadata: {} does not exist",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata: PluginMetadata = serde_json::from_str(&content).map_err(|e| {
        Error::validation(format!("invalid metadata in {}: {e}", path.display()))
    })?;
    metadata.validate()?;
    Ok(metadata)
}

/// Write `plugin.json` into `dir`
pub fn write_metadata(dir: &Path, metadata: &PluginMetadata) -> Result<()> {
    crate::fsutil::write_json_atomic(&metadata_path(dir), metadata)
}

/// Check that the backend executable exists and is runnable
pub fn validate_executable(dir: &Path) -> Result<PathBuf> {
    let path = executable_path(dir);
    let meta = std::fs::metadata(&path).map_err(|_| {
        Error::validation(format!("missing plugin binary: {}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(Error::validation(format!(
            "plugin binary is not a file: {}",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::validation(format!(
                "plugin binary is not executable: {}",
                path.display()
            )));
        }
    }

    Ok(path)
}

/// Whether compiled UI assets are present
pub fn has_ui_assets(dir: &Path) -> bool {
    let assets = dir.join(UI_ASSETS_DIR);
    std::fs::read_dir(&assets)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> PluginMetadata {
        PluginMetadata {
            id: "kubernetes".to_string(),
            name: "Kubernetes".to_string(),
            version: "1.2.0".to_string(),
            description: String::new(),
            author: None,
            capabilities: vec![Capability::Resource, Capability::Ui, Capability::Resource],
        }
    }

    #[test]
    fn test_capability_helpers() {
        let meta = sample();
        assert!(meta.has_backend());
        assert!(meta.has_ui());
        assert_eq!(meta.backend_capabilities(), vec![Capability::Resource]);
    }

    #[test]
    fn test_id_validation() {
        let mut meta = sample();
        meta.id = "../escape".to_string();
        assert!(meta.validate().is_err());
        meta.id = "".to_string();
        assert!(meta.validate().is_err());
        meta.id = "aws-ec2_v2".to_string();
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_read_metadata() {
        let dir = TempDir::new().unwrap();
        let err = read_metadata(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);

        std::fs::write(metadata_path(dir.path()), "{not json").unwrap();
        let err = read_metadata(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);

        write_metadata(dir.path(), &sample()).unwrap();
        assert_eq!(read_metadata(dir.path()).unwrap(), sample());
    }

    #[test]
    fn test_validate_executable() {
        let dir = TempDir::new().unwrap();
        assert!(validate_executable(dir.path()).is_err());

        let bin = executable_path(dir.path());
        std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert!(validate_executable(dir.path()).is_err());
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        assert_eq!(validate_executable(dir.path()).unwrap(), bin);
    }

    #[test]
    fn test_ui_assets() {
        let dir = TempDir::new().unwrap();
        assert!(!has_ui_assets(dir.path()));
        let assets = dir.path().join(UI_ASSETS_DIR);
        std::fs::create_dir_all(&assets).unwrap();
        assert!(!has_ui_assets(dir.path()));
        std::fs::write(assets.join("index.html"), "<html></html>").unwrap();
        assert!(has_ui_assets(dir.path()));
    }
}
