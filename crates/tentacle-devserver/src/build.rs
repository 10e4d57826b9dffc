//! Backend build pipeline
//!
//! Compiles a dev plugin's Go sources and moves the result into the
//! installed plugin directory. The binary is written to a temporary name
//! and renamed over the executable, so a running backend never sees a
//! half-written file.

use crate::diagnostics::parse_go_build_output;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tentacle_core::metadata::{executable_path, read_metadata, write_metadata};
use tentacle_core::{DevPlugin, Error, Result};
use tokio::process::Command;
use tracing::{debug, info};

/// Temporary build output, relative to the install directory
const BUILD_OUTPUT: &str = "bin/.plugin.build";

/// Outcome of a successful build
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Wall-clock build time
    pub duration: Duration,
    /// Combined tool output, one entry per line
    pub output: Vec<String>,
}

/// Builds a dev plugin's backend into its install directory
#[async_trait]
pub trait BackendBuilder: Send + Sync + std::fmt::Debug {
    /// Build `plugin` and install the binary and metadata.
    ///
    /// Compiler failures are [`Error::Build`] carrying parsed diagnostics.
    async fn build(&self, plugin: &DevPlugin) -> Result<BuildReport>;
}

/// Builds with `go build`
#[derive(Debug, Clone)]
pub struct GoBuilder {
    go_path: PathBuf,
}

impl GoBuilder {
    /// Builder using the Go toolchain at `go_path`
    pub fn new(go_path: impl Into<PathBuf>) -> Self {
        Self {
            go_path: go_path.into(),
        }
    }
}

#[async_trait]
impl BackendBuilder for GoBuilder {
    async fn build(&self, plugin: &DevPlugin) -> Result<BuildReport> {
        let started = Instant::now();
        let output_path = plugin.install_dir.join(BUILD_OUTPUT);
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(
            plugin = %plugin.id(),
            source = %plugin.dev_path.display(),
            "Running go build"
        );

        let output = Command::new(&self.go_path)
            .arg("build")
            .arg("-o")
            .arg(&output_path)
            .arg(".")
            .current_dir(&plugin.dev_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::process(format!(
                    "failed to run {}: {e}",
                    self.go_path.display()
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<String> = stdout
            .lines()
            .chain(stderr.lines())
            .map(str::to_string)
            .collect();

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&output_path).await;
            let diagnostics = parse_go_build_output(&stderr, &plugin.dev_path);
            let summary = match diagnostics.len() {
                0 => format!("go build exited with {}", output.status),
                1 => "1 compile error".to_string(),
                n => format!("{n} compile errors"),
            };
            return Err(Error::build(summary, diagnostics));
        }

        install_output(plugin, &output_path).await?;

        let duration = started.elapsed();
        info!(plugin = %plugin.id(), ?duration, "Backend built");
        Ok(BuildReport {
            duration,
            output: lines,
        })
    }
}

/// Move a fresh build into place and refresh the installed metadata
pub async fn install_output(plugin: &DevPlugin, built: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(built, std::fs::Permissions::from_mode(0o755)).await?;
    }

    let target = executable_path(&plugin.install_dir);
    tokio::fs::rename(built, &target).await?;

    let dev_path = plugin.dev_path.clone();
    let install_dir = plugin.install_dir.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let metadata = read_metadata(&dev_path)?;
        write_metadata(&install_dir, &metadata)
    })
    .await
    .map_err(|e| Error::internal(format!("metadata copy task failed: {e}")))??;

    debug!(plugin = %plugin.id(), target = %target.display(), "Build output installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tentacle_core::{Capability, ErrorKind, PluginMetadata};

    fn plugin(tmp: &TempDir) -> DevPlugin {
        let metadata = PluginMetadata {
            id: "kube".to_string(),
            name: "Kube".to_string(),
            version: "0.2.0".to_string(),
            description: String::new(),
            author: None,
            capabilities: vec![Capability::Resource],
        };
        let dev_path = tmp.path().join("src");
        let install_dir = tmp.path().join("plugins/kube");
        std::fs::create_dir_all(dev_path.join("bin")).unwrap();
        std::fs::create_dir_all(install_dir.join("bin")).unwrap();
        write_metadata(&dev_path, &metadata).unwrap();
        DevPlugin {
            metadata,
            dev_path,
            install_dir,
        }
    }

    #[tokio::test]
    async fn test_install_output_moves_binary_and_metadata() {
        let tmp = TempDir::new().unwrap();
        let plugin = plugin(&tmp);
        let built = plugin.install_dir.join(BUILD_OUTPUT);
        std::fs::write(&built, b"#!/bin/sh\n").unwrap();

        install_output(&plugin, &built).await.unwrap();

        assert!(!built.exists());
        tentacle_core::metadata::validate_executable(&plugin.install_dir).unwrap();
        assert_eq!(read_metadata(&plugin.install_dir).unwrap().version, "0.2.0");
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_process_error() {
        let tmp = TempDir::new().unwrap();
        let plugin = plugin(&tmp);
        let builder = GoBuilder::new(tmp.path().join("no-such-go"));

        let err = builder.build(&plugin).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert_eq!(err.kind(), ErrorKind::Build);
    }
}
