//! Front-end dev server process
//!
//! Runs Vite for a plugin's `ui/` directory in its own process group so
//! the whole tree (node plus anything it forks) can be signalled at once.
//! Output is streamed line by line to a log callback; the server counts as
//! ready once it prints a line mentioning its port.

use crate::log_buffer::{LogEntry, LogSource, LogStream};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tentacle_core::process::shutdown_child;
use tentacle_core::{Error, ProcessController, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Vite entry point inside `node_modules`
const VITE_ENTRY: &str = "node_modules/vite/bin/vite.js";

/// Bound on waiting for exit after the forced kill
const FINAL_WAIT: Duration = Duration::from_secs(5);

static ANSI_ESCAPE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok());

/// Receives every line the dev server prints
pub type LogCallback = Arc<dyn Fn(LogEntry) + Send + Sync>;

/// Front-end dev server status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendStatus {
    /// The plugin has no UI sources
    Disabled,
    /// Installing dependencies or waiting for the ready line
    Starting,
    /// Serving on its port
    Ready,
    /// Stopped on request
    Stopped,
    /// Failed to start or exited on its own
    Error,
}

/// Tool paths and timings for the front-end dev server
#[derive(Debug, Clone)]
pub struct FrontendOptions {
    /// Node.js binary
    pub node_path: PathBuf,
    /// Package manager used to install dependencies
    pub package_manager: PathBuf,
    /// Time between terminate and kill on stop
    pub stop_grace: Duration,
}

/// A Vite process serving one plugin's UI
pub struct FrontendServer {
    plugin_id: String,
    ui_dir: PathBuf,
    port: u16,
    options: FrontendOptions,
    controller: Arc<dyn ProcessController>,
    on_log: LogCallback,
    child: Mutex<Option<Child>>,
    status: Arc<watch::Sender<FrontendStatus>>,
}

impl fmt::Debug for FrontendServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontendServer")
            .field("plugin_id", &self.plugin_id)
            .field("ui_dir", &self.ui_dir)
            .field("port", &self.port)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl FrontendServer {
    /// Server for the UI sources in `ui_dir`, to listen on `port`
    pub fn new(
        plugin_id: impl Into<String>,
        ui_dir: impl Into<PathBuf>,
        port: u16,
        options: FrontendOptions,
        controller: Arc<dyn ProcessController>,
        on_log: LogCallback,
    ) -> Self {
        let (status, _) = watch::channel(FrontendStatus::Stopped);
        Self {
            plugin_id: plugin_id.into(),
            ui_dir: ui_dir.into(),
            port,
            options,
            controller,
            on_log,
            child: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    /// Allocated port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current status
    pub fn status(&self) -> FrontendStatus {
        *self.status.borrow()
    }

    /// Follow status changes
    pub fn subscribe(&self) -> watch::Receiver<FrontendStatus> {
        self.status.subscribe()
    }

    /// Install dependencies if needed and spawn the dev server.
    ///
    /// Returns once the process is spawned; use
    /// [`FrontendServer::wait_ready`] to wait for it to serve.
    pub async fn start(&self) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if child_slot.is_some() {
            return Ok(());
        }
        self.status.send_replace(FrontendStatus::Starting);

        if let Err(e) = self.ensure_dependencies().await {
            self.status.send_replace(FrontendStatus::Error);
            return Err(e);
        }

        let mut command = Command::new(&self.options.node_path);
        command
            .arg(VITE_ENTRY)
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--strictPort")
            .current_dir(&self.ui_dir)
            .env("NO_COLOR", "1")
            .env("FORCE_COLOR", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.status.send_replace(FrontendStatus::Error);
                return Err(Error::process(format!(
                    "failed to start vite for plugin '{}': {e}",
                    self.plugin_id
                )));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(
                stdout,
                LogStream::Stdout,
                self.port,
                Arc::clone(&self.on_log),
                Arc::clone(&self.status),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(
                stderr,
                LogStream::Stderr,
                self.port,
                Arc::clone(&self.on_log),
                Arc::clone(&self.status),
            ));
        }

        info!(
            plugin = %self.plugin_id,
            port = self.port,
            pid = ?child.id(),
            "Vite dev server started"
        );
        *child_slot = Some(child);
        Ok(())
    }

    /// Wait until the server prints its ready line
    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        let mut rx = self.status.subscribe();
        let waited = tokio::time::timeout(limit, async {
            loop {
                let status = *rx.borrow_and_update();
                match status {
                    FrontendStatus::Ready => return Ok(()),
                    FrontendStatus::Error | FrontendStatus::Stopped => {
                        return Err(Error::process(format!(
                            "vite for plugin '{}' exited before becoming ready",
                            self.plugin_id
                        )))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::internal("vite status channel closed"));
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "vite for plugin '{}' not ready after {limit:?}",
                self.plugin_id
            ))),
        }
    }

    /// Terminate the process group, then kill it after the grace period
    pub async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.status.send_replace(FrontendStatus::Stopped);

        let result = shutdown_child(
            self.controller.as_ref(),
            &mut child,
            cfg!(unix),
            self.options.stop_grace,
            FINAL_WAIT,
        )
        .await;
        info!(plugin = %self.plugin_id, port = self.port, "Vite dev server stopped");
        result
    }

    async fn ensure_dependencies(&self) -> Result<()> {
        if self.ui_dir.join("node_modules").is_dir() {
            return Ok(());
        }

        info!(plugin = %self.plugin_id, "Installing front-end dependencies");
        self.log(LogStream::Stdout, format!(
            "{} install",
            self.options.package_manager.display()
        ));

        let output = Command::new(&self.options.package_manager)
            .arg("install")
            .current_dir(&self.ui_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::process(format!(
                    "failed to run {}: {e}",
                    self.options.package_manager.display()
                ))
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            self.log(LogStream::Stdout, line.to_string());
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            self.log(LogStream::Stderr, line.to_string());
        }

        if !output.status.success() {
            return Err(Error::process(format!(
                "dependency install for plugin '{}' exited with {}",
                self.plugin_id, output.status
            )));
        }
        Ok(())
    }

    fn log(&self, stream: LogStream, line: String) {
        (self.on_log)(LogEntry::new(LogSource::Vite, stream, line));
    }
}

/// The UI source directory of a dev plugin, if it has one
pub fn ui_source_dir(dev_path: &Path) -> Option<PathBuf> {
    let dir = dev_path.join("ui");
    dir.join("package.json").is_file().then_some(dir)
}

async fn pump<R>(
    reader: R,
    stream: LogStream,
    port: u16,
    on_log: LogCallback,
    status: Arc<watch::Sender<FrontendStatus>>,
) where
    R: AsyncRead + Unpin,
{
    let ready_marker = format!(":{port}");
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = strip_ansi(&line);
                debug!(port, stream = ?stream, line = %line, "vite");
                if line.contains(&ready_marker) {
                    status.send_if_modified(|current| {
                        if *current == FrontendStatus::Starting {
                            *current = FrontendStatus::Ready;
                            true
                        } else {
                            false
                        }
                    });
                }
                on_log(LogEntry::new(LogSource::Vite, stream, line));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(port, error = %e, "Failed to read vite output");
                break;
            }
        }
    }

    // The process closed its output without being asked to stop
    if stream == LogStream::Stdout {
        status.send_if_modified(|current| {
            if matches!(current, FrontendStatus::Starting | FrontendStatus::Ready) {
                *current = FrontendStatus::Error;
                true
            } else {
                false
            }
        });
    }
}

fn strip_ansi(line: &str) -> String {
    match ANSI_ESCAPE.as_ref() {
        Some(pattern) => pattern.replace_all(line, "").into_owned(),
        None => line.to_string(),
    }
}
