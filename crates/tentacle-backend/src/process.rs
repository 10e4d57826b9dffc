//! Out-of-process backends
//!
//! [`ProcessBackend`] owns a plugin process: it spawns the executable in
//! its own process group, waits for the handshake line on stdout, connects
//! to the announced address and supervises the child until it exits or is
//! stopped. [`AttachedBackend`] speaks the same protocol to a plugin the
//! developer started; the host never signals that process.

use crate::backend::{
    AttachSpec, Backend, BackendFactory, BackendSpec, CapabilityClient, CapabilityDetector,
    ExitSignal,
};
use crate::handshake::Handshake;
use crate::rpc::{RpcConnection, RpcPluginClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tentacle_core::process::shutdown_child;
use tentacle_core::{default_controller, Capability, Error, ProcessController, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Env var carrying the magic cookie; plugins refuse to run without it
pub const COOKIE_ENV: &str = "TENTACLE_PLUGIN_COOKIE";

/// Env var carrying the plugin ID
pub const PLUGIN_ID_ENV: &str = "TENTACLE_PLUGIN_ID";

const FINAL_WAIT: Duration = Duration::from_secs(2);

/// Tunables for [`ProcessBackend`]
#[derive(Debug, Clone)]
pub struct ProcessBackendOptions {
    /// Time allowed for the handshake line
    pub startup_timeout: Duration,
    /// Grace period between terminate and kill
    pub stop_grace: Duration,
    /// Timeout for lifecycle RPCs
    pub rpc_timeout: Duration,
    /// Magic cookie value
    pub magic_cookie: String,
}

impl Default for ProcessBackendOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(3),
            rpc_timeout: Duration::from_secs(2),
            magic_cookie: "d9a3c5f0-tentacle-plugin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful,
    Kill,
}

enum Supervised {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stop(StopMode),
}

/// A plugin process spawned and owned by the host
#[derive(Debug)]
pub struct ProcessBackend {
    plugin_id: String,
    pid: Option<u32>,
    client: RpcPluginClient,
    exited: Arc<AtomicBool>,
    exit_rx: ExitSignal,
    stop_tx: Mutex<Option<oneshot::Sender<StopMode>>>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ProcessBackend {
    /// Spawn the plugin and complete the handshake
    pub async fn spawn(
        spec: &BackendSpec,
        options: &ProcessBackendOptions,
        controller: Arc<dyn ProcessController>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(COOKIE_ENV, &options.magic_cookie)
            .env(PLUGIN_ID_ENV, &spec.plugin_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::process(format!(
                "failed to spawn plugin '{}' ({}): {e}",
                spec.plugin_id,
                spec.executable.display()
            ))
        })?;
        let pid = child.id();

        let Some(stdout) = child.stdout.take() else {
            Self::abort_start(&*controller, &mut child).await;
            return Err(Error::internal("plugin stdout was not captured"));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                spec.plugin_id.clone(),
                "stderr",
                BufReader::new(stderr).lines(),
            ));
        }

        let mut lines = BufReader::new(stdout).lines();
        let handshake = match tokio::time::timeout(
            options.startup_timeout,
            read_handshake(&spec.plugin_id, &mut lines),
        )
        .await
        {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                Self::abort_start(&*controller, &mut child).await;
                return Err(e);
            }
            Err(_) => {
                Self::abort_start(&*controller, &mut child).await;
                return Err(Error::timeout(format!(
                    "plugin '{}' did not complete its handshake within {:?}",
                    spec.plugin_id, options.startup_timeout
                )));
            }
        };
        tokio::spawn(forward_output(spec.plugin_id.clone(), "stdout", lines));

        let conn = match RpcConnection::connect(
            spec.plugin_id.clone(),
            handshake.addr,
            options.startup_timeout,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                Self::abort_start(&*controller, &mut child).await;
                return Err(e);
            }
        };

        info!(
            plugin = %spec.plugin_id,
            pid = ?pid,
            addr = %handshake.addr,
            "Plugin process started"
        );

        let exited = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(
            spec.plugin_id.clone(),
            child,
            stop_rx,
            Exit {
                flag: exited.clone(),
                signal: exit_tx,
            },
            controller,
            options.stop_grace,
        ));

        Ok(Self {
            plugin_id: spec.plugin_id.clone(),
            pid,
            client: RpcPluginClient::new(conn, options.rpc_timeout),
            exited,
            exit_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            supervisor: tokio::sync::Mutex::new(Some(supervisor)),
        })
    }

    async fn abort_start(controller: &dyn ProcessController, child: &mut Child) {
        if let Err(e) = shutdown_child(controller, child, true, Duration::ZERO, FINAL_WAIT).await {
            warn!(error = %e, "Failed to reap plugin process after failed start");
        }
    }

    async fn finish(&self, mode: StopMode) -> Result<()> {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(mode);
        }
        let handle = self.supervisor.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::internal(format!("plugin supervisor panicked: {e}")))?,
            None => Ok(()),
        }
    }
}

async fn read_handshake(
    plugin_id: &str,
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> Result<Handshake> {
    loop {
        match lines.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => {
                debug!(plugin = %plugin_id, line = %line.trim(), "Plugin handshake");
                return line.parse();
            }
            None => {
                return Err(Error::crash(plugin_id, "process exited before handshake"));
            }
        }
    }
}

async fn forward_output<R>(plugin_id: String, stream: &'static str, mut lines: Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %plugin_id, stream, "{}", line);
    }
}

struct Exit {
    flag: Arc<AtomicBool>,
    signal: watch::Sender<Option<String>>,
}

async fn supervise(
    plugin_id: String,
    mut child: Child,
    stop_rx: oneshot::Receiver<StopMode>,
    exit: Exit,
    controller: Arc<dyn ProcessController>,
    grace: Duration,
) -> Result<()> {
    let pgid = child.id();
    let event = tokio::select! {
        status = child.wait() => Supervised::Exited(status),
        mode = stop_rx => Supervised::Stop(mode.unwrap_or(StopMode::Kill)),
    };

    match event {
        Supervised::Exited(status) => {
            let reason = match status {
                Ok(status) => {
                    warn!(plugin = %plugin_id, %status, "Plugin process exited");
                    format!("process exited ({status})")
                }
                Err(e) => {
                    warn!(plugin = %plugin_id, error = %e, "Failed waiting on plugin process");
                    format!("process lost: {e}")
                }
            };
            // Children of the plugin may still hold the group
            if let Some(pgid) = pgid {
                let _ = controller.kill_group(pgid);
            }
            exit.flag.store(true, Ordering::SeqCst);
            exit.signal.send_replace(Some(reason));
            Ok(())
        }
        Supervised::Stop(mode) => {
            let grace = match mode {
                StopMode::Graceful => grace,
                StopMode::Kill => Duration::ZERO,
            };
            let result = shutdown_child(&*controller, &mut child, true, grace, FINAL_WAIT).await;
            exit.flag.store(true, Ordering::SeqCst);
            result
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn dispense(&self, capability: Capability) -> Result<Arc<dyn CapabilityClient>> {
        if self.exited() {
            return Err(Error::crash(&self.plugin_id, "process has exited"));
        }
        self.client.dispense(capability)
    }

    async fn healthy(&self) -> bool {
        if self.exited() {
            return false;
        }
        match self.client.health().await {
            Ok(Some(healthy)) => healthy,
            Ok(None) => !self.exited(),
            Err(e) => {
                debug!(plugin = %self.plugin_id, error = %e, "Health RPC failed");
                false
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if !self.exited() {
            if let Err(e) = self.client.shutdown().await {
                debug!(plugin = %self.plugin_id, error = %e, "Graceful shutdown RPC failed");
            }
        }
        self.client.close();
        self.finish(StopMode::Graceful).await
    }

    async fn kill(&self) -> Result<()> {
        self.client.close();
        self.finish(StopMode::Kill).await
    }

    fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_signal(&self) -> Option<ExitSignal> {
        Some(self.exit_rx.clone())
    }

    fn as_detector(&self) -> Option<&dyn CapabilityDetector> {
        Some(self)
    }
}

#[async_trait]
impl CapabilityDetector for ProcessBackend {
    async fn detect_capabilities(&self) -> Result<Vec<Capability>> {
        self.client.detect_capabilities().await
    }
}

/// A plugin process started outside the host
#[derive(Debug)]
pub struct AttachedBackend {
    plugin_id: String,
    external_pid: u32,
    client: RpcPluginClient,
    controller: Arc<dyn ProcessController>,
    detached: AtomicBool,
}

impl AttachedBackend {
    /// Connect to the plugin described by `spec`
    pub async fn attach(
        spec: &AttachSpec,
        options: &ProcessBackendOptions,
        controller: Arc<dyn ProcessController>,
    ) -> Result<Self> {
        if !controller.is_alive(spec.pid) {
            return Err(Error::not_found(format!(
                "external plugin '{}' process {} is not running",
                spec.plugin_id, spec.pid
            )));
        }
        let conn =
            RpcConnection::connect(spec.plugin_id.clone(), spec.addr, options.startup_timeout)
                .await?;
        info!(plugin = %spec.plugin_id, pid = spec.pid, addr = %spec.addr, "Attached to external plugin");
        Ok(Self {
            plugin_id: spec.plugin_id.clone(),
            external_pid: spec.pid,
            client: RpcPluginClient::new(conn, options.rpc_timeout),
            controller,
            detached: AtomicBool::new(false),
        })
    }

    /// Process ID the external plugin declared
    pub fn external_pid(&self) -> u32 {
        self.external_pid
    }
}

#[async_trait]
impl Backend for AttachedBackend {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn dispense(&self, capability: Capability) -> Result<Arc<dyn CapabilityClient>> {
        if self.exited() {
            return Err(Error::crash(&self.plugin_id, "external process has exited"));
        }
        self.client.dispense(capability)
    }

    async fn healthy(&self) -> bool {
        if self.exited() {
            return false;
        }
        match self.client.health().await {
            Ok(Some(healthy)) => healthy,
            Ok(None) => !self.exited(),
            Err(e) => {
                debug!(plugin = %self.plugin_id, error = %e, "Health RPC failed");
                false
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.detached.store(true, Ordering::SeqCst);
        self.client.close();
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.stop().await
    }

    fn exited(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
            || self.client.connection().is_closed()
            || !self.controller.is_alive(self.external_pid)
    }

    fn as_detector(&self) -> Option<&dyn CapabilityDetector> {
        Some(self)
    }
}

#[async_trait]
impl CapabilityDetector for AttachedBackend {
    async fn detect_capabilities(&self) -> Result<Vec<Capability>> {
        self.client.detect_capabilities().await
    }
}

/// Factory producing [`ProcessBackend`]s and [`AttachedBackend`]s
#[derive(Debug, Clone)]
pub struct ProcessBackendFactory {
    options: ProcessBackendOptions,
    controller: Arc<dyn ProcessController>,
}

impl ProcessBackendFactory {
    /// Factory using the platform process controller
    pub fn new(options: ProcessBackendOptions) -> Self {
        Self::with_controller(options, default_controller())
    }

    /// Factory using a specific process controller
    pub fn with_controller(
        options: ProcessBackendOptions,
        controller: Arc<dyn ProcessController>,
    ) -> Self {
        Self {
            options,
            controller,
        }
    }
}

#[async_trait]
impl BackendFactory for ProcessBackendFactory {
    async fn create(&self, spec: &BackendSpec) -> Result<Arc<dyn Backend>> {
        let backend = ProcessBackend::spawn(spec, &self.options, self.controller.clone()).await?;
        Ok(Arc::new(backend))
    }

    async fn attach(&self, spec: &AttachSpec) -> Result<Arc<dyn Backend>> {
        let backend = AttachedBackend::attach(spec, &self.options, self.controller.clone()).await?;
        Ok(Arc::new(backend))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tentacle_core::ErrorKind;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn sh_spec(script: &str) -> BackendSpec {
        let mut spec = BackendSpec::new("demo", "/bin/sh", std::env::temp_dir());
        spec.args = vec!["-c".to_string(), script.to_string()];
        spec
    }

    fn fast_options() -> ProcessBackendOptions {
        ProcessBackendOptions {
            startup_timeout: Duration::from_millis(500),
            stop_grace: Duration::from_millis(200),
            ..ProcessBackendOptions::default()
        }
    }

    /// Answer lifecycle calls like a plugin would; `shutdown` is set once
    /// the host asks the plugin to stop
    async fn lifecycle_server(shutdown: Arc<AtomicBool>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let body = match req["method"].as_str() {
                    Some("lifecycle.health") => {
                        json!({"jsonrpc": "2.0", "id": req["id"], "result": {"healthy": true}})
                    }
                    Some("lifecycle.shutdown") => {
                        shutdown.store(true, Ordering::SeqCst);
                        json!({"jsonrpc": "2.0", "id": req["id"], "result": null})
                    }
                    _ => json!({
                        "jsonrpc": "2.0",
                        "id": req["id"],
                        "error": {"code": -32601, "message": "method not found"},
                    }),
                };
                let mut out = serde_json::to_vec(&body).unwrap();
                out.push(b'\n');
                if write.write_all(&out).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    fn plugin_script(addr: std::net::SocketAddr) -> BackendSpec {
        sh_spec(&format!("echo '1|1|tcp|{addr}|jsonrpc'; exec sleep 30"))
    }

    #[tokio::test]
    async fn test_spawn_and_graceful_stop() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let addr = lifecycle_server(shutdown.clone()).await;
        let controller = default_controller();

        let backend = ProcessBackend::spawn(&plugin_script(addr), &fast_options(), controller.clone())
            .await
            .unwrap();
        let pid = backend.pid().unwrap();
        assert!(controller.is_alive(pid));
        assert!(!backend.exited());
        assert!(backend.healthy().await);

        backend.stop().await.unwrap();
        assert!(shutdown.load(Ordering::SeqCst));
        assert!(backend.exited());
        assert!(!backend.healthy().await);
        assert!(!controller.is_alive(pid));
        // A requested stop is not reported as a crash
        assert!(backend.exit_signal().unwrap().borrow().is_none());
        assert!(backend.dispense(Capability::Resource).is_err());
    }

    #[tokio::test]
    async fn test_killed_process_is_reported() {
        let addr = lifecycle_server(Arc::new(AtomicBool::new(false))).await;
        let controller = default_controller();

        let backend = ProcessBackend::spawn(&plugin_script(addr), &fast_options(), controller.clone())
            .await
            .unwrap();
        let mut signal = backend.exit_signal().unwrap();
        assert!(backend.healthy().await);

        controller.kill(backend.pid().unwrap()).unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(5), signal.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert!(reason.unwrap().starts_with("process exited"));
        assert!(backend.exited());
        assert!(!backend.healthy().await);

        // Stopping a dead process still succeeds
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_before_handshake() {
        let err = ProcessBackend::spawn(&sh_spec("exit 3"), &fast_options(), default_controller())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crash);
    }

    #[tokio::test]
    async fn test_malformed_handshake() {
        let err = ProcessBackend::spawn(
            &sh_spec("echo hello; sleep 5"),
            &fast_options(),
            default_controller(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let err = ProcessBackend::spawn(&sh_spec("sleep 5"), &fast_options(), default_controller())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cookie_is_passed() {
        // The script echoes the cookie back in place of the handshake
        let err = ProcessBackend::spawn(
            &sh_spec("echo \"$TENTACLE_PLUGIN_COOKIE\"; sleep 5"),
            &fast_options(),
            default_controller(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("d9a3c5f0-tentacle-plugin"));
    }

    #[tokio::test]
    async fn test_attach_to_external_plugin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let body = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"healthy": true}});
                let mut out = serde_json::to_vec(&body).unwrap();
                out.push(b'\n');
                write.write_all(&out).await.unwrap();
            }
        });

        let factory = ProcessBackendFactory::new(fast_options());
        let backend = factory
            .attach(&AttachSpec {
                plugin_id: "demo".to_string(),
                addr,
                pid: std::process::id(),
            })
            .await
            .unwrap();

        assert!(!backend.exited());
        assert!(backend.healthy().await);
        assert_eq!(backend.pid(), None);

        backend.stop().await.unwrap();
        assert!(backend.exited());
    }

    #[tokio::test]
    async fn test_attach_dead_pid() {
        let factory = ProcessBackendFactory::new(fast_options());
        let err = factory
            .attach(&AttachSpec {
                plugin_id: "demo".to_string(),
                addr: "127.0.0.1:9".parse().unwrap(),
                pid: 4_194_304 + 17,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
