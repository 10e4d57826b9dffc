//! Integration tests for the plugin host

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tentacle_backend::{Backend, InProcessBackendFactory};
use tentacle_config::{HostConfig, HostConfigBuilder};
use tentacle_core::events::{
    PLUGIN_CRASHED, PLUGIN_INSTALL_PROGRESS, PLUGIN_RECOVERED, PLUGIN_UNINSTALLED,
};
use tentacle_core::metadata::{write_metadata, EXECUTABLE_PATH, UI_ASSETS_DIR};
use tentacle_core::{
    Capability, DevModeHook, DevPlugin, Error, ErrorKind, PluginMetadata, PluginPhase,
    PluginStateRecord, RecordingSink, ReloadCallback, Result,
};
use tentacle_runtime::{Manager, RecoveryOutcome};
use tempfile::TempDir;

fn metadata(id: &str, capabilities: Vec<Capability>) -> PluginMetadata {
    PluginMetadata {
        id: id.to_string(),
        name: format!("{id} plugin"),
        version: "1.0.0".to_string(),
        description: String::new(),
        author: None,
        capabilities,
    }
}

fn write_executable(dir: &Path) {
    let exe = dir.join(EXECUTABLE_PATH);
    std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
    std::fs::write(&exe, "#!/bin/sh\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// A complete package with backend binary and UI assets
fn package(root: &Path, id: &str) -> PathBuf {
    let dir = root.join("packages").join(id);
    write_metadata(
        &dir,
        &metadata(id, vec![Capability::Resource, Capability::Log, Capability::Ui]),
    )
    .unwrap();
    write_executable(&dir);
    let assets = dir.join(UI_ASSETS_DIR);
    std::fs::create_dir_all(&assets).unwrap();
    std::fs::write(assets.join("index.html"), "<html></html>").unwrap();
    dir
}

fn config(data_dir: &Path) -> HostConfig {
    HostConfigBuilder::new()
        .data_dir(data_dir)
        .health_enabled(false)
        .recovery(Duration::from_millis(100), Duration::from_secs(1), 3)
        .build()
        .unwrap()
}

struct Host {
    manager: Manager,
    factory: InProcessBackendFactory,
    events: Arc<RecordingSink>,
}

fn host(data_dir: &Path, dev: Option<Arc<FakeDevHook>>) -> Host {
    let factory = InProcessBackendFactory::new();
    let events = Arc::new(RecordingSink::new());
    let mut builder = Manager::builder()
        .config(config(data_dir))
        .backend_factory(Arc::new(factory.clone()))
        .event_sink(events.clone());
    if let Some(dev) = dev {
        builder = builder.dev_mode(dev);
    }
    Host {
        manager: builder.build().unwrap(),
        factory,
        events,
    }
}

/// Dev hook that "builds" by dropping an executable into the install dir
#[derive(Debug, Default)]
struct FakeDevHook {
    fail_build: AtomicBool,
    builds: AtomicU32,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
}

#[async_trait]
impl DevModeHook for FakeDevHook {
    async fn initial_build(&self, plugin: &DevPlugin) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(Error::build("main.go:3:1: syntax error", Vec::new()));
        }
        write_executable(&plugin.install_dir);
        Ok(())
    }

    async fn start(&self, plugin: DevPlugin, _reload: ReloadCallback) -> Result<()> {
        self.started.lock().push(plugin.id().to_string());
        Ok(())
    }

    async fn stop(&self, plugin_id: &str) -> Result<()> {
        self.stopped.lock().push(plugin_id.to_string());
        Ok(())
    }

    async fn stop_all(&self) {
        let started = self.started.lock().clone();
        self.stopped.lock().extend(started);
    }
}

fn read_state(data_dir: &Path) -> Vec<PluginStateRecord> {
    let content = std::fs::read_to_string(data_dir.join("plugin_state.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[tokio::test]
async fn test_install_and_uninstall() {
    let tmp = TempDir::new().unwrap();
    let host = host(tmp.path(), None);
    host.manager.initialize().await.unwrap();

    let info = host
        .manager
        .install_from_dir(&package(tmp.path(), "k8s"))
        .await
        .unwrap();
    assert_eq!(info.phase, PluginPhase::Running);
    assert_eq!(info.capabilities, vec![Capability::Resource, Capability::Log]);
    assert!(host.manager.plugins_dir().join("k8s").is_dir());
    assert!(host.manager.clients().get("k8s", Capability::Log).is_some());
    assert!(!host.events.events_with_key(PLUGIN_INSTALL_PROGRESS).is_empty());

    let err = host
        .manager
        .install_from_dir(&package(tmp.path(), "k8s"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    host.manager.uninstall("k8s").await.unwrap();
    assert!(!host.manager.plugins_dir().join("k8s").exists());
    assert!(host.manager.list().is_empty());
    assert!(host.manager.clients().is_empty());
    assert!(host.factory.last("k8s").unwrap().exited());
    assert_eq!(host.events.events_with_key(PLUGIN_UNINSTALLED).len(), 1);
    assert!(read_state(tmp.path()).is_empty());

    let err = host.manager.uninstall("k8s").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_invalid_package_keeps_kind() {
    let tmp = TempDir::new().unwrap();
    let host = host(tmp.path(), None);
    host.manager.initialize().await.unwrap();

    let empty = tmp.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    let err = host.manager.install_from_dir(&empty).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(matches!(err, Error::Context { .. }));
}

#[tokio::test]
async fn test_restart_restores_plugins() {
    let tmp = TempDir::new().unwrap();
    {
        let host = host(tmp.path(), None);
        host.manager.initialize().await.unwrap();
        host.manager
            .install_from_dir(&package(tmp.path(), "alpha"))
            .await
            .unwrap();
        host.manager
            .install_from_dir(&package(tmp.path(), "beta"))
            .await
            .unwrap();
        let info = host.manager.disable("beta").await.unwrap();
        assert_eq!(info.phase, PluginPhase::Stopped);
        assert!(!info.enabled);
        host.manager.shutdown().await;
    }

    // Clean shutdown leaves an empty PID file
    let pids: HashMap<String, u32> =
        serde_json::from_str(&std::fs::read_to_string(tmp.path().join("plugin_pids.json")).unwrap())
            .unwrap();
    assert!(pids.is_empty());

    let host = host(tmp.path(), None);
    let report = host.manager.initialize().await.unwrap();
    assert_eq!(report.loaded, vec!["alpha".to_string()]);
    assert_eq!(report.skipped, vec!["beta".to_string()]);
    assert!(report.orphans.is_empty());

    let beta = host.manager.get("beta").unwrap();
    assert_eq!(beta.phase, PluginPhase::Stopped);
    assert!(!beta.enabled);

    let beta = host.manager.enable("beta").await.unwrap();
    assert_eq!(beta.phase, PluginPhase::Running);
    assert!(beta.enabled);
}

#[tokio::test]
async fn test_orphans_ghosts_and_corrupt_state() {
    let tmp = TempDir::new().unwrap();
    let plugins_dir = tmp.path().join("plugins");
    let orphan = plugins_dir.join("orphan");
    write_metadata(&orphan, &metadata("orphan", vec![Capability::Exec])).unwrap();
    write_executable(&orphan);

    let ghost = PluginStateRecord::new(metadata("ghost", vec![]), PluginPhase::Running);
    std::fs::write(
        tmp.path().join("plugin_state.json"),
        serde_json::to_string(&vec![ghost]).unwrap(),
    )
    .unwrap();

    let report = {
        let host = host(tmp.path(), None);
        let report = host.manager.initialize().await.unwrap();
        host.manager.shutdown().await;
        report
    };
    assert_eq!(report.orphans, vec!["orphan".to_string()]);
    assert_eq!(report.ghosts, vec!["ghost".to_string()]);
    assert_eq!(report.loaded, vec!["orphan".to_string()]);
    let ids: Vec<String> = read_state(tmp.path()).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["orphan".to_string()]);

    std::fs::write(tmp.path().join("plugin_state.json"), "[{ broken").unwrap();
    let host = host(tmp.path(), None);
    let report = host.manager.initialize().await.unwrap();
    assert!(report.rebuilt_from_filesystem);
    assert_eq!(report.loaded, vec!["orphan".to_string()]);
}

#[tokio::test]
async fn test_bad_plugin_does_not_abort_startup() {
    let tmp = TempDir::new().unwrap();
    let plugins_dir = tmp.path().join("plugins");
    for id in ["good", "broken"] {
        let dir = plugins_dir.join(id);
        write_metadata(&dir, &metadata(id, vec![Capability::Metric])).unwrap();
        write_executable(&dir);
    }
    std::fs::create_dir_all(plugins_dir.join("junk")).unwrap();

    let host = host(tmp.path(), None);
    host.factory.fail_next("broken", 1);
    let report = host.manager.initialize().await.unwrap();

    assert_eq!(report.loaded, vec!["good".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");
    assert_eq!(report.unreadable.len(), 1);

    let broken = host.manager.get("broken").unwrap();
    assert_eq!(broken.phase, PluginPhase::Failed);
    assert_eq!(broken.error_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_crash_recovery() {
    let tmp = TempDir::new().unwrap();
    let host = host(tmp.path(), None);
    host.manager.initialize().await.unwrap();
    host.manager
        .install_from_dir(&package(tmp.path(), "k8s"))
        .await
        .unwrap();

    host.factory.last("k8s").unwrap().simulate_exit();
    host.factory.fail_next("k8s", 2);

    let unhealthy = host.manager.health().check_all().await;
    assert_eq!(unhealthy, vec!["k8s".to_string()]);
    assert!(host.manager.health().is_recovering("k8s"));

    // A crash report while recovering supersedes the running loop
    let outcome = host.manager.handle_plugin_crash("k8s", "exited").await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::Recovered);

    let info = host.manager.get("k8s").unwrap();
    assert_eq!(info.phase, PluginPhase::Running);
    assert!(!host.factory.last("k8s").unwrap().exited());
    assert_eq!(host.events.events_with_key(PLUGIN_RECOVERED).len(), 1);
    assert!(host.manager.clients().get("k8s", Capability::Resource).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_backend_exit_recovers_without_polling() {
    let tmp = TempDir::new().unwrap();
    let host = host(tmp.path(), None);
    host.manager.initialize().await.unwrap();
    host.manager
        .install_from_dir(&package(tmp.path(), "k8s"))
        .await
        .unwrap();
    let creates = host.factory.create_count();

    // Health polling is disabled in this host
    host.factory
        .last("k8s")
        .unwrap()
        .simulate_crash("process exited (signal: 9)");

    for _ in 0..100 {
        if !host.events.events_with_key(PLUGIN_RECOVERED).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let crashed = host.events.events_with_key(PLUGIN_CRASHED);
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].payload["error"], "process exited (signal: 9)");
    assert_eq!(host.events.events_with_key(PLUGIN_RECOVERED).len(), 1);
    assert_eq!(host.factory.create_count(), creates + 1);

    let info = host.manager.get("k8s").unwrap();
    assert_eq!(info.phase, PluginPhase::Running);
    assert_eq!(info.error_count, 1);
    assert!(!host.factory.last("k8s").unwrap().exited());

    // A requested stop is not a crash
    host.manager.uninstall("k8s").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(host.events.events_with_key(PLUGIN_CRASHED).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_gives_up() {
    let tmp = TempDir::new().unwrap();
    let host = host(tmp.path(), None);
    host.manager.initialize().await.unwrap();
    host.manager
        .install_from_dir(&package(tmp.path(), "k8s"))
        .await
        .unwrap();
    host.factory.fail_next("k8s", 100);

    let outcome = host.manager.handle_plugin_crash("k8s", "exited").await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::Exhausted);

    let info = host.manager.get("k8s").unwrap();
    assert_eq!(info.phase, PluginPhase::Failed);
    assert!(info.last_error.unwrap().contains("recovery failed after 3 attempts"));
}

#[tokio::test(start_paused = true)]
async fn test_uninstall_cancels_recovery() {
    let tmp = TempDir::new().unwrap();
    let host = host(tmp.path(), None);
    host.manager.initialize().await.unwrap();
    host.manager
        .install_from_dir(&package(tmp.path(), "k8s"))
        .await
        .unwrap();
    host.factory.fail_next("k8s", 100);
    let creates = host.factory.create_count();

    let recovery = host.manager.handle_plugin_crash("k8s", "exited");
    host.manager.uninstall("k8s").await.unwrap();

    assert_eq!(recovery.await.unwrap(), RecoveryOutcome::Cancelled);
    assert_eq!(host.factory.create_count(), creates);
    assert!(host.manager.get("k8s").is_err());
}

#[tokio::test]
async fn test_dev_install_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("src").join("dash");
    write_metadata(
        &source,
        &metadata("dash", vec![Capability::Resource, Capability::Ui]),
    )
    .unwrap();
    let source = source.canonicalize().unwrap();

    {
        let hook = Arc::new(FakeDevHook::default());
        let host = host(tmp.path(), Some(hook.clone()));
        host.manager.initialize().await.unwrap();

        let info = host.manager.install_dev(&source).await.unwrap();
        assert_eq!(info.phase, PluginPhase::Running);
        assert!(info.dev_mode);
        assert_eq!(info.dev_path.as_deref(), Some(source.as_path()));
        assert_eq!(hook.builds.load(Ordering::SeqCst), 1);
        assert_eq!(*hook.started.lock(), vec!["dash".to_string()]);

        host.manager.shutdown().await;
        assert_eq!(*hook.stopped.lock(), vec!["dash".to_string()]);
    }

    let persisted = read_state(tmp.path());
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].dev_mode);
    assert_eq!(persisted[0].dev_path.as_deref(), Some(source.as_path()));

    let hook = Arc::new(FakeDevHook::default());
    let host = host(tmp.path(), Some(hook.clone()));
    let report = host.manager.initialize().await.unwrap();
    assert_eq!(report.loaded, vec!["dash".to_string()]);

    let info = host.manager.get("dash").unwrap();
    assert_eq!(info.phase, PluginPhase::Running);
    assert!(info.dev_mode);
    assert_eq!(info.dev_path.as_deref(), Some(source.as_path()));
    // The binary from the first run is still valid, so no rebuild
    assert_eq!(hook.builds.load(Ordering::SeqCst), 0);
    assert_eq!(*hook.started.lock(), vec!["dash".to_string()]);
}

#[tokio::test]
async fn test_dev_build_failure_keeps_watching() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("src").join("svc");
    write_metadata(&source, &metadata("svc", vec![Capability::Exec])).unwrap();

    let hook = Arc::new(FakeDevHook::default());
    hook.fail_build.store(true, Ordering::SeqCst);
    let host = host(tmp.path(), Some(hook.clone()));
    host.manager.initialize().await.unwrap();

    let err = host.manager.install_dev(&source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);

    let info = host.manager.get("svc").unwrap();
    assert_eq!(info.phase, PluginPhase::BuildFailed);
    assert!(info.last_error.unwrap().contains("syntax error"));
    assert_eq!(*hook.started.lock(), vec!["svc".to_string()]);
    assert_eq!(host.factory.create_count(), 0);
}
