//! Tentacle CLI

mod signal;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tentacle_config::{load_config, HostConfig};
use tentacle_core::{
    default_controller, EventSink, ExternalPluginListener, PluginStateRecord, TracingSink,
};
use tentacle_devserver::{DevServerManager, ExternalWatcher};
use tentacle_runtime::{Manager, StateStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tentacle")]
#[command(about = "Tentacle plugin host", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "TENTACLE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the plugin host until SIGINT or SIGTERM
    Serve,

    /// List installed plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Install a plugin package
    Install {
        /// Package directory, or plugin sources with --dev
        dir: PathBuf,

        /// Install from sources in dev mode
        #[arg(long)]
        dev: bool,
    },

    /// Uninstall a plugin
    Uninstall {
        /// Plugin ID
        id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = load(cli.config.as_deref())?;
            init_tracing(&config, cli.log_level.as_deref(), cli.log_json)?;
            serve(config).await
        }

        Commands::List { json } => {
            let config = load(cli.config.as_deref())?;
            init_tracing(&config, cli.log_level.as_deref(), cli.log_json)?;
            list(&config, json)
        }

        Commands::Install { dir, dev } => {
            let config = load(cli.config.as_deref())?;
            init_tracing(&config, cli.log_level.as_deref(), cli.log_json)?;
            install(config, &dir, dev).await
        }

        Commands::Uninstall { id } => {
            let config = load(cli.config.as_deref())?;
            init_tracing(&config, cli.log_level.as_deref(), cli.log_json)?;
            uninstall(config, &id).await
        }

        Commands::Validate => {
            let path = cli
                .config
                .context("--config is required for validate")?;
            match load_config(&path) {
                Ok(cfg) => {
                    println!("✓ Configuration is valid");
                    println!("  Data dir: {}", cfg.paths.data_dir().display());
                    println!("  Plugins dir: {}", cfg.paths.plugins_dir().display());
                    println!(
                        "  Recovery: {:?} .. {:?}, {} attempts",
                        cfg.recovery.initial_backoff,
                        cfg.recovery.max_backoff,
                        cfg.recovery.max_attempts
                    );
                    println!(
                        "  Dev ports: {}-{}",
                        cfg.dev.port_range_start, cfg.dev.port_range_end
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Tentacle plugin host");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn load(path: Option<&Path>) -> Result<HostConfig> {
    match path {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(HostConfig::default()),
    }
}

async fn serve(config: HostConfig) -> Result<()> {
    tracing::info!(data_dir = %config.paths.data_dir().display(), "Starting Tentacle plugin host");

    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let handshake_dir = config.paths.dev_handshake_dir();
    let liveness_interval = config.dev.external_liveness_interval;
    let devs = Arc::new(DevServerManager::new(config.dev.clone(), Arc::clone(&events)));

    let manager = Arc::new(
        Manager::builder()
            .config(config)
            .event_sink(Arc::clone(&events))
            .dev_mode(devs)
            .build()?,
    );

    let report = manager.initialize().await?;
    tracing::info!(
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        orphans = report.orphans.len(),
        ghosts = report.ghosts.len(),
        "Plugin host ready"
    );
    for (plugin, error) in &report.failed {
        tracing::warn!(plugin = %plugin, error = %error, "Plugin failed to load");
    }

    let external = Arc::new(ExternalWatcher::new(
        handshake_dir,
        Arc::clone(&manager) as Arc<dyn ExternalPluginListener>,
        events,
        default_controller(),
        liveness_interval,
    ));
    let external_task = external.start(manager.shutdown_token())?;

    match signal::wait_for_stop().await {
        Ok(sig) => tracing::info!(signal = %sig, "Received stop signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for signals, stopping"),
    }

    manager.shutdown().await;
    let _ = external_task.await;
    tracing::info!("Plugin host stopped");
    Ok(())
}

fn list(config: &HostConfig, json: bool) -> Result<()> {
    let store = StateStore::new(config.paths.state_file());
    let mut records: Vec<PluginStateRecord> = store.load()?.unwrap_or_default();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No plugins installed");
        return Ok(());
    }

    println!("{:<24} {:<10} {:<14} {:<8} {}", "ID", "VERSION", "PHASE", "ENABLED", "DEV");
    for record in &records {
        let dev = match (record.dev_mode, &record.dev_path) {
            (true, Some(path)) => path.display().to_string(),
            (true, None) => "yes".to_string(),
            (false, _) => String::new(),
        };
        println!(
            "{:<24} {:<10} {:<14} {:<8} {}",
            record.id,
            record.metadata.version,
            record.phase.to_string(),
            record.enabled,
            dev
        );
    }
    Ok(())
}

async fn install(config: HostConfig, dir: &Path, dev: bool) -> Result<()> {
    let mut builder = Manager::builder();
    if dev {
        let devs = DevServerManager::new(config.dev.clone(), Arc::new(TracingSink));
        builder = builder.dev_mode(Arc::new(devs));
    }
    let manager = builder.config(one_shot(config)).build()?;

    let installed = if dev {
        manager.install_dev(dir).await
    } else {
        manager.install_from_dir(dir).await
    };
    manager.shutdown().await;

    let info = installed?;
    println!("Installed {} {} ({})", info.id, info.version, info.phase);
    Ok(())
}

async fn uninstall(config: HostConfig, id: &str) -> Result<()> {
    let manager = Manager::builder().config(one_shot(config)).build()?;
    manager.initialize().await?;
    let removed = manager.uninstall(id).await;
    manager.shutdown().await;

    removed?;
    println!("Uninstalled {id}");
    Ok(())
}

/// Settings for commands that run the host only briefly
fn one_shot(mut config: HostConfig) -> HostConfig {
    config.health.enabled = false;
    config.dev.auto_start = false;
    config
}

fn init_tracing(config: &HostConfig, level: Option<&str>, json: bool) -> Result<()> {
    let level = level.unwrap_or(&config.observability.log_level);
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let json = json || config.observability.json_logs;

    tracing_subscriber::registry()
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
        }))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(filter.into())
                // File watcher internals are noisy at debug
                .add_directive("notify=warn".parse()?),
        )
        .try_init()?;

    Ok(())
}
