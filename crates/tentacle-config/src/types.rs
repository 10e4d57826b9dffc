//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tentacle_core::RetryPolicy;

/// Main host configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Periodic health checking
    #[serde(default)]
    pub health: HealthConfig,

    /// Crash recovery backoff
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Out-of-process backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Developer mode
    #[serde(default)]
    pub dev: DevConfig,

    /// Observability
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            backend: BackendConfig::default(),
            dev: DevConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl HostConfig {
    /// Configuration with every path rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: PathsConfig {
                data_dir: data_dir.into(),
                ..PathsConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Filesystem locations.
///
/// Unset paths are resolved relative to `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root directory for host data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Installed plugin packages (default: `<data_dir>/plugins`)
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,

    /// Persisted lifecycle state (default: `<data_dir>/plugin_state.json`)
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Running plugin PIDs (default: `<data_dir>/plugin_pids.json`)
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Handshake files of externally-run dev plugins (default: `<data_dir>/dev`)
    #[serde(default)]
    pub dev_handshake_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            plugins_dir: None,
            state_file: None,
            pid_file: None,
            dev_handshake_dir: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".tentacle")
}

impl PathsConfig {
    fn resolve(&self, explicit: &Option<PathBuf>, default: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.data_dir.join(default))
    }

    /// Root data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Resolved plugins directory
    pub fn plugins_dir(&self) -> PathBuf {
        self.resolve(&self.plugins_dir, "plugins")
    }

    /// Resolved state file
    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.state_file, "plugin_state.json")
    }

    /// Resolved PID file
    pub fn pid_file(&self) -> PathBuf {
        self.resolve(&self.pid_file, "plugin_pids.json")
    }

    /// Resolved dev handshake directory
    pub fn dev_handshake_dir(&self) -> PathBuf {
        self.resolve(&self.dev_handshake_dir, "dev")
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Run the periodic health checker
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between health sweeps
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single health RPC
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            rpc_timeout: default_rpc_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Crash recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// Delay before the first restart attempt
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Maximum delay between attempts
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Attempts before the plugin is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RecoveryConfig {
    /// As a [`RetryPolicy`]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            max_attempts: self.max_attempts,
        }
    }
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    5
}

/// Out-of-process backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Time allowed for a plugin to print its handshake line
    #[serde(default = "default_startup_timeout", with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Time between graceful stop and forced kill
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Value of the cookie env var passed to plugin processes
    #[serde(default = "default_magic_cookie")]
    pub magic_cookie: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            startup_timeout: default_startup_timeout(),
            stop_grace: default_stop_grace(),
            magic_cookie: default_magic_cookie(),
        }
    }
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_magic_cookie() -> String {
    "d9a3c5f0-tentacle-plugin".to_string()
}

/// Developer mode configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevConfig {
    /// Start dev servers for dev-mode plugins at boot
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Go toolchain binary
    #[serde(default = "default_go_path")]
    pub go_path: PathBuf,

    /// Node.js binary
    #[serde(default = "default_node_path")]
    pub node_path: PathBuf,

    /// Package manager used for the front end (npm, pnpm, yarn)
    #[serde(default = "default_package_manager")]
    pub package_manager: PathBuf,

    /// First port handed to front-end dev servers
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port (inclusive) handed to front-end dev servers
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Quiet period after a source change before rebuilding
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,

    /// Lines of output kept per dev-server process
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Time between graceful terminate and forced kill of a dev server
    #[serde(default = "default_dev_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Liveness check interval for externally-run plugins
    #[serde(default = "default_external_liveness_interval", with = "humantime_serde")]
    pub external_liveness_interval: Duration,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            go_path: default_go_path(),
            node_path: default_node_path(),
            package_manager: default_package_manager(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            debounce: default_debounce(),
            log_capacity: default_log_capacity(),
            stop_grace: default_dev_stop_grace(),
            external_liveness_interval: default_external_liveness_interval(),
        }
    }
}

fn default_go_path() -> PathBuf {
    PathBuf::from("go")
}

fn default_node_path() -> PathBuf {
    PathBuf::from("node")
}

fn default_package_manager() -> PathBuf {
    PathBuf::from("npm")
}

fn default_port_range_start() -> u16 {
    15173
}

fn default_port_range_end() -> u16 {
    15273
}

fn default_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_log_capacity() -> usize {
    1000
}

fn default_dev_stop_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_external_liveness_interval() -> Duration {
    Duration::from_secs(2)
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
