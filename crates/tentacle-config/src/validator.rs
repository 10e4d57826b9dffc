//! Configuration validation

use crate::HostConfig;
use tentacle_core::{Error, Result};

/// Validate configuration
pub fn validate_config(config: &HostConfig) -> Result<()> {
    validate_paths(config)?;
    validate_health(config)?;
    validate_recovery(config)?;
    validate_backend(config)?;
    validate_dev(config)?;
    Ok(())
}

fn validate_paths(config: &HostConfig) -> Result<()> {
    if config.paths.data_dir.as_os_str().is_empty() {
        return Err(Error::config("paths.data_dir cannot be empty"));
    }
    if config.paths.state_file() == config.paths.pid_file() {
        return Err(Error::config(
            "paths.state_file and paths.pid_file must differ",
        ));
    }
    Ok(())
}

fn validate_health(config: &HostConfig) -> Result<()> {
    if config.health.interval.is_zero() {
        return Err(Error::config("health.interval must be > 0"));
    }
    if config.health.rpc_timeout.is_zero() {
        return Err(Error::config("health.rpc_timeout must be > 0"));
    }
    if config.health.rpc_timeout >= config.health.interval {
        tracing::warn!(
            interval = ?config.health.interval,
            rpc_timeout = ?config.health.rpc_timeout,
            "Health RPC timeout is not shorter than the check interval"
        );
    }
    Ok(())
}

fn validate_recovery(config: &HostConfig) -> Result<()> {
    let recovery = &config.recovery;
    if recovery.initial_backoff.is_zero() {
        return Err(Error::config("recovery.initial_backoff must be > 0"));
    }
    if recovery.max_backoff < recovery.initial_backoff {
        return Err(Error::config(
            "recovery.max_backoff must be >= recovery.initial_backoff",
        ));
    }
    if recovery.max_attempts == 0 {
        return Err(Error::config("recovery.max_attempts must be >= 1"));
    }
    Ok(())
}

fn validate_backend(config: &HostConfig) -> Result<()> {
    if config.backend.startup_timeout.is_zero() {
        return Err(Error::config("backend.startup_timeout must be > 0"));
    }
    if config.backend.magic_cookie.is_empty() {
        return Err(Error::config("backend.magic_cookie cannot be empty"));
    }
    Ok(())
}

fn validate_dev(config: &HostConfig) -> Result<()> {
    let dev = &config.dev;
    if dev.port_range_start == 0 {
        return Err(Error::config("dev.port_range_start must be > 0"));
    }
    if dev.port_range_end < dev.port_range_start {
        return Err(Error::config(format!(
            "dev port range is empty: {}..={}",
            dev.port_range_start, dev.port_range_end
        )));
    }
    if dev.log_capacity == 0 {
        return Err(Error::config("dev.log_capacity must be > 0"));
    }
    if dev.debounce.is_zero() {
        return Err(Error::config("dev.debounce must be > 0"));
    }
    Ok(())
}
