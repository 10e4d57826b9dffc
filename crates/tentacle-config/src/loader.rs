//! Configuration loading

use crate::{ConfigFormat, HostConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::fs;
use std::path::Path;
use tentacle_core::{Error, Result};

static ENV_VAR: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").ok());

/// Load configuration from a file without validating it
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    let path = path.as_ref();

    let content = fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand `${VAR}` and `${VAR:-default}` references
fn expand_env_vars(content: &str) -> Result<String> {
    let re = ENV_VAR
        .as_ref()
        .ok_or_else(|| Error::internal("invalid env expansion pattern"))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        let value = match env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(3) {
                Some(default) => default.as_str().to_string(),
                None => {
                    return Err(Error::config(format!(
                        "Environment variable '{var_name}' not set and no default provided"
                    )));
                }
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string without validating it
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<HostConfig> {
    let expanded = expand_env_vars(content)?;

    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded)
            .map_err(|e| Error::config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded)
            .map_err(|e| Error::config(format!("Failed to parse JSON: {e}")))?,
    };

    Ok(config)
}

/// Load a file and validate the result
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    let path = path.as_ref();
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    tracing::debug!(path = %path.display(), "Loaded host configuration");
    Ok(config)
}
