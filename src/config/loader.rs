//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        interface = %config.interface.name,
        subnet = %config.interface.subnet,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// A missing file is not an error here: the defaults plus environment
/// overrides form a complete configuration.
///
/// Environment variables:
/// - `WG_PEERD_INTERFACE`: Override interface name
/// - `WG_PEERD_CONF`: Override interface config file path
/// - `WG_PEERD_SUBNET`: Override tunnel subnet
/// - `WG_PEERD_SERVER_PUB`: Override server public key
/// - `WG_PEERD_ENDPOINT`: Override server endpoint
/// - `WG_PEERD_DNS`: Override client DNS servers
/// - `WG_PEERD_DATA_DIR`: Override data directory
/// - `WG_PEERD_LOG_LEVEL`: Override log level
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        debug!("No configuration at {:?}, using defaults", path);
        Config::default_config()
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Apply overrides from a variable lookup
///
/// Split out from [`load_config_with_env`] so tests do not have to mutate
/// the process environment.
pub(crate) fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(name) = lookup("WG_PEERD_INTERFACE") {
        config.interface.name = name;
        debug!("Interface overridden to {}", config.interface.name);
    }

    if let Some(conf) = lookup("WG_PEERD_CONF") {
        config.interface.config_path = conf.into();
        debug!("Interface config overridden to {:?}", config.interface.config_path);
    }

    if let Some(subnet) = lookup("WG_PEERD_SUBNET") {
        config.interface.subnet = subnet.parse().map_err(|_| ConfigError::EnvError {
            name: "WG_PEERD_SUBNET".into(),
            reason: format!("Invalid IPv4 CIDR: {subnet}"),
        })?;
        debug!("Subnet overridden to {}", config.interface.subnet);
    }

    if let Some(key) = lookup("WG_PEERD_SERVER_PUB") {
        config.interface.server_public_key = key;
    }

    if let Some(endpoint) = lookup("WG_PEERD_ENDPOINT") {
        config.interface.endpoint = endpoint;
    }

    if let Some(dns) = lookup("WG_PEERD_DNS") {
        config.interface.dns = dns;
    }

    if let Some(dir) = lookup("WG_PEERD_DATA_DIR") {
        config.storage.data_dir = dir.into();
        debug!("Data directory overridden to {:?}", config.storage.data_dir);
    }

    if let Some(level) = lookup("WG_PEERD_LOG_LEVEL") {
        config.log.level = level;
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
