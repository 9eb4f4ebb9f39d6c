//! Configuration types for wg-peerd
//!
//! This module defines all configuration structures used by the daemon.
//! Configuration is loaded from JSON files and validated at startup.
//! Every section has defaults so an empty object is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum interface name length (IFNAMSIZ - 1 on Linux)
pub const MAX_INTERFACE_NAME_LENGTH: usize = 15;

/// Smallest accepted subnet prefix
pub const MIN_SUBNET_PREFIX: u8 = 16;

/// Largest accepted subnet prefix (a /31 has no room for peers)
pub const MAX_SUBNET_PREFIX: u8 = 30;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Tunnel interface settings
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// On-disk state locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// External command settings
    #[serde(default)]
    pub driver: DriverConfig,

    /// Poll loop settings
    #[serde(default)]
    pub poll: PollConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interface.validate()?;
        self.storage.validate()?;
        self.driver.validate()?;
        self.poll.validate()?;
        Ok(())
    }

    /// Create a default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Tunnel interface configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceConfig {
    /// Interface name (e.g., "wg0")
    #[serde(default = "default_interface_name")]
    pub name: String,

    /// Path to the interface config file read by `wg-quick`
    #[serde(default = "default_interface_config_path")]
    pub config_path: PathBuf,

    /// Tunnel subnet peers are allocated from
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Net,

    /// Server public key handed to clients
    #[serde(default)]
    pub server_public_key: String,

    /// Server endpoint handed to clients (host:port)
    #[serde(default)]
    pub endpoint: String,

    /// DNS servers handed to clients (comma-separated)
    #[serde(default = "default_dns")]
    pub dns: String,

    /// Tag used in the managed block marker lines
    #[serde(default = "default_block_marker")]
    pub block_marker: String,
}

impl InterfaceConfig {
    /// Validate interface configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "Interface name cannot be empty".into(),
            ));
        }

        if self.name.len() > MAX_INTERFACE_NAME_LENGTH {
            return Err(ConfigError::ValidationError(format!(
                "Interface name '{}' too long (max {MAX_INTERFACE_NAME_LENGTH} chars)",
                self.name
            )));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ConfigError::ValidationError(format!(
                "Interface name '{}' contains invalid characters",
                self.name
            )));
        }

        if self.config_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Interface config_path cannot be empty".into(),
            ));
        }

        let prefix = self.subnet.prefix_len();
        if !(MIN_SUBNET_PREFIX..=MAX_SUBNET_PREFIX).contains(&prefix) {
            return Err(ConfigError::ValidationError(format!(
                "Subnet {} must have a prefix between /{MIN_SUBNET_PREFIX} and /{MAX_SUBNET_PREFIX}",
                self.subnet
            )));
        }

        if self.block_marker.is_empty()
            || !self
                .block_marker
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::ValidationError(format!(
                "Block marker '{}' must be non-empty and alphanumeric (-, _ allowed)",
                self.block_marker
            )));
        }

        Ok(())
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            config_path: default_interface_config_path(),
            subnet: default_subnet(),
            server_public_key: String::new(),
            endpoint: String::new(),
            dns: default_dns(),
            block_marker: default_block_marker(),
        }
    }
}

/// On-disk state configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Base data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Registry file (defaults to `<data_dir>/peers.json`)
    #[serde(default)]
    pub registry_path: Option<PathBuf>,

    /// Client config directory (defaults to `<data_dir>/clients`)
    #[serde(default)]
    pub clients_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Validate storage configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Storage data_dir cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Effective registry file path
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("peers.json"))
    }

    /// Effective client config directory
    #[must_use]
    pub fn clients_dir(&self) -> PathBuf {
        self.clients_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("clients"))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            registry_path: None,
            clients_dir: None,
        }
    }
}

/// External command configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    /// `wg` binary
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,

    /// `wg-quick` binary
    #[serde(default = "default_wg_quick_binary")]
    pub wg_quick_binary: String,

    /// Timeout for each external command in seconds
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl DriverConfig {
    /// Validate driver configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wg_binary.is_empty() || self.wg_quick_binary.is_empty() {
            return Err(ConfigError::ValidationError(
                "wg_binary and wg_quick_binary cannot be empty".into(),
            ));
        }

        if self.command_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "command_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get command timeout as Duration
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            wg_binary: default_wg_binary(),
            wg_quick_binary: default_wg_quick_binary(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// Poll loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    /// Seconds between polls
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,

    /// A peer is online if its last handshake is younger than this
    #[serde(default = "default_online_threshold_secs")]
    pub online_threshold_secs: u64,
}

impl PollConfig {
    /// Validate poll configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "poll interval_secs must be greater than 0".into(),
            ));
        }

        if self.online_threshold_secs == 0 {
            return Err(ConfigError::ValidationError(
                "online_threshold_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get poll interval as Duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            online_threshold_secs: default_online_threshold_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

fn default_interface_name() -> String {
    "wg0".into()
}

fn default_interface_config_path() -> PathBuf {
    PathBuf::from("/etc/wireguard/wg0.conf")
}

fn default_subnet() -> Ipv4Net {
    Ipv4Net::new_assert(std::net::Ipv4Addr::new(10, 0, 70, 0), 24)
}

fn default_dns() -> String {
    "1.1.1.1,8.8.8.8".into()
}

fn default_block_marker() -> String {
    "WG-DASHBOARD".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/opt/wg-peerd/data")
}

fn default_wg_binary() -> String {
    "wg".into()
}

fn default_wg_quick_binary() -> String {
    "wg-quick".into()
}

const fn default_command_timeout_secs() -> u64 {
    10
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_online_threshold_secs() -> u64 {
    180
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_true() -> bool {
    true
}
