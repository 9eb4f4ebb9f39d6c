//! Configuration module for wg-peerd
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use wg_peerd::config::load_config;
//!
//! let config = load_config("/etc/wg-peerd/config.json").unwrap();
//! println!("Managing {} in {}", config.interface.name, config.interface.subnet);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, DriverConfig, InterfaceConfig, LogConfig, PollConfig, StorageConfig,
    MAX_INTERFACE_NAME_LENGTH, MAX_SUBNET_PREFIX, MIN_SUBNET_PREFIX,
};
