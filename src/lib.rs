//! wg-peerd: WireGuard peer registry and runtime reconciliation
//!
//! This crate manages the peers of a single WireGuard interface, keeping the
//! live interface, a durable peer registry and the managed blocks of the
//! interface config file consistent.
//!
//! # Features
//!
//! - **Address Allocation**: Lowest free host address in the tunnel subnet
//! - **Managed Config Blocks**: Marker-delimited `[Peer]` blocks, leaving
//!   hand-written configuration untouched
//! - **Rollback**: Multi-step mutations compensate on partial failure
//! - **Status Polling**: Periodic merge of interface dump and registry with
//!   transfer rates, published over a `watch` channel
//! - **Audit and Repair**: Drift detection across the three stores
//!
//! # Architecture
//!
//! ```text
//! request → PeerManager → allocator → driver → config file → registry
//!                                        ↑
//!            PeerPoller ── dump + registry ──→ StatusSnapshot subscribers
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wg_peerd::config::load_config;
//! use wg_peerd::driver::WgCommandDriver;
//! use wg_peerd::peer::PeerManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/wg-peerd/config.json")?;
//! let driver = Arc::new(WgCommandDriver::from_config(&config.interface, &config.driver));
//! let manager = PeerManager::new(&config, driver);
//!
//! manager.prepare_storage()?;
//! let created = manager.create_peer("laptop").await?;
//! println!("{}", created.bundle.render());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`driver`]: Interface driver trait and implementations
//! - [`error`]: Error types
//! - [`peer`]: Registry, config file blocks, poller and lifecycle engine

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod driver;
pub mod error;
pub mod peer;

// Re-export commonly used types at the crate root
pub use config::{Config, InterfaceConfig, PollConfig, StorageConfig};
pub use driver::{MemoryDriver, PeerAttributes, PeerRuntimeRow, TunnelDriver, WgCommandDriver};
pub use error::{ConfFileError, ConfigError, DriverError, RegistryError};
pub use peer::{PeerError, PeerErrorKind, PeerManager, PeerPoller, PeerRecord, StatusSnapshot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
