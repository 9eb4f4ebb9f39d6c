//! Peer management
//!
//! This module keeps the peers of one tunnel interface consistent across the
//! live interface, the durable registry and the interface config file.
//!
//! # Submodules
//!
//! - [`validation`]: Input validation for peer operations
//! - [`ip_allocator`]: Tunnel address allocation
//! - [`conf_file`]: Managed blocks in the interface config file
//! - [`registry`]: Durable peer records
//! - [`client_config`]: Client credential bundles
//! - [`rates`]: Transfer rate side table
//! - [`snapshot`]: Published status types
//! - [`poller`]: Periodic status poller
//! - [`manager`]: `PeerManager` lifecycle engine

pub mod client_config;
pub mod conf_file;
pub mod ip_allocator;
pub mod manager;
pub mod poller;
pub mod rates;
pub mod registry;
pub mod snapshot;
mod storage;
pub mod validation;

// Re-export commonly used types from validation
pub use validation::{validate_endpoint, validate_peer_name, validate_wg_key, ValidationError, WG_KEY_LENGTH};

// Re-export PeerManager and related types
pub use manager::{
    BlockMismatch, CreatedPeer, DriftReport, OrphanBlock, PeerError, PeerErrorKind, PeerManager,
    PeerOutcome, RepairReport,
};

pub use client_config::ClientBundle;
pub use conf_file::{ConfFile, ConfigBlock};
pub use ip_allocator::{allocate, IpAllocatorError};
pub use poller::PeerPoller;
pub use rates::RateTracker;
pub use registry::{PeerRecord, PeerRegistry};
pub use snapshot::{InterfaceSummary, PeerSnapshot, StatusSnapshot};
