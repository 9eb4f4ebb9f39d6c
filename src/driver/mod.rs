//! Interface driver abstraction
//!
//! The engine never talks to the tunnel interface directly. Every primitive
//! (key generation, per-peer attribute mutation, state dump, interface
//! up/down) goes through the [`TunnelDriver`] trait so the kernel-backed
//! implementation and the in-memory one are interchangeable.
//!
//! # Implementations
//!
//! - [`WgCommandDriver`]: runs `wg` / `wg-quick`, each call bounded by a timeout
//! - [`MemoryDriver`]: in-process interface with failure injection

pub mod keys;
pub mod memory;
pub mod wg;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

pub use keys::{derive_public_key, generate_preshared_key, generate_private_key, KeyPair};
pub use memory::{DriverOp, MemoryDriver};
pub use wg::{parse_dump, WgCommandDriver};

/// One peer line of the interface dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRuntimeRow {
    /// Peer public key
    pub public_key: String,
    /// Last seen remote endpoint
    pub endpoint: Option<String>,
    /// Allowed addresses in CIDR notation
    pub allowed_addresses: Vec<String>,
    /// Unix seconds of the latest handshake, 0 if none
    pub latest_handshake: u64,
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
}

/// Attributes applied to a peer on the live interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAttributes {
    /// Pre-shared key; `None` leaves the current one untouched
    pub preshared_key: Option<String>,
    /// Replacement allowed addresses
    pub allowed_addresses: Vec<String>,
}

impl PeerAttributes {
    /// Attributes that only replace the allowed addresses
    pub fn allowed_only(allowed: impl Into<String>) -> Self {
        Self {
            preshared_key: None,
            allowed_addresses: vec![allowed.into()],
        }
    }
}

/// Primitive operations on the tunnel interface
///
/// Implementations may block on external processes; callers treat every
/// error as a failed primitive and never retry automatically.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Interface this driver controls
    fn interface(&self) -> &str;

    /// Generate a fresh private/public key pair
    async fn generate_key_pair(&self) -> Result<KeyPair, DriverError>;

    /// Generate a fresh pre-shared key
    async fn generate_preshared_key(&self) -> Result<String, DriverError>;

    /// Create or update a peer on the live interface
    async fn set_peer_attributes(
        &self,
        public_key: &str,
        attrs: &PeerAttributes,
    ) -> Result<(), DriverError>;

    /// Remove a peer from the live interface
    async fn remove_peer(&self, public_key: &str) -> Result<(), DriverError>;

    /// Dump the live peer table
    async fn dump_state(&self) -> Result<Vec<PeerRuntimeRow>, DriverError>;

    /// Bring the interface up from its config file
    async fn bring_up(&self) -> Result<(), DriverError>;

    /// Take the interface down
    async fn bring_down(&self) -> Result<(), DriverError>;

    /// Human-readable interface status
    async fn query_interface_summary(&self) -> Result<String, DriverError>;
}
