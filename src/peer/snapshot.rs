//! Published peer status
//!
//! A [`StatusSnapshot`] is the merge of registry records with one interface
//! dump. Only registered peers are listed; runtime peers the daemon does not
//! manage are left out.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::registry::PeerRecord;
use crate::driver::PeerRuntimeRow;

/// Allowed address applied to blocked peers
pub const BLOCKED_ALLOWED_ADDRESS: &str = "0.0.0.0/32";

/// Whether runtime allowed addresses match a blocked peer
///
/// Every blocked peer is assigned the same null route, and an interface
/// keeps each prefix on one peer only, so all but the last blocked peer
/// end up with no allowed addresses at all.
pub fn is_null_routed(allowed_addresses: &[String]) -> bool {
    match allowed_addresses {
        [] => true,
        [only] => only == BLOCKED_ALLOWED_ADDRESS,
        _ => false,
    }
}

/// Summary text published when the interface cannot be queried
pub const INTERFACE_UNAVAILABLE: &str = "unavailable";

/// Whether a handshake at `latest_handshake` counts as online at `now`
///
/// Both are epoch seconds; 0 means no handshake has happened.
pub fn is_online(latest_handshake: u64, now: u64, threshold_secs: u64) -> bool {
    latest_handshake > 0 && now.saturating_sub(latest_handshake) < threshold_secs
}

/// One registered peer with its runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    /// Display name
    pub name: String,
    /// Public key
    pub public_key: String,
    /// Registry address
    pub address: Ipv4Addr,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Registry block flag
    pub blocked: bool,
    /// Last remote endpoint
    pub endpoint: Option<String>,
    /// Registry address as `address/32`
    pub allowed_addresses: Vec<String>,
    /// Allowed addresses as reported by the interface
    pub runtime_allowed_addresses: Vec<String>,
    /// Whether the interface dump listed the peer
    pub in_runtime: bool,
    /// Epoch seconds of the latest handshake, 0 if none
    pub latest_handshake: u64,
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes sent
    pub tx_bytes: u64,
    /// Receive rate in bytes/sec
    pub rx_rate: f64,
    /// Send rate in bytes/sec
    pub tx_rate: f64,
    /// Handshake within the online threshold
    pub online: bool,
}

impl PeerSnapshot {
    /// Merge a record with its dump row, if any
    ///
    /// Rates start at zero; the poller fills them in.
    pub fn merge(record: &PeerRecord, row: Option<&PeerRuntimeRow>, now: u64, threshold_secs: u64) -> Self {
        let latest_handshake = row.map_or(0, |r| r.latest_handshake);
        Self {
            name: record.name.clone(),
            public_key: record.public_key.clone(),
            address: record.address,
            created_at: record.created_at,
            blocked: record.blocked,
            endpoint: row.and_then(|r| r.endpoint.clone()),
            allowed_addresses: vec![record.allowed_address()],
            runtime_allowed_addresses: row.map(|r| r.allowed_addresses.clone()).unwrap_or_default(),
            in_runtime: row.is_some(),
            latest_handshake,
            rx_bytes: row.map_or(0, |r| r.rx_bytes),
            tx_bytes: row.map_or(0, |r| r.tx_bytes),
            rx_rate: 0.0,
            tx_rate: 0.0,
            online: is_online(latest_handshake, now, threshold_secs),
        }
    }
}

/// Merge registry records with dump rows, in registry order
pub fn merge_peers(
    records: &[PeerRecord],
    rows: &[PeerRuntimeRow],
    now: u64,
    threshold_secs: u64,
) -> Vec<PeerSnapshot> {
    let by_key: HashMap<&str, &PeerRuntimeRow> =
        rows.iter().map(|r| (r.public_key.as_str(), r)).collect();

    records
        .iter()
        .map(|record| {
            let row = by_key.get(record.public_key.as_str()).copied();
            PeerSnapshot::merge(record, row, now, threshold_secs)
        })
        .collect()
}

/// Interface status text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSummary {
    /// Whether the summary query succeeded
    pub available: bool,
    /// `wg show` output, or [`INTERFACE_UNAVAILABLE`]
    pub text: String,
}

impl InterfaceSummary {
    /// Summary for an interface that could not be queried
    pub fn unavailable() -> Self {
        Self {
            available: false,
            text: INTERFACE_UNAVAILABLE.to_string(),
        }
    }
}

/// Everything published on one poll tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Interface name
    pub interface: String,
    /// Interface status text
    pub summary: InterfaceSummary,
    /// Registered peers
    pub peers: Vec<PeerSnapshot>,
    /// Set when the registry could not be loaded
    pub registry_error: Option<String>,
    /// Set when the interface dump failed
    pub runtime_error: Option<String>,
    /// When the snapshot was built
    pub generated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Snapshot published before the first tick
    pub fn empty(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            summary: InterfaceSummary::unavailable(),
            peers: Vec::new(),
            registry_error: None,
            runtime_error: None,
            generated_at: Utc::now(),
        }
    }

    /// Peer by public key
    pub fn peer(&self, public_key: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }

    /// Number of online peers
    pub fn online_count(&self) -> usize {
        self.peers.iter().filter(|p| p.online).count()
    }
}
