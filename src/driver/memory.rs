//! In-memory interface driver
//!
//! Keeps a peer table in process memory with the same semantics as the
//! kernel interface: setting attributes creates or updates a peer, the dump
//! lists every peer, and a down interface rejects everything except
//! `bring_up`. Individual primitives can be made to fail or to take time so
//! rollback paths and slow commands can be exercised.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::keys::{generate_preshared_key, KeyPair};
use super::{PeerAttributes, PeerRuntimeRow, TunnelDriver};
use crate::error::DriverError;

/// Primitive that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriverOp {
    /// `set_peer_attributes`
    SetPeer,
    /// `remove_peer`
    RemovePeer,
    /// `dump_state`
    Dump,
    /// `bring_up`
    BringUp,
    /// `bring_down`
    BringDown,
    /// `query_interface_summary`
    Summary,
    /// `generate_key_pair` and `generate_preshared_key`
    Keys,
}

#[derive(Debug, Clone)]
struct MemoryPeer {
    preshared_key: Option<String>,
    row: PeerRuntimeRow,
}

#[derive(Debug)]
struct MemoryState {
    up: bool,
    peers: BTreeMap<String, MemoryPeer>,
    failing: Vec<DriverOp>,
    delays: BTreeMap<DriverOp, Duration>,
    calls: Vec<DriverOp>,
}

/// In-process [`TunnelDriver`]
#[derive(Debug)]
pub struct MemoryDriver {
    interface: String,
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    /// Create a driver for an interface that is already up
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            state: Mutex::new(MemoryState {
                up: true,
                peers: BTreeMap::new(),
                failing: Vec::new(),
                delays: BTreeMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Make `op` fail until [`MemoryDriver::clear_failures`] is called
    pub fn fail(&self, op: DriverOp) {
        let mut state = self.state.lock();
        if !state.failing.contains(&op) {
            state.failing.push(op);
        }
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Make `op` take `delay` before it runs; `Duration::ZERO` clears it
    pub fn set_delay(&self, op: DriverOp, delay: Duration) {
        let mut state = self.state.lock();
        if delay.is_zero() {
            state.delays.remove(&op);
        } else {
            state.delays.insert(op, delay);
        }
    }

    /// Whether the interface is up
    pub fn is_up(&self) -> bool {
        self.state.lock().up
    }

    /// Runtime row for a peer, if present
    pub fn peer(&self, public_key: &str) -> Option<PeerRuntimeRow> {
        self.state.lock().peers.get(public_key).map(|p| p.row.clone())
    }

    /// Pre-shared key currently set for a peer
    pub fn preshared_key(&self, public_key: &str) -> Option<String> {
        self.state
            .lock()
            .peers
            .get(public_key)
            .and_then(|p| p.preshared_key.clone())
    }

    /// Number of peers on the interface
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Overwrite traffic counters and handshake time for a peer
    pub fn set_transfer(&self, public_key: &str, rx_bytes: u64, tx_bytes: u64, latest_handshake: u64) {
        if let Some(peer) = self.state.lock().peers.get_mut(public_key) {
            peer.row.rx_bytes = rx_bytes;
            peer.row.tx_bytes = tx_bytes;
            peer.row.latest_handshake = latest_handshake;
        }
    }

    /// Add a peer that was configured outside of the engine
    pub fn insert_peer(&self, row: PeerRuntimeRow) {
        self.state.lock().peers.insert(
            row.public_key.clone(),
            MemoryPeer {
                preshared_key: None,
                row,
            },
        );
    }

    /// Number of calls made to `op`, failed calls included
    pub fn call_count(&self, op: DriverOp) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    async fn pause(&self, op: DriverOp) {
        let delay = self.state.lock().delays.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn enter(&self, op: DriverOp) -> Result<parking_lot::MutexGuard<'_, MemoryState>, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(op);

        if state.failing.contains(&op) {
            return Err(DriverError::command_failed(
                format!("memory {op:?}"),
                "injected",
                "injected failure",
            ));
        }

        let needs_up = !matches!(op, DriverOp::BringUp | DriverOp::Keys);
        if needs_up && !state.up {
            return Err(DriverError::InterfaceDown(self.interface.clone()));
        }

        Ok(state)
    }
}

#[async_trait]
impl TunnelDriver for MemoryDriver {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn generate_key_pair(&self) -> Result<KeyPair, DriverError> {
        self.pause(DriverOp::Keys).await;
        drop(self.enter(DriverOp::Keys)?);
        KeyPair::generate()
    }

    async fn generate_preshared_key(&self) -> Result<String, DriverError> {
        self.pause(DriverOp::Keys).await;
        drop(self.enter(DriverOp::Keys)?);
        Ok(generate_preshared_key())
    }

    async fn set_peer_attributes(
        &self,
        public_key: &str,
        attrs: &PeerAttributes,
    ) -> Result<(), DriverError> {
        self.pause(DriverOp::SetPeer).await;
        let mut state = self.enter(DriverOp::SetPeer)?;
        // A prefix belongs to one peer; assigning it moves it
        for other in state.peers.values_mut().filter(|p| p.row.public_key != public_key) {
            other
                .row
                .allowed_addresses
                .retain(|a| !attrs.allowed_addresses.contains(a));
        }
        let peer = state
            .peers
            .entry(public_key.to_string())
            .or_insert_with(|| MemoryPeer {
                preshared_key: None,
                row: PeerRuntimeRow {
                    public_key: public_key.to_string(),
                    endpoint: None,
                    allowed_addresses: Vec::new(),
                    latest_handshake: 0,
                    rx_bytes: 0,
                    tx_bytes: 0,
                },
            });

        if let Some(psk) = &attrs.preshared_key {
            peer.preshared_key = Some(psk.clone());
        }
        peer.row.allowed_addresses = attrs.allowed_addresses.clone();
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), DriverError> {
        self.pause(DriverOp::RemovePeer).await;
        let mut state = self.enter(DriverOp::RemovePeer)?;
        state.peers.remove(public_key);
        Ok(())
    }

    async fn dump_state(&self) -> Result<Vec<PeerRuntimeRow>, DriverError> {
        self.pause(DriverOp::Dump).await;
        let state = self.enter(DriverOp::Dump)?;
        Ok(state.peers.values().map(|p| p.row.clone()).collect())
    }

    async fn bring_up(&self) -> Result<(), DriverError> {
        self.pause(DriverOp::BringUp).await;
        let mut state = self.enter(DriverOp::BringUp)?;
        state.up = true;
        Ok(())
    }

    async fn bring_down(&self) -> Result<(), DriverError> {
        self.pause(DriverOp::BringDown).await;
        let mut state = self.enter(DriverOp::BringDown)?;
        state.up = false;
        // Peers come back from the config file on up with fresh counters
        for peer in state.peers.values_mut() {
            peer.row.latest_handshake = 0;
            peer.row.rx_bytes = 0;
            peer.row.tx_bytes = 0;
        }
        Ok(())
    }

    async fn query_interface_summary(&self) -> Result<String, DriverError> {
        self.pause(DriverOp::Summary).await;
        let state = self.enter(DriverOp::Summary)?;
        Ok(format!(
            "interface: {}\n  peers: {}",
            self.interface,
            state.peers.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_dump() {
        let driver = MemoryDriver::new("wg0");
        driver
            .set_peer_attributes(
                "pub-a",
                &PeerAttributes {
                    preshared_key: Some("psk".into()),
                    allowed_addresses: vec!["10.0.70.2/32".into()],
                },
            )
            .await
            .unwrap();

        let rows = driver.dump_state().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].allowed_addresses, vec!["10.0.70.2/32".to_string()]);
        assert_eq!(driver.preshared_key("pub-a").as_deref(), Some("psk"));

        // Updating allowed addresses keeps the pre-shared key
        driver
            .set_peer_attributes("pub-a", &PeerAttributes::allowed_only("0.0.0.0/32"))
            .await
            .unwrap();
        assert_eq!(driver.preshared_key("pub-a").as_deref(), Some("psk"));
        assert_eq!(
            driver.peer("pub-a").unwrap().allowed_addresses,
            vec!["0.0.0.0/32".to_string()]
        );
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let driver = MemoryDriver::new("wg0");
        driver.fail(DriverOp::SetPeer);
        let result = driver
            .set_peer_attributes("pub-a", &PeerAttributes::allowed_only("10.0.70.2/32"))
            .await;
        assert!(result.is_err());
        assert_eq!(driver.peer_count(), 0);
        assert_eq!(driver.call_count(DriverOp::SetPeer), 1);

        driver.clear_failures();
        assert!(driver
            .set_peer_attributes("pub-a", &PeerAttributes::allowed_only("10.0.70.2/32"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_down_interface_rejects_queries() {
        let driver = MemoryDriver::new("wg0");
        driver
            .set_peer_attributes("pub-a", &PeerAttributes::allowed_only("10.0.70.2/32"))
            .await
            .unwrap();
        driver.set_transfer("pub-a", 10, 20, 30);
        driver.bring_down().await.unwrap();
        assert!(!driver.is_up());
        assert!(matches!(
            driver.dump_state().await,
            Err(DriverError::InterfaceDown(_))
        ));
        // Keys do not need the interface
        assert!(driver.generate_key_pair().await.is_ok());

        driver.bring_up().await.unwrap();
        let rows = driver.dump_state().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].rx_bytes, rows[0].tx_bytes, rows[0].latest_handshake), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_prefix_moves_between_peers() {
        let driver = MemoryDriver::new("wg0");
        for key in ["pub-a", "pub-b"] {
            driver
                .set_peer_attributes(key, &PeerAttributes::allowed_only("0.0.0.0/32"))
                .await
                .unwrap();
        }

        assert!(driver.peer("pub-a").unwrap().allowed_addresses.is_empty());
        assert_eq!(
            driver.peer("pub-b").unwrap().allowed_addresses,
            vec!["0.0.0.0/32".to_string()]
        );
    }
}
