//! Periodic status poller
//!
//! Every tick dumps the interface, queries its summary, loads the registry,
//! merges them into a [`StatusSnapshot`] and publishes it on a `watch`
//! channel. Failures degrade the snapshot rather than stopping publication.
//!
//! The poller never takes the engine's mutation lock, so a snapshot may be
//! one mutation behind. It is the only writer of the rate side table.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::rates::RateTracker;
use super::registry::PeerRegistry;
use super::snapshot::{merge_peers, InterfaceSummary, StatusSnapshot};
use crate::config::PollConfig;
use crate::driver::TunnelDriver;

/// Current time as epoch seconds
pub(crate) fn epoch_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

/// Poll loop state
pub struct PeerPoller {
    driver: Arc<dyn TunnelDriver>,
    registry: PeerRegistry,
    interval: Duration,
    online_threshold_secs: u64,
    rates: Mutex<RateTracker>,
    snapshot_tx: watch::Sender<Arc<StatusSnapshot>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PeerPoller {
    /// Create a poller; nothing runs until [`PeerPoller::run`] or
    /// [`PeerPoller::tick`] is called
    pub fn new(driver: Arc<dyn TunnelDriver>, registry: PeerRegistry, config: &PollConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(StatusSnapshot::empty(driver.interface())));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            driver,
            registry,
            interval: config.interval(),
            online_threshold_secs: config.online_threshold_secs,
            rates: Mutex::new(RateTracker::new()),
            snapshot_tx,
            shutdown_tx,
        }
    }

    /// Subscribe to published snapshots
    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Most recently published snapshot
    pub fn latest(&self) -> Arc<StatusSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Sender that stops [`PeerPoller::run`]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Stop [`PeerPoller::run`]
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Build and publish one snapshot
    pub async fn tick(&self) -> Arc<StatusSnapshot> {
        let dump = self.driver.dump_state().await;
        // Rate window starts at the dump; tokio clock, pausable in tests
        let now = tokio::time::Instant::now().into_std();
        let summary = match self.driver.query_interface_summary().await {
            Ok(text) => InterfaceSummary {
                available: true,
                text,
            },
            Err(e) => {
                debug!(error = %e, "interface summary unavailable");
                InterfaceSummary::unavailable()
            }
        };
        let records = self.registry.load();

        let (rows, runtime_error) = match dump {
            Ok(rows) => (rows, None),
            Err(e) => {
                warn!(error = %e, "interface dump failed");
                (Vec::new(), Some(e.to_string()))
            }
        };
        let (records, registry_error) = match records {
            Ok(records) => (records, None),
            Err(e) => {
                warn!(error = %e, "registry load failed");
                (Vec::new(), Some(e.to_string()))
            }
        };

        let mut peers = merge_peers(&records, &rows, epoch_secs(), self.online_threshold_secs);

        {
            let mut rates = self.rates.lock();
            for peer in peers.iter_mut().filter(|p| p.in_runtime) {
                let (rx_rate, tx_rate) = rates.observe(&peer.public_key, peer.rx_bytes, peer.tx_bytes, now);
                peer.rx_rate = rx_rate;
                peer.tx_rate = tx_rate;
            }
            // A failed registry load keeps the table; the peers are not gone
            if registry_error.is_none() {
                let live: HashSet<&str> = records.iter().map(|r| r.public_key.as_str()).collect();
                rates.retain(&live);
            }
        }

        let snapshot = Arc::new(StatusSnapshot {
            interface: self.driver.interface().to_string(),
            summary,
            peers,
            registry_error,
            runtime_error,
            generated_at: Utc::now(),
        });

        trace!(
            peers = snapshot.peers.len(),
            online = snapshot.online_count(),
            "snapshot published"
        );
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// Tick on the configured interval until shut down
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interface = %self.driver.interface(),
            interval_secs = self.interval.as_secs(),
            "poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("poller received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("poller stopped");
    }
}

impl std::fmt::Debug for PeerPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPoller")
            .field("interface", &self.driver.interface())
            .field("registry", &self.registry.path())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
