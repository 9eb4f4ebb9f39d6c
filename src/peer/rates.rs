//! Transfer rate side table
//!
//! Keeps the previous counter sample per public key so two successive dumps
//! give a bytes-per-second rate. State lives only in memory and starts empty
//! after a restart.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Shortest interval a rate is computed over
pub const MIN_RATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Sample {
    rx_bytes: u64,
    tx_bytes: u64,
    at: Instant,
}

/// Per-peer previous counter samples
#[derive(Debug, Default)]
pub struct RateTracker {
    samples: HashMap<String, Sample>,
}

impl RateTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record counters for a peer and return `(rx_rate, tx_rate)` in bytes/sec
    ///
    /// The first sample for a key yields zero. Counters that went backwards
    /// (interface restart) yield zero instead of a negative rate.
    pub fn observe(&mut self, public_key: &str, rx_bytes: u64, tx_bytes: u64, now: Instant) -> (f64, f64) {
        let current = Sample {
            rx_bytes,
            tx_bytes,
            at: now,
        };

        let rates = match self.samples.get(public_key) {
            Some(prev) => {
                let elapsed = now
                    .saturating_duration_since(prev.at)
                    .max(MIN_RATE_INTERVAL)
                    .as_secs_f64();
                (
                    rx_bytes.saturating_sub(prev.rx_bytes) as f64 / elapsed,
                    tx_bytes.saturating_sub(prev.tx_bytes) as f64 / elapsed,
                )
            }
            None => (0.0, 0.0),
        };

        self.samples.insert(public_key.to_string(), current);
        rates
    }

    /// Drop samples for keys not in `keep`
    pub fn retain(&mut self, keep: &HashSet<&str>) {
        self.samples.retain(|key, _| keep.contains(key.as_str()));
    }

    /// Number of tracked peers
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no peer is tracked
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
