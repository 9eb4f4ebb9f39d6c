//! Durable peer registry
//!
//! A JSON array of [`PeerRecord`]s, replaced atomically on every save.
//! Records written by older deployments use the short field names `pub`,
//! `ip` and `created` (epoch milliseconds); those are still accepted.
//!
//! An absent or blank file is an empty registry. A file that exists but
//! cannot be read or parsed is an error: callers must not treat it as empty,
//! or the next save would silently forget every peer.

use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::storage::write_atomic;
use crate::error::RegistryError;

/// One registered peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Unique display name
    pub name: String,

    /// Peer public key; identity of the record
    #[serde(alias = "pub")]
    pub public_key: String,

    /// Tunnel address
    #[serde(alias = "ip")]
    pub address: Ipv4Addr,

    /// Creation time, serialized as epoch milliseconds
    #[serde(alias = "created", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Whether traffic is null-routed
    #[serde(default)]
    pub blocked: bool,
}

impl PeerRecord {
    /// Allowed address applied while the peer is active
    pub fn allowed_address(&self) -> String {
        format!("{}/32", self.address)
    }
}

/// File-backed registry
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    path: PathBuf,
}

impl PeerRegistry {
    /// Create a registry backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the registry file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Read` if the file exists but cannot be read,
    /// and `RegistryError::Corrupt` if its contents are not a record list.
    pub fn load(&self) -> Result<Vec<PeerRecord>, RegistryError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::read(&self.path, e)),
        };

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&text).map_err(|e| RegistryError::corrupt(&self.path, e.to_string()))
    }

    /// Replace the registry contents with `records`
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Write` if the file cannot be replaced.
    pub fn save(&self, records: &[PeerRecord]) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| RegistryError::write(&self.path, e.to_string()))?;

        write_atomic(&self.path, json.as_bytes(), None)
            .map_err(|e| RegistryError::write(&self.path, e.to_string()))?;

        debug!(path = %self.path.display(), count = records.len(), "registry saved");
        Ok(())
    }

    /// First record matching `pred`
    ///
    /// # Errors
    ///
    /// Propagates [`PeerRegistry::load`] errors.
    pub fn find<P>(&self, pred: P) -> Result<Option<PeerRecord>, RegistryError>
    where
        P: FnMut(&PeerRecord) -> bool,
    {
        Ok(self.load()?.into_iter().find(pred))
    }
}
