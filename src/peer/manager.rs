//! `PeerManager` - peer lifecycle across runtime, registry and config file
//!
//! Each peer exists in three places that have to agree:
//!
//! - the live interface (driver), which carries traffic
//! - the registry, which remembers names, addresses and block state
//! - a managed block in the interface config file, which `wg-quick up`
//!   reads on the next start
//!
//! Every mutation is an ordered list of steps. A step that fails after
//! earlier steps took effect either compensates (undoing what it can, best
//! effort) or, where the inconsistency is harmless and repairable, leaves it
//! for [`PeerManager::repair`].
//!
//! # Locking
//!
//! All mutations hold one async mutex for their whole duration, so registry
//! read-modify-write cycles and config file rewrites never interleave. The
//! poller never takes it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wg_peerd::config::Config;
//! use wg_peerd::driver::MemoryDriver;
//! use wg_peerd::peer::PeerManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let manager = PeerManager::new(&config, Arc::new(MemoryDriver::new("wg0")));
//!
//! let created = manager.create_peer("alice").await?;
//! println!("{}", created.bundle.render());
//!
//! manager.block_peer(&created.record.public_key).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::client_config::{client_config_path, write_client_config, ClientBundle};
use super::conf_file::{ConfFile, ConfigBlock};
use super::ip_allocator::{allocate, IpAllocatorError};
use super::poller::{epoch_secs, PeerPoller};
use super::registry::{PeerRecord, PeerRegistry};
use super::snapshot::{
    is_null_routed, merge_peers, PeerSnapshot, StatusSnapshot, BLOCKED_ALLOWED_ADDRESS,
};
use super::validation::{validate_peer_name, ValidationError};
use crate::config::{Config, InterfaceConfig};
use crate::driver::{PeerAttributes, PeerRuntimeRow, TunnelDriver};
use crate::error::{ConfFileError, DriverError, RegistryError};

/// Machine-readable error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerErrorKind {
    /// Name failed validation
    InvalidName,
    /// Another peer has the name
    NameExists,
    /// No peer with the key (or no client config for it)
    NotFound,
    /// Subnet has no free address
    NoFreeAddress,
    /// Driver mutation failed
    RuntimeApplyFailed,
    /// Driver query failed
    RuntimeQueryFailed,
    /// Config file or client config could not be written
    PersistFailed,
    /// Registry could not be written
    RegistryWriteFailed,
    /// Registry could not be read
    RegistryReadFailed,
    /// Config file could not be read
    ConfFileReadFailed,
}

impl PeerErrorKind {
    /// `snake_case` name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidName => "invalid_name",
            Self::NameExists => "name_exists",
            Self::NotFound => "not_found",
            Self::NoFreeAddress => "no_free_address",
            Self::RuntimeApplyFailed => "runtime_apply_failed",
            Self::RuntimeQueryFailed => "runtime_query_failed",
            Self::PersistFailed => "persist_failed",
            Self::RegistryWriteFailed => "registry_write_failed",
            Self::RegistryReadFailed => "registry_read_failed",
            Self::ConfFileReadFailed => "conf_file_read_failed",
        }
    }
}

impl fmt::Display for PeerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for peer operations
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Name failed validation
    #[error("Invalid peer name: {0}")]
    InvalidName(#[from] ValidationError),

    /// Name already registered
    #[error("Peer name already exists: {0}")]
    NameExists(String),

    /// Peer not registered
    #[error("Peer not found: {0}")]
    NotFound(String),

    /// IP allocation exhausted
    #[error("{0}")]
    NoFreeAddress(#[from] IpAllocatorError),

    /// Driver mutation failed
    #[error("Failed to apply runtime state: {0}")]
    RuntimeApplyFailed(#[source] DriverError),

    /// Driver query failed
    #[error("Failed to query runtime state: {0}")]
    RuntimeQueryFailed(#[source] DriverError),

    /// Persisting failed after the runtime was changed
    #[error("Failed to persist peer: {reason}")]
    PersistFailed {
        /// What failed
        reason: String,
        /// Set when compensation failed too
        compensation_warning: Option<String>,
    },

    /// Registry write failed
    #[error("Failed to write registry: {0}")]
    RegistryWriteFailed(#[source] RegistryError),

    /// Registry read failed; mutations refuse to continue
    #[error("Failed to read registry: {0}")]
    RegistryReadFailed(#[source] RegistryError),

    /// Config file read failed
    #[error("Failed to read interface config: {0}")]
    ConfFileReadFailed(#[source] ConfFileError),
}

impl PeerError {
    /// Machine-readable category
    pub const fn kind(&self) -> PeerErrorKind {
        match self {
            Self::InvalidName(_) => PeerErrorKind::InvalidName,
            Self::NameExists(_) => PeerErrorKind::NameExists,
            Self::NotFound(_) => PeerErrorKind::NotFound,
            Self::NoFreeAddress(_) => PeerErrorKind::NoFreeAddress,
            Self::RuntimeApplyFailed(_) => PeerErrorKind::RuntimeApplyFailed,
            Self::RuntimeQueryFailed(_) => PeerErrorKind::RuntimeQueryFailed,
            Self::PersistFailed { .. } => PeerErrorKind::PersistFailed,
            Self::RegistryWriteFailed(_) => PeerErrorKind::RegistryWriteFailed,
            Self::RegistryReadFailed(_) => PeerErrorKind::RegistryReadFailed,
            Self::ConfFileReadFailed(_) => PeerErrorKind::ConfFileReadFailed,
        }
    }

    /// Human-readable detail
    pub fn detail(&self) -> String {
        self.to_string()
    }

    /// Warnings attached to the error
    pub fn warnings(&self) -> Vec<String> {
        match self {
            Self::PersistFailed {
                compensation_warning: Some(w),
                ..
            } => vec![w.clone()],
            _ => Vec::new(),
        }
    }

    /// Check if retrying the same request could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RuntimeApplyFailed(e) | Self::RuntimeQueryFailed(e) => e.is_recoverable(),
            Self::PersistFailed { .. } | Self::RegistryWriteFailed(_) => true,
            Self::RegistryReadFailed(e) => e.is_recoverable(),
            Self::InvalidName(_)
            | Self::NameExists(_)
            | Self::NotFound(_)
            | Self::NoFreeAddress(_)
            | Self::ConfFileReadFailed(_) => false,
        }
    }
}

/// Result of [`PeerManager::create_peer`]
#[derive(Debug, Clone)]
pub struct CreatedPeer {
    /// Registered record
    pub record: PeerRecord,
    /// Client credentials; the private key is not kept anywhere else
    pub bundle: ClientBundle,
    /// Where the client config was written, if it was
    pub client_config_path: Option<PathBuf>,
    /// Best-effort step failures
    pub warnings: Vec<String>,
}

/// Result of block, unblock and delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOutcome {
    /// Record after the operation (before removal, for delete)
    pub record: PeerRecord,
    /// Best-effort step failures
    pub warnings: Vec<String>,
}

/// Registry record whose block flag disagrees with the interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockMismatch {
    /// Peer public key
    pub public_key: String,
    /// Registry block flag
    pub blocked: bool,
    /// Allowed addresses on the interface
    pub runtime_allowed_addresses: Vec<String>,
}

/// Disagreements between the three stores
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Registry records without a config block
    pub missing_blocks: Vec<String>,
    /// Config blocks without a registry record
    pub orphan_blocks: Vec<OrphanBlock>,
    /// Registry records absent from the interface
    pub missing_runtime: Vec<String>,
    /// Registry block flags not reflected on the interface
    pub block_mismatches: Vec<BlockMismatch>,
    /// Set when the interface could not be dumped; runtime checks skipped
    pub runtime_error: Option<String>,
}

impl DriftReport {
    /// Whether all stores agree
    pub fn is_clean(&self) -> bool {
        self.missing_blocks.is_empty()
            && self.orphan_blocks.is_empty()
            && self.missing_runtime.is_empty()
            && self.block_mismatches.is_empty()
            && self.runtime_error.is_none()
    }
}

/// Managed block with no registry record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanBlock {
    /// Name from the block marker
    pub name: String,
    /// Public key from the block marker
    pub public_key: String,
    /// `AllowedIPs` of the block
    pub allowed_addresses: String,
}

impl From<&ConfigBlock> for OrphanBlock {
    fn from(block: &ConfigBlock) -> Self {
        Self {
            name: block.name.clone(),
            public_key: block.public_key.clone(),
            allowed_addresses: block.allowed_addresses.clone(),
        }
    }
}

/// Result of [`PeerManager::repair`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Records created from orphan blocks
    pub adopted: Vec<PeerRecord>,
    /// Public keys re-applied to the interface
    pub reapplied: Vec<String>,
    /// Drifts that could not be repaired
    pub warnings: Vec<String>,
}

/// Peer lifecycle engine
pub struct PeerManager {
    driver: Arc<dyn TunnelDriver>,
    registry: PeerRegistry,
    conf_file: ConfFile,
    interface: InterfaceConfig,
    data_dir: PathBuf,
    clients_dir: PathBuf,
    online_threshold_secs: u64,
    poller: Arc<PeerPoller>,
    mutation_lock: Mutex<()>,
}

impl fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerManager")
            .field("interface", &self.interface.name)
            .field("registry", &self.registry.path())
            .field("conf_file", &self.conf_file.path())
            .finish_non_exhaustive()
    }
}

impl PeerManager {
    /// Create a manager and its poller from configuration
    pub fn new(config: &Config, driver: Arc<dyn TunnelDriver>) -> Self {
        let registry = PeerRegistry::new(config.storage.registry_path());
        let poller = Arc::new(PeerPoller::new(
            Arc::clone(&driver),
            registry.clone(),
            &config.poll,
        ));

        Self {
            driver,
            registry,
            conf_file: ConfFile::new(
                config.interface.config_path.clone(),
                config.interface.block_marker.clone(),
            ),
            interface: config.interface.clone(),
            data_dir: config.storage.data_dir.clone(),
            clients_dir: config.storage.clients_dir(),
            online_threshold_secs: config.poll.online_threshold_secs,
            poller,
            mutation_lock: Mutex::new(()),
        }
    }

    /// Poller publishing status snapshots
    pub fn poller(&self) -> &Arc<PeerPoller> {
        &self.poller
    }

    /// Subscribe to status snapshots
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Arc<StatusSnapshot>> {
        self.poller.subscribe()
    }

    /// Registry store
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Interface config file
    pub fn conf_file(&self) -> &ConfFile {
        &self.conf_file
    }

    async fn publish(&self) {
        self.poller.tick().await;
    }

    fn load_records(&self) -> Result<Vec<PeerRecord>, PeerError> {
        self.registry.load().map_err(|e| {
            error!(error = %e, "registry unreadable, refusing to continue");
            PeerError::RegistryReadFailed(e)
        })
    }

    fn find_record(&self, records: &[PeerRecord], public_key: &str) -> Result<PeerRecord, PeerError> {
        records
            .iter()
            .find(|r| r.public_key == public_key)
            .cloned()
            .ok_or_else(|| PeerError::NotFound(public_key.to_string()))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a peer and return its client credentials
    ///
    /// # Flow
    ///
    /// 1. Validate the name and check it is unused
    /// 2. Generate keys, allocate an address
    /// 3. Add the peer to the interface
    /// 4. Append the config block; on failure remove the runtime peer
    /// 5. Write the client config (best effort)
    /// 6. Save the registry
    ///
    /// # Errors
    ///
    /// Nothing is changed on `InvalidName`, `NameExists`, `NoFreeAddress`,
    /// `RegistryReadFailed` or `RuntimeApplyFailed`. `PersistFailed` means
    /// the runtime peer was removed again (see its warnings).
    /// `RegistryWriteFailed` leaves the runtime peer and config block in
    /// place for [`PeerManager::repair`] to adopt.
    pub async fn create_peer(&self, name: &str) -> Result<CreatedPeer, PeerError> {
        validate_peer_name(name)?;

        let guard = self.mutation_lock.lock().await;

        let mut records = self.load_records()?;
        if records.iter().any(|r| r.name == name) {
            return Err(PeerError::NameExists(name.to_string()));
        }

        let keys = self
            .driver
            .generate_key_pair()
            .await
            .map_err(PeerError::RuntimeApplyFailed)?;
        let preshared_key = self
            .driver
            .generate_preshared_key()
            .await
            .map_err(PeerError::RuntimeApplyFailed)?;

        let address = allocate(&records, self.interface.subnet)?;
        let record = PeerRecord {
            name: name.to_string(),
            public_key: keys.public_key.clone(),
            address,
            created_at: Utc::now(),
            blocked: false,
        };

        self.driver
            .set_peer_attributes(
                &record.public_key,
                &PeerAttributes {
                    preshared_key: Some(preshared_key.clone()),
                    allowed_addresses: vec![record.allowed_address()],
                },
            )
            .await
            .map_err(|e| {
                error!(name = %name, error = %e, "failed to add peer to interface");
                PeerError::RuntimeApplyFailed(e)
            })?;

        let block = ConfigBlock {
            name: record.name.clone(),
            public_key: record.public_key.clone(),
            preshared_key: preshared_key.clone(),
            allowed_addresses: record.allowed_address(),
        };
        if let Err(e) = self.conf_file.append_block(&block) {
            error!(name = %name, error = %e, "failed to append config block");
            let compensation_warning = match self.driver.remove_peer(&record.public_key).await {
                Ok(()) => None,
                Err(comp) => {
                    warn!(name = %name, error = %comp, "compensation failed: runtime peer left behind");
                    Some(format!("runtime peer {} could not be removed: {comp}", record.public_key))
                }
            };
            return Err(PeerError::PersistFailed {
                reason: e.to_string(),
                compensation_warning,
            });
        }

        let mut warnings = Vec::new();
        let bundle = ClientBundle {
            name: record.name.clone(),
            private_key: keys.private_key,
            public_key: record.public_key.clone(),
            address,
            prefix_len: self.interface.subnet.prefix_len(),
            server_public_key: self.interface.server_public_key.clone(),
            preshared_key,
            dns: self.interface.dns.clone(),
            endpoint: self.interface.endpoint.clone(),
        };
        let client_config_path = match write_client_config(&self.clients_dir, &bundle) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(name = %name, error = %e, "failed to write client config");
                warnings.push(format!("client config not written: {e}"));
                None
            }
        };

        records.push(record.clone());
        if let Err(e) = self.registry.save(&records) {
            error!(
                name = %name,
                error = %e,
                "registry write failed; runtime peer and config block kept for repair"
            );
            return Err(PeerError::RegistryWriteFailed(e));
        }

        drop(guard);
        info!(name = %name, address = %address, public_key = %record.public_key, "Peer created");
        self.publish().await;

        Ok(CreatedPeer {
            record,
            bundle,
            client_config_path,
            warnings,
        })
    }

    /// Null-route a peer's traffic
    ///
    /// # Errors
    ///
    /// `NotFound` if the peer is not registered. On `RuntimeApplyFailed` the
    /// registry flag is unchanged.
    pub async fn block_peer(&self, public_key: &str) -> Result<PeerOutcome, PeerError> {
        self.set_blocked(public_key, true).await
    }

    /// Restore a blocked peer's address
    ///
    /// # Errors
    ///
    /// Same as [`PeerManager::block_peer`].
    pub async fn unblock_peer(&self, public_key: &str) -> Result<PeerOutcome, PeerError> {
        self.set_blocked(public_key, false).await
    }

    async fn set_blocked(&self, public_key: &str, blocked: bool) -> Result<PeerOutcome, PeerError> {
        let guard = self.mutation_lock.lock().await;

        let mut records = self.load_records()?;
        let mut record = self.find_record(&records, public_key)?;

        let allowed = if blocked {
            BLOCKED_ALLOWED_ADDRESS.to_string()
        } else {
            record.allowed_address()
        };
        self.driver
            .set_peer_attributes(public_key, &PeerAttributes::allowed_only(allowed))
            .await
            .map_err(|e| {
                error!(name = %record.name, blocked, error = %e, "failed to update peer on interface");
                PeerError::RuntimeApplyFailed(e)
            })?;

        record.blocked = blocked;
        for r in records.iter_mut().filter(|r| r.public_key == public_key) {
            r.blocked = blocked;
        }
        self.registry.save(&records).map_err(|e| {
            error!(name = %record.name, error = %e, "registry write failed after runtime update");
            PeerError::RegistryWriteFailed(e)
        })?;

        drop(guard);
        if blocked {
            info!(name = %record.name, public_key = %public_key, "Peer blocked");
        } else {
            info!(name = %record.name, public_key = %public_key, "Peer unblocked");
        }
        self.publish().await;

        Ok(PeerOutcome {
            record,
            warnings: Vec::new(),
        })
    }

    /// Delete a peer everywhere
    ///
    /// # Flow
    ///
    /// 1. Look up the record (`NotFound` if absent, nothing touched)
    /// 2. Remove from the interface (best effort)
    /// 3. Remove the client config (best effort)
    /// 4. Remove from the registry (authoritative)
    /// 5. Remove the config block (best effort)
    ///
    /// # Errors
    ///
    /// `NotFound`, `RegistryReadFailed` or `RegistryWriteFailed`.
    pub async fn delete_peer(&self, public_key: &str) -> Result<PeerOutcome, PeerError> {
        let guard = self.mutation_lock.lock().await;

        let records = self.load_records()?;
        let record = self.find_record(&records, public_key)?;
        let mut warnings = Vec::new();

        if let Err(e) = self.driver.remove_peer(public_key).await {
            warn!(name = %record.name, error = %e, "failed to remove peer from interface");
            warnings.push(format!("runtime removal failed: {e}"));
        }

        let client_path = client_config_path(&self.clients_dir, &record.name);
        match fs::remove_file(&client_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(name = %record.name, path = %client_path.display(), error = %e, "failed to remove client config");
                warnings.push(format!("client config not removed: {e}"));
            }
        }

        let remaining: Vec<PeerRecord> = records
            .into_iter()
            .filter(|r| r.public_key != public_key)
            .collect();
        self.registry.save(&remaining).map_err(|e| {
            error!(name = %record.name, error = %e, "registry write failed during delete");
            PeerError::RegistryWriteFailed(e)
        })?;

        match self.conf_file.remove_block(public_key) {
            Ok(true) => {}
            Ok(false) => warnings.push("config block was already absent".to_string()),
            Err(e) => {
                warn!(name = %record.name, error = %e, "failed to remove config block");
                warnings.push(format!("config block not removed: {e}"));
            }
        }

        drop(guard);
        info!(name = %record.name, public_key = %public_key, "Peer deleted");
        self.publish().await;

        Ok(PeerOutcome { record, warnings })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All registered peers with fresh runtime state
    ///
    /// Rates are always zero here; they come from the poller.
    ///
    /// # Errors
    ///
    /// `RegistryReadFailed` or `RuntimeQueryFailed`.
    pub async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, PeerError> {
        let records = self.load_records()?;
        let rows = self
            .driver
            .dump_state()
            .await
            .map_err(PeerError::RuntimeQueryFailed)?;
        Ok(merge_peers(&records, &rows, epoch_secs(), self.online_threshold_secs))
    }

    /// One registered peer with fresh runtime state
    ///
    /// # Errors
    ///
    /// `NotFound` in addition to the [`PeerManager::list_peers`] errors.
    pub async fn get_peer(&self, public_key: &str) -> Result<PeerSnapshot, PeerError> {
        self.list_peers()
            .await?
            .into_iter()
            .find(|p| p.public_key == public_key)
            .ok_or_else(|| PeerError::NotFound(public_key.to_string()))
    }

    /// Stored client config text for a peer
    ///
    /// # Errors
    ///
    /// `NotFound` if the peer or its client config file does not exist.
    pub fn client_config(&self, public_key: &str) -> Result<String, PeerError> {
        let records = self.load_records()?;
        let record = self.find_record(&records, public_key)?;
        let path = client_config_path(&self.clients_dir, &record.name);
        fs::read_to_string(&path)
            .map_err(|e| PeerError::NotFound(format!("client config {}: {e}", path.display())))
    }

    // =========================================================================
    // Interface Control
    // =========================================================================

    /// Take the interface down and bring it back up from the config file
    ///
    /// A failed `bring_down` is reported as a warning (the interface may
    /// already be down). Blocked peers are null-routed again afterwards,
    /// since the config file carries their real address.
    ///
    /// # Errors
    ///
    /// `RuntimeApplyFailed` if the interface does not come back up.
    pub async fn restart_interface(&self) -> Result<Vec<String>, PeerError> {
        let guard = self.mutation_lock.lock().await;
        let mut warnings = Vec::new();

        if let Err(e) = self.driver.bring_down().await {
            warn!(interface = %self.interface.name, error = %e, "bring down failed");
            warnings.push(format!("bring down failed: {e}"));
        }
        self.driver.bring_up().await.map_err(|e| {
            error!(interface = %self.interface.name, error = %e, "bring up failed");
            PeerError::RuntimeApplyFailed(e)
        })?;
        warnings.extend(self.reapply_blocks().await);

        drop(guard);
        info!(interface = %self.interface.name, "Interface restarted");
        self.publish().await;
        Ok(warnings)
    }

    /// Bring the interface up unless it is already running
    ///
    /// Returns `true` if it had to be started.
    ///
    /// # Errors
    ///
    /// `RuntimeApplyFailed` if starting it fails.
    pub async fn ensure_interface_up(&self) -> Result<bool, PeerError> {
        let _guard = self.mutation_lock.lock().await;

        match self.driver.query_interface_summary().await {
            Ok(summary) if summary.contains("interface:") => {
                debug!(interface = %self.interface.name, "interface already up");
                return Ok(false);
            }
            Ok(_) => debug!(interface = %self.interface.name, "interface not running"),
            Err(e) => debug!(interface = %self.interface.name, error = %e, "interface query failed"),
        }

        self.driver.bring_up().await.map_err(|e| {
            error!(interface = %self.interface.name, error = %e, "failed to bring interface up");
            PeerError::RuntimeApplyFailed(e)
        })?;
        for warning in self.reapply_blocks().await {
            warn!(interface = %self.interface.name, "{warning}");
        }

        info!(interface = %self.interface.name, "Interface brought up");
        Ok(true)
    }

    /// Null-route registered blocked peers; returns failures as warnings
    async fn reapply_blocks(&self) -> Vec<String> {
        let records = match self.registry.load() {
            Ok(records) => records,
            Err(e) => return vec![format!("block state not re-applied: {e}")],
        };

        let mut warnings = Vec::new();
        for record in records.iter().filter(|r| r.blocked) {
            if let Err(e) = self
                .driver
                .set_peer_attributes(
                    &record.public_key,
                    &PeerAttributes::allowed_only(BLOCKED_ALLOWED_ADDRESS),
                )
                .await
            {
                warnings.push(format!("could not re-block {}: {e}", record.name));
            }
        }
        warnings
    }

    /// Create the data and client config directories
    ///
    /// # Errors
    ///
    /// `PersistFailed` if a directory cannot be created.
    pub fn prepare_storage(&self) -> Result<(), PeerError> {
        for dir in [&self.data_dir, &self.clients_dir] {
            fs::create_dir_all(dir).map_err(|e| PeerError::PersistFailed {
                reason: format!("cannot create {}: {e}", dir.display()),
                compensation_warning: None,
            })?;
        }
        if let Some(parent) = self.registry.path().parent() {
            fs::create_dir_all(parent).map_err(|e| PeerError::PersistFailed {
                reason: format!("cannot create {}: {e}", parent.display()),
                compensation_warning: None,
            })?;
        }
        Ok(())
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Compare registry, config file and interface
    ///
    /// A failed interface dump is recorded in the report rather than
    /// returned, so file drift is still reported with the interface down.
    ///
    /// # Errors
    ///
    /// `RegistryReadFailed` or `ConfFileReadFailed`.
    pub async fn audit(&self) -> Result<DriftReport, PeerError> {
        let _guard = self.mutation_lock.lock().await;
        let (records, blocks, dump) = self.gather().await?;
        Ok(drift(&records, &blocks, dump.as_deref().map_err(ToString::to_string)))
    }

    /// Heal the drift that can be rebuilt safely
    ///
    /// - Orphan config blocks (a create whose registry write failed) are
    ///   adopted into the registry
    /// - Registry records missing from the interface are re-applied with the
    ///   pre-shared key from their config block
    ///
    /// Peers on the interface that the daemon does not manage are never
    /// touched.
    ///
    /// # Errors
    ///
    /// `RegistryReadFailed`, `ConfFileReadFailed` or `RegistryWriteFailed`.
    pub async fn repair(&self) -> Result<RepairReport, PeerError> {
        let guard = self.mutation_lock.lock().await;
        let (mut records, blocks, dump) = self.gather().await?;
        let mut report = RepairReport::default();

        let runtime: HashMap<&str, &PeerRuntimeRow> = match &dump {
            Ok(rows) => rows.iter().map(|r| (r.public_key.as_str(), r)).collect(),
            Err(e) => {
                report
                    .warnings
                    .push(format!("interface dump failed, runtime not repaired: {e}"));
                HashMap::new()
            }
        };

        let known: HashSet<String> = records.iter().map(|r| r.public_key.clone()).collect();
        for block in blocks.iter().filter(|b| !known.contains(&b.public_key)) {
            match self.adopt(&records, block, runtime.get(block.public_key.as_str()).copied()) {
                Ok(record) => {
                    info!(name = %record.name, address = %record.address, "Adopted orphan config block");
                    report.adopted.push(record.clone());
                    records.push(record);
                }
                Err(reason) => {
                    warn!(public_key = %block.public_key, reason = %reason, "orphan block not adopted");
                    report
                        .warnings
                        .push(format!("block {} not adopted: {reason}", block.public_key));
                }
            }
        }
        if !report.adopted.is_empty() {
            self.registry
                .save(&records)
                .map_err(PeerError::RegistryWriteFailed)?;
        }

        if dump.is_ok() {
            let psks: HashMap<&str, &str> = blocks
                .iter()
                .map(|b| (b.public_key.as_str(), b.preshared_key.as_str()))
                .collect();

            for record in records.iter().filter(|r| !runtime.contains_key(r.public_key.as_str())) {
                let Some(psk) = psks.get(record.public_key.as_str()).filter(|k| !k.is_empty()) else {
                    report.warnings.push(format!(
                        "{} missing from interface and has no config block to restore from",
                        record.name
                    ));
                    continue;
                };

                let allowed = if record.blocked {
                    BLOCKED_ALLOWED_ADDRESS.to_string()
                } else {
                    record.allowed_address()
                };
                let attrs = PeerAttributes {
                    preshared_key: Some((*psk).to_string()),
                    allowed_addresses: vec![allowed],
                };
                match self.driver.set_peer_attributes(&record.public_key, &attrs).await {
                    Ok(()) => {
                        info!(name = %record.name, "Re-applied peer to interface");
                        report.reapplied.push(record.public_key.clone());
                    }
                    Err(e) => {
                        warn!(name = %record.name, error = %e, "failed to re-apply peer");
                        report
                            .warnings
                            .push(format!("{} not re-applied: {e}", record.name));
                    }
                }
            }
        }

        drop(guard);
        self.publish().await;
        Ok(report)
    }

    async fn gather(
        &self,
    ) -> Result<(Vec<PeerRecord>, Vec<ConfigBlock>, Result<Vec<PeerRuntimeRow>, DriverError>), PeerError> {
        let records = self.load_records()?;
        let blocks = self
            .conf_file
            .blocks()
            .map_err(PeerError::ConfFileReadFailed)?;
        let dump = self.driver.dump_state().await;
        Ok((records, blocks, dump))
    }

    /// Build a record for an orphan block, or explain why not
    fn adopt(
        &self,
        records: &[PeerRecord],
        block: &ConfigBlock,
        row: Option<&PeerRuntimeRow>,
    ) -> Result<PeerRecord, String> {
        validate_peer_name(&block.name).map_err(|e| e.to_string())?;
        if records.iter().any(|r| r.name == block.name) {
            return Err(format!("name {} is taken", block.name));
        }

        let address: Ipv4Addr = block
            .allowed_addresses
            .split(',')
            .next()
            .and_then(|first| first.trim().strip_suffix("/32"))
            .and_then(|ip| ip.parse().ok())
            .ok_or_else(|| format!("unusable AllowedIPs {:?}", block.allowed_addresses))?;

        if !self.interface.subnet.contains(&address) {
            return Err(format!("{address} is outside {}", self.interface.subnet));
        }
        if records.iter().any(|r| r.address == address) {
            return Err(format!("{address} is taken"));
        }

        let blocked = row.is_some_and(|r| is_null_routed(&r.allowed_addresses));

        Ok(PeerRecord {
            name: block.name.clone(),
            public_key: block.public_key.clone(),
            address,
            created_at: Utc::now(),
            blocked,
        })
    }
}

/// Compute drift between the stores
fn drift(
    records: &[PeerRecord],
    blocks: &[ConfigBlock],
    dump: Result<&[PeerRuntimeRow], String>,
) -> DriftReport {
    let block_keys: HashSet<&str> = blocks.iter().map(|b| b.public_key.as_str()).collect();
    let record_keys: HashSet<&str> = records.iter().map(|r| r.public_key.as_str()).collect();

    let mut report = DriftReport {
        missing_blocks: records
            .iter()
            .filter(|r| !block_keys.contains(r.public_key.as_str()))
            .map(|r| r.public_key.clone())
            .collect(),
        orphan_blocks: blocks
            .iter()
            .filter(|b| !record_keys.contains(b.public_key.as_str()))
            .map(OrphanBlock::from)
            .collect(),
        ..DriftReport::default()
    };

    let rows = match dump {
        Ok(rows) => rows,
        Err(e) => {
            report.runtime_error = Some(e);
            return report;
        }
    };
    let runtime: HashMap<&str, &PeerRuntimeRow> =
        rows.iter().map(|r| (r.public_key.as_str(), r)).collect();

    for record in records {
        let Some(row) = runtime.get(record.public_key.as_str()) else {
            report.missing_runtime.push(record.public_key.clone());
            continue;
        };

        let consistent = if record.blocked {
            is_null_routed(&row.allowed_addresses)
        } else {
            row.allowed_addresses == [record.allowed_address()]
        };
        if !consistent {
            report.block_mismatches.push(BlockMismatch {
                public_key: record.public_key.clone(),
                blocked: record.blocked,
                runtime_allowed_addresses: row.allowed_addresses.clone(),
            });
        }
    }

    report
}
