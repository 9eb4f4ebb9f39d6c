//! Integration tests for wg-peerd
//!
//! Every test drives a `PeerManager` over the in-memory driver with the
//! registry, interface config file and client configs in a temporary
//! directory.
//!
//! # Test Organization
//!
//! - `lifecycle`: create, block, unblock, delete and address reuse
//! - `failures`: rollback and error classification across the stores
//! - `polling`: snapshot publication and transfer rates

pub mod failures;
pub mod lifecycle;
pub mod polling;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use wg_peerd::config::Config;
use wg_peerd::driver::MemoryDriver;
use wg_peerd::peer::PeerManager;

pub const BASE_CONF: &str = "[Interface]\n\
PrivateKey = c2VydmVyLXByaXZhdGUta2V5LXBsYWNlaG9sZGVyMDA=\n\
Address = 10.0.70.1/24\n\
ListenPort = 51820\n\
\n\
# hand-written peer\n\
[Peer]\n\
PublicKey = bWFudWFsLXBlZXItcHVibGljLWtleS1wbGFjZWhvbGQ=\n\
AllowedIPs = 10.0.70.250/32\n";

/// A manager wired to temporary storage
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub driver: Arc<MemoryDriver>,
    pub manager: PeerManager,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build an environment after adjusting the default test configuration
    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.interface.config_path = dir.path().join("wg0.conf");
        config.interface.server_public_key = "c2VydmVyLXB1YmxpYy1rZXktcGxhY2Vob2xkZXIwMDA=".into();
        config.interface.endpoint = "vpn.example.com:51820".into();
        config.storage.data_dir = dir.path().join("data");
        adjust(&mut config);
        fs::write(&config.interface.config_path, BASE_CONF).expect("write conf");

        let driver = Arc::new(MemoryDriver::new("wg0"));
        let manager = PeerManager::new(&config, driver.clone());
        manager.prepare_storage().expect("prepare storage");

        Self {
            dir,
            config,
            driver,
            manager,
        }
    }

    pub fn conf_path(&self) -> PathBuf {
        self.config.interface.config_path.clone()
    }

    pub fn conf_text(&self) -> String {
        fs::read_to_string(self.conf_path()).expect("read conf")
    }

    pub fn registry_text(&self) -> String {
        fs::read_to_string(self.manager.registry().path()).unwrap_or_default()
    }
}
