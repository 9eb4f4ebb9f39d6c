//! `wg` / `wg-quick` backed driver
//!
//! Every primitive is one external command, started without a shell and
//! bounded by the configured timeout. A timed-out command is killed when its
//! future is dropped.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::keys::{generate_preshared_key, KeyPair};
use super::{PeerAttributes, PeerRuntimeRow, TunnelDriver};
use crate::config::{DriverConfig, InterfaceConfig};
use crate::error::DriverError;

/// Number of tab-separated fields on a peer line of `wg show <if> dump`
const DUMP_PEER_FIELDS: usize = 8;

/// Placeholder `wg` prints for empty values
const DUMP_NONE: &str = "(none)";

/// Driver that shells out to the WireGuard userspace tools
#[derive(Debug, Clone)]
pub struct WgCommandDriver {
    interface: String,
    wg_binary: String,
    wg_quick_binary: String,
    timeout: Duration,
}

impl WgCommandDriver {
    /// Create a driver for the given interface
    pub fn new(interface: impl Into<String>, config: &DriverConfig) -> Self {
        Self {
            interface: interface.into(),
            wg_binary: config.wg_binary.clone(),
            wg_quick_binary: config.wg_quick_binary.clone(),
            timeout: config.command_timeout(),
        }
    }

    /// Create a driver from the interface and driver config sections
    pub fn from_config(interface: &InterfaceConfig, driver: &DriverConfig) -> Self {
        Self::new(interface.name.clone(), driver)
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, DriverError> {
        let command = format!("{program} {}", args.join(" "));
        trace!(cmd = %command, "running command");

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(program = %program, "binary not found in PATH");
                }
                DriverError::spawn(&command, e.to_string())
            })?,
            Err(_) => {
                warn!(cmd = %command, timeout_secs = self.timeout.as_secs(), "command timed out");
                return Err(DriverError::timeout(command, self.timeout.as_secs()));
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(DriverError::command_failed(
                command,
                output.status.to_string(),
                stderr,
            ))
        }
    }

    async fn wg(&self, args: &[&str]) -> Result<String, DriverError> {
        self.run(&self.wg_binary, args).await
    }
}

#[async_trait]
impl TunnelDriver for WgCommandDriver {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn generate_key_pair(&self) -> Result<KeyPair, DriverError> {
        KeyPair::generate()
    }

    async fn generate_preshared_key(&self) -> Result<String, DriverError> {
        Ok(generate_preshared_key())
    }

    async fn set_peer_attributes(
        &self,
        public_key: &str,
        attrs: &PeerAttributes,
    ) -> Result<(), DriverError> {
        let allowed = attrs.allowed_addresses.join(",");

        // `wg` only reads pre-shared keys from a file; tempfile creates it 0600
        // and removes it when dropped.
        let psk_file = match &attrs.preshared_key {
            Some(psk) => {
                let mut file = tempfile::Builder::new().prefix("psk-").tempfile()?;
                writeln!(file, "{psk}")?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };
        let psk_path = psk_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned());

        let mut args = vec!["set", self.interface.as_str(), "peer", public_key];
        if let Some(path) = psk_path.as_deref() {
            args.push("preshared-key");
            args.push(path);
        }
        args.push("allowed-ips");
        args.push(&allowed);

        self.wg(&args).await?;
        debug!(peer = %public_key, allowed = %allowed, "peer attributes applied");
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), DriverError> {
        self.wg(&["set", &self.interface, "peer", public_key, "remove"])
            .await?;
        debug!(peer = %public_key, "peer removed from interface");
        Ok(())
    }

    async fn dump_state(&self) -> Result<Vec<PeerRuntimeRow>, DriverError> {
        let output = self.wg(&["show", &self.interface, "dump"]).await?;
        Ok(parse_dump(&self.interface, &output))
    }

    async fn bring_up(&self) -> Result<(), DriverError> {
        self.run(&self.wg_quick_binary, &["up", &self.interface])
            .await
            .map(|_| ())
    }

    async fn bring_down(&self) -> Result<(), DriverError> {
        self.run(&self.wg_quick_binary, &["down", &self.interface])
            .await
            .map(|_| ())
    }

    async fn query_interface_summary(&self) -> Result<String, DriverError> {
        self.wg(&["show", &self.interface]).await
    }
}

/// Parse `wg show <if> dump` output into peer rows
///
/// The interface line has fewer fields and is skipped, as are lines prefixed
/// with the interface name (`wg show all dump` format) and malformed lines.
pub fn parse_dump(interface: &str, output: &str) -> Vec<PeerRuntimeRow> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < DUMP_PEER_FIELDS || fields[0] == interface {
                return None;
            }

            let endpoint = match fields[2] {
                DUMP_NONE | "" => None,
                other => Some(other.to_string()),
            };

            let allowed_addresses = match fields[3] {
                DUMP_NONE | "" => Vec::new(),
                list => list
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            };

            Some(PeerRuntimeRow {
                public_key: fields[0].to_string(),
                endpoint,
                allowed_addresses,
                latest_handshake: fields[4].parse().unwrap_or(0),
                rx_bytes: fields[5].parse().unwrap_or(0),
                tx_bytes: fields[6].parse().unwrap_or(0),
            })
        })
        .collect()
}
