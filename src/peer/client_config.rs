//! Client credential bundle
//!
//! The bundle is the only place a peer's private key ever appears. It is
//! returned once from peer creation and written to `<clients_dir>/<name>.conf`
//! with owner-only permissions.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::storage::write_atomic;

/// Mode of client config files
pub const CLIENT_CONFIG_MODE: u32 = 0o600;

/// Everything a client needs to connect
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ClientBundle {
    /// Peer name
    pub name: String,
    /// Client private key
    pub private_key: String,
    /// Client public key
    pub public_key: String,
    /// Client tunnel address
    pub address: Ipv4Addr,
    /// Prefix length of the tunnel subnet
    pub prefix_len: u8,
    /// Server public key
    pub server_public_key: String,
    /// Pre-shared key
    pub preshared_key: String,
    /// DNS servers (comma-separated)
    pub dns: String,
    /// Server endpoint (host:port)
    pub endpoint: String,
}

impl fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBundle")
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .field("private_key", &"<redacted>")
            .field("preshared_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl ClientBundle {
    /// Render a `wg-quick` client config routing all traffic through the tunnel
    pub fn render(&self) -> String {
        let mut out = format!(
            "[Interface]\nPrivateKey = {}\nAddress = {}/{}\n",
            self.private_key, self.address, self.prefix_len
        );
        if !self.dns.trim().is_empty() {
            out.push_str(&format!("DNS = {}\n", self.dns));
        }
        out.push_str(&format!(
            "\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nAllowedIPs = 0.0.0.0/0\n",
            self.server_public_key, self.preshared_key
        ));
        if !self.endpoint.trim().is_empty() {
            out.push_str(&format!("Endpoint = {}\n", self.endpoint));
        }
        out
    }
}

/// Path of the client config for `name`
pub fn client_config_path(clients_dir: &Path, name: &str) -> PathBuf {
    clients_dir.join(format!("{name}.conf"))
}

/// Write the rendered bundle with owner-only permissions
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn write_client_config(clients_dir: &Path, bundle: &ClientBundle) -> std::io::Result<PathBuf> {
    let path = client_config_path(clients_dir, &bundle.name);
    write_atomic(&path, bundle.render().as_bytes(), Some(CLIENT_CONFIG_MODE))?;
    Ok(path)
}
