//! Input validation for peer operations
//!
//! # Validation Rules
//!
//! - **Names**: 2-32 characters from `[A-Za-z0-9._-]`
//! - **`WireGuard` Keys**: Base64 encoded, 44 characters (32 bytes)
//! - **Endpoints**: IP:port or hostname:port format
//!
//! # Examples
//!
//! ```
//! use wg_peerd::peer::validation::{validate_peer_name, validate_wg_key};
//!
//! assert!(validate_peer_name("alice").is_ok());
//! assert!(validate_peer_name("a").is_err());
//! assert!(validate_wg_key("short").is_err());
//! ```

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

/// `WireGuard` key length in bytes (before Base64 encoding)
pub const WG_KEY_LENGTH: usize = 32;

/// `WireGuard` key Base64 length (32 bytes = 44 chars in Base64 with padding)
pub const WG_KEY_BASE64_LENGTH: usize = 44;

/// Minimum peer name length
pub const MIN_NAME_LENGTH: usize = 2;

/// Maximum peer name length
pub const MAX_NAME_LENGTH: usize = 32;

/// Pattern accepted for peer names
pub const NAME_PATTERN: &str = r"^[A-Za-z0-9._-]{2,32}$";

/// Validation error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Name is shorter than the minimum
    #[error("Name must be at least {MIN_NAME_LENGTH} characters: got {length}")]
    NameTooShort { length: usize },

    /// Name is longer than the maximum
    #[error("Name exceeds maximum length of {MAX_NAME_LENGTH} characters: {length}")]
    NameTooLong { length: usize },

    /// Name contains characters outside the allowed set
    #[error("Name contains invalid character {character:?}: must match pattern {NAME_PATTERN}")]
    InvalidNameCharacter { character: char },

    /// `WireGuard` key has invalid length
    #[error("WireGuard key has invalid length: expected {WG_KEY_BASE64_LENGTH}, got {length}")]
    InvalidKeyLength { length: usize },

    /// `WireGuard` key has invalid Base64 encoding
    #[error("WireGuard key has invalid Base64 encoding")]
    InvalidKeyEncoding,

    /// Endpoint is invalid
    #[error("Invalid endpoint format: {message}")]
    InvalidEndpoint { message: String },
}

/// Validate a peer name
///
/// Names double as the client config file stem, so the character set
/// excludes path separators and whitespace.
///
/// # Examples
///
/// ```
/// use wg_peerd::peer::validation::validate_peer_name;
///
/// assert!(validate_peer_name("laptop-01").is_ok());
/// assert!(validate_peer_name("bob.phone").is_ok());
/// assert!(validate_peer_name("../etc").is_err());
/// assert!(validate_peer_name("has space").is_err());
/// ```
pub fn validate_peer_name(name: &str) -> Result<(), ValidationError> {
    // Length is checked on chars; anything non-ASCII fails the charset anyway
    let length = name.chars().count();
    if length < MIN_NAME_LENGTH {
        return Err(ValidationError::NameTooShort { length });
    }
    if length > MAX_NAME_LENGTH {
        return Err(ValidationError::NameTooLong { length });
    }

    if let Some(character) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ValidationError::InvalidNameCharacter { character });
    }

    Ok(())
}

/// Validate a `WireGuard` public, private or pre-shared key
///
/// # Examples
///
/// ```
/// use wg_peerd::peer::validation::validate_wg_key;
///
/// assert!(validate_wg_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_ok());
/// assert!(validate_wg_key("short").is_err());
/// ```
pub fn validate_wg_key(key: &str) -> Result<(), ValidationError> {
    if key.len() != WG_KEY_BASE64_LENGTH {
        return Err(ValidationError::InvalidKeyLength { length: key.len() });
    }

    match BASE64.decode(key) {
        Ok(bytes) if bytes.len() == WG_KEY_LENGTH => Ok(()),
        _ => Err(ValidationError::InvalidKeyEncoding),
    }
}

/// Validate an endpoint (IP:port or hostname:port)
///
/// # Examples
///
/// ```
/// use wg_peerd::peer::validation::validate_endpoint;
///
/// assert!(validate_endpoint("203.0.113.1:51820").is_ok());
/// assert!(validate_endpoint("[::1]:51820").is_ok());
/// assert!(validate_endpoint("vpn.example.com:51820").is_ok());
/// assert!(validate_endpoint("invalid").is_err());
/// ```
pub fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(ValidationError::InvalidEndpoint {
                message: "Port cannot be 0".into(),
            });
        }
        return Ok(());
    }

    if endpoint.starts_with('[') {
        return Err(ValidationError::InvalidEndpoint {
            message: format!("Invalid IPv6 endpoint: {endpoint}"),
        });
    }

    let (host, port_str) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ValidationError::InvalidEndpoint {
            message: "Missing port separator".into(),
        })?;

    let port: u16 = port_str.parse().map_err(|_| ValidationError::InvalidEndpoint {
        message: format!("Invalid port number: {port_str}"),
    })?;

    if port == 0 {
        return Err(ValidationError::InvalidEndpoint {
            message: "Port cannot be 0".into(),
        });
    }

    if host.is_empty() {
        return Err(ValidationError::InvalidEndpoint {
            message: "Host cannot be empty".into(),
        });
    }

    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ValidationError::InvalidEndpoint {
                message: format!("Invalid hostname label: {label}"),
            });
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ValidationError::InvalidEndpoint {
                message: format!("Invalid hostname characters in: {label}"),
            });
        }
    }

    Ok(())
}
