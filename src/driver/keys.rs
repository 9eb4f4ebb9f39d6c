//! WireGuard key material
//!
//! Keys are 32 bytes encoded as standard Base64 (44 characters), the same
//! format `wg genkey`, `wg pubkey` and `wg genpsk` produce.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::DriverError;

/// Key length in bytes
pub const KEY_LENGTH: usize = 32;

/// A generated key pair
///
/// The private key is handed to the client exactly once and is never
/// written to the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Base64 private key
    pub private_key: String,
    /// Base64 public key
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, DriverError> {
        let private_key = generate_private_key();
        let public_key = derive_public_key(&private_key)?;
        Ok(Self {
            private_key,
            public_key,
        })
    }
}

/// Generate a new X25519 private key
///
/// `StaticSecret` applies the curve clamping.
pub fn generate_private_key() -> String {
    let mut key_bytes = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let secret = StaticSecret::from(key_bytes);
    BASE64.encode(secret.to_bytes())
}

/// Derive the public key for a Base64 private key
///
/// # Errors
///
/// Returns `DriverError::Key` if the input is not a Base64 32-byte key.
pub fn derive_public_key(private_key: &str) -> Result<String, DriverError> {
    let bytes = decode_key(private_key)?;
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(BASE64.encode(public.as_bytes()))
}

/// Generate a new pre-shared key (32 random bytes)
pub fn generate_preshared_key() -> String {
    let mut key_bytes = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    BASE64.encode(key_bytes)
}

fn decode_key(key: &str) -> Result<[u8; KEY_LENGTH], DriverError> {
    let decoded = BASE64
        .decode(key.trim())
        .map_err(|e| DriverError::Key(format!("invalid Base64: {e}")))?;
    decoded
        .try_into()
        .map_err(|v: Vec<u8>| DriverError::Key(format!("expected {KEY_LENGTH} bytes, got {}", v.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::validation::validate_wg_key;

    #[test]
    fn test_generated_keys_are_valid() {
        let pair = KeyPair::generate().unwrap();
        assert!(validate_wg_key(&pair.private_key).is_ok());
        assert!(validate_wg_key(&pair.public_key).is_ok());
        assert_ne!(pair.private_key, pair.public_key);

        let psk = generate_preshared_key();
        assert!(validate_wg_key(&psk).is_ok());
    }

    #[test]
    fn test_derive_is_deterministic() {
        let private_key = generate_private_key();
        let a = derive_public_key(&private_key).unwrap();
        let b = derive_public_key(&private_key).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_rejects_bad_input() {
        assert!(matches!(derive_public_key("not base64!"), Err(DriverError::Key(_))));
        assert!(matches!(derive_public_key("c2hvcnQ="), Err(DriverError::Key(_))));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = KeyPair::generate().unwrap();
        let debug = format!("{pair:?}");
        assert!(!debug.contains(&pair.private_key));
        assert!(debug.contains(&pair.public_key));
    }
}
