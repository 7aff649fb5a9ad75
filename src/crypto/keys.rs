//! X25519 key management
//!
//! Client identities are static X25519 keys. Peers identify each other by
//! fingerprint: the hex encoded BLAKE2s-256 hash of the public key.

use std::fmt;

use blake2::{Blake2s256, Digest};
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::Error;
use crate::core::constants::{PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

/// Errors parsing key material.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Not valid hex.
    #[error("private key is not valid hex")]
    InvalidHex,

    /// Wrong number of bytes.
    #[error("private key must be {PRIVATE_KEY_SIZE} bytes, got {0}")]
    InvalidLength(usize),
}

impl From<KeyError> for Error {
    fn from(_: KeyError) -> Self {
        Error::InvalidArgument
    }
}

/// A static X25519 private key.
///
/// The key material is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    secret: [u8; PRIVATE_KEY_SIZE],
}

impl PrivateKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            secret: secret.to_bytes(),
        }
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(secret: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self { secret }
    }

    /// Parse a hex encoded key.
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let mut bytes = hex::decode(encoded.trim()).map_err(|_| KeyError::InvalidHex)?;
        if bytes.len() != PRIVATE_KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            return Err(KeyError::InvalidLength(len));
        }
        let mut secret = [0u8; PRIVATE_KEY_SIZE];
        secret.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { secret })
    }

    /// Hex encoding of the key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn to_hex(&self) -> String {
        hex::encode(self.secret)
    }

    /// The matching public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let secret = StaticSecret::from(self.secret);
        PublicKey::from(&secret).to_bytes()
    }

    /// Fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Hex encoded BLAKE2s-256 of a public key.
pub fn fingerprint(public_key: &[u8; PUBLIC_KEY_SIZE]) -> String {
    hex::encode(Blake2s256::digest(public_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::FINGERPRINT_HEX_LEN;

    #[test]
    fn test_key_generation() {
        let k1 = PrivateKey::generate();
        let k2 = PrivateKey::generate();
        assert_ne!(k1.public_key(), k2.public_key());
        assert_ne!(k1.fingerprint(), k2.fingerprint());
    }

    #[test]
    fn test_fingerprint_format() {
        let key = PrivateKey::generate();
        let fp = key.fingerprint();
        assert_eq!(fp.len(), FINGERPRINT_HEX_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(fp, key.fingerprint());
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = PrivateKey::generate();
        let parsed = PrivateKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed.public_key(), key.public_key());
    }

    #[test]
    fn test_invalid_hex() {
        assert_eq!(PrivateKey::from_hex("not hex").unwrap_err(), KeyError::InvalidHex);
        assert_eq!(
            PrivateKey::from_hex("abcd").unwrap_err(),
            KeyError::InvalidLength(2)
        );
        assert_eq!(Error::from(KeyError::InvalidHex), Error::InvalidArgument);
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = PrivateKey::from_bytes([7u8; PRIVATE_KEY_SIZE]);
        let debug = format!("{key:?}");
        assert!(!debug.contains(&key.to_hex()));
        assert!(debug.contains(&key.fingerprint()));
    }
}
