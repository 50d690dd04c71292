//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use vaultsync_common::{Error, Result};

/// Length of derived keys and hashes in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of password-hashing salts in bytes.
pub const SALT_LENGTH: usize = 16;

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        Error::Validation(format!(
            "Invalid {} length: expected {}, got {}",
            what,
            N,
            bytes.len()
        ))
    })
}

/// Key-encryption key derived from the user's password.
///
/// Wraps and unwraps the data encryption key. Once handed to the key worker
/// for caching, the main thread drops its copy.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyEncryptionKey {
    key: [u8; KEY_LENGTH],
}

impl KeyEncryptionKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create a key from a slice.
    ///
    /// # Errors
    /// - Returns `Validation` if the slice is not KEY_LENGTH bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_bytes(fixed(bytes, "key")?))
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        Self {
            key: rand::random::<[u8; KEY_LENGTH]>(),
        }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Overwrite the key with random bytes.
    ///
    /// Used before releasing a cached key so the old value is gone even if
    /// the allocation outlives this value.
    pub fn overwrite_with_random(&mut self) {
        self.key = rand::random::<[u8; KEY_LENGTH]>();
    }
}

impl PartialEq for KeyEncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}

impl Eq for KeyEncryptionKey {}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyEncryptionKey([REDACTED])")
    }
}

/// Password-derived proof of knowledge sent to the server.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthHash {
    hash: [u8; KEY_LENGTH],
}

impl AuthHash {
    /// Create an auth hash from raw bytes.
    pub fn from_bytes(hash: [u8; KEY_LENGTH]) -> Self {
        Self { hash }
    }

    /// Get the hash bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.hash
    }

    /// Encode for transmission.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.hash)
    }
}

impl PartialEq for AuthHash {
    fn eq(&self, other: &Self) -> bool {
        self.hash.ct_eq(&other.hash).into()
    }
}

impl Eq for AuthHash {}

impl fmt::Debug for AuthHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthHash([REDACTED])")
    }
}

/// Salt for password hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        Self(rand::random::<[u8; SALT_LENGTH]>())
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(fixed(bytes, "salt")?))
    }

    /// Decode a base64 salt.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Validation(format!("Invalid base64 salt: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_kek_generate() {
        let key1 = KeyEncryptionKey::generate();
        let key2 = KeyEncryptionKey::generate();

        // Random keys should be different
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_kek_from_slice_rejects_wrong_length() {
        assert!(KeyEncryptionKey::from_slice(&[0u8; 16]).is_err());
        assert!(KeyEncryptionKey::from_slice(&[0u8; KEY_LENGTH]).is_ok());
    }

    #[test]
    fn test_overwrite_with_random_changes_key() {
        let original = KeyEncryptionKey::from_bytes([9u8; KEY_LENGTH]);
        let mut scrambled = original.clone();
        scrambled.overwrite_with_random();
        assert_ne!(original, scrambled);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = KeyEncryptionKey::from_bytes([0xAB; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "KeyEncryptionKey([REDACTED])");
        let hash = AuthHash::from_bytes([0xAB; KEY_LENGTH]);
        assert_eq!(format!("{:?}", hash), "AuthHash([REDACTED])");
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();

        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }

    #[test]
    fn test_salt_from_slice_length() {
        assert!(Salt::from_slice(&[1u8; 15]).is_err());
        assert!(Salt::from_slice(&[1u8; 32]).is_err());
        assert_eq!(Salt::from_slice(&[1u8; 16]).unwrap(), Salt([1u8; 16]));
    }

    proptest! {
        #[test]
        fn salt_base64_is_stable(bytes in proptest::array::uniform16(any::<u8>())) {
            let salt = Salt::from_bytes(bytes);
            let decoded = Salt::from_base64(&salt.to_base64()).unwrap();
            prop_assert_eq!(decoded, salt);
        }
    }
}
