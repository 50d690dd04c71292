//! Key wrapping using ChaCha20-Poly1305.
//!
//! ChaCha20-Poly1305 provides both confidentiality and authenticity. Wrapped
//! keys carry their own 12-byte random nonce; a wrapping key must never be
//! used for anywhere near 2^32 wraps, which is far beyond one vault's needs.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};

use crate::keys::KeyEncryptionKey;
use vaultsync_common::{Error, Result, SensitiveBytes};

/// Nonce size for ChaCha20-Poly1305 (12 bytes).
pub const NONCE_LENGTH: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Associated data binding every ciphertext to its purpose.
const WRAP_AAD: &[u8] = b"vaultsync/key-wrap/v1";

/// A key encrypted under a wrapping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Ciphertext followed by the Poly1305 tag.
    pub wrapped_key: Vec<u8>,
    /// Nonce used for this wrap.
    pub iv: [u8; NONCE_LENGTH],
}

impl WrappedKey {
    /// Build from decoded parts, checking the nonce length.
    pub fn from_parts(wrapped_key: Vec<u8>, iv: &[u8]) -> Result<Self> {
        let iv: [u8; NONCE_LENGTH] = iv.try_into().map_err(|_| {
            Error::Validation(format!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_LENGTH,
                iv.len()
            ))
        })?;
        Ok(Self { wrapped_key, iv })
    }

    /// Encode as `(wrapped_key, iv)` base64 strings.
    pub fn to_base64(&self) -> (String, String) {
        (STANDARD.encode(&self.wrapped_key), STANDARD.encode(self.iv))
    }

    /// Decode from base64 strings.
    pub fn from_base64(wrapped_key: &str, iv: &str) -> Result<Self> {
        let wrapped = STANDARD
            .decode(wrapped_key.trim())
            .map_err(|e| Error::Validation(format!("Invalid base64 wrapped key: {}", e)))?;
        let iv = STANDARD
            .decode(iv.trim())
            .map_err(|e| Error::Validation(format!("Invalid base64 nonce: {}", e)))?;
        Self::from_parts(wrapped, &iv)
    }
}

/// Wrap `key` under `wrapping_key` with a fresh random nonce.
///
/// # Preconditions
/// - `key` must not be empty
///
/// # Postconditions
/// - `wrapped_key.len() == key.len() + TAG_SIZE`
///
/// # Errors
/// - `Validation` if `key` is empty
/// - `Crypto` if encryption fails
pub fn wrap_key(wrapping_key: &KeyEncryptionKey, key: &[u8]) -> Result<WrappedKey> {
    if key.is_empty() {
        return Err(Error::Validation("Key to wrap cannot be empty".to_string()));
    }

    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(wrapping_key.as_bytes()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let wrapped = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: key,
                aad: WRAP_AAD,
            },
        )
        .map_err(|e| Error::Crypto(format!("Key wrap failed: {}", e)))?;

    let mut iv = [0u8; NONCE_LENGTH];
    iv.copy_from_slice(&nonce);

    Ok(WrappedKey {
        wrapped_key: wrapped,
        iv,
    })
}

/// Unwrap a key previously produced by [`wrap_key`].
///
/// # Errors
/// - `Validation` if the ciphertext is shorter than the tag
/// - `Crypto` if authentication fails (wrong key or tampered data)
///
/// # Security
/// - Authenticates before returning any plaintext
pub fn unwrap_key(wrapping_key: &KeyEncryptionKey, wrapped: &WrappedKey) -> Result<SensitiveBytes> {
    if wrapped.wrapped_key.len() < TAG_SIZE {
        return Err(Error::Validation("Wrapped key too short".to_string()));
    }

    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(wrapping_key.as_bytes()));

    cipher
        .decrypt(
            GenericArray::from_slice(&wrapped.iv),
            Payload {
                msg: &wrapped.wrapped_key,
                aad: WRAP_AAD,
            },
        )
        .map(SensitiveBytes::new)
        .map_err(|_| Error::Crypto("Key unwrap failed: authentication error".to_string()))
}
