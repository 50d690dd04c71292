//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks.
//!
//! The same password and salt feed two derivations: the auth hash that is
//! sent to the server and the key-encryption key that never leaves the
//! client. Each derivation appends its own context label to the salt so the
//! two outputs are unrelated even when a caller reuses one salt for both.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::keys::{AuthHash, KeyEncryptionKey, Salt, KEY_LENGTH};
use vaultsync_common::{Error, Result};

const AUTH_CONTEXT: &[u8] = b"vaultsync/auth-hash/v1";
const KEK_CONTEXT: &[u8] = b"vaultsync/kek/v1";

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Create parameters suitable for interactive use.
    ///
    /// These parameters provide a balance between security and usability,
    /// targeting approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Create moderate parameters for mobile devices.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// Look up a preset by name.
    pub fn from_preset(name: &str) -> Result<Self> {
        match name {
            "interactive" => Ok(Self::interactive()),
            "moderate" => Ok(Self::moderate()),
            "sensitive" => Ok(Self::sensitive()),
            other => Err(Error::Validation(format!("Unknown KDF preset: {}", other))),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Run Argon2id over `password` with `salt || context` as the salt input.
fn derive_raw(
    password: &[u8],
    salt: &Salt,
    context: &[u8],
    params: &KdfParams,
) -> Result<[u8; KEY_LENGTH]> {
    if password.is_empty() {
        return Err(Error::Validation("Password cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Validation(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut salted = Vec::with_capacity(salt.as_bytes().len() + context.len());
    salted.extend_from_slice(salt.as_bytes());
    salted.extend_from_slice(context);

    let mut out = [0u8; KEY_LENGTH];
    let result = argon2.hash_password_into(password, &salted, &mut out);
    salted.zeroize();

    if let Err(e) = result {
        out.zeroize();
        return Err(Error::Crypto(format!("Key derivation failed: {}", e)));
    }

    Ok(out)
}

/// Derive the server authentication hash.
///
/// # Preconditions
/// - `password` must not be empty
///
/// # Postconditions
/// - Deterministic for identical `(password, salt, params)`
///
/// # Errors
/// - `Validation` for an empty password or invalid parameters
pub fn derive_auth_hash(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<AuthHash> {
    derive_raw(password, salt, AUTH_CONTEXT, params).map(AuthHash::from_bytes)
}

/// Derive the key-encryption key.
///
/// # Security
/// - Password is not stored or logged
/// - The output is domain-separated from [`derive_auth_hash`]
pub fn derive_kek(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<KeyEncryptionKey> {
    derive_raw(password, salt, KEK_CONTEXT, params).map(KeyEncryptionKey::from_bytes)
}

/// Check a password against a known auth hash in constant time.
pub fn verify_auth_hash(
    password: &[u8],
    salt: &Salt,
    params: &KdfParams,
    expected: &AuthHash,
) -> Result<bool> {
    let derived = derive_auth_hash(password, salt, params)?;
    Ok(derived.as_bytes().ct_eq(expected.as_bytes()).into())
}
