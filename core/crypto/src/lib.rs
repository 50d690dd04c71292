//! Cryptographic primitives for VaultSync.
//!
//! This module provides:
//! - Password hashing using Argon2id (auth hash and key-encryption key)
//! - Key wrapping using ChaCha20-Poly1305
//! - Key types with automatic zeroization
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time comparisons for keys and hashes

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{unwrap_key, wrap_key, WrappedKey, NONCE_LENGTH};
pub use kdf::{derive_auth_hash, derive_kek, verify_auth_hash, KdfParams};
pub use keys::{AuthHash, KeyEncryptionKey, Salt, KEY_LENGTH, SALT_LENGTH};
