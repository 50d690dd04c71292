//! Common utilities and types shared across VaultSync crates.
//!
//! This crate provides the error taxonomy used by both the sync engine and
//! the key-derivation worker, plus the zeroizing byte container used to move
//! secrets between them.

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::SensitiveBytes;
