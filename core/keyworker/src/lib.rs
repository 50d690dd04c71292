//! Key derivation worker for VaultSync.
//!
//! Argon2id derivation and key wrapping run in an isolated context (a
//! dedicated thread) that is the only holder of the cached key-encryption
//! key. Callers talk to it through [`KeyWorker`], which correlates requests
//! and responses by id and restarts the context after `lock`/`terminate` or a
//! crash. [`SessionCoordinator`] ties the worker's lifetime to the user's
//! session.
//!
//! # Example
//!
//! ```no_run
//! use vaultsync_crypto::Salt;
//! use vaultsync_keyworker::{KeyWorker, WorkerConfig};
//!
//! # async fn example() -> vaultsync_common::Result<()> {
//! let worker = KeyWorker::new(WorkerConfig::default());
//! let keys = worker
//!     .derive_keys(b"password", &Salt::generate(), &Salt::generate(), None)
//!     .await?;
//! worker.cache_kek(keys.kek).await?;
//! let wrapped = worker.wrap_key(&[0u8; 32], None).await?;
//! worker.lock().await;
//! # let _ = wrapped;
//! # Ok(())
//! # }
//! ```

mod context;
pub mod manager;
mod pending;
pub mod protocol;
pub mod session;

pub use manager::{KeyWorker, WorkerConfig};
pub use pending::ProgressCallback;
pub use protocol::{DerivedKeys, Operation};
pub use session::{SessionCoordinator, SessionState};
