//! VaultSync Sync Engine
//!
//! Offline-first synchronization of services, credentials, and subscriptions:
//! - Local edits tag records; the pending queue is projected from the tags
//! - Push before pull, with a persisted single-flight flag
//! - Observable status machine (idle, syncing, error, offline)
//! - Debounced background scheduling

pub mod engine;
pub mod memory;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use engine::{SyncConfig, SyncEngine, SyncReport};
pub use memory::MemoryStore;
pub use model::{
    BillingCycle, ChangeType, Credential, EntityKind, Service, Subscription, SyncRecord,
};
pub use queue::{collect_queue, EntityCounts, PendingChange, SyncQueue};
pub use scheduler::Debouncer;
pub use state::{ObserverId, StatusEvent, StatusObserver, StatusTracker, SyncMetadata, SyncStatus};
pub use store::{batches, LocalStore, MetadataStore, RecordStore, DEFAULT_PAGE_SIZE};
pub use transport::{DeletedIds, SyncResponse, SyncTransport};
