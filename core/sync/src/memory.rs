//! In-memory local store.
//!
//! Useful for tests and for clients that keep their data elsewhere. Records
//! of each kind are kept in insertion order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use vaultsync_common::Result;

use crate::model::{Credential, Service, Subscription, SyncRecord};
use crate::state::SyncMetadata;
use crate::store::{MetadataStore, RecordStore, RecordVersion};

/// In-memory [`LocalStore`](crate::store::LocalStore) backend.
#[derive(Default)]
pub struct MemoryStore {
    services: RwLock<Vec<Service>>,
    credentials: RwLock<Vec<Credential>>,
    subscriptions: RwLock<Vec<Subscription>>,
    metadata: RwLock<Option<SyncMetadata>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

macro_rules! impl_record_store {
    ($ty:ty, $field:ident) => {
        #[async_trait]
        impl RecordStore<$ty> for MemoryStore {
            async fn save(&self, record: $ty) -> Result<()> {
                let mut rows = self.$field.write().await;
                match rows.iter_mut().find(|r| r.id == record.id) {
                    Some(existing) => *existing = record,
                    None => rows.push(record),
                }
                Ok(())
            }

            async fn get(&self, id: &str) -> Result<Option<$ty>> {
                let rows = self.$field.read().await;
                Ok(rows.iter().find(|r| r.id == id).cloned())
            }

            async fn get_all(&self) -> Result<Vec<$ty>> {
                Ok(self.$field.read().await.clone())
            }

            async fn delete(&self, id: &str) -> Result<bool> {
                let mut rows = self.$field.write().await;
                let before = rows.len();
                rows.retain(|r| r.id != id);
                Ok(rows.len() != before)
            }

            async fn clear_pending_sync(
                &self,
                snapshot: &[RecordVersion],
                synced_at: DateTime<Utc>,
            ) -> Result<usize> {
                let mut rows = self.$field.write().await;
                let mut cleared = 0;
                for (id, updated_at) in snapshot {
                    if let Some(row) = rows.iter_mut().find(|r| &r.id == id) {
                        if row.updated_at == *updated_at {
                            row.mark_synced(synced_at);
                            cleared += 1;
                        }
                    }
                }
                Ok(cleared)
            }

            async fn page(&self, offset: usize, limit: usize) -> Result<Vec<$ty>> {
                let rows = self.$field.read().await;
                Ok(rows.iter().skip(offset).take(limit).cloned().collect())
            }
        }
    };
}

impl_record_store!(Service, services);
impl_record_store!(Credential, credentials);
impl_record_store!(Subscription, subscriptions);

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn load_metadata(&self) -> Result<Option<SyncMetadata>> {
        Ok(self.metadata.read().await.clone())
    }

    async fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        *self.metadata.write().await = Some(metadata.clone());
        Ok(())
    }
}
