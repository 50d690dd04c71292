//! Pending-change projection.
//!
//! The queue is rebuilt from record tags for every sync attempt and never
//! stored. A change's timestamp is the record's `updated_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultsync_common::Result;

use crate::model::{ChangeType, Credential, Service, Subscription, SyncRecord};
use crate::store::{LocalStore, RecordStore, RecordVersion};

/// A record with a pending tag, as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange<T> {
    pub operation: ChangeType,
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

impl<T: SyncRecord> PendingChange<T> {
    /// Project a record. Returns `None` for synchronized records.
    pub fn from_record(record: T) -> Option<Self> {
        let operation = record.pending_sync()?;
        Some(Self {
            operation,
            timestamp: record.updated_at(),
            data: record,
        })
    }

    /// Version of the record that this change carries.
    pub fn version(&self) -> RecordVersion {
        (self.data.id().to_string(), self.data.updated_at())
    }
}

/// Counts per entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub services: usize,
    pub credentials: usize,
    pub subscriptions: usize,
}

impl EntityCounts {
    pub fn new(services: usize, credentials: usize, subscriptions: usize) -> Self {
        Self {
            services,
            credentials,
            subscriptions,
        }
    }

    pub fn total(&self) -> usize {
        self.services + self.credentials + self.subscriptions
    }

    /// Field-wise sum.
    pub fn merge(self, other: EntityCounts) -> EntityCounts {
        EntityCounts {
            services: self.services + other.services,
            credentials: self.credentials + other.credentials,
            subscriptions: self.subscriptions + other.subscriptions,
        }
    }
}

/// Everything awaiting upload, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncQueue {
    pub services: Vec<PendingChange<Service>>,
    pub credentials: Vec<PendingChange<Credential>>,
    pub subscriptions: Vec<PendingChange<Subscription>>,
}

impl SyncQueue {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.counts().total()
    }

    pub fn counts(&self) -> EntityCounts {
        EntityCounts::new(
            self.services.len(),
            self.credentials.len(),
            self.subscriptions.len(),
        )
    }
}

async fn pending_of<T, S>(store: &S) -> Result<Vec<PendingChange<T>>>
where
    T: SyncRecord,
    S: RecordStore<T> + ?Sized,
{
    Ok(store
        .get_pending_sync()
        .await?
        .into_iter()
        .filter_map(PendingChange::from_record)
        .collect())
}

/// Scan the store for tagged records. Read-only.
pub async fn collect_queue<S: LocalStore + ?Sized>(store: &S) -> Result<SyncQueue> {
    Ok(SyncQueue {
        services: pending_of::<Service, S>(store).await?,
        credentials: pending_of::<Credential, S>(store).await?,
        subscriptions: pending_of::<Subscription, S>(store).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::BillingCycle;

    #[tokio::test]
    async fn test_collect_only_tagged_records() {
        let store = MemoryStore::new();
        let mut synced = Service::new("u", "Synced");
        synced.mark_synced(Utc::now());
        let fresh = Service::new("u", "Fresh");
        let mut deleted = Credential::new(&fresh.id, "old", "ZA==", "aXY=");
        deleted.record_delete(Utc::now());

        store.save(synced).await.unwrap();
        store.save(fresh.clone()).await.unwrap();
        store.save(deleted).await.unwrap();

        let queue = collect_queue(&store).await.unwrap();
        assert_eq!(queue.counts(), EntityCounts::new(1, 1, 0));
        assert_eq!(queue.services[0].data.id, fresh.id);
        assert_eq!(queue.services[0].timestamp, fresh.updated_at);
        assert_eq!(queue.credentials[0].operation, ChangeType::Delete);
    }

    #[tokio::test]
    async fn test_collect_does_not_mutate() {
        let store = MemoryStore::new();
        store
            .save(Subscription::new("s", "Basic", 500, "USD", BillingCycle::Weekly))
            .await
            .unwrap();

        let first = collect_queue(&store).await.unwrap();
        let second = collect_queue(&store).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let queue = collect_queue(&MemoryStore::new()).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.counts().total(), 0);
    }

    #[test]
    fn test_counts_merge() {
        let merged = EntityCounts::new(1, 2, 3).merge(EntityCounts::new(1, 0, 0));
        assert_eq!(merged, EntityCounts::new(2, 2, 3));
        assert_eq!(merged.total(), 7);
    }
}
