//! Local store abstraction.
//!
//! The engine reads pending records through these traits and is their only
//! writer of sync tags and metadata. Backends implement [`RecordStore`] once
//! per entity kind plus [`MetadataStore`]; [`LocalStore`] is implemented
//! automatically for anything that has all four.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};

use vaultsync_common::Result;

use crate::model::{Credential, Service, Subscription, SyncRecord};
use crate::state::SyncMetadata;

/// Default number of records per page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Snapshot of a record version: its id and the `updated_at` that was sent.
pub type RecordVersion = (String, DateTime<Utc>);

/// Persistence for one entity kind.
#[async_trait]
pub trait RecordStore<T: SyncRecord>: Send + Sync {
    /// Insert or replace a record by id.
    async fn save(&self, record: T) -> Result<()>;

    /// Insert or replace several records.
    async fn save_many(&self, records: Vec<T>) -> Result<()> {
        for record in records {
            self.save(record).await?;
        }
        Ok(())
    }

    /// Get a record by id.
    async fn get(&self, id: &str) -> Result<Option<T>>;

    /// All records in insertion order.
    async fn get_all(&self) -> Result<Vec<T>>;

    /// Hard-delete a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Records carrying a pending tag.
    async fn get_pending_sync(&self) -> Result<Vec<T>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|r| r.pending_sync().is_some())
            .collect())
    }

    /// Clear the tag of each snapshot record whose `updated_at` still
    /// matches. Records edited since the snapshot keep their tag.
    ///
    /// Returns the number of records cleared.
    async fn clear_pending_sync(
        &self,
        snapshot: &[RecordVersion],
        synced_at: DateTime<Utc>,
    ) -> Result<usize>;

    /// Up to `limit` records starting at `offset`, in insertion order.
    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<T>>;
}

/// Persistence for the sync metadata singleton.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Stored metadata, or `None` before the first save.
    async fn load_metadata(&self) -> Result<Option<SyncMetadata>>;

    async fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()>;
}

/// Everything the sync engine needs from local storage.
pub trait LocalStore:
    RecordStore<Service> + RecordStore<Credential> + RecordStore<Subscription> + MetadataStore
{
}

impl<S> LocalStore for S where
    S: RecordStore<Service>
        + RecordStore<Credential>
        + RecordStore<Subscription>
        + MetadataStore
        + ?Sized
{
}

/// Stream all records of one kind in pages of `page_size`.
///
/// Each call starts a fresh cursor at the first record.
pub fn batches<'a, T, S>(
    store: &'a S,
    page_size: usize,
) -> impl Stream<Item = Result<Vec<T>>> + Send + 'a
where
    T: SyncRecord,
    S: RecordStore<T> + ?Sized,
{
    let page_size = page_size.max(1);
    stream::try_unfold(Some(0usize), move |cursor| async move {
        let Some(offset) = cursor else {
            return Ok(None);
        };
        let page = store.page(offset, page_size).await?;
        if page.is_empty() {
            return Ok(None);
        }
        let next = (page.len() == page_size).then(|| offset + page.len());
        Ok(Some((page, next)))
    })
}
