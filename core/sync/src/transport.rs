//! Remote sync transport abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultsync_common::Result;

use crate::model::{Credential, Service, Subscription};
use crate::queue::{EntityCounts, SyncQueue};

/// Ids the server reports as deleted, by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletedIds {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub credentials: Vec<String>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl DeletedIds {
    pub fn counts(&self) -> EntityCounts {
        EntityCounts::new(
            self.services.len(),
            self.credentials.len(),
            self.subscriptions.len(),
        )
    }
}

/// Body returned by both push and pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    pub server_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub deleted_ids: DeletedIds,
}

impl SyncResponse {
    /// An empty response stamped with `server_timestamp`.
    pub fn empty(server_timestamp: DateTime<Utc>) -> Self {
        Self {
            services: Vec::new(),
            credentials: Vec::new(),
            subscriptions: Vec::new(),
            server_timestamp,
            deleted_ids: DeletedIds::default(),
        }
    }

    /// Number of records to upsert, by kind.
    pub fn upsert_counts(&self) -> EntityCounts {
        EntityCounts::new(
            self.services.len(),
            self.credentials.len(),
            self.subscriptions.len(),
        )
    }
}

/// Remote authority for synchronized data.
///
/// Implementations map network unavailability to `Error::Offline` and any
/// rejection to `Error::Transport`.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Whether the network is reachable right now.
    async fn is_online(&self) -> bool;

    /// Upload pending changes.
    async fn push_changes(&self, queue: &SyncQueue, token: &str) -> Result<SyncResponse>;

    /// Download changes since `since`, or everything if `None`.
    async fn pull_changes(
        &self,
        since: Option<DateTime<Utc>>,
        token: &str,
    ) -> Result<SyncResponse>;
}
