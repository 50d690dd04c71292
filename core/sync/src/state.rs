//! Sync metadata and the observable status machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vaultsync_common::{Error, Result};

/// Persisted sync bookkeeping. One per local store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Server timestamp of the last successful push or pull.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Owner of the synchronized data.
    pub user_id: Option<String>,
    /// True while exactly one sync step is in flight.
    #[serde(default)]
    pub sync_in_progress: bool,
}

impl SyncMetadata {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Engine-wide sync status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
    Offline,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Inputs to the status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    SyncStarted,
    SyncSucceeded,
    SyncFailed,
    NetworkDown,
    NetworkUp,
}

impl SyncStatus {
    /// Next status for `event`, or `None` if the event does not apply.
    pub fn on(self, event: StatusEvent) -> Option<SyncStatus> {
        use StatusEvent::*;
        use SyncStatus::*;

        match (self, event) {
            (Offline, NetworkDown) => None,
            (_, NetworkDown) => Some(Offline),
            (Offline, NetworkUp) => Some(Idle),
            (Idle | Error, SyncStarted) => Some(Syncing),
            (Syncing, SyncSucceeded) => Some(Idle),
            (Syncing, SyncFailed) => Some(Error),
            _ => None,
        }
    }
}

/// Handle returned by [`StatusTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Observer called with `(previous, next)` on every transition.
pub type StatusObserver = Arc<dyn Fn(SyncStatus, SyncStatus) + Send + Sync>;

struct TrackerInner {
    status: SyncStatus,
    observers: Vec<(ObserverId, StatusObserver)>,
}

/// Holds the current status and notifies observers of transitions.
pub struct StatusTracker {
    inner: Mutex<TrackerInner>,
    next_id: AtomicU64,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                status: SyncStatus::Idle,
                observers: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn inner(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SyncStatus {
        self.inner().status
    }

    pub fn subscribe(&self, observer: StatusObserver) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner().observers.push((id, observer));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut inner = self.inner();
        let before = inner.observers.len();
        inner.observers.retain(|(observer_id, _)| *observer_id != id);
        inner.observers.len() != before
    }

    /// Apply an event. Returns the new status if a transition happened.
    pub fn apply(&self, event: StatusEvent) -> Option<SyncStatus> {
        let (previous, next, observers) = {
            let mut inner = self.inner();
            let previous = inner.status;
            let Some(next) = previous.on(event) else {
                debug!("Ignoring {:?} while {}", event, previous);
                return None;
            };
            inner.status = next;
            let observers: Vec<StatusObserver> =
                inner.observers.iter().map(|(_, o)| o.clone()).collect();
            (previous, next, observers)
        };

        debug!("Sync status {} -> {}", previous, next);
        // Observers run outside the lock and may read the status.
        for observer in observers {
            observer(previous, next);
        }
        Some(next)
    }

    /// Force the status to `status` (logout), bypassing the transition table.
    pub fn reset(&self, status: SyncStatus) {
        let (previous, observers) = {
            let mut inner = self.inner();
            let previous = inner.status;
            inner.status = status;
            let observers: Vec<StatusObserver> =
                inner.observers.iter().map(|(_, o)| o.clone()).collect();
            (previous, observers)
        };

        if previous != status {
            debug!("Sync status {} -> {} (reset)", previous, status);
            for observer in observers {
                observer(previous, status);
            }
        }
    }
}
