//! Core sync engine: pushes tagged local records, pulls remote changes, and
//! keeps the persisted sync metadata and observable status consistent.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use vaultsync_common::{Error, ErrorKind, Result};

use crate::model::{ChangeType, Credential, Service, Subscription, SyncRecord};
use crate::queue::{collect_queue, EntityCounts, PendingChange, SyncQueue};
use crate::scheduler::Debouncer;
use crate::state::{
    ObserverId, StatusEvent, StatusObserver, StatusTracker, SyncMetadata, SyncStatus,
};
use crate::store::{self, LocalStore, RecordStore, DEFAULT_PAGE_SIZE};
use crate::transport::{SyncResponse, SyncTransport};

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Delay before a scheduled sync fires.
    pub debounce: Duration,
    /// Records per page when streaming local data.
    pub page_size: usize,
    /// Upper bound on a single transport call, if any.
    #[serde(default)]
    pub transport_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            page_size: DEFAULT_PAGE_SIZE,
            transport_timeout: None,
        }
    }
}

/// Outcome of a push, pull, or reconcile. Failures are reported here rather
/// than as `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub uploaded: EntityCounts,
    pub downloaded: EntityCounts,
    pub deleted: EntityCounts,
    pub duration: Duration,
}

impl SyncReport {
    fn succeeded(
        uploaded: EntityCounts,
        downloaded: EntityCounts,
        deleted: EntityCounts,
        duration: Duration,
    ) -> Self {
        Self {
            success: true,
            error: None,
            error_kind: None,
            uploaded,
            downloaded,
            deleted,
            duration,
        }
    }

    fn failed(err: &Error, duration: Duration) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            uploaded: EntityCounts::default(),
            downloaded: EntityCounts::default(),
            deleted: EntityCounts::default(),
            duration,
        }
    }

    /// Combine two sequential reports. The first failure wins.
    fn then(self, next: SyncReport, duration: Duration) -> Self {
        Self {
            success: self.success && next.success,
            error: self.error.or(next.error),
            error_kind: self.error_kind.or(next.error_kind),
            uploaded: self.uploaded.merge(next.uploaded),
            downloaded: self.downloaded.merge(next.downloaded),
            deleted: self.deleted.merge(next.deleted),
            duration,
        }
    }
}

/// Marks a sync step started by this engine as running until dropped.
struct Running(Arc<AtomicBool>);

impl Running {
    fn start(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Running(flag.clone())
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct PullOutcome {
    downloaded: EntityCounts,
    deleted: EntityCounts,
    server_timestamp: DateTime<Utc>,
}

/// Sync engine over a local store.
///
/// Cloning is cheap; clones share the store, status, schedule, and the
/// in-process guard around the persisted in-progress flag.
///
/// `running` is set only while a step started by this process holds the
/// persisted flag. A persisted flag without it was left by an earlier process.
pub struct SyncEngine<S: LocalStore + ?Sized> {
    store: Arc<S>,
    config: SyncConfig,
    status: Arc<StatusTracker>,
    flight: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
    debouncer: Arc<Debouncer>,
    network_available: Arc<AtomicBool>,
}

impl<S: LocalStore + ?Sized> Clone for SyncEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            status: self.status.clone(),
            flight: self.flight.clone(),
            running: self.running.clone(),
            debouncer: self.debouncer.clone(),
            network_available: self.network_available.clone(),
        }
    }
}

impl<S: LocalStore + ?Sized> SyncEngine<S> {
    /// Create an engine over `store`.
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            status: Arc::new(StatusTracker::new()),
            flight: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
            debouncer: Arc::new(Debouncer::new()),
            network_available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.status.status()
    }

    /// Register a status observer.
    pub fn subscribe(&self, observer: StatusObserver) -> ObserverId {
        self.status.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.status.unsubscribe(id)
    }

    /// Stored metadata, or the default if none was saved yet.
    pub async fn metadata(&self) -> Result<SyncMetadata> {
        Ok(self.store.load_metadata().await?.unwrap_or_default())
    }

    /// Project the pending changes. Read-only.
    pub async fn collect_queue(&self) -> Result<SyncQueue> {
        collect_queue(self.store.as_ref()).await
    }

    /// Stream local records of one kind in pages of `config.page_size`.
    pub fn batches<T>(&self) -> impl Stream<Item = Result<Vec<T>>> + Send + '_
    where
        T: SyncRecord,
        S: RecordStore<T>,
    {
        store::batches(self.store.as_ref(), self.config.page_size)
    }

    /// Feed a network reachability change into the status machine.
    pub fn set_network_available(&self, available: bool) {
        let previous = self.network_available.swap(available, Ordering::SeqCst);
        if previous != available {
            info!(
                "Network {}",
                if available { "available" } else { "unavailable" }
            );
        }
        let event = if available {
            StatusEvent::NetworkUp
        } else {
            StatusEvent::NetworkDown
        };
        self.status.apply(event);
    }

    /// Upload every tagged record.
    ///
    /// # Postconditions
    /// - On success, records sent are untagged unless edited meanwhile, and
    ///   acknowledged deletions are removed from the store
    /// - On failure, tags are unchanged
    /// - The in-progress flag is clear on every path that set it
    pub async fn push_local<T>(&self, transport: &T, token: &str) -> SyncReport
    where
        T: SyncTransport + ?Sized,
    {
        let started = Instant::now();
        match self.try_push(transport, token).await {
            Ok(uploaded) => {
                let report = SyncReport::succeeded(
                    uploaded,
                    EntityCounts::default(),
                    EntityCounts::default(),
                    started.elapsed(),
                );
                if uploaded.total() > 0 {
                    info!("Push completed: {} change(s) uploaded", uploaded.total());
                }
                report
            }
            Err(e) => {
                warn!("Push failed: {}", e);
                SyncReport::failed(&e, started.elapsed())
            }
        }
    }

    /// Download and apply remote changes since the last sync.
    pub async fn pull_remote<T>(&self, transport: &T, token: &str, user_id: &str) -> SyncReport
    where
        T: SyncTransport + ?Sized,
    {
        let started = Instant::now();
        match self.try_pull(transport, token, user_id).await {
            Ok(outcome) => {
                info!(
                    "Pull completed: {} downloaded, {} deleted",
                    outcome.downloaded.total(),
                    outcome.deleted.total()
                );
                SyncReport::succeeded(
                    EntityCounts::default(),
                    outcome.downloaded,
                    outcome.deleted,
                    started.elapsed(),
                )
            }
            Err(e) => {
                warn!("Pull failed: {}", e);
                SyncReport::failed(&e, started.elapsed())
            }
        }
    }

    /// Push, then pull.
    ///
    /// A push failure other than `Offline` is returned without pulling.
    pub async fn reconcile<T>(&self, transport: &T, token: &str, user_id: &str) -> SyncReport
    where
        T: SyncTransport + ?Sized,
    {
        let started = Instant::now();
        info!("Starting sync");

        let push = self.push_local(transport, token).await;
        if !push.success && push.error_kind != Some(ErrorKind::Offline) {
            return SyncReport {
                duration: started.elapsed(),
                ..push
            };
        }

        let pull = self.pull_remote(transport, token, user_id).await;
        let report = push.then(pull, started.elapsed());
        if report.success {
            info!(
                "Sync completed in {:?}: {} up, {} down, {} deleted",
                report.duration,
                report.uploaded.total(),
                report.downloaded.total(),
                report.deleted.total()
            );
        }
        report
    }

    /// Cancel a scheduled sync that has not started. Idempotent.
    pub fn cancel_schedule(&self) -> bool {
        let cancelled = self.debouncer.cancel();
        if cancelled {
            debug!("Scheduled sync cancelled");
        }
        cancelled
    }

    /// Whether a scheduled sync is waiting to fire.
    pub fn has_scheduled_sync(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Reset sync state on logout.
    ///
    /// Fails with `AlreadyInProgress`, changing nothing, while a sync step of
    /// this engine is running. A stale in-progress flag is cleared.
    pub async fn reset(&self) -> Result<()> {
        {
            let _flight = self.flight.lock().await;
            if self.running.load(Ordering::SeqCst) {
                return Err(Error::AlreadyInProgress);
            }
            self.cancel_schedule();
            self.store.save_metadata(&SyncMetadata::default()).await?;
        }

        let status = if self.network_available.load(Ordering::SeqCst) {
            SyncStatus::Idle
        } else {
            SyncStatus::Offline
        };
        self.status.reset(status);
        info!("Sync state reset");
        Ok(())
    }

    async fn ensure_online<T: SyncTransport + ?Sized>(&self, transport: &T) -> Result<()> {
        if !self.network_available.load(Ordering::SeqCst) || !transport.is_online().await {
            return Err(Error::Offline("network unavailable".to_string()));
        }
        Ok(())
    }

    async fn try_push<T>(&self, transport: &T, token: &str) -> Result<EntityCounts>
    where
        T: SyncTransport + ?Sized,
    {
        self.ensure_online(transport).await?;

        let (queue, running) = {
            let _flight = self.flight.lock().await;
            let mut metadata = self.metadata().await?;
            if metadata.sync_in_progress {
                return Err(Error::AlreadyInProgress);
            }
            let queue = self.collect_queue().await?;
            if queue.is_empty() {
                debug!("Nothing to push");
                return Ok(EntityCounts::default());
            }
            metadata.sync_in_progress = true;
            self.store.save_metadata(&metadata).await?;
            (queue, Running::start(&self.running))
        };

        self.status.apply(StatusEvent::SyncStarted);
        debug!("Pushing {} change(s)", queue.len());

        let outcome = self.push_queue(transport, &queue, token).await;
        let server_timestamp = outcome.as_ref().ok().copied();
        let ended = self.end_flight(running, server_timestamp, None).await;
        let result = outcome.and(ended).map(|_| queue.counts());

        self.finish_status(&result);
        result
    }

    async fn push_queue<T>(
        &self,
        transport: &T,
        queue: &SyncQueue,
        token: &str,
    ) -> Result<DateTime<Utc>>
    where
        T: SyncTransport + ?Sized,
    {
        // Entity bodies in the push response are not applied; the next pull
        // delivers the server's view.
        let response = self
            .call_transport(transport.push_changes(queue, token))
            .await?;
        let synced_at = response.server_timestamp;

        settle(self.store.as_ref(), &queue.services, synced_at).await?;
        settle(self.store.as_ref(), &queue.credentials, synced_at).await?;
        settle(self.store.as_ref(), &queue.subscriptions, synced_at).await?;

        Ok(synced_at)
    }

    async fn try_pull<T>(&self, transport: &T, token: &str, user_id: &str) -> Result<PullOutcome>
    where
        T: SyncTransport + ?Sized,
    {
        self.ensure_online(transport).await?;

        let (since, running) = {
            let _flight = self.flight.lock().await;
            let mut metadata = self.metadata().await?;
            if metadata.sync_in_progress {
                return Err(Error::AlreadyInProgress);
            }
            metadata.sync_in_progress = true;
            self.store.save_metadata(&metadata).await?;
            (metadata.last_synced_at, Running::start(&self.running))
        };

        self.status.apply(StatusEvent::SyncStarted);
        debug!("Pulling changes since {:?}", since);

        let outcome = match self
            .call_transport(transport.pull_changes(since, token))
            .await
        {
            Ok(response) => self.apply_pull(response).await,
            Err(e) => Err(e),
        };
        let server_timestamp = outcome.as_ref().ok().map(|o| o.server_timestamp);
        let user = outcome.is_ok().then_some(user_id);
        let ended = self.end_flight(running, server_timestamp, user).await;
        let result = outcome.and_then(|o| ended.map(|_| o));

        self.finish_status(&result);
        result
    }

    async fn apply_pull(&self, response: SyncResponse) -> Result<PullOutcome> {
        let synced_at = response.server_timestamp;
        let downloaded = response.upsert_counts();

        upsert(self.store.as_ref(), response.services, synced_at).await?;
        upsert(self.store.as_ref(), response.credentials, synced_at).await?;
        upsert(self.store.as_ref(), response.subscriptions, synced_at).await?;

        let deleted = EntityCounts::new(
            remove::<Service, S>(self.store.as_ref(), &response.deleted_ids.services).await?,
            remove::<Credential, S>(self.store.as_ref(), &response.deleted_ids.credentials)
                .await?,
            remove::<Subscription, S>(self.store.as_ref(), &response.deleted_ids.subscriptions)
                .await?,
        );

        Ok(PullOutcome {
            downloaded,
            deleted,
            server_timestamp: synced_at,
        })
    }

    /// Clear the in-progress flag, recording a successful step's results.
    async fn end_flight(
        &self,
        running: Running,
        last_synced_at: Option<DateTime<Utc>>,
        user_id: Option<&str>,
    ) -> Result<()> {
        let _flight = self.flight.lock().await;
        // Released while `flight` is held so `reset` never sees a half-ended step.
        let _running = running;
        let mut metadata = self.metadata().await?;
        metadata.sync_in_progress = false;
        if let Some(at) = last_synced_at {
            metadata.last_synced_at = Some(at);
        }
        if let Some(user_id) = user_id {
            metadata.user_id = Some(user_id.to_string());
        }
        self.store.save_metadata(&metadata).await.map_err(|e| {
            error!("Failed to clear sync-in-progress flag: {}", e);
            e
        })
    }

    fn finish_status<R>(&self, result: &Result<R>) {
        let event = if result.is_ok() {
            StatusEvent::SyncSucceeded
        } else {
            StatusEvent::SyncFailed
        };
        self.status.apply(event);
    }

    async fn call_transport<F>(&self, call: F) -> Result<SyncResponse>
    where
        F: Future<Output = Result<SyncResponse>>,
    {
        match self.config.transport_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                Error::Timeout(format!("transport call exceeded {:?}", limit))
            })?,
            None => call.await,
        }
    }
}

impl<S: LocalStore + ?Sized + 'static> SyncEngine<S> {
    /// Run a full [`reconcile`](Self::reconcile) after `delay` (or the
    /// configured debounce). Scheduling again before it fires restarts the
    /// timer.
    pub fn schedule_sync<T>(
        &self,
        transport: Arc<T>,
        token: impl Into<String>,
        user_id: impl Into<String>,
        delay: Option<Duration>,
    ) where
        T: SyncTransport + ?Sized + 'static,
    {
        let delay = delay.unwrap_or(self.config.debounce);
        let engine = self.clone();
        let token = token.into();
        let user_id = user_id.into();

        debug!("Sync scheduled in {:?}", delay);
        self.debouncer.schedule(delay, move || async move {
            let report = engine.reconcile(transport.as_ref(), &token, &user_id).await;
            match (report.error, report.error_kind) {
                (None, _) => debug!("Scheduled sync finished"),
                (Some(reason), Some(kind)) if kind.is_transient() => {
                    info!("Scheduled sync deferred: {}", reason)
                }
                (Some(reason), _) => warn!("Scheduled sync failed: {}", reason),
            }
        });
    }
}

/// Apply a successful push to one kind.
async fn settle<T, S>(
    store: &S,
    changes: &[PendingChange<T>],
    synced_at: DateTime<Utc>,
) -> Result<()>
where
    T: SyncRecord,
    S: RecordStore<T> + ?Sized,
{
    let mut versions = Vec::with_capacity(changes.len());
    for change in changes {
        if change.operation == ChangeType::Delete {
            store.delete(change.data.id()).await?;
        } else {
            versions.push(change.version());
        }
    }

    if !versions.is_empty() {
        let cleared = store.clear_pending_sync(&versions, synced_at).await?;
        if cleared < versions.len() {
            debug!(
                "{} {} record(s) changed during push and stay pending",
                versions.len() - cleared,
                T::KIND
            );
        }
    }
    Ok(())
}

/// Store server versions, untagged.
async fn upsert<T, S>(store: &S, records: Vec<T>, synced_at: DateTime<Utc>) -> Result<()>
where
    T: SyncRecord,
    S: RecordStore<T> + ?Sized,
{
    if records.is_empty() {
        return Ok(());
    }
    let records = records
        .into_iter()
        .map(|mut record| {
            record.mark_synced(synced_at);
            record
        })
        .collect();
    store.save_many(records).await
}

/// Delete by id, ignoring unknown ids. Returns how many were removed.
async fn remove<T, S>(store: &S, ids: &[String]) -> Result<usize>
where
    T: SyncRecord,
    S: RecordStore<T> + ?Sized,
{
    let mut removed = 0;
    for id in ids {
        if store.delete(id).await? {
            removed += 1;
        } else {
            debug!("Remote deletion of unknown {} {}", T::KIND, id);
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::BillingCycle;
    use crate::store::MetadataStore;
    use crate::testing::{Call, MockTransport};
    use crate::transport::DeletedIds;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    fn engine() -> SyncEngine<MemoryStore> {
        SyncEngine::new(Arc::new(MemoryStore::new()), SyncConfig::default())
    }

    fn server_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    async fn pending_services(engine: &SyncEngine<MemoryStore>) -> Vec<Service> {
        RecordStore::<Service>::get_pending_sync(engine.store().as_ref())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_push_one_dirty_service() {
        let engine = engine();
        let service = Service::new("user-1", "Mail");
        engine.store().save(service.clone()).await.unwrap();

        let transport = MockTransport::new();
        transport.queue_push(Ok(SyncResponse::empty(server_time())));

        let report = engine.push_local(&transport, "token").await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.uploaded, EntityCounts::new(1, 0, 0));
        assert!(pending_services(&engine).await.is_empty());

        let stored: Option<Service> = engine.store().get(&service.id).await.unwrap();
        assert_eq!(stored.unwrap().last_synced_at, Some(server_time()));

        let metadata = engine.metadata().await.unwrap();
        assert_eq!(metadata.last_synced_at, Some(server_time()));
        assert!(!metadata.sync_in_progress);
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_push_empty_queue_makes_no_call() {
        let engine = engine();
        let transport = MockTransport::new();

        let report = engine.push_local(&transport, "token").await;
        assert!(report.success);
        assert_eq!(report.uploaded.total(), 0);
        assert!(transport.calls().is_empty());
        assert!(engine.store().load_metadata().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_pushes_before_pull() {
        let engine = engine();
        engine
            .store()
            .save(Service::new("user-1", "Mail"))
            .await
            .unwrap();
        let transport = MockTransport::new();
        transport.queue_push(Ok(SyncResponse::empty(server_time())));

        let report = engine.reconcile(&transport, "token", "user-1").await;
        assert!(report.success);

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::Push(EntityCounts::new(1, 0, 0)));
        // The pull starts from the push's server timestamp.
        assert_eq!(calls[1], Call::Pull(Some(server_time())));
        assert_eq!(report.uploaded, EntityCounts::new(1, 0, 0));
    }

    #[tokio::test]
    async fn test_in_progress_guard() {
        let engine = engine();
        let service = Service::new("user-1", "Mail");
        engine.store().save(service.clone()).await.unwrap();
        let stuck = SyncMetadata {
            sync_in_progress: true,
            ..Default::default()
        };
        engine.store().save_metadata(&stuck).await.unwrap();

        let transport = MockTransport::new();
        let push = engine.push_local(&transport, "token").await;
        let pull = engine.pull_remote(&transport, "token", "user-1").await;

        for report in [&push, &pull] {
            assert!(!report.success);
            assert_eq!(report.error_kind, Some(ErrorKind::AlreadyInProgress));
            assert!(report
                .error
                .as_deref()
                .unwrap()
                .contains("already in progress"));
        }
        assert!(transport.calls().is_empty());
        assert_eq!(engine.metadata().await.unwrap(), stuck);
        assert_eq!(pending_services(&engine).await.len(), 1);
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    /// Transport that edits a record while the push is in flight.
    struct EditingTransport {
        store: Arc<MemoryStore>,
        edit_id: String,
    }

    #[async_trait]
    impl SyncTransport for EditingTransport {
        async fn is_online(&self) -> bool {
            true
        }

        async fn push_changes(&self, _queue: &SyncQueue, _token: &str) -> Result<SyncResponse> {
            let mut record: Service = self.store.get(&self.edit_id).await?.unwrap();
            record.name.push_str(" (edited)");
            record.record_update(record.updated_at + chrono::Duration::seconds(1));
            self.store.save(record).await?;
            Ok(SyncResponse::empty(server_time()))
        }

        async fn pull_changes(
            &self,
            _since: Option<DateTime<Utc>>,
            _token: &str,
        ) -> Result<SyncResponse> {
            Ok(SyncResponse::empty(server_time()))
        }
    }

    #[tokio::test]
    async fn test_records_dirtied_during_push_stay_pending() {
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(store.clone(), SyncConfig::default());
        let untouched = Service::new("u", "A");
        let edited = Service::new("u", "B");
        store.save(untouched.clone()).await.unwrap();
        store.save(edited.clone()).await.unwrap();

        let transport = EditingTransport {
            store: store.clone(),
            edit_id: edited.id.clone(),
        };
        let report = engine.push_local(&transport, "token").await;
        assert!(report.success);
        assert_eq!(report.uploaded, EntityCounts::new(2, 0, 0));

        let pending = pending_services(&engine).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, edited.id);
        assert_eq!(pending[0].pending_sync, Some(ChangeType::Create));
    }

    #[tokio::test]
    async fn test_push_removes_acknowledged_deletes() {
        let engine = engine();
        let mut credential = Credential::new("svc", "old", "ZA==", "aXY=");
        credential.mark_synced(server_time());
        credential.record_delete(Utc::now());
        engine.store().save(credential.clone()).await.unwrap();

        let report = engine.push_local(&MockTransport::new(), "token").await;
        assert!(report.success);
        assert_eq!(report.uploaded, EntityCounts::new(0, 1, 0));
        let stored: Option<Credential> = engine.store().get(&credential.id).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_pull_upserts_and_deletes() {
        let engine = engine();
        let local = Credential::new("svc-0", "old", "ZA==", "aXY=");
        engine.store().save(local.clone()).await.unwrap();

        let mut remote = Service::new("user-1", "Bank");
        remote.pending_sync = None;
        let mut response = SyncResponse::empty(server_time());
        response.services.push(remote.clone());
        response.deleted_ids = DeletedIds {
            credentials: vec![local.id.clone(), "missing".to_string()],
            ..Default::default()
        };

        let transport = MockTransport::new();
        transport.queue_pull(Ok(response));

        let report = engine.pull_remote(&transport, "token", "user-1").await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.downloaded, EntityCounts::new(1, 0, 0));
        assert_eq!(report.deleted, EntityCounts::new(0, 1, 0));
        assert_eq!(transport.calls(), vec![Call::Pull(None)]);

        let stored: Service = engine.store().get(&remote.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Bank");
        assert!(stored.pending_sync.is_none());
        assert_eq!(stored.last_synced_at, Some(server_time()));
        let gone: Option<Credential> = engine.store().get(&local.id).await.unwrap();
        assert!(gone.is_none());

        let metadata = engine.metadata().await.unwrap();
        assert_eq!(metadata.user_id.as_deref(), Some("user-1"));
        assert_eq!(metadata.last_synced_at, Some(server_time()));
        assert!(!metadata.sync_in_progress);
    }

    #[tokio::test]
    async fn test_offline_push_leaves_state_alone() {
        let engine = engine();
        engine
            .store()
            .save(Subscription::new("s", "Pro", 999, "USD", BillingCycle::Monthly))
            .await
            .unwrap();
        let transport = MockTransport::new();
        transport.set_online(false);

        let report = engine.push_local(&transport, "token").await;
        assert!(!report.success);
        assert_eq!(report.error_kind, Some(ErrorKind::Offline));
        assert!(report.error.as_deref().unwrap().contains("Offline"));
        assert!(transport.calls().is_empty());
        assert!(engine.store().load_metadata().await.unwrap().is_none());
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_push_failure_keeps_tags_and_clears_flag() {
        let engine = engine();
        engine
            .store()
            .save(Service::new("user-1", "Mail"))
            .await
            .unwrap();
        let transport = MockTransport::new();
        transport.queue_push(Err(Error::Transport("HTTP 500".into())));

        let report = engine.push_local(&transport, "token").await;
        assert!(!report.success);
        assert_eq!(report.error_kind, Some(ErrorKind::Transport));
        assert_eq!(pending_services(&engine).await.len(), 1);
        assert!(!engine.metadata().await.unwrap().sync_in_progress);
        assert_eq!(engine.status(), SyncStatus::Error);

        // Retry succeeds from the error state.
        let report = engine.push_local(&transport, "token").await;
        assert!(report.success);
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_reconcile_stops_after_push_failure() {
        let engine = engine();
        engine
            .store()
            .save(Service::new("user-1", "Mail"))
            .await
            .unwrap();
        let transport = MockTransport::new();
        transport.queue_push(Err(Error::Transport("rejected".into())));

        let report = engine.reconcile(&transport, "token", "user-1").await;
        assert!(!report.success);
        assert_eq!(transport.calls().len(), 1);
        assert!(matches!(transport.calls()[0], Call::Push(_)));
    }

    #[tokio::test]
    async fn test_reconcile_when_offline_reports_offline() {
        let engine = engine();
        let transport = MockTransport::new();
        transport.set_online(false);

        let report = engine.reconcile(&transport, "token", "user-1").await;
        assert!(!report.success);
        assert_eq!(report.error_kind, Some(ErrorKind::Offline));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_pulls_after_offline_push() {
        let engine = engine();
        engine
            .store()
            .save(Service::new("user-1", "Mail"))
            .await
            .unwrap();
        let transport = MockTransport::new();
        transport.queue_push(Err(Error::Offline("connection dropped".into())));

        let mut response = SyncResponse::empty(server_time());
        response.services.push(Service::new("user-1", "Bank"));
        transport.queue_pull(Ok(response));

        let report = engine.reconcile(&transport, "token", "user-1").await;
        assert!(!report.success);
        assert_eq!(report.error_kind, Some(ErrorKind::Offline));
        assert_eq!(report.downloaded, EntityCounts::new(1, 0, 0));
        assert_eq!(
            transport.calls(),
            vec![Call::Push(EntityCounts::new(1, 0, 0)), Call::Pull(None)]
        );
        // The local edit is still queued for the next sync.
        let pending = pending_services(&engine).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "Mail");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_timeout() {
        let config = SyncConfig {
            transport_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let engine = SyncEngine::new(Arc::new(MemoryStore::new()), config);
        let transport = MockTransport::new();
        transport.set_delay(Duration::from_secs(30));

        let report = engine.pull_remote(&transport, "token", "user-1").await;
        assert_eq!(report.error_kind, Some(ErrorKind::Timeout));
        assert!(!engine.metadata().await.unwrap().sync_in_progress);
    }

    #[tokio::test]
    async fn test_status_observer_sees_transitions() {
        let engine = engine();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let id = engine.subscribe(Arc::new(move |prev, next| {
            sink.lock().unwrap().push((prev, next));
        }));

        let transport = MockTransport::new();
        engine.pull_remote(&transport, "token", "u").await;
        assert!(engine.unsubscribe(id));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SyncStatus::Idle, SyncStatus::Syncing),
                (SyncStatus::Syncing, SyncStatus::Idle),
            ]
        );
    }

    #[tokio::test]
    async fn test_network_unavailable() {
        let engine = engine();
        engine.set_network_available(false);
        assert_eq!(engine.status(), SyncStatus::Offline);

        let report = engine
            .pull_remote(&MockTransport::new(), "token", "u")
            .await;
        assert_eq!(report.error_kind, Some(ErrorKind::Offline));

        engine.set_network_available(true);
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_schedule_runs_once() {
        let engine = engine();
        engine
            .store()
            .save(Service::new("user-1", "Mail"))
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::new());

        engine.schedule_sync(transport.clone(), "token", "user-1", None);
        tokio::time::sleep(Duration::from_millis(500)).await;
        engine.schedule_sync(transport.clone(), "token", "user-1", None);
        assert!(engine.has_scheduled_sync());

        // Past the first deadline, before the second.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(transport.push_count(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.push_count(), 1);
        assert!(!engine.has_scheduled_sync());
        assert!(pending_services(&engine).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_schedule() {
        let engine = engine();
        engine
            .store()
            .save(Service::new("user-1", "Mail"))
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::new());

        engine.schedule_sync(transport.clone(), "token", "user-1", Some(Duration::from_secs(2)));
        assert!(engine.cancel_schedule());
        assert!(!engine.cancel_schedule());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reset() {
        let engine = engine();
        engine
            .store()
            .save_metadata(&SyncMetadata {
                last_synced_at: Some(server_time()),
                user_id: Some("user-1".into()),
                sync_in_progress: false,
            })
            .await
            .unwrap();
        engine.set_network_available(false);

        engine.reset().await.unwrap();
        assert_eq!(engine.metadata().await.unwrap(), SyncMetadata::default());
        assert_eq!(engine.status(), SyncStatus::Offline);

        let report = engine
            .pull_remote(&MockTransport::new(), "token", "user-1")
            .await;
        assert_eq!(report.error_kind, Some(ErrorKind::Offline));
        assert_eq!(engine.status(), SyncStatus::Offline);

        engine.set_network_available(true);
        assert_eq!(engine.status(), SyncStatus::Idle);
        engine.reset().await.unwrap();
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_reset_clears_stale_in_progress_flag() {
        let engine = engine();
        let stale = SyncMetadata {
            sync_in_progress: true,
            ..Default::default()
        };
        engine.store().save_metadata(&stale).await.unwrap();

        engine.reset().await.unwrap();
        assert!(!engine.metadata().await.unwrap().sync_in_progress);
    }

    /// Transport whose push blocks until released.
    struct GatedTransport {
        entered: Notify,
        release: Notify,
        pushes: AtomicUsize,
    }

    impl GatedTransport {
        fn new() -> Self {
            Self {
                entered: Notify::new(),
                release: Notify::new(),
                pushes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SyncTransport for GatedTransport {
        async fn is_online(&self) -> bool {
            true
        }

        async fn push_changes(&self, _queue: &SyncQueue, _token: &str) -> Result<SyncResponse> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(SyncResponse::empty(server_time()))
        }

        async fn pull_changes(
            &self,
            _since: Option<DateTime<Utc>>,
            _token: &str,
        ) -> Result<SyncResponse> {
            Ok(SyncResponse::empty(server_time()))
        }
    }

    #[tokio::test]
    async fn test_reset_refused_while_push_in_flight() {
        let engine = engine();
        engine
            .store()
            .save(Service::new("user-1", "Mail"))
            .await
            .unwrap();
        let transport = Arc::new(GatedTransport::new());

        let first = {
            let engine = engine.clone();
            let transport = transport.clone();
            tokio::spawn(async move { engine.push_local(transport.as_ref(), "token").await })
        };
        transport.entered.notified().await;

        assert!(matches!(engine.reset().await, Err(Error::AlreadyInProgress)));
        assert!(engine.metadata().await.unwrap().sync_in_progress);
        assert_eq!(engine.status(), SyncStatus::Syncing);

        let second = engine.push_local(transport.as_ref(), "token").await;
        assert_eq!(second.error_kind, Some(ErrorKind::AlreadyInProgress));
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 1);

        transport.release.notify_one();
        let first = first.await.unwrap();
        assert!(first.success, "{:?}", first.error);
        assert!(!engine.metadata().await.unwrap().sync_in_progress);

        engine.reset().await.unwrap();
        assert_eq!(engine.metadata().await.unwrap(), SyncMetadata::default());
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_batches_use_page_size() {
        use futures::TryStreamExt;

        let config = SyncConfig {
            page_size: 2,
            ..Default::default()
        };
        let engine = SyncEngine::new(Arc::new(MemoryStore::new()), config);
        for i in 0..5 {
            engine
                .store()
                .save(Service::new("u", format!("s{}", i)))
                .await
                .unwrap();
        }

        let pages: Vec<Vec<Service>> = engine.batches().try_collect().await.unwrap();
        assert_eq!(pages.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
    }
}
