//! Scripted transport for engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vaultsync_common::{Error, Result};

use crate::queue::{EntityCounts, SyncQueue};
use crate::transport::{SyncResponse, SyncTransport};

/// A transport call as seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Push(EntityCounts),
    Pull(Option<DateTime<Utc>>),
}

/// Transport that answers from queued responses and records every call.
pub(crate) struct MockTransport {
    online: AtomicBool,
    delay: Mutex<Option<Duration>>,
    push_responses: Mutex<VecDeque<Result<SyncResponse>>>,
    pull_responses: Mutex<VecDeque<Result<SyncResponse>>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            delay: Mutex::new(None),
            push_responses: Mutex::new(VecDeque::new()),
            pull_responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn queue_push(&self, response: Result<SyncResponse>) {
        self.push_responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn queue_pull(&self, response: Result<SyncResponse>) {
        self.pull_responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn push_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Push(_)))
            .count()
    }

    async fn respond(&self, scripted: &Mutex<VecDeque<Result<SyncResponse>>>) -> Result<SyncResponse> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = scripted.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(SyncResponse::empty(Utc::now())))
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn push_changes(&self, queue: &SyncQueue, _token: &str) -> Result<SyncResponse> {
        self.calls.lock().unwrap().push(Call::Push(queue.counts()));
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Offline("mock transport offline".into()));
        }
        self.respond(&self.push_responses).await
    }

    async fn pull_changes(
        &self,
        since: Option<DateTime<Utc>>,
        _token: &str,
    ) -> Result<SyncResponse> {
        self.calls.lock().unwrap().push(Call::Pull(since));
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Offline("mock transport offline".into()));
        }
        self.respond(&self.pull_responses).await
    }
}
