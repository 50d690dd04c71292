//! Pending-request table and response dispatcher.
//!
//! Each in-flight request owns a completion slot (a oneshot sender) and an
//! optional progress sink. The dispatcher drains the context's outgoing
//! channel, routes responses by id, and fails every entry when the context
//! reports a fault or disappears.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use vaultsync_common::{Error, Result};

use crate::protocol::{
    error_from_response, Operation, Reply, RequestId, Response, ResponseKind, WorkerMessage,
};

/// Callback receiving progress fractions in `[0, 1]`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

struct PendingRequest {
    operation: Operation,
    reply: oneshot::Sender<Result<Reply>>,
    progress: Option<ProgressCallback>,
}

/// Requests awaiting a terminal response.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and get the receiver for its outcome.
    pub(crate) fn register(
        &self,
        id: RequestId,
        operation: Operation,
        progress: Option<ProgressCallback>,
    ) -> oneshot::Receiver<Result<Reply>> {
        let (reply, rx) = oneshot::channel();
        self.entries().insert(
            id,
            PendingRequest {
                operation,
                reply,
                progress,
            },
        );
        rx
    }

    /// Route a response. Returns false if no request with that id is pending.
    pub(crate) fn complete(&self, response: Response) -> bool {
        let Response { id, kind } = response;

        let outcome = match kind {
            ResponseKind::Progress(fraction) => {
                let sink = match self.entries().get(&id) {
                    Some(entry) => entry.progress.clone(),
                    None => return false,
                };
                // Called outside the lock so the callback may issue requests.
                if let Some(sink) = sink {
                    sink(fraction);
                }
                return true;
            }
            ResponseKind::Success(reply) => Ok(reply),
            ResponseKind::Error { kind, message } => Err(error_from_response(kind, message)),
        };

        let Some(entry) = self.entries().remove(&id) else {
            return false;
        };

        if entry.reply.send(outcome).is_err() {
            debug!(request_id = id, operation = %entry.operation, "Caller stopped waiting for key worker reply");
        }
        true
    }

    /// Drop a request without answering it (timeouts, send failures).
    pub(crate) fn cancel(&self, id: RequestId) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Reject every pending request. Returns how many were rejected.
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = self.entries().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let err = Error::WorkerFault(format!("{} ({} request {})", reason, entry.operation, id));
            let _ = entry.reply.send(Err(err));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Drain `messages` until the context faults or hangs up.
pub(crate) async fn dispatch(
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
) {
    let reason = loop {
        match messages.recv().await {
            Some(WorkerMessage::Response(response)) => {
                let id = response.id;
                if !pending.complete(response) {
                    debug!(request_id = id, "Dropping key worker response for unknown request");
                }
            }
            Some(WorkerMessage::Fault(reason)) => {
                error!("Key worker context faulted: {}", reason);
                break format!("key worker fault: {}", reason);
            }
            None => break "key worker context exited".to_string(),
        }
    };

    alive.store(false, Ordering::SeqCst);
    let failed = pending.fail_all(&reason);
    if failed > 0 {
        warn!("Rejected {} pending key worker request(s): {}", failed, reason);
    }
}
