//! Session and lock coordination.
//!
//! Holds the session token and the decrypted data-encryption key in memory
//! and locks everything, including the key worker, after a period without
//! activity or on request.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use zeroize::Zeroizing;

use vaultsync_common::{Error, Result, SensitiveBytes};

use crate::manager::KeyWorker;

/// State of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Token and key are available.
    Active,
    /// Token and key have been cleared.
    Locked,
}

struct Inner {
    token: Option<Zeroizing<String>>,
    dek: Option<SensitiveBytes>,
    last_activity: Instant,
    state: SessionState,
}

impl Inner {
    fn clear(&mut self) {
        // Both types zeroize on drop.
        self.token = None;
        self.dek = None;
        self.state = SessionState::Locked;
    }
}

/// Coordinates the in-memory session with the key worker.
pub struct SessionCoordinator {
    worker: Arc<KeyWorker>,
    idle_timeout: Duration,
    inner: Mutex<Inner>,
}

impl SessionCoordinator {
    /// Create a locked coordinator.
    pub fn new(worker: Arc<KeyWorker>, idle_timeout: Duration) -> Self {
        Self {
            worker,
            idle_timeout,
            inner: Mutex::new(Inner {
                token: None,
                dek: None,
                last_activity: Instant::now(),
                state: SessionState::Locked,
            }),
        }
    }

    /// The key worker this session locks.
    pub fn worker(&self) -> &Arc<KeyWorker> {
        &self.worker
    }

    /// Configured inactivity limit.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Start a session.
    ///
    /// # Postconditions
    /// - State is `Active`
    /// - Previous token and key, if any, are zeroized
    pub async fn unlock(&self, token: String, dek: SensitiveBytes) {
        let mut inner = self.inner.lock().await;
        inner.clear();
        inner.token = Some(Zeroizing::new(token));
        inner.dek = Some(dek);
        inner.state = SessionState::Active;
        inner.last_activity = Instant::now();
        debug!("Session unlocked");
    }

    /// Record user activity.
    pub async fn touch(&self) {
        self.inner.lock().await.last_activity = Instant::now();
    }

    /// Copy of the session token, if the session is active.
    pub async fn token(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.token.as_ref().map(|token| token.as_str().to_string())
    }

    /// Run `f` with the session key. Counts as activity.
    ///
    /// # Errors
    /// - Session is locked
    pub async fn with_dek<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Locked {
            return Err(Error::Validation("Session is locked".to_string()));
        }
        inner.last_activity = Instant::now();
        let dek = inner
            .dek
            .as_ref()
            .ok_or_else(|| Error::Validation("Session key not available".to_string()))?;
        Ok(f(dek.as_bytes()))
    }

    /// Current state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Time since the last recorded activity.
    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_activity.elapsed()
    }

    /// Clear the session and lock the key worker.
    pub async fn lock(&self) {
        self.inner.lock().await.clear();
        self.worker.lock().await;
        info!("Session locked");
    }

    /// Lock if the session has been idle for at least the timeout.
    /// Returns whether a lock happened.
    pub async fn lock_if_idle(&self) -> bool {
        {
            let inner = self.inner.lock().await;
            if inner.state == SessionState::Locked
                || inner.last_activity.elapsed() < self.idle_timeout
            {
                return false;
            }
        }
        info!("Session idle for {:?}; locking", self.idle_timeout);
        self.lock().await;
        true
    }

    /// Check for inactivity every `check_every` until the coordinator is dropped.
    pub fn spawn_idle_watch(self: &Arc<Self>, check_every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(check_every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.lock_if_idle().await;
            }
        })
    }
}
