//! Caller-owned manager for the isolated key worker.
//!
//! `KeyWorker` creates the context lazily, correlates requests and responses
//! through a pending table, and tears everything down on `lock`/`terminate`.
//! The next call after a teardown or a fault transparently starts a fresh
//! context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vaultsync_common::{Error, Result, SensitiveBytes};
use vaultsync_crypto::{AuthHash, KdfParams, KeyEncryptionKey, Salt, WrappedKey};

use crate::context;
use crate::pending::{dispatch, PendingTable, ProgressCallback};
use crate::protocol::{DerivedKeys, Operation, Reply, Request, RequestBody};

/// Configuration for the key worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Argon2id parameters used for every derivation.
    pub kdf: KdfParams,
    /// Upper bound on a single request, if any.
    #[serde(default)]
    pub request_timeout: Option<Duration>,
    /// Name given to the context thread.
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            request_timeout: None,
            thread_name: "vaultsync-keyworker".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Set the KDF parameters.
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// A live context plus its bookkeeping.
struct Connection {
    requests: tokio::sync::mpsc::UnboundedSender<Request>,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.requests.is_closed()
    }

    fn shutdown(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        let failed = self.pending.fail_all(reason);
        if failed > 0 {
            debug!("Abandoned {} pending key worker request(s): {}", failed, reason);
        }
        self.dispatcher.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropping `requests` closes the channel and the context thread exits.
        self.dispatcher.abort();
    }
}

/// Manager for the isolated key-derivation context.
pub struct KeyWorker {
    config: WorkerConfig,
    slot: Mutex<Option<Arc<Connection>>>,
    next_id: AtomicU64,
    contexts_created: AtomicU64,
}

impl KeyWorker {
    /// Create a manager. No context is started until first use.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            contexts_created: AtomicU64::new(0),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Number of contexts started over the manager's lifetime.
    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::SeqCst)
    }

    /// Whether a live context currently exists.
    pub async fn is_initialized(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_alive())
    }

    /// Start the context if needed.
    ///
    /// Concurrent callers wait on the same initialization; exactly one
    /// context is created.
    pub async fn init(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut slot = self.slot.lock().await;

        if let Some(conn) = slot.as_ref() {
            if conn.is_alive() {
                return Ok(conn.clone());
            }
            warn!("Key worker context is gone; starting a new one");
            conn.shutdown("key worker context replaced");
        }
        *slot = None;

        let conn = Arc::new(self.start_context()?);
        let ready = self
            .send(
                &conn,
                RequestBody::Init {
                    params: self.config.kdf.clone(),
                },
                None,
            )
            .await;

        match ready {
            Ok(Reply::Ready) => {
                info!("Key worker context ready");
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Ok(other) => {
                conn.shutdown("initialization failed");
                Err(unexpected(Operation::Init, &other))
            }
            Err(e) => {
                conn.shutdown("initialization failed");
                Err(e)
            }
        }
    }

    fn start_context(&self) -> Result<Connection> {
        let channels = context::spawn(&self.config.thread_name)?;
        let created = self.contexts_created.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Started key worker context #{}", created);

        let pending = Arc::new(PendingTable::new());
        let alive = Arc::new(AtomicBool::new(true));
        let dispatcher = tokio::spawn(dispatch(channels.messages, pending.clone(), alive.clone()));

        Ok(Connection {
            requests: channels.requests,
            pending,
            alive,
            dispatcher,
        })
    }

    async fn send(
        &self,
        conn: &Connection,
        body: RequestBody,
        progress: Option<ProgressCallback>,
    ) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let operation = body.operation();
        let rx = conn.pending.register(id, operation, progress);

        if conn.requests.send(Request { id, body }).is_err() || !conn.is_alive() {
            // If the dispatcher already failed the entry, the receiver has the error.
            if conn.pending.cancel(id) {
                conn.alive.store(false, Ordering::SeqCst);
                return Err(Error::WorkerFault(format!(
                    "key worker context unavailable for {}",
                    operation
                )));
            }
        }
        debug!(request_id = id, operation = %operation, "Sent key worker request");

        let received = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    conn.pending.cancel(id);
                    return Err(Error::Timeout(format!(
                        "{} did not complete within {:?}",
                        operation, limit
                    )));
                }
            },
            None => rx.await,
        };

        received.map_err(|_| Error::WorkerFault(format!("{} request was abandoned", operation)))?
    }

    /// Queue a request without waiting for its reply.
    fn post(&self, conn: &Connection, body: RequestBody) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let operation = body.operation();
        if conn.requests.send(Request { id, body }).is_err() {
            debug!(request_id = id, operation = %operation, "Key worker context gone; request dropped");
        }
    }

    async fn call(&self, body: RequestBody, progress: Option<ProgressCallback>) -> Result<Reply> {
        let conn = self.connection().await?;
        self.send(&conn, body, progress).await
    }

    /// Derive the server authentication hash.
    pub async fn derive_auth_hash(
        &self,
        password: &[u8],
        salt: &Salt,
        on_progress: Option<ProgressCallback>,
    ) -> Result<AuthHash> {
        let body = RequestBody::DeriveAuthHash {
            password: SensitiveBytes::from_slice(password),
            salt: *salt,
        };
        match self.call(body, on_progress).await? {
            Reply::AuthHash(hash) => Ok(hash),
            other => Err(unexpected(Operation::DeriveAuthHash, &other)),
        }
    }

    /// Derive the key-encryption key.
    pub async fn derive_kek(
        &self,
        password: &[u8],
        salt: &Salt,
        on_progress: Option<ProgressCallback>,
    ) -> Result<KeyEncryptionKey> {
        let body = RequestBody::DeriveKek {
            password: SensitiveBytes::from_slice(password),
            salt: *salt,
        };
        match self.call(body, on_progress).await? {
            Reply::Kek(kek) => Ok(kek),
            other => Err(unexpected(Operation::DeriveKek, &other)),
        }
    }

    /// Derive both the auth hash and the KEK in one round trip.
    pub async fn derive_keys(
        &self,
        password: &[u8],
        auth_salt: &Salt,
        kek_salt: &Salt,
        on_progress: Option<ProgressCallback>,
    ) -> Result<DerivedKeys> {
        let body = RequestBody::DeriveKeys {
            password: SensitiveBytes::from_slice(password),
            auth_salt: *auth_salt,
            kek_salt: *kek_salt,
        };
        match self.call(body, on_progress).await? {
            Reply::Keys(keys) => Ok(keys),
            other => Err(unexpected(Operation::DeriveKeys, &other)),
        }
    }

    /// Hand the KEK to the context. The caller's copy is consumed.
    ///
    /// On `Timeout` the context may still cache the key later, so a sanitize
    /// is queued behind it; the context ends up holding no KEK.
    pub async fn cache_kek(&self, kek: KeyEncryptionKey) -> Result<()> {
        let conn = self.connection().await?;
        match self.send(&conn, RequestBody::CacheKek { kek }, None).await {
            Ok(Reply::Cached) => Ok(()),
            Ok(other) => Err(unexpected(Operation::CacheKek, &other)),
            Err(e @ Error::Timeout(_)) => {
                warn!("Caching the KEK timed out; discarding it");
                self.post(&conn, RequestBody::Sanitize);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the context holds a cached KEK.
    pub async fn has_cached_kek(&self) -> Result<bool> {
        match self.call(RequestBody::GetCachedKek, None).await? {
            Reply::HasCachedKek(present) => Ok(present),
            other => Err(unexpected(Operation::GetCachedKek, &other)),
        }
    }

    /// Wrap `key` under `wrapping_key`, or under the cached KEK if `None`.
    pub async fn wrap_key(
        &self,
        key: &[u8],
        wrapping_key: Option<&KeyEncryptionKey>,
    ) -> Result<WrappedKey> {
        let body = RequestBody::WrapKey {
            key: SensitiveBytes::from_slice(key),
            wrapping_key: wrapping_key.cloned(),
        };
        match self.call(body, None).await? {
            Reply::Wrapped(wrapped) => Ok(wrapped),
            other => Err(unexpected(Operation::WrapKey, &other)),
        }
    }

    /// Unwrap a key with `wrapping_key`, or with the cached KEK if `None`.
    pub async fn unwrap_key(
        &self,
        wrapped: &WrappedKey,
        wrapping_key: Option<&KeyEncryptionKey>,
    ) -> Result<SensitiveBytes> {
        let body = RequestBody::UnwrapKey {
            wrapped: wrapped.clone(),
            wrapping_key: wrapping_key.cloned(),
        };
        match self.call(body, None).await? {
            Reply::Unwrapped(key) => Ok(key),
            other => Err(unexpected(Operation::UnwrapKey, &other)),
        }
    }

    /// Overwrite cached key material inside the context.
    ///
    /// No-op when no context exists; never starts one.
    pub async fn sanitize(&self) -> Result<()> {
        let conn = self.slot.lock().await.clone();
        let Some(conn) = conn else {
            return Ok(());
        };
        if !conn.is_alive() {
            // A dead context's thread has already dropped its state.
            return Ok(());
        }
        match self.send(&conn, RequestBody::Sanitize, None).await? {
            Reply::Sanitized(had_key) => {
                debug!(had_key, "Key worker sanitized");
                Ok(())
            }
            other => Err(unexpected(Operation::Sanitize, &other)),
        }
    }

    /// Sanitize (best effort) and tear the context down.
    pub async fn lock(&self) {
        if let Err(e) = self.sanitize().await {
            warn!("Sanitize before lock failed: {}", e);
        }
        self.terminate().await;
        info!("Key worker locked");
    }

    /// Tear the context down and abandon pending requests.
    pub async fn terminate(&self) {
        if let Some(conn) = self.slot.lock().await.take() {
            conn.shutdown("key worker terminated");
        }
    }

    /// Health check; starts a context if none is running.
    pub async fn ping(&self) -> Result<()> {
        match self.call(RequestBody::Ping, None).await? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(Operation::Ping, &other)),
        }
    }
}

impl Default for KeyWorker {
    fn default() -> Self {
        Self::new(WorkerConfig::default())
    }
}

fn unexpected(operation: Operation, reply: &Reply) -> Error {
    Error::WorkerFault(format!("unexpected reply to {}: {:?}", operation, reply))
}
