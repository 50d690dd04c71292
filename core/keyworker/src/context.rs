//! The isolated execution context.
//!
//! A dedicated OS thread owns the only copy of the cached key-encryption key.
//! It receives [`Request`]s over a channel, runs Argon2id and AEAD work
//! synchronously, and answers with [`WorkerMessage`]s. Nothing else can reach
//! its state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use vaultsync_common::{Error, Result};
use vaultsync_crypto::{
    derive_auth_hash, derive_kek, unwrap_key, wrap_key, KdfParams, KeyEncryptionKey,
};

use crate::protocol::{DerivedKeys, Reply, Request, RequestBody, Response, WorkerMessage};

/// Channels connecting the manager to a running context.
pub(crate) struct ContextChannels {
    pub(crate) requests: mpsc::UnboundedSender<Request>,
    pub(crate) messages: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// Start a new context thread.
pub(crate) fn spawn(thread_name: &str) -> Result<ContextChannels> {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::unbounded_channel();

    thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || run(request_rx, message_tx))?;

    Ok(ContextChannels {
        requests: request_tx,
        messages: message_rx,
    })
}

fn run(mut requests: mpsc::UnboundedReceiver<Request>, out: mpsc::UnboundedSender<WorkerMessage>) {
    let mut state = ContextState::default();

    while let Some(Request { id, body }) = requests.blocking_recv() {
        let operation = body.operation();
        trace!(request_id = id, operation = %operation, "Key worker handling request");

        let progress = |fraction: f64| {
            let _ = out.send(WorkerMessage::Response(Response::progress(id, fraction)));
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.handle(body, &progress)));

        let message = match outcome {
            Ok(Ok(reply)) => WorkerMessage::Response(Response::success(id, reply)),
            Ok(Err(err)) => WorkerMessage::Response(Response::error(id, &err)),
            Err(payload) => {
                state.sanitize();
                let _ = out.send(WorkerMessage::Fault(format!(
                    "{} panicked: {}",
                    operation,
                    panic_message(payload.as_ref())
                )));
                return;
            }
        };

        if out.send(message).is_err() {
            break;
        }
    }

    state.sanitize();
    debug!("Key worker context stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Private memory of the context.
#[derive(Default)]
struct ContextState {
    params: Option<KdfParams>,
    cached_kek: Option<KeyEncryptionKey>,
}

impl ContextState {
    fn handle(&mut self, body: RequestBody, progress: &dyn Fn(f64)) -> Result<Reply> {
        match body {
            RequestBody::Init { params } => {
                self.params = Some(params);
                Ok(Reply::Ready)
            }
            RequestBody::Ping => Ok(Reply::Pong),
            RequestBody::DeriveAuthHash { password, salt } => {
                let params = self.params()?;
                progress(0.0);
                let hash = derive_auth_hash(password.as_bytes(), &salt, params)?;
                progress(1.0);
                Ok(Reply::AuthHash(hash))
            }
            RequestBody::DeriveKek { password, salt } => {
                let params = self.params()?;
                progress(0.0);
                let kek = derive_kek(password.as_bytes(), &salt, params)?;
                progress(1.0);
                Ok(Reply::Kek(kek))
            }
            RequestBody::DeriveKeys {
                password,
                auth_salt,
                kek_salt,
            } => {
                let params = self.params()?;
                progress(0.0);
                let auth_hash = derive_auth_hash(password.as_bytes(), &auth_salt, params)?;
                progress(0.5);
                let kek = derive_kek(password.as_bytes(), &kek_salt, params)?;
                progress(1.0);
                Ok(Reply::Keys(DerivedKeys { auth_hash, kek }))
            }
            RequestBody::CacheKek { kek } => {
                self.sanitize();
                self.cached_kek = Some(kek);
                Ok(Reply::Cached)
            }
            RequestBody::GetCachedKek => Ok(Reply::HasCachedKek(self.cached_kek.is_some())),
            RequestBody::WrapKey { key, wrapping_key } => {
                let wrapping_key = self.wrapping_key(wrapping_key.as_ref())?;
                wrap_key(wrapping_key, key.as_bytes()).map(Reply::Wrapped)
            }
            RequestBody::UnwrapKey {
                wrapped,
                wrapping_key,
            } => {
                let wrapping_key = self.wrapping_key(wrapping_key.as_ref())?;
                unwrap_key(wrapping_key, &wrapped).map(Reply::Unwrapped)
            }
            RequestBody::Sanitize => Ok(Reply::Sanitized(self.sanitize())),
            #[cfg(test)]
            RequestBody::Crash => panic!("context crash requested"),
        }
    }

    fn params(&self) -> Result<&KdfParams> {
        self.params
            .as_ref()
            .ok_or_else(|| Error::WorkerFault("context not initialized".to_string()))
    }

    fn wrapping_key<'a>(
        &'a self,
        explicit: Option<&'a KeyEncryptionKey>,
    ) -> Result<&'a KeyEncryptionKey> {
        explicit.or(self.cached_kek.as_ref()).ok_or_else(|| {
            Error::Validation("No wrapping key supplied and no key is cached".to_string())
        })
    }

    /// Overwrite and drop the cached key. Returns whether one was present.
    fn sanitize(&mut self) -> bool {
        match self.cached_kek.take() {
            Some(mut kek) => {
                kek.overwrite_with_random();
                // Dropping zeroizes the overwritten bytes.
                drop(kek);
                true
            }
            None => false,
        }
    }
}
