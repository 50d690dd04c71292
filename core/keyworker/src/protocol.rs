//! Messages exchanged with the isolated key worker context.
//!
//! Every request carries a [`RequestId`]; every response echoes it. Progress
//! responses are non-terminal and leave the request pending. A [`WorkerMessage::Fault`]
//! is not tied to any request and means the context is gone.

use std::fmt;

use vaultsync_common::{Error, ErrorKind, SensitiveBytes};
use vaultsync_crypto::{AuthHash, KdfParams, KeyEncryptionKey, Salt, WrappedKey};

/// Correlation identifier for a request.
pub type RequestId = u64;

/// Closed set of operations the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    DeriveAuthHash,
    DeriveKek,
    DeriveKeys,
    CacheKek,
    GetCachedKek,
    WrapKey,
    UnwrapKey,
    Sanitize,
    Ping,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Init => "init",
            Operation::DeriveAuthHash => "deriveAuthHash",
            Operation::DeriveKek => "deriveKEK",
            Operation::DeriveKeys => "deriveKeys",
            Operation::CacheKek => "cacheKEK",
            Operation::GetCachedKek => "getCachedKEK",
            Operation::WrapKey => "wrapKey",
            Operation::UnwrapKey => "unwrapKey",
            Operation::Sanitize => "sanitize",
            Operation::Ping => "ping",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payloads. Secrets are moved in, never copied.
#[derive(Debug)]
pub enum RequestBody {
    Init {
        params: KdfParams,
    },
    DeriveAuthHash {
        password: SensitiveBytes,
        salt: Salt,
    },
    DeriveKek {
        password: SensitiveBytes,
        salt: Salt,
    },
    DeriveKeys {
        password: SensitiveBytes,
        auth_salt: Salt,
        kek_salt: Salt,
    },
    CacheKek {
        kek: KeyEncryptionKey,
    },
    GetCachedKek,
    WrapKey {
        key: SensitiveBytes,
        wrapping_key: Option<KeyEncryptionKey>,
    },
    UnwrapKey {
        wrapped: WrappedKey,
        wrapping_key: Option<KeyEncryptionKey>,
    },
    Sanitize,
    Ping,
    /// Makes the context panic.
    #[cfg(test)]
    Crash,
}

impl RequestBody {
    /// Operation tag for this payload.
    pub fn operation(&self) -> Operation {
        match self {
            RequestBody::Init { .. } => Operation::Init,
            RequestBody::DeriveAuthHash { .. } => Operation::DeriveAuthHash,
            RequestBody::DeriveKek { .. } => Operation::DeriveKek,
            RequestBody::DeriveKeys { .. } => Operation::DeriveKeys,
            RequestBody::CacheKek { .. } => Operation::CacheKek,
            RequestBody::GetCachedKek => Operation::GetCachedKek,
            RequestBody::WrapKey { .. } => Operation::WrapKey,
            RequestBody::UnwrapKey { .. } => Operation::UnwrapKey,
            RequestBody::Sanitize => Operation::Sanitize,
            RequestBody::Ping => Operation::Ping,
            #[cfg(test)]
            RequestBody::Crash => Operation::Ping,
        }
    }
}

/// A correlated request.
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub body: RequestBody,
}

/// Auth hash and KEK produced by one `deriveKeys` call.
#[derive(Debug)]
pub struct DerivedKeys {
    pub auth_hash: AuthHash,
    pub kek: KeyEncryptionKey,
}

/// Terminal success payloads.
#[derive(Debug)]
pub enum Reply {
    Ready,
    AuthHash(AuthHash),
    Kek(KeyEncryptionKey),
    Keys(DerivedKeys),
    Cached,
    HasCachedKek(bool),
    Wrapped(WrappedKey),
    Unwrapped(SensitiveBytes),
    /// Whether any key material was present to overwrite.
    Sanitized(bool),
    Pong,
}

/// Body of a response.
#[derive(Debug)]
pub enum ResponseKind {
    Success(Reply),
    Error { kind: ErrorKind, message: String },
    Progress(f64),
}

impl ResponseKind {
    /// Whether this response retires its request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseKind::Progress(_))
    }
}

/// A correlated response.
#[derive(Debug)]
pub struct Response {
    pub id: RequestId,
    pub kind: ResponseKind,
}

impl Response {
    pub fn success(id: RequestId, reply: Reply) -> Self {
        Self {
            id,
            kind: ResponseKind::Success(reply),
        }
    }

    pub fn error(id: RequestId, err: &Error) -> Self {
        Self {
            id,
            kind: ResponseKind::Error {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }

    pub fn progress(id: RequestId, fraction: f64) -> Self {
        Self {
            id,
            kind: ResponseKind::Progress(fraction.clamp(0.0, 1.0)),
        }
    }
}

/// Everything the context sends back to the manager.
#[derive(Debug)]
pub enum WorkerMessage {
    Response(Response),
    /// Fatal failure; the context has stopped.
    Fault(String),
}

/// Rebuild a caller-facing error from an error response.
///
/// Input problems keep their category; anything else is reported as a
/// worker fault.
pub fn error_from_response(kind: ErrorKind, message: String) -> Error {
    match kind {
        ErrorKind::Validation => Error::Validation(message),
        ErrorKind::Crypto => Error::Crypto(message),
        _ => Error::WorkerFault(message),
    }
}
