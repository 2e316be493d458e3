//! Error taxonomy for the sync engine.
//!
//! Two layers:
//! - [`RemoteError`] is what the store adapter can produce (network-level).
//! - [`SyncError`] is the engine-facing taxonomy. Transient and conflict
//!   conditions are resolved internally by the driver; `PermissionDenied`
//!   and `SchemaIncompatible` are always surfaced to the caller.

use thiserror::Error;

/// Failures produced by the remote store adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network/timeout class failure. Retried per the driver's backoff policy.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Access-control rejection. Fatal: requires an operator/config fix,
    /// never retried.
    #[error("permission denied at {path}")]
    PermissionDenied { path: String },
}

/// Engine-level error taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Retryable remote failure.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Fatal access-control failure, surfaced to the caller.
    #[error("permission denied at {path}")]
    PermissionDenied { path: String },

    /// The remote document was written by a newer app version. Surfaced as
    /// "upgrade required"; no field of the payload may be interpreted.
    #[error("schema version {found} is newer than supported {supported}")]
    SchemaIncompatible { found: u32, supported: u32 },

    /// The remote payload failed structural validation. The whole document
    /// is rejected and the caller re-enters generate-or-adopt.
    #[error("remote payload rejected: {0}")]
    ValidationFailed(String),

    /// A conditional write lost to a concurrent writer. Expected, treated
    /// as a successful no-op.
    #[error("idempotency key already claimed")]
    IdempotencyConflict,

    /// Local state is missing; resync from the remote store.
    #[error("no local state for {0}")]
    NotFound(String),

    /// The content item is past its expiry. Terminal, no retry.
    #[error("content expired")]
    Expired,

    /// The identifier is not guaranteed stable across devices/reinstalls
    /// (e.g. a push-delivery token) and cannot seed a couple key.
    #[error("identifier is not stable across devices: {0:?}")]
    UnstableIdentifier(String),
}

impl SyncError {
    /// Whether the driver may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Whether the error must be surfaced to the caller as a fault state
    /// instead of being resolved internally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::PermissionDenied { .. } | SyncError::SchemaIncompatible { .. }
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Transient(msg) => SyncError::Transient(msg),
            RemoteError::PermissionDenied { path } => SyncError::PermissionDenied { path },
        }
    }
}
