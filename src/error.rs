//! Error types for the sync subsystem.
//!
//! Local and validation failures are returned to the caller synchronously.
//! Failures during replay are stored on the queue entry and only surface in
//! aggregate through the status projection.

use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local storage rejected the enqueue. The mutation was not recorded.
    #[error("failed to queue mutation: {0}")]
    QueueWrite(String),

    /// A device/serial identifier has already been sold in this store.
    #[error("device {device_id} is already recorded as sold in store {store_id}")]
    DuplicateDetected { store_id: String, device_id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    /// One remote step of a multi-step mutation failed.
    #[error("sync step '{step}' failed: {source}")]
    SyncStep {
        step: String,
        #[source]
        source: RemoteError,
    },

    /// A temporary id has no server counterpart yet.
    #[error("local reference {0} has not been synced yet")]
    UnresolvedReference(String),

    #[error("payload digest mismatch for queue entry {client_ref}")]
    PayloadDigestMismatch { client_ref: String },

    #[error("remote store is offline")]
    Offline,

    #[error("queue entry {0} not found")]
    EntryNotFound(String),

    #[error("queue entry {0} is already synced")]
    AlreadySynced(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn step(step: impl Into<String>, source: RemoteError) -> Self {
        SyncError::SyncStep {
            step: step.into(),
            source,
        }
    }

    /// Errors that belong to the caller's input rather than to storage.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_) | SyncError::DuplicateDetected { .. }
        )
    }

    /// Convert a storage-level failure during `record` into a queue write
    /// failure, leaving validation errors untouched.
    pub(crate) fn into_queue_write(self) -> Self {
        match self {
            SyncError::Storage(e) => SyncError::QueueWrite(e.to_string()),
            SyncError::Serialization(e) => SyncError::QueueWrite(e.to_string()),
            SyncError::LockPoisoned => SyncError::QueueWrite("database lock poisoned".into()),
            other => other,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
