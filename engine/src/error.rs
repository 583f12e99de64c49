//! Error types for the tandem engine.

use crate::{EntityId, OperationId};
use thiserror::Error;

/// All possible errors from the tandem engine.
#[derive(Debug, Error)]
pub enum Error {
    // Log store errors
    #[error("duplicate operation: {0}")]
    DuplicateOperation(OperationId),

    #[error("storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    #[error("invalid log snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    // Transport errors
    #[error("sync version conflict: expected {expected}, found {actual}")]
    SyncVersionConflict { expected: u64, actual: u64 },

    #[error("remote revision changed during upload of '{path}'")]
    RevisionMismatch { path: String },

    #[error("remote migration in progress")]
    MigrationInProgress,

    #[error("sync data corrupted: {0}")]
    SyncDataCorrupted(String),

    #[error("unsupported sync format version {found} (supported: {supported})")]
    UnsupportedSyncFormat { found: u32, supported: u32 },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("network error: {0}")]
    Network(String),

    // Apply errors
    #[error("entity not found: {entity_type}:{entity_id}")]
    EntityNotFound {
        entity_type: String,
        entity_id: EntityId,
    },

    #[error("invalid operation {op_id}: {reason}")]
    InvalidOperation { op_id: OperationId, reason: String },

    #[error("invalid entity change: {0}")]
    InvalidChange(String),

    #[error("failed to apply operation {op_id}: {reason}")]
    ApplyFailed { op_id: OperationId, reason: String },

    // Cycle errors
    #[error("sync already in progress")]
    SyncInProgress,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Action the user can take to get out of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    Reauthenticate,
    CheckConnection,
    FreeStorage,
    Reload,
}

impl Error {
    /// Whether the current cycle can recover from this error by itself
    /// (filter and retry, re-download, or wait).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DuplicateOperation(_)
                | Error::SyncVersionConflict { .. }
                | Error::RevisionMismatch { .. }
                | Error::MigrationInProgress
        )
    }

    /// Whether a whole sync cycle should be repeated after a backoff.
    pub fn should_retry_cycle(&self) -> bool {
        matches!(
            self,
            Error::MigrationInProgress
                | Error::SyncVersionConflict { .. }
                | Error::RevisionMismatch { .. }
        )
    }

    /// User-facing remediation for errors that end the cycle.
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Error::Authentication(_) => Some(Remediation::Reauthenticate),
            Error::Network(_) => Some(Remediation::CheckConnection),
            Error::StorageQuotaExceeded(_) => Some(Remediation::FreeStorage),
            Error::SyncDataCorrupted(_) | Error::InvalidSnapshot(_) | Error::ApplyFailed { .. } => {
                Some(Remediation::Reload)
            }
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
