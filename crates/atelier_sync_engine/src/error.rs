//! Error types for the sync engine.

use atelier_core::CoreError;
use atelier_model::{EntityId, EntityKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures a [`crate::RemoteClient`] reports.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The remote could not be reached, or the call timed out.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The remote refused the write on business or validation grounds.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The remote holds a newer version than the one the write is based on.
    #[error("remote holds a newer version")]
    Conflict,

    /// The remote refused the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The target record does not exist on the remote.
    #[error("record not found on remote")]
    NotFound,
}

impl RemoteError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnavailable(message.into())
    }

    /// Creates a rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Returns true if the same call may succeed later unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::NetworkUnavailable(_))
    }
}

/// Errors returned by sync engine operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// Remote error surfaced directly (manual operations only).
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// No queued conflict exists for the entity.
    #[error("no unresolved conflict for {kind} {id}")]
    NoConflict {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
    },

    /// The record cannot be dropped while other records reference it.
    #[error("{kind} {id} is still referenced by {count} {by} record(s)")]
    StillReferenced {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
        /// Kind of the referencing records.
        by: EntityKind,
        /// Number of referencing records.
        count: usize,
    },

    /// The background service is already running.
    #[error("sync service already running")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(RemoteError::network("offline").is_retryable());
        assert!(!RemoteError::rejected("total").is_retryable());
        assert!(!RemoteError::Conflict.is_retryable());
        assert!(!RemoteError::Unauthorized("expired".into()).is_retryable());
        assert!(!RemoteError::NotFound.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NoConflict {
            kind: EntityKind::Invoice,
            id: EntityId::from_bytes([0; 16]),
        };
        assert!(err.to_string().starts_with("no unresolved conflict for invoice"));
        assert_eq!(
            SyncError::from(RemoteError::Conflict).to_string(),
            "remote error: remote holds a newer version"
        );
    }
}
