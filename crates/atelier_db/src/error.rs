//! Error types for the database facade.

use atelier_core::CoreError;
use atelier_model::{EntityId, EntityKind, SyncState, Violation};
use atelier_sync_engine::SyncError;
use thiserror::Error;

/// Result type for facade operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors returned by the facade.
///
/// Remote failures never show up here for `create`/`update`/`delete`: they
/// surface later through the entity's sync state and the sync status.
#[derive(Error, Debug)]
pub enum DbError {
    /// The write breaks a field rule or a reference; nothing was stored or
    /// queued.
    #[error("validation failed: {}", describe(.0))]
    Validation(Vec<Violation>),

    /// No entity with this identifier.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
    },

    /// The entity's sync state does not allow the operation.
    #[error("{kind} {id} is {state:?}: {message}")]
    InvalidState {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
        /// Current sync state.
        state: SyncState,
        /// What the caller has to do first.
        message: String,
    },

    /// The local store failed; the operation was aborted.
    #[error("storage error: {0}")]
    Storage(#[source] CoreError),

    /// A sync engine operation failed.
    #[error("sync error: {0}")]
    Sync(SyncError),
}

impl From<CoreError> for DbError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Validation { violations, .. } => DbError::Validation(violations),
            other => DbError::Storage(other),
        }
    }
}

impl From<SyncError> for DbError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Store(core) => DbError::from(core),
            other => DbError::Sync(other),
        }
    }
}

impl DbError {
    /// Creates a validation error with a single violation.
    pub fn violation(field: impl Into<String>, message: impl Into<String>) -> Self {
        DbError::Validation(vec![Violation::new(field, message)])
    }

    /// Returns the violations if this is a validation error.
    pub fn violations(&self) -> &[Violation] {
        match self {
            DbError::Validation(violations) => violations,
            _ => &[],
        }
    }
}

fn describe(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_lists_every_violation() {
        let err = DbError::Validation(vec![
            Violation::new("total", "must be >= 0"),
            Violation::new("paid_amount", "must be <= total"),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("validation failed: "));
        assert!(text.contains("total"));
        assert!(text.contains("paid_amount"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn engine_errors_map_onto_facade_errors() {
        let err = DbError::from(SyncError::Store(CoreError::StoreLocked));
        assert!(matches!(err, DbError::Storage(CoreError::StoreLocked)));
        let err = DbError::from(SyncError::Store(CoreError::Validation {
            kind: EntityKind::Customer,
            id: EntityId::from_bytes([1; 16]),
            violations: vec![Violation::new("name", "must not be empty")],
        }));
        assert_eq!(err.violations()[0].field, "name");
        let err = DbError::from(SyncError::AlreadyRunning);
        assert!(matches!(err, DbError::Sync(SyncError::AlreadyRunning)));
    }
}
