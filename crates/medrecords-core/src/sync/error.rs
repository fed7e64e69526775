//! Error types for the sync engine.

use thiserror::Error;

use crate::db::DbError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why the server refused a write as conflicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The record was modified remotely since our snapshot.
    Stale,
    /// The record no longer exists remotely.
    NotFound,
}

/// Failure of one remote call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The server reported a conflict; the server version wins.
    #[error("conflict ({kind:?}): {message}")]
    Conflict { kind: ConflictKind, message: String },

    /// Network failure or server-side error worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The call did not complete within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The bearer token was missing or rejected.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The server rejected the request and will keep rejecting it.
    #[error("rejected by server: {0}")]
    Permanent(String),

    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Creates a conflict error.
    pub fn conflict(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when repeated later.
    ///
    /// An expired token is retryable: the host refreshes it between cycles.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient(_) | RemoteError::Timeout | RemoteError::Unauthorized(_)
        )
    }

    /// Returns the conflict kind, if this is a conflict.
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            RemoteError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Errors surfaced by sync workers and the scheduler.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local storage failure; fatal to the current operation.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// Remote failure that was not absorbed by retry handling.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A lock guarding shared state was poisoned by a panicking holder.
    #[error("lock poisoned")]
    LockPoisoned,

    /// The async runtime could not be started or is gone.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(RemoteError::Transient("503".into()).is_retryable());
        assert!(RemoteError::Timeout.is_retryable());
        assert!(RemoteError::Unauthorized("expired".into()).is_retryable());
        assert!(!RemoteError::Permanent("400".into()).is_retryable());
        assert!(!RemoteError::conflict(ConflictKind::Stale, "409").is_retryable());
        assert!(!RemoteError::Protocol("bad json".into()).is_retryable());
    }

    #[test]
    fn test_conflict_kind() {
        let err = RemoteError::conflict(ConflictKind::NotFound, "gone");
        assert_eq!(err.conflict_kind(), Some(ConflictKind::NotFound));
        assert_eq!(RemoteError::Timeout.conflict_kind(), None);
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::from(RemoteError::Timeout);
        assert_eq!(err.to_string(), "remote error: request timed out");

        let err = SyncError::from(DbError::NotFound("patient 1".into()));
        assert!(err.to_string().contains("patient 1"));
    }
}
