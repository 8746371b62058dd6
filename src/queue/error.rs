//! Error types for queue operations.

use std::fmt;

use thiserror::Error;

use super::QueueStatus;

/// Structured classification for queue/database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out or is closed.
    Pool,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl QueueDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Pool,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for QueueDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::Pool => "pool",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> QueueDbErrorKind {
    let code = database_error.code();
    if matches!(code.as_deref(), Some("5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED")) {
        return QueueDbErrorKind::BusyOrLocked;
    }
    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return QueueDbErrorKind::ConstraintViolation;
    }
    if database_error
        .message()
        .to_ascii_lowercase()
        .contains("database is locked")
    {
        return QueueDbErrorKind::BusyOrLocked;
    }
    QueueDbErrorKind::Other
}

/// Errors that can occur during queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        kind: QueueDbErrorKind,
        message: String,
    },

    /// Queue item not found.
    #[error(
        "queue item not found: id {0}\n  Suggestion: The item may have been deleted or the ID is incorrect"
    )]
    ItemNotFound(i64),

    /// The requested status change is not part of the item lifecycle.
    #[error("item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: QueueStatus,
        to: QueueStatus,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: QueueDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl QueueError {
    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<QueueDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::ItemNotFound(_) | Self::InvalidTransition { .. } => None,
        }
    }

    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(QueueDbErrorKind::BusyOrLocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_database_message() {
        let err = QueueError::Database {
            kind: QueueDbErrorKind::Other,
            message: "connection failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("database error"));
        assert!(msg.contains("other"));
        assert!(msg.contains("connection failed"));
    }

    #[test]
    fn test_queue_error_database_busy_flag() {
        let err = QueueError::Database {
            kind: QueueDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        assert!(err.is_busy_or_locked());
        assert!(!QueueError::ItemNotFound(1).is_busy_or_locked());
    }

    #[test]
    fn test_queue_error_item_not_found_message() {
        let msg = QueueError::ItemNotFound(42).to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("42"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_invalid_transition_names_both_statuses() {
        let err = QueueError::InvalidTransition {
            id: 7,
            from: QueueStatus::Canceled,
            to: QueueStatus::Downloading,
        };
        assert_eq!(err.to_string(), "item 7 cannot move from canceled to downloading");
    }

    #[test]
    fn test_pool_timeout_classified() {
        assert_eq!(
            QueueDbErrorKind::from_sqlx(&sqlx::Error::PoolTimedOut),
            QueueDbErrorKind::Pool
        );
    }
}
