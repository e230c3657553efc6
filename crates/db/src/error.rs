//! Typed error type for the db crate.

use engine::CheckpointError;
use queue::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A row holds a value the domain types cannot represent.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// A domain rule rejected the write (e.g. a backwards task transition).
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<DbError> for QueueError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Queue(inner) => inner,
            other => QueueError::Backend(other.to_string()),
        }
    }
}

impl From<DbError> for CheckpointError {
    fn from(err: DbError) -> Self {
        CheckpointError::Backend(err.to_string())
    }
}
