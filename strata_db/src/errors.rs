//! Engine error types.
//!
//! The public query surface never exposes these: conflicts and absent keys
//! collapse to `false`/`None` at that boundary. Inside the engine the full
//! taxonomy drives abort and poisoning decisions.

use groundwork::lock_manager::LockError;
use groundwork::StorageError;
use thiserror::Error;

/// Result type alias using [`DbError`].
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record lock could not be acquired; the transaction aborts.
    #[error("lock conflict")]
    Conflict,

    /// The addressed key or record does not exist.
    #[error("record not found")]
    NotFound,

    /// An insert or key update collides on the primary key.
    #[error("duplicate primary key")]
    DuplicateKey,

    /// Wrong arity or an out-of-range column at the API boundary.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A prior I/O failure marked the database unusable.
    #[error("database poisoned by an earlier I/O failure")]
    Poisoned,
}

impl From<LockError> for DbError {
    fn from(_: LockError) -> Self {
        DbError::Conflict
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Storage(StorageError::Io(err))
    }
}

impl DbError {
    /// Whether the error reflects an I/O fault that must poison the
    /// database, as opposed to a per-call outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DbError::Storage(StorageError::Io(_)) | DbError::Storage(StorageError::Corrupted(_))
        )
    }
}
