//! Error types for the storage core.

use thiserror::Error;

/// Result type alias using [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by the storage core.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A column page has all 512 slots written.
    #[error("page full")]
    PageFull,

    /// A page range has all of its base slots written.
    #[error("page range full")]
    RangeFull,

    /// Every buffer pool frame is pinned; the caller should yield and retry.
    #[error("buffer pool exhausted: all frames pinned")]
    PoolExhausted,

    /// An on-disk block failed validation.
    #[error("corrupted page block: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Whether the error is transient resource pressure rather than a fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::PoolExhausted)
    }
}
