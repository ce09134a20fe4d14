//! Error types for page storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read or write a page that does not exist.
    #[error("page {page} out of range: store holds {count} pages")]
    PageOutOfRange {
        /// The requested page number.
        page: u32,
        /// The current number of pages.
        count: u32,
    },

    /// A buffer did not match the store's page size.
    #[error("invalid page size: expected {expected} bytes, got {actual}")]
    InvalidPageSize {
        /// The store's page size.
        expected: usize,
        /// The size of the supplied buffer.
        actual: usize,
    },

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,
}
