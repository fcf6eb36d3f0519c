//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the durable or staging store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A row with the same key already exists.
    #[error("duplicate {table} row: {key}")]
    Duplicate {
        /// Entity table.
        table: &'static str,
        /// Key of the existing row.
        key: String,
    },

    /// A staged resource was used after it was deleted.
    #[error("staged resource {0} was deleted")]
    ResourceDeleted(String),

    /// The store is unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if the error reports an existing key.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}
