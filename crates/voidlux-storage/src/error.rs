//! Storage errors.

use thiserror::Error;

/// Errors from the embedded stores.
///
/// Anything except `NotFound` is treated as fatal by callers: the
/// process aborts so a supervisor can restart it with intact files.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored value failed to parse back into its entity type.
    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        /// Table containing the bad row.
        table: &'static str,
        /// What failed to parse.
        message: String,
    },

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Creates a corrupt-row error.
    #[must_use]
    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }
}

impl From<StorageError> for voidlux_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => voidlux_core::Error::not_found("row", id),
            other => voidlux_core::Error::Storage(other.to_string()),
        }
    }
}
