//! Error types for VoidLux core operations.

use thiserror::Error;

/// The main error type for VoidLux operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested resource was not found.
    #[error("not found: {resource_type} with id '{id}'")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier of the resource.
        id: String,
    },

    /// The provided input was invalid.
    #[error("invalid input: {field} - {message}")]
    InvalidInput {
        /// The field that was invalid.
        field: &'static str,
        /// Why the input was invalid.
        message: String,
    },

    /// The operation conflicts with current state (claim lost, terminal
    /// state mutation, stale term). Callers handle this as an outcome,
    /// not a failure.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A storage error occurred. Storage errors are fatal to the node.
    #[error("storage error: {0}")]
    Storage(String),

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for VoidLux operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type,
            id: id.into(),
        }
    }

    /// Creates a new invalid input error.
    #[must_use]
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn error_not_found_display() {
        let err = Error::not_found("task", "abc123");
        assert_eq!(err.to_string(), "not found: task with id 'abc123'");
    }

    #[test]
    fn error_conflict_display() {
        let err = Error::conflict("task already claimed");
        assert_eq!(err.to_string(), "conflict: task already claimed");
    }
}
