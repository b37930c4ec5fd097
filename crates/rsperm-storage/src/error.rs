//! Storage error types.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Role not found.
    #[error("role not found: {role_id}")]
    RoleNotFound { role_id: String },

    /// Role already exists.
    #[error("role already exists: {role_id}")]
    RoleAlreadyExists { role_id: String },

    /// Assignment not found.
    #[error("assignment not found: {user_id} -> {target}")]
    AssignmentNotFound { user_id: String, target: String },

    /// Backend connection error.
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    InternalError { message: String },
}

impl StorageError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        StorageError::InvalidInput {
            message: message.into(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
