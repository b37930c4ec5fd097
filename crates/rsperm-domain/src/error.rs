//! Domain error types for permission resolution.

use thiserror::Error;

/// Domain-specific errors for permission resolution.
///
/// Configuration-time variants (`DependencyCycle`) are returned from
/// constructors and must abort startup. Per-request variants never leave
/// [`PermissionResolver::resolve`](crate::resolver::PermissionResolver::resolve);
/// they are folded into a denied [`Decision`](crate::model::Decision).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Principal is not a member of the tenant/entity in the request context.
    #[error("entity boundary violation: user '{user_id}' is not a member of '{entity_id}'")]
    BoundaryViolation { user_id: String, entity_id: String },

    /// The permission dependency graph contains a cycle.
    #[error("dependency cycle detected: {path}")]
    DependencyCycle { path: String },

    /// The backing store failed, timed out, or the circuit breaker is open.
    #[error("backing store unavailable: {message}")]
    BackingStoreUnavailable { message: String },

    /// The request context or check inputs are malformed.
    #[error("invalid context: {message}")]
    InvalidContext { message: String },

    /// Internal cache invariant violation (e.g. tag index missing a stored key).
    #[error("cache corruption detected for key '{key}'")]
    CacheCorruption { key: String },

    /// Depth limit exceeded during graph traversal.
    #[error("depth limit exceeded (max: {max_depth})")]
    DepthLimitExceeded { max_depth: u32 },

    /// Timeout during permission resolution.
    #[error("timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Invalid permission key format.
    #[error("invalid permission format: {value}")]
    InvalidPermissionFormat { value: String },
}

impl DomainError {
    /// Shorthand for a backing store failure.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        DomainError::BackingStoreUnavailable {
            message: message.into(),
        }
    }

    /// Shorthand for a malformed request.
    pub fn invalid_context(message: impl Into<String>) -> Self {
        DomainError::InvalidContext {
            message: message.into(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
