//! Data types for batch resolve operations.

use rsperm_domain::{Check, Decision};

/// Maximum number of checks in one batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// Request for batch permission resolution.
#[derive(Debug, Clone)]
pub struct BatchResolveRequest {
    pub checks: Vec<Check>,
}

impl BatchResolveRequest {
    pub fn new(checks: Vec<Check>) -> Self {
        Self { checks }
    }
}

/// Response from a batch resolve operation.
#[derive(Debug, Clone)]
pub struct BatchResolveResponse {
    /// Decisions for each check, in the same order as the request.
    pub results: Vec<Decision>,
}

impl BatchResolveResponse {
    /// Number of granted checks.
    pub fn granted_count(&self) -> usize {
        self.results.iter().filter(|d| d.is_granted()).count()
    }
}

/// Errors that reject a whole batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchResolveError {
    #[error("batch request cannot be empty")]
    EmptyBatch,

    #[error("batch size {size} exceeds maximum allowed {max}")]
    BatchTooLarge { size: usize, max: usize },
}

/// Result type for batch resolve operations.
pub type BatchResolveResult<T> = Result<T, BatchResolveError>;
