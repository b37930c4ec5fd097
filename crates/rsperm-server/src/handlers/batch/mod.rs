//! Batch resolve handler with two-stage deduplication.
//!
//! This handler processes many permission checks in one request, as used
//! when rendering permission matrices:
//!
//! 1. **Intra-batch deduplication**: Identical checks execute only once
//! 2. **Singleflight**: Concurrent requests for the same check share results
//!
//! Checks that lead their singleflight group are handed to the resolver
//! together, so they share one decision cache snapshot. Every check keeps an
//! independent outcome; a malformed check is denied on its own without
//! failing the batch.

mod handler;
mod singleflight;
mod types;

pub use handler::BatchResolveHandler;
pub use singleflight::{Singleflight, SingleflightGuard, SingleflightSlot};
pub use types::{
    BatchResolveError, BatchResolveRequest, BatchResolveResponse, BatchResolveResult,
    MAX_BATCH_SIZE,
};
