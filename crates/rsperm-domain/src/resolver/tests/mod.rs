//! Tests for the permission resolver module.
//!
//! Organized by functionality:
//! - Grant sources (direct, role, scoped)
//! - SuperAdmin and entity boundaries
//! - Dependency expansion
//! - Decision caching and invalidation
//! - Failure handling (breaker, timeouts, admission)
//! - Batching, auditing, adaptive warming

mod resolver_tests;
