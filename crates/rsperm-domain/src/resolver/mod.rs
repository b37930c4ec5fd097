//! Permission resolution.
//!
//! [`PermissionResolver`] combines the decision cache, the boundary
//! validator, the dependency graph and a [`DirectPermissionChecker`] behind a
//! circuit breaker. See [`permission_resolver`] for the resolution order.

mod breaker;
mod config;
pub mod permission_resolver;
mod traits;

#[cfg(test)]
mod tests;

pub use breaker::{BreakerCall, BreakerConfig, BreakerState, CircuitBreaker};
pub use config::{ResolverConfig, DEFAULT_SUPER_ADMIN_ROLE};
pub use permission_resolver::{PermissionResolver, PermissionResolverBuilder};
pub use traits::{AuditRecord, AuditSink, DirectPermissionChecker, MembershipLookup};
