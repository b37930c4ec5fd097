//! rsperm-domain: permission resolution core
//!
//! This crate contains the decision logic:
//! - Permission, check and decision types
//! - Dependency graph of permission implications
//! - Tag-indexed decision cache with batched invalidation
//! - Tenant/entity boundary validation
//! - The permission resolver and its circuit breaker
//! - Latency and hit-rate metrics
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                rsperm-domain                │
//! ├─────────────────────────────────────────────┤
//! │  model/     - Permissions, checks, decisions│
//! │  graph/     - Dependency DAG                │
//! │  cache/     - Decision cache & invalidation │
//! │  boundary/  - Tenant/entity membership      │
//! │  resolver/  - Resolution engine             │
//! │  collector/ - Rolling metrics               │
//! └─────────────────────────────────────────────┘
//! ```

pub mod boundary;
pub mod cache;
pub mod collector;
pub mod error;
pub mod graph;
pub mod model;
pub mod resolver;

// Re-export commonly used types at the crate root
pub use cache::{CacheKey, DecisionCache, DecisionCacheConfig, InvalidationEvent, Priority};
pub use collector::{MetricsCollector, MetricsSnapshot};
pub use error::{DomainError, DomainResult};
pub use graph::DependencyGraph;
pub use model::{Check, Decision, DenyReason, GrantReason, ResolveContext, Verdict};
pub use resolver::{PermissionResolver, ResolverConfig};
