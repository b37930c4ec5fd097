//! rsperm-server: service assembly around the permission resolver
//!
//! This crate contains the composition layer including:
//! - Layered configuration (defaults, YAML, environment)
//! - Adapters from the permission store to the resolver's collaborators
//! - The `PermissionService` lifecycle
//! - Batch resolution with request deduplication
//! - Logging, Prometheus metrics and an audit sink
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                rsperm-server                │
//! ├─────────────────────────────────────────────┤
//! │  config.rs      - Configuration management  │
//! │  adapters.rs    - Storage → domain traits   │
//! │  service.rs     - Assembly and lifecycle    │
//! │  audit.rs       - Log-backed audit sink     │
//! │  handlers/      - Batch resolution          │
//! │  observability/ - Logging and metrics       │
//! └─────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod audit;
pub mod config;
pub mod handlers;
pub mod observability;
pub mod service;

// Re-exports for convenience
pub use audit::TracingAuditSink;
pub use config::{ConfigLoadError, DependencyEdge, ServerConfig};
pub use service::{PermissionService, ServiceError, ServiceResult, StoreResolver};
