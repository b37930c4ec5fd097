//! rsperm-storage: Storage abstraction layer
//!
//! This crate provides the storage abstraction for permission data:
//! - PermissionStore trait for roles, assignments and memberships
//! - In-memory implementation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               rsperm-storage                │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs - PermissionStore definition     │
//! │  memory.rs - In-memory implementation       │
//! └─────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use memory::MemoryPermissionStore;
pub use traits::{PermissionAssignment, PermissionStore, Role, RoleAssignment};
