//! Permission resolution data model.
//!
//! This module contains:
//! - Permissions and their `action:resource[:resource_id]` identifiers
//! - Check requests and their tenant/entity context
//! - Decisions and the closed grant/deny reason taxonomy
//! - Entity kinds used to build cache tags

mod types;

pub use types::*;
