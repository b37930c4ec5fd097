//! Collaborator traits the resolver depends on.
//!
//! Implementations live outside the domain crate; the server crate adapts the
//! storage layer to them.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::DomainResult;
use crate::model::{Decision, Permission};

/// Answers grant questions against the backing store.
///
/// Expired assignments must never be reported as grants. Implementations
/// return `BackingStoreUnavailable` on failure.
#[async_trait]
pub trait DirectPermissionChecker: Send + Sync {
    /// Whether the user holds `permission` by direct assignment.
    ///
    /// With `tenant_id = None` only global (tenant-less) assignments count.
    /// A scoped permission matches only an assignment with the same
    /// `resource_id`.
    async fn check_direct(
        &self,
        user_id: &str,
        permission: &Permission,
        tenant_id: Option<&str>,
    ) -> DomainResult<bool>;

    /// Ids of the user's unexpired role assignments valid in the tenant.
    async fn active_roles(&self, user_id: &str, tenant_id: Option<&str>)
        -> DomainResult<Vec<String>>;

    /// Whether the role carries `permission`.
    async fn role_grants(&self, role_id: &str, permission: &Permission) -> DomainResult<bool>;

    /// Whether the user holds a system-wide role such as SuperAdmin.
    async fn has_system_role(&self, user_id: &str, role_id: &str) -> DomainResult<bool>;

    /// Time until the earliest expiring active assignment of the user that
    /// applies in `tenant_id` runs out. `None` when none of them expire.
    ///
    /// A grant is cached no longer than this.
    async fn grants_expire_in(
        &self,
        _user_id: &str,
        _tenant_id: Option<&str>,
    ) -> DomainResult<Option<Duration>> {
        Ok(None)
    }
}

/// Answers tenant/entity membership questions.
#[async_trait]
pub trait MembershipLookup: Send + Sync {
    async fn is_member(&self, user_id: &str, entity_id: &str) -> DomainResult<bool>;
}

/// One resolved decision, as handed to an [`AuditSink`].
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub tenant_id: Option<String>,
    pub entity_id: Option<String>,
    pub resource_id: Option<String>,
    pub decision: Decision,
}

/// Receives every decision for auditing.
///
/// Records are delivered from a spawned task; an error never affects the
/// decision returned to the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> DomainResult<()>;
}
