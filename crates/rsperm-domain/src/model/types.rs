//! Core type definitions for permission resolution.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A permission: an `action` on a `resource`, optionally scoped to one resource id.
///
/// Identified by `action:resource[:resource_id]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    /// The action portion (e.g., "update").
    pub action: String,
    /// The resource portion (e.g., "documents").
    pub resource: String,
    /// Optional resource instance this permission is scoped to.
    pub resource_id: Option<String>,
}

impl Permission {
    /// Creates an unscoped permission.
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
        }
    }

    /// Creates a permission scoped to a single resource id.
    pub fn scoped(
        action: impl Into<String>,
        resource: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            resource_id: Some(resource_id.into()),
        }
    }

    /// Parses a permission from `action:resource[:resource_id]` format.
    pub fn parse(value: &str) -> DomainResult<Self> {
        let parts: Vec<&str> = value.splitn(3, ':').collect();
        let invalid = || DomainError::InvalidPermissionFormat {
            value: value.to_string(),
        };
        match parts.as_slice() {
            [action, resource] if !action.is_empty() && !resource.is_empty() => {
                Ok(Self::new(*action, *resource))
            }
            [action, resource, id]
                if !action.is_empty() && !resource.is_empty() && !id.is_empty() =>
            {
                Ok(Self::scoped(*action, *resource, *id))
            }
            _ => Err(invalid()),
        }
    }

    /// Returns the identifier of this permission (`action:resource[:resource_id]`).
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Returns the unscoped `action:resource` key used by the dependency graph.
    pub fn base_key(&self) -> String {
        format!("{}:{}", self.action, self.resource)
    }

    /// Returns the same permission with the given scope.
    pub fn with_resource_id(&self, resource_id: Option<&str>) -> Self {
        Self {
            action: self.action.clone(),
            resource: self.resource.clone(),
            resource_id: resource_id.map(str::to_string),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource_id {
            Some(id) => write!(f, "{}:{}:{}", self.action, self.resource, id),
            None => write!(f, "{}:{}", self.action, self.resource),
        }
    }
}

/// Tenant/entity context for a resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolveContext {
    pub tenant_id: Option<String>,
    pub entity_id: Option<String>,
    pub resource_id: Option<String>,
}

impl ResolveContext {
    /// A context with no tenant, entity, or resource scope.
    pub fn global() -> Self {
        Self::default()
    }

    /// A context scoped to a tenant.
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    /// Sets the entity id.
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Sets the resource id.
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Boundary identifiers this context requires membership in, tenant first.
    pub fn boundary_ids(&self) -> Vec<&str> {
        let mut ids = Vec::with_capacity(2);
        if let Some(tenant) = self.tenant_id.as_deref() {
            ids.push(tenant);
        }
        if let Some(entity) = self.entity_id.as_deref() {
            if !ids.contains(&entity) {
                ids.push(entity);
            }
        }
        ids
    }
}

/// A single permission check: who wants to do what, where.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Check {
    pub user_id: String,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub context: ResolveContext,
}

impl Check {
    /// Creates a new check.
    pub fn new(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        context: ResolveContext,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            action: action.into(),
            resource: resource.into(),
            context,
        }
    }

    /// Returns a copy with whitespace trimmed and action/resource lowercased.
    ///
    /// Identifiers (user, tenant, entity, resource id) are case-sensitive and
    /// only trimmed.
    pub fn normalized(&self) -> Self {
        let trim_opt = |v: &Option<String>| v.as_deref().map(|s| s.trim().to_string());
        Self {
            user_id: self.user_id.trim().to_string(),
            action: self.action.trim().to_ascii_lowercase(),
            resource: self.resource.trim().to_ascii_lowercase(),
            context: ResolveContext {
                tenant_id: trim_opt(&self.context.tenant_id),
                entity_id: trim_opt(&self.context.entity_id),
                resource_id: trim_opt(&self.context.resource_id),
            },
        }
    }

    /// Validates a normalized check.
    pub fn validate(&self) -> DomainResult<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::invalid_context("user_id cannot be empty"));
        }
        for (field, value) in [("action", &self.action), ("resource", &self.resource)] {
            if value.is_empty() {
                return Err(DomainError::invalid_context(format!(
                    "{field} cannot be empty"
                )));
            }
            if value.contains(':') {
                return Err(DomainError::invalid_context(format!(
                    "{field} cannot contain ':'"
                )));
            }
        }
        for (field, value) in [
            ("tenant_id", &self.context.tenant_id),
            ("entity_id", &self.context.entity_id),
            ("resource_id", &self.context.resource_id),
        ] {
            if matches!(value.as_deref(), Some("")) {
                return Err(DomainError::invalid_context(format!(
                    "{field} cannot be empty when present"
                )));
            }
        }
        Ok(())
    }

    /// The permission this check asks for, scoped to the context's resource id.
    pub fn permission(&self) -> Permission {
        Permission {
            action: self.action.clone(),
            resource: self.resource.clone(),
            resource_id: self.context.resource_id.clone(),
        }
    }
}

/// Kinds of entities whose mutation invalidates cached decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Role,
    Permission,
    Tenant,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Role => "role",
            EntityKind::Permission => "permission",
            EntityKind::Tenant => "tenant",
        }
    }

    /// Builds the cache tag for an entity of this kind (e.g. `role:editor`).
    pub fn tag(&self, id: &str) -> String {
        format!("{}:{}", self.as_str(), id)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision granted access.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantReason {
    /// Principal holds the system SuperAdmin role.
    SuperAdminBypass,
    /// A direct user permission assignment matched.
    DirectGrant,
    /// A permission of one of the principal's active roles matched.
    RoleGrant { role_id: String },
}

impl GrantReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantReason::SuperAdminBypass => "SuperAdmin bypass",
            GrantReason::DirectGrant => "Direct grant",
            GrantReason::RoleGrant { .. } => "Role grant",
        }
    }
}

/// Why a decision denied access. `as_str()` values are stable and matchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DenyReason {
    /// No direct, role, or implied permission matched.
    NoMatchingPermission,
    /// Principal is not a member of the tenant/entity.
    EntityBoundaryViolation,
    /// Store lookup failed, timed out, or the circuit breaker is open.
    BackingStoreUnavailable,
    /// The request was malformed.
    InvalidContext,
    /// The resolution exceeded its deadline.
    Timeout,
    /// Too many resolutions in flight; admission refused.
    Overloaded,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NoMatchingPermission => "Permission denied",
            DenyReason::EntityBoundaryViolation => "Entity boundary violation",
            DenyReason::BackingStoreUnavailable => "backing store unavailable",
            DenyReason::InvalidContext => "Invalid context",
            DenyReason::Timeout => "Resolution timeout",
            DenyReason::Overloaded => "Resolver overloaded",
        }
    }

    /// Whether the denial reflects a transient failure rather than a real
    /// absence of permission.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DenyReason::BackingStoreUnavailable | DenyReason::Timeout | DenyReason::Overloaded
        )
    }
}

impl From<&DomainError> for DenyReason {
    fn from(err: &DomainError) -> Self {
        match err {
            DomainError::BoundaryViolation { .. } => DenyReason::EntityBoundaryViolation,
            DomainError::InvalidContext { .. } | DomainError::InvalidPermissionFormat { .. } => {
                DenyReason::InvalidContext
            }
            DomainError::Timeout { .. } => DenyReason::Timeout,
            DomainError::BackingStoreUnavailable { .. }
            | DomainError::DependencyCycle { .. }
            | DomainError::CacheCorruption { .. }
            | DomainError::DepthLimitExceeded { .. } => DenyReason::BackingStoreUnavailable,
        }
    }
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Granted(GrantReason),
    Denied(DenyReason),
}

/// The resolver's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Permission keys consulted to reach this decision, in order.
    pub resolution_path: Vec<String>,
    pub resolution_time: Duration,
    pub cache_hit: bool,
}

impl Decision {
    pub fn granted(reason: GrantReason, resolution_path: Vec<String>) -> Self {
        Self {
            verdict: Verdict::Granted(reason),
            resolution_path,
            resolution_time: Duration::ZERO,
            cache_hit: false,
        }
    }

    pub fn denied(reason: DenyReason, resolution_path: Vec<String>) -> Self {
        Self {
            verdict: Verdict::Denied(reason),
            resolution_path,
            resolution_time: Duration::ZERO,
            cache_hit: false,
        }
    }

    /// Whether access is granted.
    pub fn is_granted(&self) -> bool {
        matches!(self.verdict, Verdict::Granted(_))
    }

    /// The stable reason string for this decision.
    pub fn reason(&self) -> &'static str {
        match &self.verdict {
            Verdict::Granted(reason) => reason.as_str(),
            Verdict::Denied(reason) => reason.as_str(),
        }
    }

    /// The deny reason, if denied.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match &self.verdict {
            Verdict::Denied(reason) => Some(*reason),
            Verdict::Granted(_) => None,
        }
    }

    pub fn resolution_time_ms(&self) -> f64 {
        self.resolution_time.as_secs_f64() * 1000.0
    }

    pub(crate) fn with_timing(mut self, resolution_time: Duration, cache_hit: bool) -> Self {
        self.resolution_time = resolution_time;
        self.cache_hit = cache_hit;
        self
    }
}
