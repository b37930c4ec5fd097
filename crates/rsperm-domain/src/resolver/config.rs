//! Configuration for the permission resolver.

use std::time::Duration;

/// Id of the system role that bypasses boundary and dependency checks.
pub const DEFAULT_SUPER_ADMIN_ROLE: &str = "super_admin";

/// Configuration for the permission resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Deadline for a whole uncached resolution.
    pub timeout: Duration,
    /// Deadline for each backing-store call.
    pub store_timeout: Duration,
    /// Role id checked on the SuperAdmin fast path.
    pub super_admin_role: String,
    /// When set, a global holder of this permission passes any boundary.
    pub cross_entity_permission: Option<String>,
    /// Upper bound on concurrent uncached resolutions.
    pub max_in_flight: usize,
    /// TTL for cached decisions; `None` uses the cache default.
    pub decision_ttl: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            store_timeout: Duration::from_millis(50),
            super_admin_role: DEFAULT_SUPER_ADMIN_ROLE.to_string(),
            cross_entity_permission: None,
            max_in_flight: 1024,
            decision_ttl: None,
        }
    }
}

impl ResolverConfig {
    /// Creates a new configuration with the specified timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_super_admin_role(mut self, role_id: impl Into<String>) -> Self {
        self.super_admin_role = role_id.into();
        self
    }

    /// Enables the cross-entity grant, e.g. `manage:tenants`.
    pub fn with_cross_entity_permission(mut self, permission_key: impl Into<String>) -> Self {
        self.cross_entity_permission = Some(permission_key.into());
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_decision_ttl(mut self, ttl: Duration) -> Self {
        self.decision_ttl = Some(ttl);
        self
    }
}
