//! PermissionStore trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Maximum length of any identifier.
pub const MAX_ID_LENGTH: usize = 256;

/// A role and the permission keys it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    /// Permission keys, `action:resource[:resource_id]`.
    pub permissions: Vec<String>,
    /// System roles (e.g. SuperAdmin) are only ever assigned globally.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            permissions: Vec::new(),
            is_system: false,
            created_at: Utc::now(),
        }
    }

    pub fn system(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            is_system: true,
            ..Self::new(id, name)
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

/// A user holding a role, globally or in one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: String,
    pub role_id: String,
    pub tenant_id: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoleAssignment {
    pub fn new(user_id: impl Into<String>, role_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role_id: role_id.into(),
            tenant_id: None,
            granted_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn in_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the assignment is in force at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A permission granted directly to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionAssignment {
    pub user_id: String,
    /// Permission key, `action:resource[:resource_id]`.
    pub permission: String,
    pub tenant_id: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionAssignment {
    pub fn new(user_id: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            permission: permission.into(),
            tenant_id: None,
            granted_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn in_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Abstract storage interface for permission data.
///
/// Implementations must be thread-safe (Send + Sync). Reads return expired
/// assignments as stored; callers filter with `is_active`.
#[async_trait]
pub trait PermissionStore: Send + Sync + 'static {
    // Role operations

    /// Creates a role. Fails if the id is taken.
    async fn create_role(&self, role: Role) -> StorageResult<Role>;

    async fn get_role(&self, role_id: &str) -> StorageResult<Role>;

    /// Deletes a role and every assignment of it.
    async fn delete_role(&self, role_id: &str) -> StorageResult<()>;

    /// Adds a permission key to a role. Idempotent.
    async fn add_role_permission(&self, role_id: &str, permission: &str) -> StorageResult<()>;

    /// Removes a permission key from a role. Returns whether it was present.
    async fn remove_role_permission(&self, role_id: &str, permission: &str)
        -> StorageResult<bool>;

    // Assignment operations

    /// Assigns a role, replacing an existing assignment of the same role in
    /// the same tenant.
    async fn assign_role(&self, assignment: RoleAssignment) -> StorageResult<()>;

    async fn revoke_role(
        &self,
        user_id: &str,
        role_id: &str,
        tenant_id: Option<&str>,
    ) -> StorageResult<()>;

    async fn role_assignments(&self, user_id: &str) -> StorageResult<Vec<RoleAssignment>>;

    /// Grants a permission, replacing an existing grant of the same key in
    /// the same tenant.
    async fn grant_permission(&self, assignment: PermissionAssignment) -> StorageResult<()>;

    async fn revoke_permission(
        &self,
        user_id: &str,
        permission: &str,
        tenant_id: Option<&str>,
    ) -> StorageResult<()>;

    async fn permission_assignments(&self, user_id: &str)
        -> StorageResult<Vec<PermissionAssignment>>;

    // Membership operations

    async fn add_member(&self, user_id: &str, entity_id: &str) -> StorageResult<()>;

    /// Returns whether the membership existed.
    async fn remove_member(&self, user_id: &str, entity_id: &str) -> StorageResult<bool>;

    async fn is_member(&self, user_id: &str, entity_id: &str) -> StorageResult<bool>;

    /// Drops assignments that expired before `now`. Returns how many.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}

/// Validates an identifier (user, role, tenant, entity).
pub fn validate_id(kind: &str, id: &str) -> StorageResult<()> {
    if id.is_empty() {
        return Err(StorageError::invalid_input(format!("{kind} cannot be empty")));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(StorageError::invalid_input(format!(
            "{kind} exceeds maximum length of {MAX_ID_LENGTH} characters"
        )));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(StorageError::invalid_input(format!(
            "{kind} cannot contain whitespace"
        )));
    }
    Ok(())
}

/// Validates a permission key: `action:resource` or `action:resource:resource_id`.
pub fn validate_permission_key(key: &str) -> StorageResult<()> {
    let parts: Vec<&str> = key.splitn(3, ':').collect();
    let well_formed = (parts.len() == 2 || parts.len() == 3) && parts.iter().all(|p| !p.is_empty());
    if !well_formed {
        return Err(StorageError::invalid_input(format!(
            "invalid permission key '{key}', expected action:resource[:resource_id]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("user_id", "u1").is_ok());
        assert!(validate_id("user_id", "").is_err());
        assert!(validate_id("user_id", "u 1").is_err());
        assert!(validate_id("user_id", &"x".repeat(MAX_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_permission_key() {
        assert!(validate_permission_key("read:documents").is_ok());
        assert!(validate_permission_key("read:documents:42").is_ok());
        assert!(validate_permission_key("read").is_err());
        assert!(validate_permission_key("read::42").is_err());
        assert!(validate_permission_key(":documents").is_err());
    }

    #[test]
    fn test_assignment_expiry() {
        let now = Utc::now();
        let open = RoleAssignment::new("u1", "editor");
        let expired = RoleAssignment::new("u1", "editor").expiring_at(now - Duration::seconds(1));
        let pending = PermissionAssignment::new("u1", "read:docs").expiring_at(now + Duration::hours(1));

        assert!(open.is_active(now));
        assert!(!expired.is_active(now));
        assert!(pending.is_active(now));
    }
}
