//! In-memory storage implementation.
//!
//! Keyed by user id so every read the resolver makes is a single map lookup.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    validate_id, validate_permission_key, PermissionAssignment, PermissionStore, Role,
    RoleAssignment,
};

/// In-memory implementation of PermissionStore.
///
/// # Performance Characteristics
///
/// - **Role lookup**: O(1) (DashMap)
/// - **Assignments of a user**: O(1) lookup + clone of that user's list
/// - **Membership check**: O(1)
/// - **Delete role**: O(users) to drop its assignments
#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    roles: DashMap<String, Role>,
    role_assignments: DashMap<String, Vec<RoleAssignment>>,
    permission_assignments: DashMap<String, Vec<PermissionAssignment>>,
    memberships: DashMap<String, HashSet<String>>,
    /// Simulated outage; every call fails while set.
    unavailable: AtomicBool,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes every subsequent call fail with a connection error, or recover.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError {
                message: "in-memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    #[instrument(skip(self, role), fields(role_id = %role.id))]
    async fn create_role(&self, role: Role) -> StorageResult<Role> {
        self.ensure_available()?;
        validate_id("role_id", &role.id)?;
        for permission in &role.permissions {
            validate_permission_key(permission)?;
        }

        match self.roles.entry(role.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::RoleAlreadyExists {
                role_id: role.id.clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(role.clone());
                Ok(role)
            }
        }
    }

    async fn get_role(&self, role_id: &str) -> StorageResult<Role> {
        self.ensure_available()?;
        self.roles
            .get(role_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::RoleNotFound {
                role_id: role_id.to_string(),
            })
    }

    #[instrument(skip(self))]
    async fn delete_role(&self, role_id: &str) -> StorageResult<()> {
        self.ensure_available()?;
        if self.roles.remove(role_id).is_none() {
            return Err(StorageError::RoleNotFound {
                role_id: role_id.to_string(),
            });
        }
        for mut assignments in self.role_assignments.iter_mut() {
            assignments.retain(|a| a.role_id != role_id);
        }
        debug!(role_id, "role deleted with its assignments");
        Ok(())
    }

    async fn add_role_permission(&self, role_id: &str, permission: &str) -> StorageResult<()> {
        self.ensure_available()?;
        validate_permission_key(permission)?;
        let mut role = self
            .roles
            .get_mut(role_id)
            .ok_or_else(|| StorageError::RoleNotFound {
                role_id: role_id.to_string(),
            })?;
        if !role.permissions.iter().any(|p| p == permission) {
            role.permissions.push(permission.to_string());
        }
        Ok(())
    }

    async fn remove_role_permission(
        &self,
        role_id: &str,
        permission: &str,
    ) -> StorageResult<bool> {
        self.ensure_available()?;
        let mut role = self
            .roles
            .get_mut(role_id)
            .ok_or_else(|| StorageError::RoleNotFound {
                role_id: role_id.to_string(),
            })?;
        let before = role.permissions.len();
        role.permissions.retain(|p| p != permission);
        Ok(role.permissions.len() != before)
    }

    #[instrument(skip(self, assignment), fields(user_id = %assignment.user_id, role_id = %assignment.role_id))]
    async fn assign_role(&self, assignment: RoleAssignment) -> StorageResult<()> {
        self.ensure_available()?;
        validate_id("user_id", &assignment.user_id)?;
        if let Some(tenant) = &assignment.tenant_id {
            validate_id("tenant_id", tenant)?;
        }
        let is_system = self
            .roles
            .get(&assignment.role_id)
            .map(|r| r.is_system)
            .ok_or_else(|| StorageError::RoleNotFound {
                role_id: assignment.role_id.clone(),
            })?;
        if is_system && assignment.tenant_id.is_some() {
            return Err(StorageError::invalid_input(format!(
                "system role '{}' cannot be assigned within a tenant",
                assignment.role_id
            )));
        }

        let mut assignments = self
            .role_assignments
            .entry(assignment.user_id.clone())
            .or_default();
        assignments.retain(|a| {
            !(a.role_id == assignment.role_id && a.tenant_id == assignment.tenant_id)
        });
        assignments.push(assignment);
        Ok(())
    }

    async fn revoke_role(
        &self,
        user_id: &str,
        role_id: &str,
        tenant_id: Option<&str>,
    ) -> StorageResult<()> {
        self.ensure_available()?;
        let removed = self
            .role_assignments
            .get_mut(user_id)
            .map(|mut assignments| {
                let before = assignments.len();
                assignments.retain(|a| !(a.role_id == role_id && a.tenant_id.as_deref() == tenant_id));
                assignments.len() != before
            })
            .unwrap_or(false);
        if !removed {
            return Err(StorageError::AssignmentNotFound {
                user_id: user_id.to_string(),
                target: role_id.to_string(),
            });
        }
        Ok(())
    }

    async fn role_assignments(&self, user_id: &str) -> StorageResult<Vec<RoleAssignment>> {
        self.ensure_available()?;
        Ok(self
            .role_assignments
            .get(user_id)
            .map(|a| a.value().clone())
            .unwrap_or_default())
    }

    #[instrument(skip(self, assignment), fields(user_id = %assignment.user_id, permission = %assignment.permission))]
    async fn grant_permission(&self, assignment: PermissionAssignment) -> StorageResult<()> {
        self.ensure_available()?;
        validate_id("user_id", &assignment.user_id)?;
        validate_permission_key(&assignment.permission)?;
        if let Some(tenant) = &assignment.tenant_id {
            validate_id("tenant_id", tenant)?;
        }

        let mut assignments = self
            .permission_assignments
            .entry(assignment.user_id.clone())
            .or_default();
        assignments.retain(|a| {
            !(a.permission == assignment.permission && a.tenant_id == assignment.tenant_id)
        });
        assignments.push(assignment);
        Ok(())
    }

    async fn revoke_permission(
        &self,
        user_id: &str,
        permission: &str,
        tenant_id: Option<&str>,
    ) -> StorageResult<()> {
        self.ensure_available()?;
        let removed = self
            .permission_assignments
            .get_mut(user_id)
            .map(|mut assignments| {
                let before = assignments.len();
                assignments
                    .retain(|a| !(a.permission == permission && a.tenant_id.as_deref() == tenant_id));
                assignments.len() != before
            })
            .unwrap_or(false);
        if !removed {
            return Err(StorageError::AssignmentNotFound {
                user_id: user_id.to_string(),
                target: permission.to_string(),
            });
        }
        Ok(())
    }

    async fn permission_assignments(
        &self,
        user_id: &str,
    ) -> StorageResult<Vec<PermissionAssignment>> {
        self.ensure_available()?;
        Ok(self
            .permission_assignments
            .get(user_id)
            .map(|a| a.value().clone())
            .unwrap_or_default())
    }

    async fn add_member(&self, user_id: &str, entity_id: &str) -> StorageResult<()> {
        self.ensure_available()?;
        validate_id("user_id", user_id)?;
        validate_id("entity_id", entity_id)?;
        self.memberships
            .entry(user_id.to_string())
            .or_default()
            .insert(entity_id.to_string());
        Ok(())
    }

    async fn remove_member(&self, user_id: &str, entity_id: &str) -> StorageResult<bool> {
        self.ensure_available()?;
        Ok(self
            .memberships
            .get_mut(user_id)
            .is_some_and(|mut entities| entities.remove(entity_id)))
    }

    async fn is_member(&self, user_id: &str, entity_id: &str) -> StorageResult<bool> {
        self.ensure_available()?;
        Ok(self
            .memberships
            .get(user_id)
            .is_some_and(|entities| entities.contains(entity_id)))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.ensure_available()?;
        let mut purged = 0;
        for mut assignments in self.role_assignments.iter_mut() {
            let before = assignments.len();
            assignments.retain(|a| a.is_active(now));
            purged += before - assignments.len();
        }
        for mut assignments in self.permission_assignments.iter_mut() {
            let before = assignments.len();
            assignments.retain(|a| a.is_active(now));
            purged += before - assignments.len();
        }
        if purged > 0 {
            debug!(purged, "purged expired assignments");
        }
        Ok(purged)
    }
}
