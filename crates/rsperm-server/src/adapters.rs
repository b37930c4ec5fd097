//! Adapters that bridge the storage layer to the domain layer.
//!
//! The domain layer (rsperm-domain) defines abstract collaborator traits:
//! - `DirectPermissionChecker`: direct and role-derived grants
//! - `MembershipLookup`: tenant/entity membership
//!
//! The storage layer (rsperm-storage) implements `PermissionStore`.
//!
//! This module implements the domain traits over any `PermissionStore`,
//! applying assignment expiry at the time of the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use rsperm_domain::error::{DomainError, DomainResult};
use rsperm_domain::model::Permission;
use rsperm_domain::resolver::{DirectPermissionChecker, MembershipLookup};
use rsperm_storage::{PermissionStore, StorageError};

fn store_error(err: StorageError) -> DomainError {
    DomainError::store_unavailable(format!("storage error: {err}"))
}

/// Whether an assignment made in `assigned` applies to a request in `requested`.
///
/// Without a requested tenant only global assignments count.
fn tenant_applies(assigned: Option<&str>, requested: Option<&str>) -> bool {
    match (assigned, requested) {
        (None, _) => true,
        (Some(assigned), Some(requested)) => assigned == requested,
        (Some(_), None) => false,
    }
}

/// Implements `DirectPermissionChecker` using a `PermissionStore`.
pub struct StorePermissionChecker<S: PermissionStore> {
    storage: Arc<S>,
}

impl<S: PermissionStore> StorePermissionChecker<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: PermissionStore> DirectPermissionChecker for StorePermissionChecker<S> {
    async fn check_direct(
        &self,
        user_id: &str,
        permission: &Permission,
        tenant_id: Option<&str>,
    ) -> DomainResult<bool> {
        let key = permission.key();
        let now = Utc::now();
        let assignments = self
            .storage
            .permission_assignments(user_id)
            .await
            .map_err(store_error)?;
        Ok(assignments.iter().any(|a| {
            a.permission == key
                && a.is_active(now)
                && tenant_applies(a.tenant_id.as_deref(), tenant_id)
        }))
    }

    async fn active_roles(
        &self,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> DomainResult<Vec<String>> {
        let now = Utc::now();
        let mut roles: Vec<String> = self
            .storage
            .role_assignments(user_id)
            .await
            .map_err(store_error)?
            .into_iter()
            .filter(|a| a.is_active(now) && tenant_applies(a.tenant_id.as_deref(), tenant_id))
            .map(|a| a.role_id)
            .collect();
        // Resolution order must not depend on assignment order.
        roles.sort();
        roles.dedup();
        Ok(roles)
    }

    async fn role_grants(&self, role_id: &str, permission: &Permission) -> DomainResult<bool> {
        match self.storage.get_role(role_id).await {
            Ok(role) => {
                let key = permission.key();
                Ok(role.permissions.iter().any(|p| *p == key))
            }
            // Deleted between listing and lookup.
            Err(StorageError::RoleNotFound { .. }) => Ok(false),
            Err(err) => Err(store_error(err)),
        }
    }

    async fn has_system_role(&self, user_id: &str, role_id: &str) -> DomainResult<bool> {
        let now = Utc::now();
        let assignments = self
            .storage
            .role_assignments(user_id)
            .await
            .map_err(store_error)?;
        Ok(assignments
            .iter()
            .any(|a| a.role_id == role_id && a.tenant_id.is_none() && a.is_active(now)))
    }

    async fn grants_expire_in(
        &self,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> DomainResult<Option<Duration>> {
        let now = Utc::now();
        let permissions = self
            .storage
            .permission_assignments(user_id)
            .await
            .map_err(store_error)?;
        let roles = self
            .storage
            .role_assignments(user_id)
            .await
            .map_err(store_error)?;

        let earliest = permissions
            .iter()
            .filter(|a| a.is_active(now) && tenant_applies(a.tenant_id.as_deref(), tenant_id))
            .filter_map(|a| a.expires_at)
            .chain(
                roles
                    .iter()
                    .filter(|a| {
                        a.is_active(now) && tenant_applies(a.tenant_id.as_deref(), tenant_id)
                    })
                    .filter_map(|a| a.expires_at),
            )
            .min();
        // A negative span means it expired just now.
        Ok(earliest.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO)))
    }
}

/// Implements `MembershipLookup` using a `PermissionStore`.
pub struct StoreMembershipLookup<S: PermissionStore> {
    storage: Arc<S>,
}

impl<S: PermissionStore> StoreMembershipLookup<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: PermissionStore> MembershipLookup for StoreMembershipLookup<S> {
    async fn is_member(&self, user_id: &str, entity_id: &str) -> DomainResult<bool> {
        self.storage
            .is_member(user_id, entity_id)
            .await
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use rsperm_storage::{MemoryPermissionStore, PermissionAssignment, Role, RoleAssignment};

    use super::*;

    async fn seeded() -> Arc<MemoryPermissionStore> {
        let store = MemoryPermissionStore::new_shared();
        store
            .create_role(Role::new("editor", "Editor").with_permission("update:documents"))
            .await
            .unwrap();
        store
            .create_role(Role::system("super_admin", "Super Admin"))
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_tenant_applies() {
        assert!(tenant_applies(None, None));
        assert!(tenant_applies(None, Some("t1")));
        assert!(tenant_applies(Some("t1"), Some("t1")));
        assert!(!tenant_applies(Some("t1"), Some("t2")));
        assert!(!tenant_applies(Some("t1"), None));
    }

    #[tokio::test]
    async fn test_direct_grant_respects_scope_and_tenant() {
        let store = seeded().await;
        store
            .grant_permission(PermissionAssignment::new("u1", "read:documents:42").in_tenant("t1"))
            .await
            .unwrap();
        let checker = StorePermissionChecker::new(Arc::clone(&store));

        let scoped = Permission::scoped("read", "documents", "42");
        assert!(checker.check_direct("u1", &scoped, Some("t1")).await.unwrap());
        assert!(!checker.check_direct("u1", &scoped, Some("t2")).await.unwrap());
        assert!(!checker.check_direct("u1", &scoped, None).await.unwrap());

        let unscoped = Permission::new("read", "documents");
        assert!(!checker.check_direct("u1", &unscoped, Some("t1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_assignments_are_not_grants() {
        let store = seeded().await;
        let past = Utc::now() - Duration::minutes(5);
        store
            .grant_permission(PermissionAssignment::new("u1", "read:documents").expiring_at(past))
            .await
            .unwrap();
        store
            .assign_role(RoleAssignment::new("u1", "editor").expiring_at(past))
            .await
            .unwrap();
        store
            .assign_role(RoleAssignment::new("u2", "super_admin").expiring_at(past))
            .await
            .unwrap();
        let checker = StorePermissionChecker::new(Arc::clone(&store));

        let read = Permission::new("read", "documents");
        assert!(!checker.check_direct("u1", &read, None).await.unwrap());
        assert!(checker.active_roles("u1", None).await.unwrap().is_empty());
        assert!(!checker.has_system_role("u2", "super_admin").await.unwrap());
    }

    #[tokio::test]
    async fn test_grant_lifetime_is_earliest_applicable_expiry() {
        let store = seeded().await;
        let now = Utc::now();
        store
            .grant_permission(
                PermissionAssignment::new("u1", "read:documents")
                    .expiring_at(now + Duration::minutes(10)),
            )
            .await
            .unwrap();
        store
            .assign_role(
                RoleAssignment::new("u1", "editor")
                    .in_tenant("t1")
                    .expiring_at(now + Duration::minutes(2)),
            )
            .await
            .unwrap();
        store
            .assign_role(RoleAssignment::new("u2", "editor"))
            .await
            .unwrap();
        let checker = StorePermissionChecker::new(Arc::clone(&store));

        let global = checker.grants_expire_in("u1", None).await.unwrap().unwrap();
        let in_t1 = checker.grants_expire_in("u1", Some("t1")).await.unwrap().unwrap();

        assert!(global > std::time::Duration::from_secs(9 * 60));
        assert!(in_t1 <= std::time::Duration::from_secs(2 * 60));
        assert_eq!(checker.grants_expire_in("u2", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_active_roles_and_role_grants() {
        let store = seeded().await;
        store
            .assign_role(RoleAssignment::new("u1", "editor").in_tenant("t1"))
            .await
            .unwrap();
        let checker = StorePermissionChecker::new(Arc::clone(&store));

        assert_eq!(checker.active_roles("u1", Some("t1")).await.unwrap(), vec!["editor"]);
        assert!(checker.active_roles("u1", Some("t2")).await.unwrap().is_empty());

        let update = Permission::new("update", "documents");
        assert!(checker.role_grants("editor", &update).await.unwrap());
        assert!(!checker
            .role_grants("editor", &Permission::new("delete", "documents"))
            .await
            .unwrap());
        assert!(!checker.role_grants("ghost", &update).await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_failure_maps_to_backing_store_unavailable() {
        let store = seeded().await;
        store.set_unavailable(true);
        let checker = StorePermissionChecker::new(Arc::clone(&store));
        let lookup = StoreMembershipLookup::new(Arc::clone(&store));

        let err = checker
            .check_direct("u1", &Permission::new("read", "documents"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::BackingStoreUnavailable { .. }));
        assert!(matches!(
            lookup.is_member("u1", "t1").await,
            Err(DomainError::BackingStoreUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_membership_lookup() {
        let store = seeded().await;
        store.add_member("u1", "t1").await.unwrap();
        let lookup = StoreMembershipLookup::new(store);

        assert!(lookup.is_member("u1", "t1").await.unwrap());
        assert!(!lookup.is_member("u1", "t2").await.unwrap());
    }
}
