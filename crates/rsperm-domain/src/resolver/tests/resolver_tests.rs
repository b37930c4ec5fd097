//! Permission resolver test suite.
//!
//! Covers grant sources, the SuperAdmin fast path, entity boundaries,
//! dependency expansion, decision caching, failure handling, batching,
//! auditing and the adaptive controller.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::mocks::{create_resolver, MockAuditSink, MockChecker, MockMembership, TestResolver};
use crate::cache::{AdaptiveConfig, CacheKey, InvalidationEvent, Priority};
use crate::error::DomainError;
use crate::graph::DependencyGraph;
use crate::model::{Check, DenyReason, GrantReason, ResolveContext, Verdict};
use crate::resolver::{BreakerConfig, BreakerState, PermissionResolver, ResolverConfig};

fn builder_resolver(
    config: ResolverConfig,
    breaker: BreakerConfig,
) -> (Arc<MockChecker>, Arc<MockMembership>, TestResolver) {
    let checker = Arc::new(MockChecker::new());
    let membership = Arc::new(MockMembership::new());
    let resolver = PermissionResolver::builder(Arc::clone(&checker), Arc::clone(&membership))
        .config(config)
        .breaker_config(breaker)
        .build()
        .unwrap();
    (checker, membership, resolver)
}

// ========== Section 1: Grant Sources ==========

#[tokio::test]
async fn test_direct_grant_is_granted() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert!(decision.is_granted());
    assert_eq!(decision.reason(), "Direct grant");
    assert_eq!(decision.resolution_path, vec!["update:documents"]);
    assert!(!decision.cache_hit);
}

#[tokio::test]
async fn test_role_grant_is_granted_with_role_id() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.assign_role("u1", "editor", None).await;
    checker.grant_role("editor", "update:documents").await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert_eq!(
        decision.verdict,
        Verdict::Granted(GrantReason::RoleGrant {
            role_id: "editor".to_string()
        })
    );
    assert_eq!(decision.reason(), "Role grant");
}

#[tokio::test]
async fn test_absence_of_grant_is_denied() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "read:documents", None).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert!(!decision.is_granted());
    assert_eq!(decision.reason(), "Permission denied");
    assert_eq!(decision.resolution_path, vec!["update:documents"]);
}

#[tokio::test]
async fn test_direct_grant_wins_over_role_when_both_match() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    checker.assign_role("u1", "editor", None).await;
    checker.grant_role("editor", "update:documents").await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert_eq!(decision.verdict, Verdict::Granted(GrantReason::DirectGrant));
}

#[tokio::test]
async fn test_tenantless_context_ignores_tenant_assignments() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", Some("t1")).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert!(!decision.is_granted());
}

#[tokio::test]
async fn test_scoped_grant_matches_only_its_resource_id() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents:42", None).await;

    let own = resolver
        .resolve(
            "u1",
            "update",
            "documents",
            &ResolveContext::global().with_resource_id("42"),
        )
        .await;
    let other = resolver
        .resolve(
            "u1",
            "update",
            "documents",
            &ResolveContext::global().with_resource_id("43"),
        )
        .await;

    assert!(own.is_granted());
    assert!(!other.is_granted());
    assert_eq!(
        other.resolution_path,
        vec!["update:documents:43", "update:documents"]
    );
}

#[tokio::test]
async fn test_unscoped_grant_covers_every_resource_id() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;

    let decision = resolver
        .resolve(
            "u1",
            "update",
            "documents",
            &ResolveContext::global().with_resource_id("42"),
        )
        .await;

    assert!(decision.is_granted());
    assert_eq!(
        decision.resolution_path,
        vec!["update:documents:42", "update:documents"]
    );
}

// ========== Section 2: SuperAdmin ==========

#[tokio::test]
async fn test_super_admin_bypasses_boundary_and_grants() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.make_super_admin("root").await;

    let decision = resolver
        .resolve(
            "root",
            "delete",
            "tenants",
            &ResolveContext::tenant("t9").with_entity("e1"),
        )
        .await;

    assert!(decision.is_granted());
    assert_eq!(decision.reason(), "SuperAdmin bypass");
    assert!(decision.resolution_path.is_empty());
    // Only the SuperAdmin lookup reached the store.
    assert_eq!(checker.calls(), 1);
}

#[tokio::test]
async fn test_super_admin_decision_is_tagged_by_user() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.make_super_admin("root").await;
    let ctx = ResolveContext::tenant("t1");
    resolver.resolve("root", "read", "audit", &ctx).await;

    let key = CacheKey::from_check(&Check::new("root", "read", "audit", ctx));
    let entry = resolver.cache().entry(&key).await.unwrap();
    assert_eq!(entry.tags, vec!["role:super_admin", "user:root"]);
}

// ========== Section 3: Entity Boundaries ==========

#[tokio::test]
async fn test_boundary_isolation_between_tenants() {
    let (checker, membership, resolver) = create_resolver(&[]);
    membership.add_member("u1", "t1").await;
    checker.grant_direct("u1", "update:documents", Some("t1")).await;
    checker.grant_direct("u1", "update:documents", Some("t2")).await;

    let in_t1 = resolver
        .resolve("u1", "update", "documents", &ResolveContext::tenant("t1"))
        .await;
    let calls_before = checker.calls();
    let in_t2 = resolver
        .resolve("u1", "update", "documents", &ResolveContext::tenant("t2"))
        .await;

    assert!(in_t1.is_granted());
    assert!(!in_t2.is_granted());
    assert_eq!(in_t2.reason(), "Entity boundary violation");
    // Only the SuperAdmin lookup ran; no grant lookup after the violation.
    assert_eq!(checker.calls() - calls_before, 1);
}

#[tokio::test]
async fn test_entity_membership_is_required_in_addition_to_tenant() {
    let (checker, membership, resolver) = create_resolver(&[]);
    membership.add_member("u1", "t1").await;
    checker.grant_direct("u1", "read:reports", Some("t1")).await;

    let decision = resolver
        .resolve(
            "u1",
            "read",
            "reports",
            &ResolveContext::tenant("t1").with_entity("dept-7"),
        )
        .await;

    assert_eq!(
        decision.deny_reason(),
        Some(DenyReason::EntityBoundaryViolation)
    );
}

#[tokio::test]
async fn test_boundary_violation_is_cached_and_corrected_by_tenant_event() {
    let (checker, membership, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", Some("t2")).await;
    let ctx = ResolveContext::tenant("t2");

    let first = resolver.resolve("u1", "update", "documents", &ctx).await;
    membership.add_member("u1", "t2").await;
    let cached = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(!first.is_granted());
    assert!(cached.cache_hit);
    assert!(!cached.is_granted());

    resolver
        .invalidate(InvalidationEvent::tenant("t2", "member added").with_priority(Priority::High))
        .await;

    let after = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(after.is_granted());
}

#[tokio::test]
async fn test_membership_lookup_failure_denies_uncached() {
    let (checker, membership, resolver) = create_resolver(&[]);
    membership.add_member("u1", "t1").await;
    checker.grant_direct("u1", "update:documents", Some("t1")).await;
    membership.fail.store(true, Ordering::SeqCst);
    let ctx = ResolveContext::tenant("t1");

    let failed = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert_eq!(failed.reason(), "backing store unavailable");

    membership.fail.store(false, Ordering::SeqCst);
    let recovered = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(recovered.is_granted());
    assert!(!recovered.cache_hit);
}

#[tokio::test]
async fn test_cross_entity_permission_passes_boundary_when_enabled() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default().with_cross_entity_permission("manage:tenants"),
        BreakerConfig::default(),
    );
    checker.grant_direct("ops", "manage:tenants", None).await;
    checker.grant_direct("ops", "read:billing", Some("t5")).await;

    let decision = resolver
        .resolve("ops", "read", "billing", &ResolveContext::tenant("t5"))
        .await;

    assert!(decision.is_granted());
}

#[tokio::test]
async fn test_cross_entity_permission_is_off_by_default() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("ops", "manage:tenants", None).await;
    checker.grant_direct("ops", "read:billing", Some("t5")).await;

    let decision = resolver
        .resolve("ops", "read", "billing", &ResolveContext::tenant("t5"))
        .await;

    assert_eq!(decision.reason(), "Entity boundary violation");
}

// ========== Section 4: Dependency Expansion ==========

#[tokio::test]
async fn test_implied_permission_grants() {
    let (checker, _, resolver) = create_resolver(&[("manage:documents", "update:documents")]);
    checker.grant_direct("u1", "manage:documents", None).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert!(decision.is_granted());
    assert_eq!(
        decision.resolution_path,
        vec!["update:documents", "manage:documents"]
    );
}

#[tokio::test]
async fn test_transitive_implication_through_role() {
    let (checker, _, resolver) = create_resolver(&[
        ("admin:documents", "manage:documents"),
        ("manage:documents", "update:documents"),
    ]);
    checker.assign_role("u1", "owner", None).await;
    checker.grant_role("owner", "admin:documents").await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert!(decision.is_granted());
    assert_eq!(decision.resolution_path.last().unwrap(), "admin:documents");
}

#[tokio::test]
async fn test_removing_edge_and_invalidating_revokes_implied_grant() {
    let (checker, _, resolver) = create_resolver(&[("manage:documents", "update:documents")]);
    checker.grant_direct("u1", "manage:documents", None).await;
    let ctx = ResolveContext::global();
    assert!(resolver.resolve("u1", "update", "documents", &ctx).await.is_granted());

    let mut graph = (*resolver.graph()).clone();
    assert!(graph.remove_edge("manage:documents", "update:documents"));
    resolver.replace_graph(graph).unwrap();
    resolver
        .invalidate(
            InvalidationEvent::permission("manage:documents", "dependency removed")
                .with_priority(Priority::High),
        )
        .await;

    let decision = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(!decision.is_granted());
    assert!(!decision.cache_hit);
}

#[test]
fn test_cyclic_dependencies_abort_construction() {
    let result = DependencyGraph::from_edges([
        ("read:documents", "update:documents"),
        ("update:documents", "read:documents"),
    ]);
    assert!(matches!(result, Err(DomainError::DependencyCycle { .. })));
}

#[tokio::test]
async fn test_replace_graph_rejects_cycle_and_keeps_old_graph() {
    let (_, _, resolver) = create_resolver(&[("manage:documents", "update:documents")]);
    let mut cyclic = DependencyGraph::new();
    cyclic.add_edge("a:x", "b:x").unwrap();
    cyclic.add_edge("b:x", "a:x").unwrap();

    let err = resolver.replace_graph(cyclic).unwrap_err();

    assert!(matches!(err, DomainError::DependencyCycle { .. }));
    assert_eq!(resolver.graph().edge_count(), 1);
}

#[tokio::test]
async fn test_builder_rejects_cyclic_graph() {
    let mut cyclic = DependencyGraph::new();
    cyclic.add_edge("a:x", "b:x").unwrap();
    cyclic.add_edge("b:x", "a:x").unwrap();

    let result = PermissionResolver::new(
        Arc::new(MockChecker::new()),
        Arc::new(MockMembership::new()),
        cyclic,
    );

    assert!(matches!(result, Err(DomainError::DependencyCycle { .. })));
}

// ========== Section 5: Decision Cache ==========

#[tokio::test]
async fn test_second_resolution_is_served_from_cache() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    let ctx = ResolveContext::global();

    let first = resolver.resolve("u1", "update", "documents", &ctx).await;
    let calls = checker.calls();
    let second = resolver.resolve("u1", "update", "documents", &ctx).await;

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.resolution_path, second.resolution_path);
    assert_eq!(checker.calls(), calls);
}

#[tokio::test]
async fn test_equivalent_checks_share_a_cache_entry() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;

    resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;
    let decision = resolver
        .resolve(" u1 ", "UPDATE", "Documents", &ResolveContext::global())
        .await;

    assert!(decision.cache_hit);
}

#[tokio::test]
async fn test_cache_hit_matches_full_recompute() {
    let (checker, membership, resolver) = create_resolver(&[("manage:documents", "update:documents")]);
    membership.add_member("u1", "t1").await;
    checker.assign_role("u1", "editor", Some("t1")).await;
    checker.grant_role("editor", "manage:documents").await;
    let ctx = ResolveContext::tenant("t1");

    let computed = resolver.resolve("u1", "update", "documents", &ctx).await;
    let cached = resolver.resolve("u1", "update", "documents", &ctx).await;
    resolver
        .invalidate(InvalidationEvent::user("u1", "force miss").with_priority(Priority::High))
        .await;
    let recomputed = resolver.resolve("u1", "update", "documents", &ctx).await;

    assert!(cached.cache_hit);
    assert!(!recomputed.cache_hit);
    assert_eq!(cached.verdict, recomputed.verdict);
    assert_eq!(cached.resolution_path, recomputed.resolution_path);
    assert_eq!(computed.verdict, recomputed.verdict);
}

#[tokio::test]
async fn test_revocation_is_visible_after_invalidation() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    let ctx = ResolveContext::global();
    assert!(resolver.resolve("u1", "update", "documents", &ctx).await.is_granted());

    checker.revoke_direct("u1", "update:documents", None).await;
    resolver
        .invalidate(InvalidationEvent::user("u1", "grant revoked").with_priority(Priority::High))
        .await;

    assert!(!resolver.resolve("u1", "update", "documents", &ctx).await.is_granted());
}

#[tokio::test]
async fn test_role_event_invalidates_role_derived_decisions() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.assign_role("u1", "editor", None).await;
    checker.grant_role("editor", "update:documents").await;
    let ctx = ResolveContext::global();
    resolver.resolve("u1", "update", "documents", &ctx).await;

    resolver
        .invalidate(InvalidationEvent::role("editor", "permissions edited"))
        .await;
    // Medium priority waits for its flush.
    assert!(resolver.resolve("u1", "update", "documents", &ctx).await.cache_hit);

    resolver.cache().flush(Priority::Medium).await;
    assert!(!resolver.resolve("u1", "update", "documents", &ctx).await.cache_hit);
}

#[tokio::test]
async fn test_repeated_invalidation_is_idempotent() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    checker.grant_direct("u2", "update:documents", None).await;
    let ctx = ResolveContext::global();
    resolver.resolve("u1", "update", "documents", &ctx).await;
    resolver.resolve("u2", "update", "documents", &ctx).await;

    let event = InvalidationEvent::user("u1", "changed").with_priority(Priority::High);
    resolver.invalidate(event.clone()).await;
    let after_first = resolver.cache().counters().snapshot();
    resolver.invalidate(event).await;
    let after_second = resolver.cache().counters().snapshot();

    assert_eq!(after_first.invalidations, after_second.invalidations);
    assert!(resolver.resolve("u2", "update", "documents", &ctx).await.cache_hit);
}

#[tokio::test]
async fn test_decision_older_than_ttl_is_recomputed() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default().with_decision_ttl(Duration::from_millis(30)),
        BreakerConfig::default(),
    );
    checker.grant_direct("u1", "update:documents", None).await;
    let ctx = ResolveContext::global();
    resolver.resolve("u1", "update", "documents", &ctx).await;

    tokio::time::sleep(Duration::from_millis(60)).await;

    let decision = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(!decision.cache_hit);
    assert!(decision.is_granted());
}

#[tokio::test]
async fn test_grant_is_cached_no_longer_than_its_assignment() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    checker
        .set_grant_lifetime(Some(Duration::from_millis(50)))
        .await;
    let ctx = ResolveContext::global();

    assert!(resolver.resolve("u1", "update", "documents", &ctx).await.is_granted());
    assert!(resolver.resolve("u1", "update", "documents", &ctx).await.cache_hit);

    tokio::time::sleep(Duration::from_millis(80)).await;
    checker.revoke_direct("u1", "update:documents", None).await;

    let decision = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(!decision.cache_hit);
    assert!(!decision.is_granted());
}

#[tokio::test]
async fn test_grant_at_end_of_its_lifetime_is_not_cached() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    checker.set_grant_lifetime(Some(Duration::ZERO)).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert!(decision.is_granted());
    assert_eq!(resolver.cache().entry_count(), 0);
}

// ========== Section 6: Failure Handling ==========

#[tokio::test]
async fn test_store_error_fails_closed() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    checker.set_failing(true);

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert!(!decision.is_granted());
    assert_eq!(decision.reason(), "backing store unavailable");
    assert!(decision.deny_reason().unwrap().is_transient());
}

#[tokio::test]
async fn test_store_errors_are_not_cached() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    let ctx = ResolveContext::global();

    checker.set_failing(true);
    resolver.resolve("u1", "update", "documents", &ctx).await;
    checker.set_failing(false);

    let decision = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(decision.is_granted());
    assert!(!decision.cache_hit);
}

#[tokio::test]
async fn test_breaker_opens_and_fails_fast() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default(),
        BreakerConfig::default()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_secs(60)),
    );
    checker.set_failing(true);
    let ctx = ResolveContext::global();

    for _ in 0..3 {
        resolver.resolve("u1", "update", "documents", &ctx).await;
    }
    assert_eq!(resolver.breaker().state(), BreakerState::Open);
    let calls = checker.calls();

    let decision = resolver.resolve("u1", "update", "documents", &ctx).await;

    assert_eq!(decision.reason(), "backing store unavailable");
    assert_eq!(checker.calls(), calls, "open breaker must not reach the store");
    assert!(resolver.snapshot().breaker_open);
}

#[tokio::test]
async fn test_half_open_probe_closes_breaker() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default(),
        BreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_millis(20)),
    );
    checker.grant_direct("u1", "update:documents", None).await;
    let ctx = ResolveContext::global();

    checker.set_failing(true);
    resolver.resolve("u1", "update", "documents", &ctx).await;
    assert_eq!(resolver.breaker().state(), BreakerState::Open);

    checker.set_failing(false);
    tokio::time::sleep(Duration::from_millis(40)).await;

    let decision = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(decision.is_granted());
    assert_eq!(resolver.breaker().state(), BreakerState::Closed);
    assert!(!resolver.snapshot().breaker_open);
}

#[tokio::test]
async fn test_abandoned_half_open_call_does_not_wedge_breaker() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default()
            .with_store_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(2)),
        BreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_millis(20)),
    );
    checker.grant_direct("u1", "update:documents", None).await;
    let ctx = ResolveContext::global();

    checker.set_failing(true);
    resolver.resolve("u1", "update", "documents", &ctx).await;
    assert_eq!(resolver.breaker().state(), BreakerState::Open);

    // The store recovers but answers slowly; the caller gives up waiting.
    checker.set_failing(false);
    checker.set_delay(Some(Duration::from_millis(200))).await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    let gave_up = tokio::time::timeout(
        Duration::from_millis(20),
        resolver.resolve("u1", "update", "documents", &ctx),
    )
    .await;
    assert!(gave_up.is_err());
    assert_eq!(resolver.breaker().state(), BreakerState::Open);

    checker.set_delay(None).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let decision = resolver.resolve("u1", "update", "documents", &ctx).await;
    assert!(decision.is_granted());
    assert_eq!(resolver.breaker().state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_slow_store_call_is_a_store_failure() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default()
            .with_store_timeout(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(1)),
        BreakerConfig::default(),
    );
    checker.grant_direct("u1", "update:documents", None).await;
    checker.set_delay(Some(Duration::from_millis(100))).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert_eq!(decision.reason(), "backing store unavailable");
}

#[tokio::test]
async fn test_resolution_deadline_denies_with_timeout() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default()
            .with_store_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_millis(20)),
        BreakerConfig::default(),
    );
    checker.set_delay(Some(Duration::from_millis(200))).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;

    assert_eq!(decision.deny_reason(), Some(DenyReason::Timeout));
    assert_eq!(decision.reason(), "Resolution timeout");
}

#[tokio::test]
async fn test_saturated_resolver_denies_as_overloaded() {
    let (checker, _, resolver) = builder_resolver(
        ResolverConfig::default()
            .with_max_in_flight(1)
            .with_store_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(2)),
        BreakerConfig::default(),
    );
    checker.set_delay(Some(Duration::from_millis(100))).await;
    let ctx = ResolveContext::global();

    let (slow, rejected) = tokio::join!(
        resolver.resolve("u1", "read", "documents", &ctx),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve("u2", "read", "documents", &ctx).await
        }
    );

    assert_eq!(slow.reason(), "Permission denied");
    assert_eq!(rejected.deny_reason(), Some(DenyReason::Overloaded));
}

#[tokio::test]
async fn test_malformed_check_is_denied_without_store_access() {
    let (checker, _, resolver) = create_resolver(&[]);

    let empty_user = resolver
        .resolve("", "update", "documents", &ResolveContext::global())
        .await;
    let bad_action = resolver
        .resolve("u1", "update:all", "documents", &ResolveContext::global())
        .await;

    assert_eq!(empty_user.reason(), "Invalid context");
    assert_eq!(bad_action.deny_reason(), Some(DenyReason::InvalidContext));
    assert_eq!(checker.calls(), 0);
    assert_eq!(resolver.cache().entry_count(), 0);
}

// ========== Section 7: Batch Resolution ==========

#[tokio::test]
async fn test_batch_deduplicates_identical_checks() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    let check = Check::new("u1", "update", "documents", ResolveContext::global());
    let other = Check::new("u2", "update", "documents", ResolveContext::global());

    let results = resolver
        .batch_resolve(&[check.clone(), other.clone(), check.clone()])
        .await;

    assert_eq!(results.len(), 2);
    assert!(results[&CacheKey::from_check(&check)].is_granted());
    assert!(!results[&CacheKey::from_check(&other)].is_granted());
    // u1 is granted on the first direct check (3 calls), u2 is denied (3 calls).
    assert_eq!(checker.calls(), 6);
}

#[tokio::test]
async fn test_batch_outcomes_match_individual_resolution() {
    let (checker, membership, resolver) = create_resolver(&[("manage:documents", "update:documents")]);
    membership.add_member("u1", "t1").await;
    checker.grant_direct("u1", "manage:documents", Some("t1")).await;
    checker.make_super_admin("root").await;

    let checks = vec![
        Check::new("u1", "update", "documents", ResolveContext::tenant("t1")),
        Check::new("u1", "update", "documents", ResolveContext::tenant("t2")),
        Check::new("root", "delete", "tenants", ResolveContext::global()),
        Check::new("u1", "", "documents", ResolveContext::global()),
    ];
    // Warm one entry so the batch mixes hits and misses.
    resolver.resolve_check(&checks[0]).await;

    let results = resolver.batch_resolve(&checks).await;

    let reasons: Vec<&str> = checks
        .iter()
        .map(|c| results[&CacheKey::from_check(&c.normalized())].reason())
        .collect();
    assert_eq!(
        reasons,
        vec![
            "Direct grant",
            "Entity boundary violation",
            "SuperAdmin bypass",
            "Invalid context"
        ]
    );
    assert!(results[&CacheKey::from_check(&checks[0])].cache_hit);
}

// ========== Section 8: Audit ==========

#[tokio::test]
async fn test_decisions_are_forwarded_to_audit_sink() {
    let checker = Arc::new(MockChecker::new());
    let sink = Arc::new(MockAuditSink::default());
    let resolver = PermissionResolver::builder(Arc::clone(&checker), Arc::new(MockMembership::new()))
        .audit_sink(sink.clone())
        .build()
        .unwrap();
    checker.grant_direct("u1", "update:documents", None).await;

    resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;
    resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let records = sink.records.lock().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].user_id, "u1");
    assert!(records[1].decision.cache_hit);
}

#[tokio::test]
async fn test_audit_failure_does_not_change_decision() {
    let checker = Arc::new(MockChecker::new());
    let sink = Arc::new(MockAuditSink::default());
    sink.reject.store(true, Ordering::SeqCst);
    let resolver = PermissionResolver::builder(Arc::clone(&checker), Arc::new(MockMembership::new()))
        .audit_sink(sink.clone())
        .build()
        .unwrap();
    checker.grant_direct("u1", "update:documents", None).await;

    let decision = resolver
        .resolve("u1", "update", "documents", &ResolveContext::global())
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(decision.is_granted());
    assert!(sink.records.lock().await.is_empty());
}

// ========== Section 9: Metrics and Adaptive Warming ==========

#[tokio::test]
async fn test_snapshot_reflects_resolutions() {
    let (checker, _, resolver) = create_resolver(&[]);
    checker.grant_direct("u1", "update:documents", None).await;
    let ctx = ResolveContext::global();

    resolver.resolve("u1", "update", "documents", &ctx).await;
    resolver.resolve("u1", "update", "documents", &ctx).await;

    let snapshot = resolver.snapshot();
    assert_eq!(snapshot.samples, 2);
    assert!((snapshot.hit_rate - 0.5).abs() < 1e-9);
    assert_eq!(snapshot.cache.hits, 1);
    assert_eq!(snapshot.cache.misses, 1);
    assert_eq!(snapshot.per_action["update"].samples, 2);
}

#[tokio::test]
async fn test_adaptive_cycle_warms_evicted_hot_keys() {
    let checker = Arc::new(MockChecker::new());
    let resolver = PermissionResolver::builder(Arc::clone(&checker), Arc::new(MockMembership::new()))
        .adaptive_config(
            AdaptiveConfig::default()
                .with_min_samples(1)
                .with_target_hit_rate(0.99),
        )
        .build()
        .unwrap();
    checker.grant_direct("u1", "update:documents", None).await;
    let check = Check::new("u1", "update", "documents", ResolveContext::global());
    let key = CacheKey::from_check(&check);

    resolver.resolve_check(&check).await;
    resolver
        .invalidate(InvalidationEvent::user("u1", "churn").with_priority(Priority::High))
        .await;
    assert!(!resolver.cache().contains_fresh(&key).await);

    let action = resolver.run_adaptive_cycle().await;

    assert!(action.warm);
    assert!(resolver.cache().contains_fresh(&key).await);
}

#[tokio::test]
async fn test_adaptive_cycle_idle_when_hit_rate_is_healthy() {
    let checker = Arc::new(MockChecker::new());
    let resolver = PermissionResolver::builder(Arc::clone(&checker), Arc::new(MockMembership::new()))
        .adaptive_config(
            AdaptiveConfig::default()
                .with_min_samples(1)
                .with_target_hit_rate(0.5),
        )
        .build()
        .unwrap();
    let check = Check::new("u1", "update", "documents", ResolveContext::global());
    for _ in 0..4 {
        resolver.resolve_check(&check).await;
    }

    let action = resolver.run_adaptive_cycle().await;

    assert!(!action.warm);
}

// ========== Section 10: Property Tests ==========

use proptest::prelude::*;

fn context_strategy() -> impl Strategy<Value = ResolveContext> {
    (
        proptest::option::of("[a-z0-9]{1,6}"),
        proptest::option::of("[a-z0-9]{1,6}"),
        proptest::option::of("[0-9]{1,4}"),
    )
        .prop_map(|(tenant_id, entity_id, resource_id)| ResolveContext {
            tenant_id,
            entity_id,
            resource_id,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a SuperAdmin is granted everything, in every context.
    #[test]
    fn test_property_super_admin_is_universal(
        action in "[a-z]{1,8}",
        resource in "[a-z]{1,8}",
        ctx in context_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let decision = rt.block_on(async {
            let (checker, _, resolver) = create_resolver(&[]);
            checker.make_super_admin("root").await;
            resolver.resolve("root", &action, &resource, &ctx).await
        });
        prop_assert!(decision.is_granted());
        prop_assert_eq!(decision.reason(), "SuperAdmin bypass");
    }

    /// Property: without any grant every well-formed check is denied.
    #[test]
    fn test_property_deny_by_default(
        action in "[a-z]{1,8}",
        resource in "[a-z]{1,8}",
        ctx in context_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let decision = rt.block_on(async {
            let (_, _, resolver) = create_resolver(&[]);
            resolver.resolve("u1", &action, &resource, &ctx).await
        });
        prop_assert!(!decision.is_granted());
    }
}
