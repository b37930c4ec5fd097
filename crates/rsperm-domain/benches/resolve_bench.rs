//! Benchmark for cached and uncached resolution.
//!
//! Run with: cargo bench -p rsperm-domain

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rsperm_domain::cache::DecisionCacheConfig;
use rsperm_domain::model::Permission;
use rsperm_domain::resolver::{DirectPermissionChecker, MembershipLookup, PermissionResolver};
use rsperm_domain::{DependencyGraph, DomainResult, ResolveContext};

struct StaticChecker {
    grants: HashSet<String>,
}

#[async_trait]
impl DirectPermissionChecker for StaticChecker {
    async fn check_direct(
        &self,
        _user_id: &str,
        permission: &Permission,
        _tenant_id: Option<&str>,
    ) -> DomainResult<bool> {
        Ok(self.grants.contains(&permission.key()))
    }

    async fn active_roles(&self, _user_id: &str, _tenant_id: Option<&str>) -> DomainResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn role_grants(&self, _role_id: &str, _permission: &Permission) -> DomainResult<bool> {
        Ok(false)
    }

    async fn has_system_role(&self, _user_id: &str, _role_id: &str) -> DomainResult<bool> {
        Ok(false)
    }
}

struct EveryoneIsMember;

#[async_trait]
impl MembershipLookup for EveryoneIsMember {
    async fn is_member(&self, _user_id: &str, _entity_id: &str) -> DomainResult<bool> {
        Ok(true)
    }
}

fn build_resolver(cache_enabled: bool) -> PermissionResolver<StaticChecker, EveryoneIsMember> {
    let graph = DependencyGraph::from_edges([
        ("admin:documents", "manage:documents"),
        ("manage:documents", "update:documents"),
        ("update:documents", "read:documents"),
    ])
    .unwrap();
    let checker = StaticChecker {
        grants: HashSet::from(["admin:documents".to_string()]),
    };
    PermissionResolver::builder(Arc::new(checker), Arc::new(EveryoneIsMember))
        .graph(graph)
        .cache_config(DecisionCacheConfig::default().with_enabled(cache_enabled))
        .build()
        .unwrap()
}

fn resolve_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ctx = ResolveContext::tenant("t1");

    let cached = build_resolver(true);
    rt.block_on(cached.resolve("u1", "read", "documents", &ctx));
    c.bench_function("resolve_cached", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cached.resolve("u1", "read", "documents", &ctx).await) })
    });

    let uncached = build_resolver(false);
    c.bench_function("resolve_uncached_depth_3", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(uncached.resolve("u1", "read", "documents", &ctx).await) })
    });
}

criterion_group!(benches, resolve_benchmark);
criterion_main!(benches);
