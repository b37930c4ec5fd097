//! Service assembly and lifecycle.
//!
//! `PermissionService` is the composition root: it builds the resolver from
//! configuration over a `PermissionStore`, runs the background invalidation
//! flusher and adaptive controller, and routes store mutations to the
//! matching invalidation events.
//!
//! # Lifecycle
//!
//! ```ignore
//! let service = PermissionService::init(config, store)?;  // fatal on cycles
//! service.start().await;
//! let decision = service.resolve("u1", "update", "documents", &ctx).await;
//! service.shutdown().await;  // applies queued invalidations, stops tasks
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use rsperm_domain::cache::spawn_flusher;
use rsperm_domain::error::DomainError;
use rsperm_domain::resolver::AuditSink;
use rsperm_domain::{
    Check, Decision, DependencyGraph, InvalidationEvent, MetricsCollector, MetricsSnapshot,
    PermissionResolver, Priority, ResolveContext,
};
use rsperm_storage::{PermissionAssignment, PermissionStore, RoleAssignment, StorageError};

use crate::adapters::{StoreMembershipLookup, StorePermissionChecker};
use crate::config::{ConfigLoadError, ServerConfig};
use crate::handlers::batch::{
    BatchResolveHandler, BatchResolveRequest, BatchResolveResponse, BatchResolveResult,
};

/// Resolver wired to a permission store.
pub type StoreResolver<S> =
    PermissionResolver<StorePermissionChecker<S>, StoreMembershipLookup<S>>;

/// Errors from assembling or operating the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigLoadError),

    /// Dependency cycles and malformed permission keys land here.
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// The assembled permission service.
pub struct PermissionService<S: PermissionStore> {
    config: ServerConfig,
    store: Arc<S>,
    resolver: Arc<StoreResolver<S>>,
    batch: BatchResolveHandler<StorePermissionChecker<S>, StoreMembershipLookup<S>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serialises read-modify-write of the dependency graph.
    graph_edit: Mutex<()>,
}

impl<S: PermissionStore> PermissionService<S> {
    /// Builds every component from `config`.
    ///
    /// Fails on invalid configuration or a cyclic dependency set; both must
    /// abort startup.
    pub fn init(config: ServerConfig, store: Arc<S>) -> ServiceResult<Self> {
        Self::init_with_audit(config, store, None)
    }

    /// Like [`init`](Self::init), forwarding every decision to `audit`.
    pub fn init_with_audit(
        config: ServerConfig,
        store: Arc<S>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> ServiceResult<Self> {
        config.validate()?;

        let graph = DependencyGraph::from_edges(
            config
                .dependencies
                .iter()
                .map(|edge| (edge.from.as_str(), edge.to.as_str())),
        )?
        .with_max_depth(config.resolver.max_depth);

        let metrics = Arc::new(MetricsCollector::new(config.metrics.window_size));
        let mut builder = PermissionResolver::builder(
            Arc::new(StorePermissionChecker::new(Arc::clone(&store))),
            Arc::new(StoreMembershipLookup::new(Arc::clone(&store))),
        )
        .graph(graph)
        .config(config.resolver_config())
        .cache_config(config.cache_config())
        .boundary_config(config.boundary_config())
        .breaker_config(config.breaker_config())
        .adaptive_config(config.adaptive_config())
        .metrics(metrics);
        if let Some(sink) = audit {
            builder = builder.audit_sink(sink);
        }
        let resolver = Arc::new(builder.build()?);

        let (shutdown, _) = watch::channel(false);
        info!(
            dependencies = config.dependencies.len(),
            cache_capacity = config.cache.max_capacity,
            "permission service initialized"
        );

        Ok(Self {
            batch: BatchResolveHandler::new(Arc::clone(&resolver)),
            config,
            store,
            resolver,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            graph_edit: Mutex::new(()),
        })
    }

    /// Spawns the invalidation flusher, the adaptive controller and, unless
    /// disabled, the expired-assignment purge.
    /// Calling it again while running has no effect.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        // Allow start after a previous shutdown.
        self.shutdown.send_replace(false);
        tasks.push(spawn_flusher(
            Arc::clone(self.resolver.cache()),
            self.shutdown.subscribe(),
        ));
        tasks.push(self.resolver.spawn_controller(self.shutdown.subscribe()));
        if self.config.resolver.purge_interval_ms > 0 {
            tasks.push(spawn_purger(
                Arc::clone(&self.store),
                Duration::from_millis(self.config.resolver.purge_interval_ms),
                self.shutdown.subscribe(),
            ));
        }
        info!("permission service started");
    }

    /// Removes assignments whose expiry has passed. Returns how many went.
    ///
    /// Expired assignments already deny, so no invalidation is needed.
    pub async fn purge_expired(&self) -> ServiceResult<usize> {
        Ok(self.store.purge_expired(Utc::now()).await?)
    }

    /// Stops background tasks and applies every queued invalidation.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        let flushed = self.resolver.cache().flush_all().await;
        info!(flushed, "permission service stopped");
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<StoreResolver<S>> {
        &self.resolver
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        context: &ResolveContext,
    ) -> Decision {
        self.resolver.resolve(user_id, action, resource, context).await
    }

    pub async fn resolve_check(&self, check: &Check) -> Decision {
        self.resolver.resolve_check(check).await
    }

    /// Resolves up to `MAX_BATCH_SIZE` checks; decisions in request order.
    pub async fn batch_resolve(
        &self,
        checks: Vec<Check>,
    ) -> BatchResolveResult<BatchResolveResponse> {
        self.batch.resolve(BatchResolveRequest::new(checks)).await
    }

    /// Queues an invalidation event. High priority applies immediately.
    pub async fn invalidate(&self, event: InvalidationEvent) {
        self.resolver.invalidate(event).await;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.resolver.snapshot()
    }

    // Mutations: commit to the store, then invalidate what they affect.
    // Losing access is invalidated at high priority, gaining it at medium.

    pub async fn assign_role(&self, assignment: RoleAssignment) -> ServiceResult<()> {
        let user_id = assignment.user_id.clone();
        self.store.assign_role(assignment).await?;
        self.invalidate(InvalidationEvent::user(user_id, "role assigned")).await;
        Ok(())
    }

    pub async fn revoke_role(
        &self,
        user_id: &str,
        role_id: &str,
        tenant_id: Option<&str>,
    ) -> ServiceResult<()> {
        self.store.revoke_role(user_id, role_id, tenant_id).await?;
        self.invalidate(
            InvalidationEvent::user(user_id, "role revoked").with_priority(Priority::High),
        )
        .await;
        Ok(())
    }

    pub async fn grant_permission(&self, assignment: PermissionAssignment) -> ServiceResult<()> {
        let user_id = assignment.user_id.clone();
        self.store.grant_permission(assignment).await?;
        self.invalidate(InvalidationEvent::user(user_id, "permission granted"))
            .await;
        Ok(())
    }

    pub async fn revoke_permission(
        &self,
        user_id: &str,
        permission: &str,
        tenant_id: Option<&str>,
    ) -> ServiceResult<()> {
        self.store
            .revoke_permission(user_id, permission, tenant_id)
            .await?;
        self.invalidate(
            InvalidationEvent::user(user_id, "permission revoked").with_priority(Priority::High),
        )
        .await;
        Ok(())
    }

    pub async fn add_role_permission(&self, role_id: &str, permission: &str) -> ServiceResult<()> {
        self.store.add_role_permission(role_id, permission).await?;
        self.invalidate(InvalidationEvent::role(role_id, "role permission added"))
            .await;
        Ok(())
    }

    pub async fn remove_role_permission(
        &self,
        role_id: &str,
        permission: &str,
    ) -> ServiceResult<bool> {
        let removed = self.store.remove_role_permission(role_id, permission).await?;
        if removed {
            self.invalidate(
                InvalidationEvent::role(role_id, "role permission removed")
                    .with_priority(Priority::High),
            )
            .await;
        }
        Ok(removed)
    }

    pub async fn delete_role(&self, role_id: &str) -> ServiceResult<()> {
        self.store.delete_role(role_id).await?;
        self.invalidate(
            InvalidationEvent::role(role_id, "role deleted").with_priority(Priority::High),
        )
        .await;
        Ok(())
    }

    pub async fn add_member(&self, user_id: &str, entity_id: &str) -> ServiceResult<()> {
        self.store.add_member(user_id, entity_id).await?;
        self.invalidate(InvalidationEvent::user(user_id, "membership added"))
            .await;
        Ok(())
    }

    pub async fn remove_member(&self, user_id: &str, entity_id: &str) -> ServiceResult<bool> {
        let removed = self.store.remove_member(user_id, entity_id).await?;
        if removed {
            self.invalidate(
                InvalidationEvent::user(user_id, "membership removed")
                    .with_priority(Priority::High),
            )
            .await;
        }
        Ok(removed)
    }

    /// Adds `from -> to` to the dependency graph. Fails with
    /// `DependencyCycle` and leaves the graph untouched if the edge would
    /// close a cycle.
    pub async fn add_dependency(&self, from: &str, to: &str) -> ServiceResult<()> {
        let _edit = self.graph_edit.lock().await;
        let mut graph = (*self.resolver.graph()).clone();
        graph.add_edge(from, to)?;
        self.resolver.replace_graph(graph)?;
        self.invalidate_dependency(from, to, Priority::Medium).await;
        Ok(())
    }

    /// Removes `from -> to`. Returns whether the edge existed.
    pub async fn remove_dependency(&self, from: &str, to: &str) -> ServiceResult<bool> {
        let _edit = self.graph_edit.lock().await;
        let mut graph = (*self.resolver.graph()).clone();
        if !graph.remove_edge(from, to) {
            return Ok(false);
        }
        self.resolver.replace_graph(graph)?;
        self.invalidate_dependency(from, to, Priority::High).await;
        Ok(true)
    }

    // Decisions that consulted either end of the edge may change.
    async fn invalidate_dependency(&self, from: &str, to: &str, priority: Priority) {
        for key in [from, to] {
            self.invalidate(
                InvalidationEvent::permission(key, "dependency changed").with_priority(priority),
            )
            .await;
        }
    }
}

fn spawn_purger<S: PermissionStore>(
    store: Arc<S>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.purge_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "expired assignments purged"),
                        Err(err) => warn!(error = %err, "expired assignment purge failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("assignment purge stopped");
                        break;
                    }
                }
            }
        }
    })
}
