//! The permission resolver.
//!
//! # Resolution order
//!
//! 1. Normalize and validate the check; malformed input is denied uncached.
//! 2. Decision cache lookup.
//! 3. Admission: a bounded number of uncached resolutions run at once,
//!    anything beyond that is denied as overloaded.
//! 4. SuperAdmin fast path.
//! 5. Tenant/entity boundary check. A violation short-circuits before any
//!    grant lookup.
//! 6. Dependency expansion: the requested permission and everything that
//!    implies it, most specific first. Each candidate is checked for a direct
//!    grant, then for a grant through each active role. First match wins.
//! 7. The decision is cached, tagged with every identifier consulted.
//!
//! Every error is folded into a denied [`Decision`]. Errors are never cached;
//! boundary violations and plain denials are.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::boundary::{BoundaryConfig, EntityBoundaryValidator};
use crate::cache::{
    AdaptiveConfig, AdaptiveController, CacheKey, ControllerAction, DecisionCache,
    DecisionCacheConfig, InvalidationEvent,
};
use crate::collector::{MetricsCollector, MetricsSnapshot};
use crate::error::{DomainError, DomainResult};
use crate::graph::DependencyGraph;
use crate::model::{Check, Decision, DenyReason, EntityKind, GrantReason, Permission, ResolveContext};

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::config::ResolverConfig;
use super::traits::{AuditRecord, AuditSink, DirectPermissionChecker, MembershipLookup};

/// Timeout for cache operations (get/set).
/// The cache must never hold up a decision; a slow cache is treated as a miss.
const CACHE_OP_TIMEOUT: Duration = Duration::from_millis(10);

/// An evaluated decision plus the tags of everything it consulted.
struct Evaluation {
    decision: Decision,
    tags: BTreeSet<String>,
}

impl Evaluation {
    fn new(decision: Decision, tags: BTreeSet<String>) -> Self {
        Self { decision, tags }
    }
}

/// Assembles a [`PermissionResolver`].
pub struct PermissionResolverBuilder<C, L> {
    checker: Arc<C>,
    lookup: Arc<L>,
    graph: DependencyGraph,
    config: ResolverConfig,
    cache_config: DecisionCacheConfig,
    boundary_config: BoundaryConfig,
    breaker_config: BreakerConfig,
    adaptive_config: AdaptiveConfig,
    metrics: Option<Arc<MetricsCollector>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl<C, L> PermissionResolverBuilder<C, L>
where
    C: DirectPermissionChecker,
    L: MembershipLookup,
{
    pub fn graph(mut self, graph: DependencyGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache_config(mut self, config: DecisionCacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn boundary_config(mut self, config: BoundaryConfig) -> Self {
        self.boundary_config = config;
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn adaptive_config(mut self, config: AdaptiveConfig) -> Self {
        self.adaptive_config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Builds the resolver.
    ///
    /// Fails with [`DomainError::DependencyCycle`] if the graph is cyclic, or
    /// [`DomainError::InvalidPermissionFormat`] if the cross-entity permission
    /// is malformed. Both are fatal configuration errors.
    pub fn build(self) -> DomainResult<PermissionResolver<C, L>> {
        self.graph.validate()?;
        let cross_entity = self
            .config
            .cross_entity_permission
            .as_deref()
            .map(Permission::parse)
            .transpose()?;

        let metrics = self.metrics.unwrap_or_default();
        let cache = Arc::new(DecisionCache::with_counters(
            self.cache_config,
            metrics.cache_counters(),
        ));

        info!(
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "permission resolver initialized"
        );

        Ok(PermissionResolver {
            checker: self.checker,
            boundary: EntityBoundaryValidator::new(self.lookup, self.boundary_config),
            graph: RwLock::new(Arc::new(self.graph)),
            cache,
            metrics,
            breaker: CircuitBreaker::new(self.breaker_config),
            admission: Semaphore::new(self.config.max_in_flight.max(1)),
            audit: self.audit,
            adaptive: AdaptiveController::new(self.adaptive_config),
            cross_entity,
            config: self.config,
        })
    }
}

/// Decides whether a principal may perform an action on a resource.
///
/// # Thread Safety
///
/// Stateless per call; share it behind an `Arc`. The decision cache and the
/// metrics collector are the only shared mutable state.
pub struct PermissionResolver<C, L> {
    checker: Arc<C>,
    boundary: EntityBoundaryValidator<L>,
    graph: RwLock<Arc<DependencyGraph>>,
    cache: Arc<DecisionCache>,
    metrics: Arc<MetricsCollector>,
    breaker: CircuitBreaker,
    admission: Semaphore,
    audit: Option<Arc<dyn AuditSink>>,
    adaptive: AdaptiveController,
    cross_entity: Option<Permission>,
    config: ResolverConfig,
}

impl<C, L> PermissionResolver<C, L>
where
    C: DirectPermissionChecker,
    L: MembershipLookup,
{
    /// Starts a builder with default configuration and an empty graph.
    pub fn builder(checker: Arc<C>, lookup: Arc<L>) -> PermissionResolverBuilder<C, L> {
        PermissionResolverBuilder {
            checker,
            lookup,
            graph: DependencyGraph::new(),
            config: ResolverConfig::default(),
            cache_config: DecisionCacheConfig::default(),
            boundary_config: BoundaryConfig::default(),
            breaker_config: BreakerConfig::default(),
            adaptive_config: AdaptiveConfig::default(),
            metrics: None,
            audit: None,
        }
    }

    /// Creates a resolver with default configuration.
    pub fn new(checker: Arc<C>, lookup: Arc<L>, graph: DependencyGraph) -> DomainResult<Self> {
        Self::builder(checker, lookup).graph(graph).build()
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn boundary(&self) -> &EntityBoundaryValidator<L> {
        &self.boundary
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Read-only performance view.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The dependency graph currently in use.
    pub fn graph(&self) -> Arc<DependencyGraph> {
        Arc::clone(&*self.graph.read())
    }

    /// Validates and atomically swaps in a new dependency graph.
    ///
    /// Cached decisions are not touched; callers emit permission
    /// invalidation events for the edges that changed.
    pub fn replace_graph(&self, graph: DependencyGraph) -> DomainResult<()> {
        graph.validate()?;
        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "dependency graph replaced"
        );
        *self.graph.write() = Arc::new(graph);
        Ok(())
    }

    /// Resolves one check. Never fails; every error becomes a denial.
    pub async fn resolve(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        context: &ResolveContext,
    ) -> Decision {
        self.resolve_check(&Check::new(user_id, action, resource, context.clone()))
            .await
    }

    /// Resolves one check. Never fails; every error becomes a denial.
    pub async fn resolve_check(&self, check: &Check) -> Decision {
        let started = Instant::now();
        let check = check.normalized();
        if let Err(err) = check.validate() {
            debug!(user_id = %check.user_id, error = %err, "rejecting malformed check");
            let decision = Decision::denied(DenyReason::from(&err), Vec::new());
            return self.finish(&check, decision, started, false);
        }

        let key = CacheKey::from_check(&check);
        if let Some(decision) = self.cached(&key).await {
            return self.finish(&check, decision, started, true);
        }

        let decision = self.resolve_uncached(&check, key).await;
        self.finish(&check, decision, started, false)
    }

    /// Resolves many checks at once, keyed by their normalized cache key.
    ///
    /// Identical checks are evaluated once. All cache lookups share one
    /// snapshot; misses are resolved concurrently and independently.
    pub async fn batch_resolve(&self, checks: &[Check]) -> HashMap<CacheKey, Decision> {
        let started = Instant::now();
        let mut results = HashMap::with_capacity(checks.len());
        let mut seen = HashSet::with_capacity(checks.len());
        let mut pending: Vec<(CacheKey, Check)> = Vec::with_capacity(checks.len());

        for check in checks {
            let check = check.normalized();
            let key = CacheKey::from_check(&check);
            if !seen.insert(key.clone()) {
                continue;
            }
            match check.validate() {
                Ok(()) => pending.push((key, check)),
                Err(err) => {
                    let decision = Decision::denied(DenyReason::from(&err), Vec::new());
                    results.insert(key, self.finish(&check, decision, started, false));
                }
            }
        }

        let keys: Vec<CacheKey> = pending.iter().map(|(key, _)| key.clone()).collect();
        let cached = match timeout(CACHE_OP_TIMEOUT, self.cache.get_many(&keys)).await {
            Ok(cached) => cached,
            Err(_) => vec![None; keys.len()],
        };

        let mut misses = Vec::new();
        for ((key, check), hit) in pending.into_iter().zip(cached) {
            match hit {
                Some(decision) => {
                    let decision = self.finish(&check, decision, started, true);
                    results.insert(key, decision);
                }
                None => misses.push((key, check)),
            }
        }

        debug!(
            checks = checks.len(),
            unique = seen.len(),
            misses = misses.len(),
            "batch resolve"
        );

        let resolved = futures::future::join_all(misses.into_iter().map(|(key, check)| async move {
            let decision = self.resolve_uncached(&check, key.clone()).await;
            (key, check, decision)
        }))
        .await;
        for (key, check, decision) in resolved {
            results.insert(key, self.finish(&check, decision, started, false));
        }
        results
    }

    /// Routes a mutation event to the decision cache and membership cache.
    pub async fn invalidate(&self, event: InvalidationEvent) {
        match event.kind {
            EntityKind::User => self.boundary.invalidate_user(&event.entity_id),
            EntityKind::Tenant => self.boundary.invalidate_entity(&event.entity_id),
            EntityKind::Role | EntityKind::Permission => {}
        }
        self.cache.invalidate(event).await;
    }

    /// Runs one adaptive controller cycle: evaluate, warm if needed, decay.
    pub async fn run_adaptive_cycle(&self) -> ControllerAction {
        let snapshot = self.metrics.snapshot();
        let action = self
            .adaptive
            .evaluate(&snapshot, self.cache.config().max_capacity);
        if action.warm {
            let warmed = self.warm(self.adaptive.config().warm_batch_size).await;
            debug!(warmed, hit_rate = snapshot.hit_rate, "cache warming cycle");
        }
        self.cache.decay_hot_keys();
        action
    }

    /// Re-resolves up to `limit` of the hottest keys that are not cached.
    pub async fn warm(&self, limit: usize) -> usize {
        let mut absent = Vec::new();
        for key in self.cache.hot_keys(limit.saturating_mul(2)) {
            if absent.len() == limit {
                break;
            }
            if !self.cache.contains_fresh(&key).await {
                absent.push(key);
            }
        }
        let count = absent.len();
        futures::future::join_all(absent.into_iter().map(|key| async move {
            let check = key.to_check();
            self.resolve_uncached(&check, key).await
        }))
        .await;
        count
    }

    async fn cached(&self, key: &CacheKey) -> Option<Decision> {
        match timeout(CACHE_OP_TIMEOUT, self.cache.get(key)).await {
            Ok(hit) => hit,
            Err(_) => {
                debug!("cache lookup timed out, treating as miss");
                None
            }
        }
    }

    async fn resolve_uncached(&self, check: &Check, key: CacheKey) -> Decision {
        let Ok(_permit) = self.admission.try_acquire() else {
            warn!(
                user_id = %check.user_id,
                max_in_flight = self.config.max_in_flight,
                "resolver saturated, denying"
            );
            return Decision::denied(DenyReason::Overloaded, Vec::new());
        };

        // Taken before any store read so a racing invalidation discards our set.
        let epoch = self.cache.epoch();

        match timeout(self.config.timeout, self.evaluate(check)).await {
            Ok(Ok(Evaluation { decision, tags })) => {
                if let Some(ttl) = self.decision_ttl(check, &decision).await {
                    let tags: Vec<String> = tags.into_iter().collect();
                    let _ = timeout(
                        CACHE_OP_TIMEOUT,
                        self.cache.set(key, decision.clone(), Some(ttl), tags, epoch),
                    )
                    .await;
                }
                decision
            }
            Ok(Err(err)) => {
                warn!(
                    user_id = %check.user_id,
                    action = %check.action,
                    resource = %check.resource,
                    error = %err,
                    "resolution failed, denying"
                );
                Decision::denied(DenyReason::from(&err), Vec::new())
            }
            Err(_) => {
                self.breaker.record_failure();
                self.metrics.record_breaker_state(self.breaker.is_open());
                warn!(
                    user_id = %check.user_id,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "resolution timed out, denying"
                );
                Decision::denied(DenyReason::Timeout, Vec::new())
            }
        }
    }

    /// How long a fresh decision may be cached, `None` if not at all.
    ///
    /// A grant expires from the cache no later than the earliest expiring
    /// assignment that could back it.
    async fn decision_ttl(&self, check: &Check, decision: &Decision) -> Option<Duration> {
        let ttl = self
            .config
            .decision_ttl
            .unwrap_or(self.cache.config().default_ttl);
        if !decision.is_granted() {
            return Some(ttl);
        }
        let tenant_id = check.context.tenant_id.as_deref();
        match self
            .store_call(self.checker.grants_expire_in(&check.user_id, tenant_id))
            .await
        {
            Ok(None) => Some(ttl),
            Ok(Some(left)) if left.is_zero() => None,
            Ok(Some(left)) => Some(ttl.min(left)),
            Err(err) => {
                debug!(
                    user_id = %check.user_id,
                    error = %err,
                    "grant lifetime unknown, not caching"
                );
                None
            }
        }
    }

    async fn evaluate(&self, check: &Check) -> DomainResult<Evaluation> {
        let user_id = check.user_id.as_str();
        let tenant_id = check.context.tenant_id.as_deref();
        let mut tags = BTreeSet::new();
        tags.insert(EntityKind::User.tag(user_id));

        let super_admin = self.config.super_admin_role.as_str();
        if self
            .store_call(self.checker.has_system_role(user_id, super_admin))
            .await?
        {
            tags.insert(EntityKind::Role.tag(super_admin));
            return Ok(Evaluation::new(
                Decision::granted(GrantReason::SuperAdminBypass, Vec::new()),
                tags,
            ));
        }

        let boundaries = check.context.boundary_ids();
        if !boundaries.is_empty() {
            for id in &boundaries {
                tags.insert(EntityKind::Tenant.tag(id));
            }
            match self.boundary.enforce(user_id, &check.context).await {
                Ok(()) => {}
                Err(DomainError::BoundaryViolation { entity_id, .. }) => {
                    if !self.holds_cross_entity_grant(user_id, &mut tags).await? {
                        debug!(user_id, entity_id = %entity_id, "entity boundary violation");
                        return Ok(Evaluation::new(
                            Decision::denied(DenyReason::EntityBoundaryViolation, Vec::new()),
                            tags,
                        ));
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let candidates = self.candidates(&check.permission())?;
        let roles = self
            .store_call(self.checker.active_roles(user_id, tenant_id))
            .await?;
        for role in &roles {
            tags.insert(EntityKind::Role.tag(role));
        }

        let mut path = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            tags.insert(EntityKind::Permission.tag(&candidate.base_key()));
            path.push(candidate.key());

            if self
                .store_call(self.checker.check_direct(user_id, &candidate, tenant_id))
                .await?
            {
                return Ok(Evaluation::new(
                    Decision::granted(GrantReason::DirectGrant, path),
                    tags,
                ));
            }
            for role in &roles {
                if self
                    .store_call(self.checker.role_grants(role, &candidate))
                    .await?
                {
                    let reason = GrantReason::RoleGrant {
                        role_id: role.clone(),
                    };
                    return Ok(Evaluation::new(Decision::granted(reason, path), tags));
                }
            }
        }

        Ok(Evaluation::new(
            Decision::denied(DenyReason::NoMatchingPermission, path),
            tags,
        ))
    }

    /// The requested permission and everything implying it, most specific
    /// first. With a resource id each key is tried scoped, then unscoped.
    fn candidates(&self, requested: &Permission) -> DomainResult<Vec<Permission>> {
        let graph = self.graph();
        let scope = requested.resource_id.as_deref();
        let mut candidates = Vec::new();
        for key in graph.expand(&requested.base_key()) {
            let permission = Permission::parse(&key)?;
            if scope.is_some() {
                candidates.push(permission.with_resource_id(scope));
            }
            candidates.push(permission);
        }
        Ok(candidates)
    }

    /// Whether the user holds the cross-entity permission globally.
    async fn holds_cross_entity_grant(
        &self,
        user_id: &str,
        tags: &mut BTreeSet<String>,
    ) -> DomainResult<bool> {
        let Some(permission) = &self.cross_entity else {
            return Ok(false);
        };
        tags.insert(EntityKind::Permission.tag(&permission.base_key()));

        if self
            .store_call(self.checker.check_direct(user_id, permission, None))
            .await?
        {
            return Ok(true);
        }
        let roles = self.store_call(self.checker.active_roles(user_id, None)).await?;
        for role in &roles {
            tags.insert(EntityKind::Role.tag(role));
            if self
                .store_call(self.checker.role_grants(role, permission))
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Runs one backing-store call through the breaker and its deadline.
    async fn store_call<T, F>(&self, call: F) -> DomainResult<T>
    where
        F: Future<Output = DomainResult<T>>,
    {
        // Dropping the guard mid-call reports an abandoned probe.
        let Some(admitted) = self.breaker.admit() else {
            return Err(DomainError::store_unavailable("circuit breaker open"));
        };
        let result = match timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::store_unavailable(format!(
                "store call exceeded {}ms",
                self.config.store_timeout.as_millis()
            ))),
        };
        admitted.finish(result.is_ok());
        self.metrics.record_breaker_state(self.breaker.is_open());
        result
    }

    fn finish(&self, check: &Check, decision: Decision, started: Instant, cache_hit: bool) -> Decision {
        let elapsed = started.elapsed();
        let decision = decision.with_timing(elapsed, cache_hit);
        self.metrics.record_resolution(&check.action, elapsed, cache_hit);
        let outcome = if decision.is_granted() { "granted" } else { "denied" };
        metrics::counter!(
            "rsperm_resolve_total",
            "outcome" => outcome,
            "reason" => decision.reason(),
            "cached" => if cache_hit { "true" } else { "false" }
        )
        .increment(1);
        self.audit(check, &decision);
        decision
    }

    fn audit(&self, check: &Check, decision: &Decision) {
        let Some(sink) = &self.audit else {
            return;
        };
        let sink = Arc::clone(sink);
        let record = AuditRecord {
            user_id: check.user_id.clone(),
            action: check.action.clone(),
            resource: check.resource.clone(),
            tenant_id: check.context.tenant_id.clone(),
            entity_id: check.context.entity_id.clone(),
            resource_id: check.context.resource_id.clone(),
            decision: decision.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = sink.record(record).await {
                warn!(error = %err, "audit sink rejected decision");
                metrics::counter!("rsperm_audit_failures_total").increment(1);
            }
        });
    }
}

impl<C, L> PermissionResolver<C, L>
where
    C: DirectPermissionChecker + 'static,
    L: MembershipLookup + 'static,
{
    /// Spawns the adaptive controller, which also runs cache maintenance.
    pub fn spawn_controller(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(resolver.adaptive.config().evaluation_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        resolver.cache.run_maintenance().await;
                        resolver.run_adaptive_cycle().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("adaptive controller stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
