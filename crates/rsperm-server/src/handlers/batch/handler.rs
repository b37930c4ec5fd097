//! Batch resolve handler implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use rsperm_domain::resolver::{DirectPermissionChecker, MembershipLookup};
use rsperm_domain::{CacheKey, Check, Decision, PermissionResolver};

use super::singleflight::{Singleflight, SingleflightGuard, SingleflightSlot};
use super::types::{
    BatchResolveError, BatchResolveRequest, BatchResolveResponse, BatchResolveResult,
    MAX_BATCH_SIZE,
};

/// Handler for batch permission resolution.
///
/// Processes many checks with two-stage deduplication:
/// 1. Intra-batch: identical checks (after normalization) execute once
/// 2. Singleflight: concurrent batches asking for the same check share results
///
/// Flights are keyed by the cache invalidation epoch as well, so a batch
/// arriving after an invalidation never joins a resolution that began before
/// it.
pub struct BatchResolveHandler<C, L> {
    resolver: Arc<PermissionResolver<C, L>>,
    singleflight: Arc<Singleflight<(CacheKey, u64), Decision>>,
}

impl<C, L> BatchResolveHandler<C, L>
where
    C: DirectPermissionChecker + 'static,
    L: MembershipLookup + 'static,
{
    pub fn new(resolver: Arc<PermissionResolver<C, L>>) -> Self {
        Self {
            resolver,
            singleflight: Arc::new(Singleflight::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<PermissionResolver<C, L>> {
        &self.resolver
    }

    /// Validates the batch shape. Individual checks are not rejected here;
    /// a malformed check resolves to its own denial.
    pub fn validate(&self, request: &BatchResolveRequest) -> BatchResolveResult<()> {
        if request.checks.is_empty() {
            return Err(BatchResolveError::EmptyBatch);
        }
        if request.checks.len() > MAX_BATCH_SIZE {
            return Err(BatchResolveError::BatchTooLarge {
                size: request.checks.len(),
                max: MAX_BATCH_SIZE,
            });
        }
        Ok(())
    }

    /// Resolves a batch. Decisions come back in request order.
    pub async fn resolve(
        &self,
        request: BatchResolveRequest,
    ) -> BatchResolveResult<BatchResolveResponse> {
        self.validate(&request)?;
        metrics::counter!("rsperm_batch_requests_total").increment(1);

        // Stage 1: intra-batch deduplication
        let mut unique: Vec<(CacheKey, Check)> = Vec::new();
        let mut key_to_index: HashMap<CacheKey, usize> = HashMap::new();
        let mut position_to_unique: Vec<usize> = Vec::with_capacity(request.checks.len());

        for check in &request.checks {
            let check = check.normalized();
            let key = CacheKey::from_check(&check);
            let index = *key_to_index.entry(key.clone()).or_insert_with(|| {
                unique.push((key, check));
                unique.len() - 1
            });
            position_to_unique.push(index);
        }

        let total = request.checks.len();
        metrics::histogram!("rsperm_batch_dedup_ratio")
            .record(1.0 - unique.len() as f64 / total as f64);

        // Stage 2: cross-request singleflight
        let epoch = self.resolver.cache().epoch();
        let mut leaders = Vec::new();
        let mut followers = Vec::new();
        for (index, (key, _)) in unique.iter().enumerate() {
            let flight = (key.clone(), epoch);
            match self.singleflight.acquire(flight.clone()) {
                SingleflightSlot::Leader(sender) => {
                    let guard = SingleflightGuard::new(&*self.singleflight, flight);
                    leaders.push((index, sender, guard));
                }
                SingleflightSlot::Follower(receiver) => followers.push((index, receiver)),
            }
        }

        debug!(
            checks = total,
            unique = unique.len(),
            leading = leaders.len(),
            following = followers.len(),
            "batch resolve"
        );

        let unique = &unique;
        let lead = async move {
            if leaders.is_empty() {
                return Vec::new();
            }
            let checks: Vec<Check> = leaders
                .iter()
                .map(|(index, _, _)| unique[*index].1.clone())
                .collect();
            // One resolver call for every led check: one cache snapshot.
            let mut resolved = self.resolver.batch_resolve(&checks).await;

            let mut results = Vec::with_capacity(leaders.len());
            for (index, sender, guard) in leaders {
                let (key, check) = &unique[index];
                let decision = match resolved.remove(key) {
                    Some(decision) => decision,
                    None => self.resolver.resolve_check(check).await,
                };
                // No receivers is fine.
                let _ = sender.send(decision.clone());
                guard.complete();
                results.push((index, decision));
            }
            results
        };

        let follow = join_all(followers.into_iter().map(|(index, mut receiver)| async move {
            let decision = match receiver.recv().await {
                Ok(decision) => decision,
                // Leader went away without a result; resolve ourselves.
                Err(_) => self.resolver.resolve_check(&unique[index].1).await,
            };
            (index, decision)
        }));

        let (led, followed) = tokio::join!(lead, follow);

        let mut unique_results: Vec<(usize, Decision)> = led.into_iter().chain(followed).collect();
        unique_results.sort_by_key(|(index, _)| *index);

        let results = position_to_unique
            .iter()
            .map(|&index| unique_results[index].1.clone())
            .collect();

        Ok(BatchResolveResponse { results })
    }

    /// Number of checks currently being resolved on behalf of some batch.
    pub fn in_flight(&self) -> usize {
        self.singleflight.in_flight()
    }

    /// Returns `(total_checks, unique_checks)` for a request.
    pub fn dedup_stats(&self, request: &BatchResolveRequest) -> (usize, usize) {
        let seen: HashSet<CacheKey> = request
            .checks
            .iter()
            .map(|check| CacheKey::from_check(&check.normalized()))
            .collect();
        (request.checks.len(), seen.len())
    }
}
