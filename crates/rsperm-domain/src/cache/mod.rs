//! Tag-indexed decision cache with TTL, batched invalidation, and LRU eviction.
//!
//! # Architecture
//!
//! The cache pairs a Moka async cache (key → entry) with a DashMap secondary
//! index (tag → keys). A tag names an entity whose mutation must evict every
//! decision that consulted it: `user:<id>`, `role:<id>`, `permission:<id>`,
//! `tenant:<id>`. Invalidating a tag therefore costs O(|affected keys|)
//! instead of a full scan.
//!
//! # Consistency
//!
//! - A reader/writer gate serialises mutation: `get`/`get_many` share the
//!   gate, `set` and every invalidation flush hold it exclusively, so a reader
//!   never observes a half-applied flush.
//! - Every flush stamps its tags with a fresh invalidation epoch. Callers take
//!   an [`epoch`](DecisionCache::epoch) snapshot before reading the backing
//!   store and hand it to [`set`](DecisionCache::set); a set whose tags were
//!   invalidated after that snapshot is discarded, so a resolution that raced
//!   an invalidation cannot re-insert stale state.
//! - The index may hold keys no longer stored (evictions do not touch it);
//!   [`run_maintenance`](DecisionCache::run_maintenance) prunes them. The
//!   reverse, a stored key missing from its tags' index, is corruption: the
//!   entry is dropped on read and reported as a miss.
//!
//! # Entry lifecycle
//!
//! `Absent → Fresh (set) → Stale (TTL elapsed, treated as absent) →
//! Evicted/Invalidated (tag flush or LRU pressure)`. Nothing leaves the
//! evicted state except through a new `set`.

mod adaptive;
mod hot_keys;
mod invalidation;

pub use adaptive::{AdaptiveConfig, AdaptiveController, CapacityRecommendation, ControllerAction};
pub use hot_keys::HotKeyTracker;
pub use invalidation::{spawn_flusher, InvalidationEvent, Priority};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::collector::CacheCounters;
use crate::model::{Check, Decision, ResolveContext};

use self::invalidation::InvalidationQueue;

/// Configuration for the decision cache.
#[derive(Debug, Clone)]
pub struct DecisionCacheConfig {
    /// Whether decisions are cached at all.
    pub enabled: bool,
    /// Maximum number of entries before LRU eviction.
    pub max_capacity: u64,
    /// TTL applied when `set` is called without one.
    pub default_ttl: Duration,
    /// Upper bound for any entry's TTL.
    pub max_ttl: Duration,
    /// Flush interval for high-priority invalidations.
    pub high_flush_interval: Duration,
    /// Flush interval for medium-priority invalidations.
    pub medium_flush_interval: Duration,
    /// Flush interval for low-priority invalidations.
    pub low_flush_interval: Duration,
    /// Number of distinct keys tracked for warming.
    pub hot_key_capacity: u64,
    /// How long a tag's invalidation epoch is remembered.
    pub tag_epoch_retention: Duration,
}

impl Default for DecisionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity: 100_000,
            default_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(600),
            high_flush_interval: Duration::from_millis(10),
            medium_flush_interval: Duration::from_millis(50),
            low_flush_interval: Duration::from_millis(200),
            hot_key_capacity: 1024,
            tag_epoch_retention: Duration::from_secs(300),
        }
    }
}

impl DecisionCacheConfig {
    /// Enables or disables caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the maximum capacity.
    pub fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Sets the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the per-priority flush intervals.
    pub fn with_flush_intervals(mut self, high: Duration, medium: Duration, low: Duration) -> Self {
        self.high_flush_interval = high;
        self.medium_flush_interval = medium;
        self.low_flush_interval = low;
        self
    }
}

/// Cache key: the normalized check tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub tenant_id: Option<String>,
    pub entity_id: Option<String>,
    pub resource_id: Option<String>,
}

impl CacheKey {
    /// Builds the key for a check. The check should already be normalized.
    pub fn from_check(check: &Check) -> Self {
        Self {
            user_id: check.user_id.clone(),
            action: check.action.clone(),
            resource: check.resource.clone(),
            tenant_id: check.context.tenant_id.clone(),
            entity_id: check.context.entity_id.clone(),
            resource_id: check.context.resource_id.clone(),
        }
    }

    /// Rebuilds the check this key was derived from.
    pub fn to_check(&self) -> Check {
        Check {
            user_id: self.user_id.clone(),
            action: self.action.clone(),
            resource: self.resource.clone(),
            context: ResolveContext {
                tenant_id: self.tenant_id.clone(),
                entity_id: self.entity_id.clone(),
                resource_id: self.resource_id.clone(),
            },
        }
    }
}

/// A cached decision and the tags whose mutation must evict it.
#[derive(Debug)]
pub struct CacheEntry {
    pub decision: Decision,
    pub tags: Vec<String>,
    pub expires_at: Instant,
    /// Milliseconds since cache creation at the last read.
    last_accessed: AtomicU64,
}

impl CacheEntry {
    /// Milliseconds since cache creation at the last read.
    pub fn last_accessed_ms(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }
}

/// Tag-indexed, TTL-based decision cache.
///
/// # Thread Safety
///
/// Fully thread-safe; share it behind an `Arc` across tasks.
pub struct DecisionCache {
    store: Cache<CacheKey, Arc<CacheEntry>>,
    /// Secondary index: tag -> keys whose decision consulted that tag.
    tag_index: DashMap<String, HashSet<CacheKey>>,
    /// Invalidation epoch per recently flushed tag.
    tag_epochs: moka::sync::Cache<String, u64>,
    /// Highest epoch forgotten by `tag_epochs`; older snapshots are refused.
    epoch_floor: Arc<AtomicU64>,
    epoch: AtomicU64,
    gate: RwLock<()>,
    queue: InvalidationQueue,
    hot_keys: HotKeyTracker,
    counters: Arc<CacheCounters>,
    config: DecisionCacheConfig,
    created: Instant,
}

impl std::fmt::Debug for DecisionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionCache")
            .field("config", &self.config)
            .field("entry_count", &self.store.entry_count())
            .field("tag_index_size", &self.tag_index.len())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl DecisionCache {
    /// Creates a cache with its own counters.
    pub fn new(config: DecisionCacheConfig) -> Self {
        Self::with_counters(config, Arc::new(CacheCounters::default()))
    }

    /// Creates a cache reporting into the given counters.
    pub fn with_counters(config: DecisionCacheConfig, counters: Arc<CacheCounters>) -> Self {
        let eviction_counters = Arc::clone(&counters);
        let store = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.max_ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |_key, _value, cause| {
                if cause == RemovalCause::Size {
                    eviction_counters.evictions.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("rsperm_cache_evictions_total").increment(1);
                }
            })
            .build();

        let epoch_floor = Arc::new(AtomicU64::new(0));
        let floor = Arc::clone(&epoch_floor);
        let tag_epochs = moka::sync::Cache::builder()
            .max_capacity(config.max_capacity.max(1024))
            .time_to_live(config.tag_epoch_retention)
            .eviction_listener(move |_tag, epoch: u64, cause: RemovalCause| {
                if cause.was_evicted() {
                    floor.fetch_max(epoch, Ordering::SeqCst);
                }
            })
            .build();

        Self {
            store,
            tag_index: DashMap::new(),
            tag_epochs,
            epoch_floor,
            epoch: AtomicU64::new(0),
            gate: RwLock::new(()),
            queue: InvalidationQueue::default(),
            hot_keys: HotKeyTracker::new(config.hot_key_capacity),
            counters,
            config,
            created: Instant::now(),
        }
    }

    /// Returns the configuration for this cache.
    pub fn config(&self) -> &DecisionCacheConfig {
        &self.config
    }

    /// Returns whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Returns the counters this cache reports into.
    pub fn counters(&self) -> &Arc<CacheCounters> {
        &self.counters
    }

    /// Current invalidation epoch. Take it before reading the backing store
    /// and pass it to [`set`](Self::set).
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Retrieves a fresh cached decision.
    ///
    /// Returns `None` if the key is absent, stale, or its entry failed the
    /// index consistency check.
    pub async fn get(&self, key: &CacheKey) -> Option<Decision> {
        if !self.config.enabled {
            return None;
        }
        let _read = self.gate.read().await;
        self.lookup(key).await
    }

    /// Looks up several keys under a single gate acquisition.
    pub async fn get_many(&self, keys: &[CacheKey]) -> Vec<Option<Decision>> {
        if !self.config.enabled {
            return vec![None; keys.len()];
        }
        let _read = self.gate.read().await;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.lookup(key).await);
        }
        results
    }

    /// Whether a fresh entry exists, without touching hit/miss accounting.
    pub async fn contains_fresh(&self, key: &CacheKey) -> bool {
        let _read = self.gate.read().await;
        self.store
            .get(key)
            .await
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Caller must hold the gate (shared or exclusive).
    async fn lookup(&self, key: &CacheKey) -> Option<Decision> {
        self.hot_keys.record(key);

        let Some(entry) = self.store.get(key).await else {
            self.record_miss();
            return None;
        };

        if entry.expires_at <= Instant::now() {
            self.store.invalidate(key).await;
            self.record_miss();
            return None;
        }

        let indexed = entry.tags.iter().all(|tag| {
            self.tag_index
                .get(tag)
                .is_some_and(|keys| keys.contains(key))
        });
        if !indexed {
            error!(
                user_id = %key.user_id,
                action = %key.action,
                resource = %key.resource,
                "cache corruption: entry missing from tag index, dropping it"
            );
            self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rsperm_cache_corruption_total").increment(1);
            self.store.invalidate(key).await;
            self.record_miss();
            return None;
        }

        entry
            .last_accessed
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rsperm_cache_hits_total").increment(1);
        Some(entry.decision.clone())
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rsperm_cache_misses_total").increment(1);
    }

    /// Inserts a decision tagged with every identifier consulted to produce it.
    ///
    /// `observed_epoch` is the [`epoch`](Self::epoch) taken before the backing
    /// store was read. Returns `false` if caching is disabled or a tag was
    /// invalidated after that snapshot.
    pub async fn set(
        &self,
        key: CacheKey,
        decision: Decision,
        ttl: Option<Duration>,
        tags: Vec<String>,
        observed_epoch: u64,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let _write = self.gate.write().await;

        let stale = observed_epoch < self.epoch_floor.load(Ordering::SeqCst)
            || tags.iter().any(|tag| {
                self.tag_epochs
                    .get(tag)
                    .is_some_and(|invalidated_at| invalidated_at > observed_epoch)
            });
        if stale {
            debug!(
                user_id = %key.user_id,
                action = %key.action,
                "discarding decision computed before a tag invalidation"
            );
            self.counters.stale_writes.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        for tag in &tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl).min(self.config.max_ttl);
        let entry = CacheEntry {
            decision,
            tags,
            expires_at: Instant::now() + ttl,
            last_accessed: AtomicU64::new(self.created.elapsed().as_millis() as u64),
        };
        self.store.insert(key, Arc::new(entry)).await;
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Immediately evicts every entry carrying `tag`. Returns the number of
    /// entries removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let _write = self.gate.write().await;
        self.apply_tags(&[tag.to_string()]).await
    }

    /// Queues an invalidation event for its priority tier.
    ///
    /// A high-priority event flushes every pending tier at once, high first.
    pub async fn invalidate(&self, event: InvalidationEvent) {
        debug!(
            tag = %event.tag(),
            reason = %event.reason,
            priority = ?event.priority,
            "queueing cache invalidation"
        );
        let priority = event.priority;
        self.queue.push(event);
        if priority == Priority::High {
            self.flush_all().await;
        }
    }

    /// Number of queued events for a tier.
    pub fn pending(&self, priority: Priority) -> usize {
        self.queue.len(priority)
    }

    /// Applies every queued event of one tier atomically. Returns the number
    /// of entries removed.
    pub async fn flush(&self, priority: Priority) -> usize {
        let events = self.queue.drain(priority);
        if events.is_empty() {
            return 0;
        }
        let mut tags: Vec<String> = events.iter().map(InvalidationEvent::tag).collect();
        tags.sort();
        tags.dedup();

        let removed = {
            let _write = self.gate.write().await;
            self.apply_tags(&tags).await
        };
        metrics::counter!("rsperm_cache_invalidations_total", "priority" => priority.as_str())
            .increment(removed as u64);
        debug!(
            priority = priority.as_str(),
            events = events.len(),
            tags = tags.len(),
            removed,
            "flushed invalidation batch"
        );
        removed
    }

    /// Flushes all tiers in priority order.
    pub async fn flush_all(&self) -> usize {
        let mut removed = 0;
        for priority in Priority::ALL {
            removed += self.flush(priority).await;
        }
        removed
    }

    /// Caller must hold the gate exclusively.
    async fn apply_tags(&self, tags: &[String]) -> usize {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut removed = 0;
        for tag in tags {
            self.tag_epochs.insert(tag.clone(), epoch);
            if let Some((_, keys)) = self.tag_index.remove(tag) {
                for key in &keys {
                    if self.store.contains_key(key) {
                        removed += 1;
                    }
                    self.store.invalidate(key).await;
                }
            }
        }
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drops every entry and refuses sets from resolutions already in flight.
    pub async fn clear(&self) {
        let _write = self.gate.write().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.epoch_floor.fetch_max(epoch, Ordering::SeqCst);
        self.tag_index.clear();
        self.store.invalidate_all();
        self.store.run_pending_tasks().await;
    }

    /// Runs pending store maintenance and prunes index entries for keys that
    /// are no longer stored.
    pub async fn run_maintenance(&self) {
        self.store.run_pending_tasks().await;
        let _write = self.gate.write().await;
        self.tag_index.retain(|_, keys| {
            keys.retain(|key| self.store.contains_key(key));
            !keys.is_empty()
        });
    }

    /// The hottest tracked keys, most requested first.
    pub fn hot_keys(&self, limit: usize) -> Vec<CacheKey> {
        self.hot_keys.hottest(limit)
    }

    /// Halves hot-key counts so old traffic fades.
    pub fn decay_hot_keys(&self) {
        self.hot_keys.decay();
    }

    /// Returns the approximate number of entries in the cache.
    pub fn entry_count(&self) -> u64 {
        self.store.entry_count()
    }

    /// Number of tags currently indexed.
    pub fn indexed_tag_count(&self) -> usize {
        self.tag_index.len()
    }

    /// Returns the stored entry for a key, fresh or not.
    pub async fn entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.store.get(key).await
    }

    #[cfg(test)]
    pub(crate) fn corrupt_index_for_test(&self, tag: &str, key: &CacheKey) {
        if let Some(mut keys) = self.tag_index.get_mut(tag) {
            keys.remove(key);
        }
    }
}
