//! Request-frequency tracking for cache warming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;

use super::CacheKey;

/// Counts lookups per key in a bounded map.
///
/// The map itself is size-bounded by Moka, so rarely requested keys fall out
/// on their own. [`decay`](Self::decay) halves every count so the ranking
/// follows recent traffic.
#[derive(Debug)]
pub struct HotKeyTracker {
    counts: Cache<CacheKey, Arc<AtomicU64>>,
}

impl HotKeyTracker {
    pub fn new(capacity: u64) -> Self {
        Self {
            counts: Cache::new(capacity.max(1)),
        }
    }

    /// Counts one request for `key`.
    pub fn record(&self, key: &CacheKey) {
        self.counts
            .get_with_by_ref(key, || Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current count for a key.
    pub fn count(&self, key: &CacheKey) -> u64 {
        self.counts
            .get(key)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Up to `limit` keys, most requested first.
    pub fn hottest(&self, limit: usize) -> Vec<CacheKey> {
        let mut ranked: Vec<(u64, CacheKey)> = self
            .counts
            .iter()
            .map(|(key, count)| (count.load(Ordering::Relaxed), (*key).clone()))
            .filter(|(count, _)| *count > 0)
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.truncate(limit);
        ranked.into_iter().map(|(_, key)| key).collect()
    }

    /// Halves every count.
    pub fn decay(&self) {
        for (_, count) in self.counts.iter() {
            let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c / 2));
        }
    }
}
