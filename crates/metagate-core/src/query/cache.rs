//! Plan cache with LRU eviction.
//!
//! Compiled plans are keyed by their structural hash. Entries carry an atomic
//! recency stamp so lookups only need the shared lock; eviction scans for the
//! oldest stamp under the exclusive lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::compiler::CompiledPlan;
use super::fingerprint::PlanKey;

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    /// Get miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    /// Get eviction count.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Get the number of entries dropped by invalidation.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(AtomicOrdering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: usize) {
        self.invalidations
            .fetch_add(count as u64, AtomicOrdering::Relaxed);
    }
}

struct CachedPlan {
    plan: Arc<CompiledPlan>,
    last_used: AtomicU64,
    hit_count: AtomicU64,
}

struct Entries {
    plans: HashMap<PlanKey, CachedPlan>,
    by_object: HashMap<String, HashSet<PlanKey>>,
    epoch: u64,
}

impl Entries {
    fn remove(&mut self, key: &PlanKey) -> Option<CachedPlan> {
        let cached = self.plans.remove(key)?;
        if let Some(keys) = self.by_object.get_mut(&cached.plan.object) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_object.remove(&cached.plan.object);
            }
        }
        Some(cached)
    }
}

/// LRU cache of compiled plans.
pub struct PlanCache {
    entries: RwLock<Entries>,
    capacity: usize,
    clock: AtomicU64,
    stats: CacheStats,
}

impl PlanCache {
    /// Create a cache holding at most `capacity` plans. A capacity of zero
    /// disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries {
                plans: HashMap::new(),
                by_object: HashMap::new(),
                epoch: 0,
            }),
            capacity,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    /// Look up a plan, recording a hit or miss.
    pub fn get(&self, key: &PlanKey) -> Option<Arc<CompiledPlan>> {
        let found = self.lookup(key);
        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        found
    }

    /// Look up a plan without touching the statistics.
    pub(crate) fn lookup(&self, key: &PlanKey) -> Option<Arc<CompiledPlan>> {
        let guard = self.entries.read();
        let cached = guard.plans.get(key)?;
        cached.last_used.store(self.tick(), AtomicOrdering::Relaxed);
        cached.hit_count.fetch_add(1, AtomicOrdering::Relaxed);
        Some(cached.plan.clone())
    }

    /// Current invalidation epoch. Capture it before reading metadata for a
    /// build and pass it to [`insert`](Self::insert).
    pub fn epoch(&self) -> u64 {
        self.entries.read().epoch
    }

    /// Store a plan built at `epoch`.
    ///
    /// Returns `false` without storing when an invalidation happened since
    /// `epoch` was read, or when caching is disabled.
    pub fn insert(&self, plan: Arc<CompiledPlan>, epoch: u64) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let mut guard = self.entries.write();
        if guard.epoch != epoch {
            return false;
        }

        let key = plan.key;
        if guard.plans.len() >= self.capacity && !guard.plans.contains_key(&key) {
            self.evict_lru(&mut guard);
        }

        guard
            .by_object
            .entry(plan.object.clone())
            .or_default()
            .insert(key);
        guard.plans.insert(
            key,
            CachedPlan {
                plan,
                last_used: AtomicU64::new(self.tick()),
                hit_count: AtomicU64::new(0),
            },
        );
        true
    }

    fn evict_lru(&self, entries: &mut Entries) {
        let evict_key = entries
            .plans
            .iter()
            .min_by_key(|(_, v)| v.last_used.load(AtomicOrdering::Relaxed))
            .map(|(k, _)| *k);

        if let Some(key) = evict_key {
            entries.remove(&key);
            self.stats.record_eviction();
        }
    }

    /// Drop every plan compiled for `object`. Returns the number dropped.
    pub fn invalidate(&self, object: &str) -> usize {
        let mut guard = self.entries.write();
        guard.epoch += 1;

        let keys = guard.by_object.remove(object).unwrap_or_default();
        for key in &keys {
            guard.plans.remove(key);
        }
        self.stats.record_invalidations(keys.len());
        keys.len()
    }

    /// Drop every plan.
    pub fn clear(&self) {
        let mut guard = self.entries.write();
        guard.epoch += 1;
        let dropped = guard.plans.len();
        guard.plans.clear();
        guard.by_object.clear();
        self.stats.record_invalidations(dropped);
    }

    /// Hit count of a cached plan.
    pub fn hits_for(&self, key: &PlanKey) -> Option<u64> {
        self.entries
            .read()
            .plans
            .get(key)
            .map(|c| c.hit_count.load(AtomicOrdering::Relaxed))
    }

    /// Get cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().plans.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagate_proto::{FilterNode, QueryAst};

    fn plan(object: &str, status: &str) -> Arc<CompiledPlan> {
        let ast = QueryAst::new().with_filter(FilterNode::eq("status", status));
        Arc::new(CompiledPlan {
            key: PlanKey::compute(object, &ast),
            object: object.to_string(),
            ast,
            index_hints: Vec::new(),
        })
    }

    #[test]
    fn test_insert_and_get() {
        let cache = PlanCache::new(4);
        let p = plan("invoice", "open");
        assert!(cache.insert(p.clone(), cache.epoch()));

        assert!(cache.get(&p.key).is_some());
        assert!(cache.get(&plan("invoice", "paid").key).is_none());
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(cache.hits_for(&p.key), Some(1));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = PlanCache::new(2);
        let a = plan("invoice", "a");
        let b = plan("invoice", "b");
        let c = plan("invoice", "c");

        cache.insert(a.clone(), cache.epoch());
        cache.insert(b.clone(), cache.epoch());
        // touch a so b becomes least recently used
        cache.get(&a.key);
        cache.insert(c.clone(), cache.epoch());

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&a.key).is_some());
        assert!(cache.lookup(&b.key).is_none());
        assert!(cache.lookup(&c.key).is_some());
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[test]
    fn test_invalidate_by_object() {
        let cache = PlanCache::new(8);
        cache.insert(plan("invoice", "a"), cache.epoch());
        cache.insert(plan("invoice", "b"), cache.epoch());
        cache.insert(plan("account", "a"), cache.epoch());

        assert_eq!(cache.invalidate("invoice"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().invalidations(), 2);
    }

    #[test]
    fn test_stale_epoch_rejected() {
        let cache = PlanCache::new(8);
        let epoch = cache.epoch();
        cache.invalidate("invoice");

        assert!(!cache.insert(plan("invoice", "a"), epoch));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = PlanCache::new(0);
        assert!(!cache.insert(plan("invoice", "a"), cache.epoch()));
        assert!(cache.is_empty());
    }
}
