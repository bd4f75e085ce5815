//! Query cache for point-in-time reads
//!
//! Caches the result of `ranged_get`: a value together with the validity
//! period it holds over. One cache slot per `(branch, keyspace, key)` keeps
//! every period seen for that key, so a later read at any timestamp inside
//! a cached period is answered without touching the tables.
//!
//! Capacity counts slots. A capacity of zero disables the cache.
//!
//! Every invalidation bumps a generation counter. Readers capture the
//! generation before touching the tables and `put` drops their result if an
//! invalidation happened in between.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tempo_core::{BranchName, Period, QualifiedKey};

type Slot = Vec<(Period, Option<Vec<u8>>)>;

/// Size-bounded LRU cache of validity periods
pub struct QueryCache {
    inner: Option<Mutex<LruCache<(BranchName, QualifiedKey), Slot>>>,
    generation: AtomicU64,
}

impl QueryCache {
    /// Create a cache holding up to `capacity` keys (0 disables caching)
    pub fn new(capacity: usize) -> Self {
        QueryCache {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            generation: AtomicU64::new(0),
        }
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        QueryCache {
            inner: None,
            generation: AtomicU64::new(0),
        }
    }

    /// Whether caching is active
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Current invalidation generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cached result for `key` at `timestamp`, if some cached period contains it
    pub fn get(
        &self,
        branch: &BranchName,
        key: &QualifiedKey,
        timestamp: u64,
    ) -> Option<(Option<Vec<u8>>, Period)> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock();
        let slot = cache.get(&(branch.clone(), key.clone()))?;
        slot.iter()
            .find(|(period, _)| period.contains(timestamp))
            .map(|(period, value)| (value.clone(), *period))
    }

    /// Remember a lookup result computed at generation `observed`
    pub fn put(
        &self,
        observed: u64,
        branch: &BranchName,
        key: &QualifiedKey,
        period: Period,
        value: Option<Vec<u8>>,
    ) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if period.is_empty() {
            return;
        }
        let mut cache = inner.lock();
        if self.generation() != observed {
            return;
        }
        let cache_key = (branch.clone(), key.clone());
        match cache.get_mut(&cache_key) {
            Some(slot) => {
                if !slot.iter().any(|(p, _)| *p == period) {
                    slot.push((period, value));
                }
            }
            None => {
                cache.put(cache_key, vec![(period, value)]);
            }
        }
    }

    /// Forget everything cached for one key of a branch
    pub fn invalidate_key(&self, branch: &BranchName, key: &QualifiedKey) {
        if let Some(inner) = self.inner.as_ref() {
            let mut cache = inner.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            cache.pop(&(branch.clone(), key.clone()));
        }
    }

    /// Forget everything cached for the given branches
    pub fn invalidate_branches(&self, branches: &[BranchName]) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let mut cache = inner.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let doomed: Vec<(BranchName, QualifiedKey)> = cache
            .iter()
            .filter(|((branch, _), _)| branches.contains(branch))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            cache.pop(&key);
        }
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        if let Some(inner) = self.inner.as_ref() {
            let mut cache = inner.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            cache.clear();
        }
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.inner.as_ref().map(|inner| inner.lock().len()).unwrap_or(0)
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("enabled", &self.is_enabled())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> QualifiedKey {
        QualifiedKey::new("kv", k)
    }

    #[test]
    fn test_hit_inside_period() {
        let cache = QueryCache::new(8);
        let master = BranchName::master();
        cache.put(0, &master, &key("x"), Period::new(100, 200), Some(b"a".to_vec()));

        assert_eq!(
            cache.get(&master, &key("x"), 150),
            Some((Some(b"a".to_vec()), Period::new(100, 200)))
        );
        assert!(cache.get(&master, &key("x"), 200).is_none());
        assert!(cache.get(&master, &key("x"), 99).is_none());
    }

    #[test]
    fn test_multiple_periods_per_key() {
        let cache = QueryCache::new(8);
        let master = BranchName::master();
        cache.put(0, &master, &key("x"), Period::new(0, 100), None);
        cache.put(0, &master, &key("x"), Period::starting_at(100), Some(b"a".to_vec()));
        assert_eq!(cache.get(&master, &key("x"), 50).map(|(v, _)| v), Some(None));
        assert_eq!(
            cache.get(&master, &key("x"), 5000).map(|(v, _)| v),
            Some(Some(b"a".to_vec()))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_branches() {
        let cache = QueryCache::new(8);
        let master = BranchName::master();
        let child = BranchName::new("child").unwrap();
        cache.put(0, &master, &key("x"), Period::eternal(), None);
        cache.put(0, &child, &key("x"), Period::eternal(), None);
        cache.put(0, &child, &key("y"), Period::eternal(), None);

        cache.invalidate_branches(&[child.clone()]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.generation(), 1);
        assert!(cache.get(&child, &key("x"), 1).is_none());

        cache.invalidate_key(&master, &key("x"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_generation_is_not_cached() {
        let cache = QueryCache::new(8);
        let master = BranchName::master();
        let observed = cache.generation();
        cache.invalidate_key(&master, &key("x"));
        cache.put(observed, &master, &key("x"), Period::eternal(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_and_disabled() {
        let cache = QueryCache::new(2);
        let master = BranchName::master();
        cache.put(0, &master, &key("a"), Period::eternal(), None);
        cache.put(0, &master, &key("b"), Period::eternal(), None);
        cache.put(0, &master, &key("c"), Period::eternal(), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&master, &key("a"), 0).is_none());

        let disabled = QueryCache::new(0);
        assert!(!disabled.is_enabled());
        disabled.put(0, &master, &key("a"), Period::eternal(), None);
        assert!(disabled.get(&master, &key("a"), 0).is_none());
    }
}
