//! Temporal entry store: lineage-aware reads
//!
//! Every read resolves a `(keyspace, key)` against the lineage of a branch
//! (see [`crate::registry`]). The queried branch is consulted first; if it
//! has nothing at or below the query time, the parent is consulted capped
//! at the branching timestamp, and so on up to the root.
//!
//! ## Validity periods
//!
//! `ranged_get(key, T)` returns the value visible at `T` together with the
//! half-open period `[t_start, t_end)` over which that value stays visible:
//!
//! - `t_start` is the timestamp of the entry that supplied the value
//! - `t_end` is the earliest visible entry after `t_start`, across every
//!   lineage level consulted, or +inf
//! - with no visible entry the value is `None` and the period starts at 0
//!
//! Only entries at or below the queried branch's `now` are visible on its
//! own level, so a commit in flight (or interrupted before its commit
//! point) never shapes a value or a period. A view built with
//! [`TemporalStore::with_pending_until`] raises that cap for the
//! transaction writing an incremental commit.
//!
//! Point reads go through the [`QueryCache`] when it is enabled; views
//! with a raised cap bypass it.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempo_core::{
    BranchName, Order, Period, QualifiedKey, TemporalEntry, TemporalKey, TempoError, TempoResult,
    INFINITE,
};

use crate::cache::QueryCache;
use crate::iter::{Batched, CloseableIter, CursorTracker, DEFAULT_BATCH_SIZE};
use crate::registry::{BranchRegistry, LineageLevel};
use crate::sharded::{BranchShard, ShardedStore};

/// Lineage-aware read access to the entry tables
#[derive(Clone)]
pub struct TemporalStore {
    store: Arc<ShardedStore>,
    registry: BranchRegistry,
    cache: Arc<QueryCache>,
    cursors: Arc<CursorTracker>,
    batch_size: usize,
    horizon: Option<u64>,
}

impl TemporalStore {
    /// Create a read layer over `store`
    pub fn new(store: Arc<ShardedStore>, cache: Arc<QueryCache>, cursors: Arc<CursorTracker>) -> Self {
        TemporalStore {
            registry: BranchRegistry::new(Arc::clone(&store)),
            store,
            cache,
            cursors,
            batch_size: DEFAULT_BATCH_SIZE,
            horizon: None,
        }
    }

    /// A view that also sees the queried branch's own entries up to `horizon`
    ///
    /// Used by a transaction reading back the batches of its own
    /// incremental commit. The view shares tables and cursors with `self`
    /// but never touches the query cache.
    pub fn with_pending_until(&self, horizon: u64) -> TemporalStore {
        TemporalStore {
            horizon: Some(horizon),
            ..self.clone()
        }
    }

    fn levels(&self, branch: &BranchName) -> TempoResult<Vec<LineageLevel>> {
        self.registry.lineage_until(branch, self.horizon)
    }

    /// Override the iterator batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Branch registry over the same store
    pub fn registry(&self) -> &BranchRegistry {
        &self.registry
    }

    /// The query cache
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Underlying tables
    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    // ========================================================================
    // Point reads
    // ========================================================================

    /// Value of `key` visible at `timestamp` (tombstones read as `None`)
    pub fn get(&self, branch: &BranchName, key: &QualifiedKey, timestamp: u64) -> TempoResult<Option<Vec<u8>>> {
        Ok(self.ranged_get(branch, key, timestamp)?.0)
    }

    /// Value of `key` visible at `timestamp` with its validity period
    pub fn ranged_get(
        &self,
        branch: &BranchName,
        key: &QualifiedKey,
        timestamp: u64,
    ) -> TempoResult<(Option<Vec<u8>>, Period)> {
        if self.horizon.is_some() {
            return Ok(resolve(&self.levels(branch)?, key, timestamp));
        }
        if let Some(hit) = self.cache.get(branch, key, timestamp) {
            return Ok(hit);
        }
        let observed = self.cache.generation();
        let levels = self.levels(branch)?;
        let (value, period) = resolve(&levels, key, timestamp);
        self.cache.put(observed, branch, key, period, value.clone());
        Ok((value, period))
    }

    /// Timestamp of the latest modification of `key` at or before `timestamp`
    ///
    /// Deletions count as modifications.
    pub fn last_modification(
        &self,
        branch: &BranchName,
        key: &QualifiedKey,
        timestamp: u64,
    ) -> TempoResult<Option<u64>> {
        for level in self.levels(branch)? {
            let cap = timestamp.min(level.visible_upper);
            let shard = level.shard.read();
            if let Some((ts, _)) = shard.chain(key).and_then(|chain| chain.latest_at(cap)) {
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Keyspace reads
    // ========================================================================

    /// Keys of `keyspace` holding a live value at `timestamp`
    pub fn key_set(&self, branch: &BranchName, keyspace: &str, timestamp: u64) -> TempoResult<BTreeSet<String>> {
        let mut levels = self.levels(branch)?;
        levels.reverse();

        let mut alive: BTreeMap<String, bool> = BTreeMap::new();
        for level in levels {
            let cap = timestamp.min(level.visible_upper);
            let shard = level.shard.read();
            let Some(table) = shard.keyspace(keyspace) else {
                continue;
            };
            for (key, chain) in table {
                if let Some((_, value)) = chain.latest_at(cap) {
                    alive.insert(key.clone(), value.is_some());
                }
            }
        }
        Ok(alive
            .into_iter()
            .filter_map(|(key, live)| live.then_some(key))
            .collect())
    }

    /// Keyspaces existing at `timestamp`, inherited ones included
    pub fn keyspaces(&self, branch: &BranchName, timestamp: u64) -> TempoResult<BTreeSet<String>> {
        let mut result = BTreeSet::new();
        for level in self.levels(branch)? {
            let cap = timestamp.min(level.visible_upper);
            let shard = level.shard.read();
            result.extend(
                shard
                    .keyspaces()
                    .iter()
                    .filter(|(_, created)| **created <= cap)
                    .map(|(name, _)| name.clone()),
            );
        }
        Ok(result)
    }

    /// Creation timestamp of a keyspace as seen from a branch
    pub fn keyspace_creation_timestamp(&self, branch: &BranchName, keyspace: &str) -> TempoResult<Option<u64>> {
        let mut levels = self.levels(branch)?;
        levels.reverse();
        for level in levels {
            let shard = level.shard.read();
            if let Some(created) = shard.keyspaces().get(keyspace) {
                if *created <= level.visible_upper {
                    return Ok(Some(*created));
                }
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// Timestamps of every modification of `key` within `[lower, upper]`
    pub fn history(
        &self,
        branch: &BranchName,
        key: &QualifiedKey,
        lower: u64,
        upper: u64,
        order: Order,
    ) -> TempoResult<CloseableIter<u64>> {
        check_bounds(lower, upper)?;
        let mut levels = self.levels(branch)?;
        if order == Order::Ascending {
            levels.reverse();
        }
        let batch_size = self.batch_size;
        let key = key.clone();
        let iter = levels.into_iter().flat_map(move |level| {
            let hi = upper.min(level.visible_upper);
            scan_chain(level.shard, key.clone(), lower, hi, order, batch_size)
        });
        Ok(CloseableIter::new(iter, Some(Arc::clone(&self.cursors)), "history"))
    }

    /// `(key, timestamp)` of every modification in `keyspace` within `[lower, upper]`
    ///
    /// Per lineage level (root first) results are ordered by timestamp,
    /// then key.
    pub fn modifications_in_keyspace_between(
        &self,
        branch: &BranchName,
        keyspace: &str,
        lower: u64,
        upper: u64,
    ) -> TempoResult<CloseableIter<(String, u64)>> {
        check_bounds(lower, upper)?;
        let mut levels = self.levels(branch)?;
        levels.reverse();
        let keyspace = keyspace.to_string();
        let iter = levels.into_iter().flat_map(move |level| {
            let hi = upper.min(level.visible_upper);
            let shard = level.shard.read();
            let mut found: Vec<(u64, String)> = Vec::new();
            if let Some(table) = shard.keyspace(&keyspace) {
                for (key, chain) in table {
                    found.extend(chain.range(lower, hi).map(|(ts, _)| (ts, key.clone())));
                }
            }
            found.sort();
            found.into_iter().map(|(ts, key)| (key, ts))
        });
        Ok(CloseableIter::new(
            iter,
            Some(Arc::clone(&self.cursors)),
            "keyspace_modifications",
        ))
    }

    /// The branch's own entries within `[min_ts, max_ts]`, no lineage
    pub fn all_entries(
        &self,
        branch: &BranchName,
        min_ts: u64,
        max_ts: u64,
    ) -> TempoResult<CloseableIter<TemporalEntry>> {
        check_bounds(min_ts, max_ts)?;
        let shard = self.store.shard(branch)?;
        let mut resume: Option<TemporalKey> = None;
        let iter = Batched::new(self.batch_size, move |size| {
            let batch = shard.read().entries_after(resume.as_ref(), min_ts, max_ts, size);
            if let Some(last) = batch.last() {
                resume = Some(last.key.clone());
            }
            batch
        });
        Ok(CloseableIter::new(iter, Some(Arc::clone(&self.cursors)), "all_entries"))
    }

    /// Number of cursors opened and not yet released
    pub fn open_cursors(&self) -> usize {
        self.cursors.open_cursors()
    }
}

impl std::fmt::Debug for TemporalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporalStore")
            .field("store", &self.store)
            .field("cache", &self.cache)
            .field("horizon", &self.horizon)
            .finish()
    }
}

fn check_bounds(lower: u64, upper: u64) -> TempoResult<()> {
    if lower > upper {
        return Err(TempoError::invalid_range(format!(
            "lower bound {} is greater than upper bound {}",
            lower, upper
        )));
    }
    Ok(())
}

/// Resolve a point read against lineage levels (queried branch first)
fn resolve(levels: &[LineageLevel], key: &QualifiedKey, timestamp: u64) -> (Option<Vec<u8>>, Period) {
    let mut upper = INFINITE;
    for level in levels {
        let cap = timestamp.min(level.visible_upper);
        let shard = level.shard.read();
        let Some(chain) = shard.chain(key) else {
            continue;
        };
        if let Some((start, value)) = chain.latest_at(cap) {
            let end = chain
                .next_after(start)
                .filter(|next| *next <= level.visible_upper)
                .map_or(upper, |next| next.min(upper));
            return (value.clone(), Period::new(start, end));
        }
        if let Some(first) = chain.first_timestamp() {
            if first <= level.visible_upper {
                upper = upper.min(first);
            }
        }
    }
    (None, Period::new(0, upper))
}

/// Lazily scan one version chain in batches, releasing the lock in between
fn scan_chain(
    shard: Arc<RwLock<BranchShard>>,
    key: QualifiedKey,
    lower: u64,
    upper: u64,
    order: Order,
    batch_size: usize,
) -> impl Iterator<Item = u64> + Send {
    let mut resume: Option<u64> = None;
    let mut done = lower > upper;
    Batched::new(batch_size, move |size| {
        if done {
            return Vec::new();
        }
        let (lo, hi) = match (order, resume) {
            (_, None) => (lower, upper),
            (Order::Ascending, Some(last)) => match last.checked_add(1) {
                Some(next) if next <= upper => (next, upper),
                _ => return Vec::new(),
            },
            (Order::Descending, Some(last)) => match last.checked_sub(1) {
                Some(prev) if prev >= lower => (lower, prev),
                _ => return Vec::new(),
            },
        };
        let guard = shard.read();
        let Some(chain) = guard.chain(&key) else {
            done = true;
            return Vec::new();
        };
        let batch: Vec<u64> = match order {
            Order::Ascending => chain.range(lo, hi).map(|(ts, _)| ts).take(size).collect(),
            Order::Descending => chain.range(lo, hi).rev().map(|(ts, _)| ts).take(size).collect(),
        };
        resume = batch.last().copied();
        batch
    })
}
