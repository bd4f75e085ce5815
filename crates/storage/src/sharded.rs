//! Sharded per-branch tables
//!
//! Each branch gets its own shard holding the persisted state of that
//! branch: the entry table, the commit table, keyspace creation records,
//! the branch metadata (including `now`) and an optional in-flight commit
//! marker.
//!
//! # Design
//!
//! - DashMap keyed by branch name: branches never contend on the map itself
//! - One `RwLock` per shard: readers of a branch proceed in parallel, a
//!   writer only blocks its own branch
//! - BTreeMaps inside the shard: every query is an ordered range scan over
//!   `(keyspace, key, timestamp)` or over commit timestamps
//!
//! All writes go through [`ShardedStore::apply`], which interprets one
//! [`Mutation`]. Mutations are idempotent so journal replay can apply a
//! record that already reached the tables without changing the outcome.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use tempo_core::{
    BranchInfo, BranchName, CommitMarker, Mutation, QualifiedKey, TemporalEntry, TemporalKey,
    TempoError, TempoResult,
};
use tracing::trace;

use crate::commit_table::CommitTable;

/// Version chain of one key: timestamp → value (`None` = tombstone)
///
/// Dateback may insert or remove versions at arbitrary timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionChain {
    versions: BTreeMap<u64, Option<Vec<u8>>>,
}

impl VersionChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the version at `timestamp`
    #[inline]
    pub fn put(&mut self, timestamp: u64, value: Option<Vec<u8>>) {
        self.versions.insert(timestamp, value);
    }

    /// Remove the version at `timestamp`, returning whether it existed
    #[inline]
    pub fn remove(&mut self, timestamp: u64) -> bool {
        self.versions.remove(&timestamp).is_some()
    }

    /// Version at exactly `timestamp`
    pub fn get_exact(&self, timestamp: u64) -> Option<&Option<Vec<u8>>> {
        self.versions.get(&timestamp)
    }

    /// Latest version at or before `max_timestamp`
    pub fn latest_at(&self, max_timestamp: u64) -> Option<(u64, &Option<Vec<u8>>)> {
        self.versions
            .range(..=max_timestamp)
            .next_back()
            .map(|(ts, v)| (*ts, v))
    }

    /// Earliest timestamp strictly after `timestamp`
    pub fn next_after(&self, timestamp: u64) -> Option<u64> {
        self.versions
            .range((Bound::Excluded(timestamp), Bound::Unbounded))
            .next()
            .map(|(ts, _)| *ts)
    }

    /// Earliest stored timestamp
    pub fn first_timestamp(&self) -> Option<u64> {
        self.versions.keys().next().copied()
    }

    /// Latest stored version
    pub fn latest(&self) -> Option<(u64, &Option<Vec<u8>>)> {
        self.versions.iter().next_back().map(|(ts, v)| (*ts, v))
    }

    /// Versions with `lower <= timestamp <= upper`, ascending
    pub fn range(
        &self,
        lower: u64,
        upper: u64,
    ) -> impl DoubleEndedIterator<Item = (u64, &Option<Vec<u8>>)> + '_ {
        let bounds = if lower <= upper {
            (Bound::Included(lower), Bound::Included(upper))
        } else {
            (Bound::Included(0), Bound::Excluded(0))
        };
        self.versions.range(bounds).map(|(ts, v)| (*ts, v))
    }

    /// Number of versions stored
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Whether the chain holds no versions
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// All versions, ascending
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, &Option<Vec<u8>>)> + '_ {
        self.versions.iter().map(|(ts, v)| (*ts, v))
    }
}

/// All version chains of one keyspace, ordered by key
pub type KeyspaceTable = BTreeMap<String, VersionChain>;

/// Persisted state of one branch
#[derive(Debug)]
pub struct BranchShard {
    /// Branch metadata, including `now`
    pub(crate) info: BranchInfo,
    /// keyspace → key → versions
    pub(crate) entries: BTreeMap<String, KeyspaceTable>,
    /// Commit records of this branch
    pub(crate) commits: CommitTable,
    /// keyspace → creation timestamp
    pub(crate) keyspaces: BTreeMap<String, u64>,
    /// Present while a commit is in flight
    pub(crate) marker: Option<CommitMarker>,
}

impl BranchShard {
    /// Create an empty shard for a branch
    pub fn new(info: BranchInfo) -> Self {
        BranchShard {
            info,
            entries: BTreeMap::new(),
            commits: CommitTable::new(),
            keyspaces: BTreeMap::new(),
            marker: None,
        }
    }

    /// Branch metadata
    pub fn info(&self) -> &BranchInfo {
        &self.info
    }

    /// Commit table
    pub fn commits(&self) -> &CommitTable {
        &self.commits
    }

    /// In-flight commit marker, if any
    pub fn marker(&self) -> Option<&CommitMarker> {
        self.marker.as_ref()
    }

    /// Keyspace creation records
    pub fn keyspaces(&self) -> &BTreeMap<String, u64> {
        &self.keyspaces
    }

    /// Version chain of a key
    pub fn chain(&self, key: &QualifiedKey) -> Option<&VersionChain> {
        self.entries.get(&key.keyspace)?.get(&key.key)
    }

    /// All chains of a keyspace
    pub fn keyspace(&self, keyspace: &str) -> Option<&KeyspaceTable> {
        self.entries.get(keyspace)
    }

    /// Value at exactly a coordinate (`Some(None)` is a stored tombstone)
    pub fn entry(&self, key: &TemporalKey) -> Option<&Option<Vec<u8>>> {
        self.entries
            .get(&key.keyspace)?
            .get(&key.key)?
            .get_exact(key.timestamp)
    }

    /// Whether a coordinate exists
    pub fn contains(&self, key: &TemporalKey) -> bool {
        self.entry(key).is_some()
    }

    /// Every stored entry, ordered by `(keyspace, key, timestamp)`
    pub fn iter_entries(&self) -> impl Iterator<Item = TemporalEntry> + '_ {
        self.entries.iter().flat_map(|(keyspace, table)| {
            table.iter().flat_map(move |(key, chain)| {
                chain.iter().map(move |(ts, value)| TemporalEntry {
                    key: TemporalKey::new(keyspace.clone(), key.clone(), ts),
                    value: value.clone(),
                })
            })
        })
    }

    /// Up to `limit` entries in `[min_ts, max_ts]` ordered after `after`
    ///
    /// Order is `(keyspace, key, timestamp)`. Used by batched dump scans to
    /// resume where the previous batch stopped.
    pub fn entries_after(
        &self,
        after: Option<&TemporalKey>,
        min_ts: u64,
        max_ts: u64,
        limit: usize,
    ) -> Vec<TemporalEntry> {
        let mut result = Vec::new();
        if limit == 0 || min_ts > max_ts {
            return result;
        }
        let keyspace_start = match after {
            Some(k) => Bound::Included(k.keyspace.clone()),
            None => Bound::Unbounded,
        };
        for (keyspace, table) in self
            .entries
            .range::<String, _>((keyspace_start, Bound::Unbounded))
        {
            let key_start = match after {
                Some(k) if &k.keyspace == keyspace => Bound::Included(k.key.clone()),
                _ => Bound::Unbounded,
            };
            for (key, chain) in table.range::<String, _>((key_start, Bound::Unbounded)) {
                let floor = match after {
                    Some(k) if &k.keyspace == keyspace && &k.key == key => {
                        match k.timestamp.checked_add(1) {
                            Some(next) => next.max(min_ts),
                            None => continue,
                        }
                    }
                    _ => min_ts,
                };
                for (ts, value) in chain.range(floor, max_ts) {
                    result.push(TemporalEntry {
                        key: TemporalKey::new(keyspace.clone(), key.clone(), ts),
                        value: value.clone(),
                    });
                    if result.len() >= limit {
                        return result;
                    }
                }
            }
        }
        result
    }

    /// Every entry stored at exactly `timestamp`
    pub fn entries_at(&self, timestamp: u64) -> Vec<TemporalEntry> {
        let mut result = Vec::new();
        for (keyspace, table) in &self.entries {
            for (key, chain) in table {
                if let Some(value) = chain.get_exact(timestamp) {
                    result.push(TemporalEntry {
                        key: TemporalKey::new(keyspace.clone(), key.clone(), timestamp),
                        value: value.clone(),
                    });
                }
            }
        }
        result
    }

    /// Every coordinate stored strictly after `timestamp`
    pub fn keys_after(&self, timestamp: u64) -> Vec<TemporalKey> {
        let mut result = Vec::new();
        for (keyspace, table) in &self.entries {
            for (key, chain) in table {
                for (ts, _) in chain.range(timestamp.saturating_add(1), u64::MAX) {
                    if ts > timestamp {
                        result.push(TemporalKey::new(keyspace.clone(), key.clone(), ts));
                    }
                }
            }
        }
        result
    }

    /// Earliest entry timestamp in a keyspace
    pub fn earliest_in_keyspace(&self, keyspace: &str) -> Option<u64> {
        self.entries
            .get(keyspace)?
            .values()
            .filter_map(|chain| chain.first_timestamp())
            .min()
    }

    /// Keyspaces holding at least one entry
    pub fn entry_keyspaces(&self) -> impl Iterator<Item = &String> + '_ {
        self.entries.keys()
    }

    /// Distinct entry timestamps at or after `min_ts`
    pub fn timestamps_from(&self, min_ts: u64) -> BTreeSet<u64> {
        self.entries
            .values()
            .flat_map(|table| table.values())
            .flat_map(|chain| chain.range(min_ts, u64::MAX).map(|(ts, _)| ts))
            .collect()
    }

    /// Total number of stored versions
    pub fn entry_count(&self) -> usize {
        self.entries
            .values()
            .flat_map(|table| table.values())
            .map(|chain| chain.version_count())
            .sum()
    }

    fn put_entry(&mut self, entry: &TemporalEntry) {
        self.entries
            .entry(entry.key.keyspace.clone())
            .or_default()
            .entry(entry.key.key.clone())
            .or_default()
            .put(entry.key.timestamp, entry.value.clone());
    }

    fn remove_entry(&mut self, key: &TemporalKey) {
        let Some(table) = self.entries.get_mut(&key.keyspace) else {
            return;
        };
        if let Some(chain) = table.get_mut(&key.key) {
            chain.remove(key.timestamp);
            if chain.is_empty() {
                table.remove(&key.key);
            }
        }
        if table.is_empty() {
            self.entries.remove(&key.keyspace);
        }
    }
}

/// Sharded storage - DashMap by branch, BTreeMaps within
///
/// # Thread Safety
///
/// All operations are thread-safe. Shards are handed out as
/// `Arc<RwLock<BranchShard>>` so long-running iterators can keep reading a
/// branch (in batches) without holding a map guard.
pub struct ShardedStore {
    shards: DashMap<BranchName, Arc<RwLock<BranchShard>>>,
}

impl ShardedStore {
    /// Create an empty store containing only the root branch
    pub fn new() -> Self {
        let store = ShardedStore {
            shards: DashMap::new(),
        };
        let master = BranchInfo::master();
        store
            .shards
            .insert(master.name.clone(), Arc::new(RwLock::new(BranchShard::new(master))));
        store
    }

    /// Shard of a branch
    pub fn shard(&self, branch: &BranchName) -> TempoResult<Arc<RwLock<BranchShard>>> {
        self.shards
            .get(branch)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TempoError::branch_not_found(branch.as_str()))
    }

    /// Whether a branch exists
    pub fn has_branch(&self, branch: &BranchName) -> bool {
        self.shards.contains_key(branch)
    }

    /// Metadata of a branch
    pub fn info(&self, branch: &BranchName) -> TempoResult<BranchInfo> {
        Ok(self.shard(branch)?.read().info.clone())
    }

    /// Metadata of every branch (unordered)
    pub fn infos(&self) -> Vec<BranchInfo> {
        self.shards
            .iter()
            .map(|entry| entry.value().read().info.clone())
            .collect()
    }

    /// Number of branches
    pub fn branch_count(&self) -> usize {
        self.shards.len()
    }

    /// Branches carrying an in-flight commit marker
    pub fn branches_with_marker(&self) -> Vec<(BranchName, CommitMarker)> {
        self.shards
            .iter()
            .filter_map(|entry| {
                let shard = entry.value().read();
                shard
                    .marker
                    .clone()
                    .map(|marker| (entry.key().clone(), marker))
            })
            .collect()
    }

    /// Total number of stored versions across branches
    pub fn total_entries(&self) -> usize {
        self.shards
            .iter()
            .map(|entry| entry.value().read().entry_count())
            .sum()
    }

    /// Apply one mutation to the tables
    ///
    /// Fails only if the target branch does not exist (or, for branch
    /// creation, its parent does not).
    pub fn apply(&self, mutation: &Mutation) -> TempoResult<()> {
        trace!(target: "tempo::storage", kind = mutation.kind(), branch = %mutation.branch(), "apply");
        match mutation {
            Mutation::CreateBranch(info) => {
                if let Some(parent) = &info.parent {
                    if !self.has_branch(parent) {
                        return Err(TempoError::branch_not_found(parent.as_str()));
                    }
                }
                match self.shards.get(&info.name) {
                    Some(existing) => existing.value().write().info = info.clone(),
                    None => {
                        self.shards.insert(
                            info.name.clone(),
                            Arc::new(RwLock::new(BranchShard::new(info.clone()))),
                        );
                    }
                }
            }
            Mutation::RemoveBranch(branch) => {
                self.shards.remove(branch);
            }
            Mutation::SetNow { branch, now } => {
                self.shard(branch)?.write().info.now = *now;
            }
            Mutation::PutEntries { branch, entries } => {
                let shard = self.shard(branch)?;
                let mut shard = shard.write();
                for entry in entries {
                    shard.put_entry(entry);
                }
            }
            Mutation::RemoveEntries { branch, keys } => {
                let shard = self.shard(branch)?;
                let mut shard = shard.write();
                for key in keys {
                    shard.remove_entry(key);
                }
            }
            Mutation::PutCommit { branch, record } => {
                self.shard(branch)?.write().commits.put(record.clone());
            }
            Mutation::RemoveCommit { branch, timestamp } => {
                self.shard(branch)?.write().commits.remove(*timestamp);
            }
            Mutation::SetKeyspaceCreation {
                branch,
                keyspace,
                timestamp,
            } => {
                self.shard(branch)?
                    .write()
                    .keyspaces
                    .insert(keyspace.clone(), *timestamp);
            }
            Mutation::RemoveKeyspace { branch, keyspace } => {
                self.shard(branch)?.write().keyspaces.remove(keyspace);
            }
            Mutation::BeginCommit { branch, marker } => {
                self.shard(branch)?.write().marker = Some(marker.clone());
            }
            Mutation::EndCommit { branch } => {
                self.shard(branch)?.write().marker = None;
            }
        }
        Ok(())
    }

    /// Drop every branch and start over with an empty root
    pub fn reset(&self) {
        self.shards.clear();
        let master = BranchInfo::master();
        self.shards
            .insert(master.name.clone(), Arc::new(RwLock::new(BranchShard::new(master))));
    }
}

impl Default for ShardedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("branch_count", &self.branch_count())
            .field("total_entries", &self.total_entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::CommitRecord;

    fn put(store: &ShardedStore, keyspace: &str, key: &str, ts: u64, value: Option<&[u8]>) {
        store
            .apply(&Mutation::PutEntries {
                branch: BranchName::master(),
                entries: vec![TemporalEntry {
                    key: TemporalKey::new(keyspace, key, ts),
                    value: value.map(|v| v.to_vec()),
                }],
            })
            .unwrap();
    }

    #[test]
    fn test_version_chain_lookup() {
        let mut chain = VersionChain::new();
        chain.put(100, Some(b"a".to_vec()));
        chain.put(200, None);
        chain.put(300, Some(b"c".to_vec()));

        assert!(chain.latest_at(99).is_none());
        assert_eq!(chain.latest_at(150).map(|(ts, _)| ts), Some(100));
        assert_eq!(chain.latest_at(200), Some((200, &None)));
        assert_eq!(chain.next_after(100), Some(200));
        assert_eq!(chain.next_after(300), None);
        assert_eq!(
            chain.range(100, 250).map(|(ts, _)| ts).collect::<Vec<_>>(),
            vec![100, 200]
        );
        assert_eq!(chain.range(250, 100).count(), 0);
    }

    #[test]
    fn test_new_store_has_master() {
        let store = ShardedStore::new();
        assert!(store.has_branch(&BranchName::master()));
        assert_eq!(store.branch_count(), 1);
    }

    #[test]
    fn test_put_and_remove_entries() {
        let store = ShardedStore::new();
        put(&store, "kv", "x", 100, Some(b"a1"));
        put(&store, "kv", "x", 200, None);
        assert_eq!(store.total_entries(), 2);

        store
            .apply(&Mutation::RemoveEntries {
                branch: BranchName::master(),
                keys: vec![
                    TemporalKey::new("kv", "x", 100),
                    TemporalKey::new("kv", "x", 200),
                ],
            })
            .unwrap();
        assert_eq!(store.total_entries(), 0);

        let shard = store.shard(&BranchName::master()).unwrap();
        assert!(shard.read().keyspace("kv").is_none());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let store = ShardedStore::new();
        put(&store, "kv", "x", 100, Some(b"a1"));
        put(&store, "kv", "x", 100, Some(b"a1"));
        let commit = Mutation::PutCommit {
            branch: BranchName::master(),
            record: CommitRecord::new(100, None),
        };
        store.apply(&commit).unwrap();
        store.apply(&commit).unwrap();

        let shard = store.shard(&BranchName::master()).unwrap();
        let shard = shard.read();
        assert_eq!(shard.entry_count(), 1);
        assert_eq!(shard.commits().len(), 1);
    }

    #[test]
    fn test_create_branch_requires_parent() {
        let store = ShardedStore::new();
        let orphan = BranchInfo::child(
            BranchName::new("orphan").unwrap(),
            BranchName::new("missing").unwrap(),
            0,
        );
        let err = store.apply(&Mutation::CreateBranch(orphan)).unwrap_err();
        assert!(matches!(err, TempoError::BranchNotFound { .. }));
    }

    #[test]
    fn test_keys_after_and_entries_at() {
        let store = ShardedStore::new();
        put(&store, "kv", "a", 100, Some(b"1"));
        put(&store, "kv", "b", 200, Some(b"2"));
        put(&store, "other", "c", 200, None);

        let shard = store.shard(&BranchName::master()).unwrap();
        let shard = shard.read();
        assert_eq!(shard.keys_after(100).len(), 2);
        assert_eq!(shard.entries_at(200).len(), 2);
        assert_eq!(shard.earliest_in_keyspace("kv"), Some(100));
    }

    #[test]
    fn test_entries_after_resumes() {
        let store = ShardedStore::new();
        put(&store, "a", "k1", 10, Some(b"1"));
        put(&store, "a", "k1", 20, Some(b"2"));
        put(&store, "a", "k2", 10, Some(b"3"));
        put(&store, "b", "k1", 30, None);

        let shard = store.shard(&BranchName::master()).unwrap();
        let shard = shard.read();
        let first = shard.entries_after(None, 0, u64::MAX, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].key, TemporalKey::new("a", "k1", 20));
        let rest = shard.entries_after(Some(&first[1].key), 0, u64::MAX, 10);
        let keys: Vec<TemporalKey> = rest.into_iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![TemporalKey::new("a", "k2", 10), TemporalKey::new("b", "k1", 30)]
        );
        assert_eq!(shard.entries_after(None, 15, 25, 10).len(), 1);
    }

    #[test]
    fn test_marker_roundtrip() {
        let store = ShardedStore::new();
        store
            .apply(&Mutation::BeginCommit {
                branch: BranchName::master(),
                marker: CommitMarker {
                    timestamp: 10,
                    previous_now: 0,
                    incremental: false,
                },
            })
            .unwrap();
        assert_eq!(store.branches_with_marker().len(), 1);
        store
            .apply(&Mutation::EndCommit {
                branch: BranchName::master(),
            })
            .unwrap();
        assert!(store.branches_with_marker().is_empty());
    }
}
