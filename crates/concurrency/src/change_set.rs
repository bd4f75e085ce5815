//! Buffered transaction writes
//!
//! A transaction buffers its writes in a [`ChangeSet`] until commit. The
//! last write to a key wins; a `None` value is a delete (tombstone).
//!
//! At commit the change set goes through:
//! 1. duplicate-version elimination (writes that would not change what a
//!    reader sees are dropped)
//! 2. conflict detection and resolution
//! 3. materialization into `TemporalEntry`s at the commit timestamp

use std::collections::{BTreeMap, BTreeSet};
use tempo_core::{BranchName, QualifiedKey, TemporalEntry, TempoResult};
use tempo_storage::TemporalStore;

/// Buffered writes of a transaction, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    writes: BTreeMap<QualifiedKey, Option<Vec<u8>>>,
}

impl ChangeSet {
    /// Create an empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a value
    pub fn put(&mut self, key: QualifiedKey, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    /// Buffer a delete
    pub fn remove(&mut self, key: QualifiedKey) {
        self.writes.insert(key, None);
    }

    /// Buffer a value or a delete
    pub fn set(&mut self, key: QualifiedKey, value: Option<Vec<u8>>) {
        self.writes.insert(key, value);
    }

    /// Drop the buffered write of a key
    pub fn discard(&mut self, key: &QualifiedKey) -> Option<Option<Vec<u8>>> {
        self.writes.remove(key)
    }

    /// Buffered write of a key (`Some(None)` is a buffered delete)
    pub fn get(&self, key: &QualifiedKey) -> Option<&Option<Vec<u8>>> {
        self.writes.get(key)
    }

    /// Number of buffered writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Buffered writes, ordered by key
    pub fn iter(&self) -> impl Iterator<Item = (&QualifiedKey, &Option<Vec<u8>>)> + '_ {
        self.writes.iter()
    }

    /// Keyspaces touched by the buffered writes
    pub fn keyspaces(&self) -> BTreeSet<String> {
        self.writes.keys().map(|k| k.keyspace.clone()).collect()
    }

    /// Take the buffered writes, leaving the set empty
    pub fn take(&mut self) -> ChangeSet {
        std::mem::take(self)
    }

    /// Clear every buffered write
    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Materialize the writes as entries at `timestamp`
    pub fn to_entries(&self, timestamp: u64) -> Vec<TemporalEntry> {
        self.writes
            .iter()
            .map(|(key, value)| TemporalEntry {
                key: key.at(timestamp),
                value: value.clone(),
            })
            .collect()
    }
}

/// When writes that do not change visible state are dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateVersionElimination {
    /// Every write is stored
    Disabled,
    /// Drop duplicates synchronously during commit
    #[default]
    OnCommit,
}

impl DuplicateVersionElimination {
    /// Configuration name of the mode
    pub fn name(&self) -> &'static str {
        match self {
            DuplicateVersionElimination::Disabled => "disabled",
            DuplicateVersionElimination::OnCommit => "on_commit",
        }
    }

    /// Parse a configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "disabled" => Some(DuplicateVersionElimination::Disabled),
            "on_commit" => Some(DuplicateVersionElimination::OnCommit),
            _ => None,
        }
    }
}

/// Drop writes that equal the latest visible value of their key
///
/// A write is a duplicate if its value equals what a reader at `now`
/// sees, or if it deletes a key that has no visible value. Returns the
/// number of writes dropped.
pub fn eliminate_duplicates(
    temporal: &TemporalStore,
    branch: &BranchName,
    now: u64,
    changes: &mut ChangeSet,
) -> TempoResult<usize> {
    let mut duplicates = Vec::new();
    for (key, incoming) in changes.iter() {
        let visible = temporal.get(branch, key, now)?;
        if &visible == incoming {
            duplicates.push(key.clone());
        }
    }
    for key in &duplicates {
        changes.discard(key);
    }
    Ok(duplicates.len())
}

/// Life cycle of a transaction's commit
///
/// `Idle → Staged → Committing → Committed | Aborted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No writes buffered yet
    Idle,
    /// Writes are buffered
    Staged,
    /// Commit in progress (incremental commits stay here between batches)
    Committing,
    /// Commit finished
    Committed,
    /// Rolled back or failed
    Aborted,
}

impl TransactionState {
    /// Whether writes may still be buffered
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            TransactionState::Idle | TransactionState::Staged | TransactionState::Committing
        )
    }

    /// Whether the transaction is finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempo_core::{Mutation, TemporalKey};
    use tempo_storage::{CursorTracker, QueryCache, ShardedStore};

    fn qk(k: &str) -> QualifiedKey {
        QualifiedKey::new("kv", k)
    }

    #[test]
    fn test_last_write_wins() {
        let mut changes = ChangeSet::new();
        changes.put(qk("x"), b"1".to_vec());
        changes.remove(qk("x"));
        changes.put(QualifiedKey::new("other", "y"), b"2".to_vec());
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.get(&qk("x")), Some(&None));

        let entries = changes.to_entries(42);
        assert!(entries.iter().all(|e| e.key.timestamp == 42));
        assert_eq!(changes.keyspaces().len(), 2);

        let taken = changes.take();
        assert!(changes.is_empty());
        assert_eq!(taken.len(), 2);
    }

    #[test]
    fn test_eliminate_duplicates() {
        let store = Arc::new(ShardedStore::new());
        store
            .apply(&Mutation::PutEntries {
                branch: BranchName::master(),
                entries: vec![TemporalEntry::new(TemporalKey::new("kv", "x", 10), b"same".to_vec())],
            })
            .unwrap();
        store
            .apply(&Mutation::SetNow {
                branch: BranchName::master(),
                now: 10,
            })
            .unwrap();
        let temporal = TemporalStore::new(
            store,
            Arc::new(QueryCache::disabled()),
            Arc::new(CursorTracker::new()),
        );

        let mut changes = ChangeSet::new();
        changes.put(qk("x"), b"same".to_vec());
        changes.remove(qk("missing"));
        changes.put(qk("y"), b"new".to_vec());
        let dropped = eliminate_duplicates(&temporal, &BranchName::master(), 10, &mut changes).unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(changes.len(), 1);
        assert!(changes.get(&qk("y")).is_some());
    }

    #[test]
    fn test_state_transitions() {
        assert!(TransactionState::Idle.accepts_writes());
        assert!(!TransactionState::Committed.accepts_writes());
        assert!(TransactionState::Aborted.is_terminal());
        assert_eq!(
            DuplicateVersionElimination::from_name("on_commit"),
            Some(DuplicateVersionElimination::OnCommit)
        );
        assert_eq!(DuplicateVersionElimination::Disabled.name(), "disabled");
    }
}
