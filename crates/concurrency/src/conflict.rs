//! Conflict detection and resolution
//!
//! A transaction reads at a fixed timestamp. When it commits, every key it
//! writes is checked against the branch: if the key's latest modification
//! on the branch is newer than the transaction's timestamp, someone else
//! committed that key after the transaction started reading, and the write
//! conflicts.
//!
//! # Strategies
//!
//! - **DoNotMerge**: abort the commit with `CommitConflict`
//! - **OverwriteWithSource**: the transaction's write wins
//! - **OverwriteWithTarget**: the committed value wins, the write is dropped
//! - **Custom**: a [`ConflictResolver`] decides per key

use std::fmt;
use std::sync::Arc;
use tempo_core::{BranchName, QualifiedKey, TempoError, TempoResult};
use tempo_storage::TemporalStore;
use tracing::debug;

use crate::change_set::ChangeSet;

/// A write that collides with a newer committed modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Branch being committed to
    pub branch: BranchName,
    /// Conflicting key
    pub key: QualifiedKey,
    /// Timestamp the transaction reads at
    pub transaction_timestamp: u64,
    /// Timestamp of the newer committed modification
    pub existing_timestamp: u64,
    /// Value committed at `existing_timestamp` (`None` = deleted)
    pub existing_value: Option<Vec<u8>>,
    /// Value the transaction wants to write (`None` = delete)
    pub incoming_value: Option<Vec<u8>>,
}

/// Outcome chosen for one conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write the transaction's value
    KeepIncoming,
    /// Drop the transaction's write
    KeepExisting,
    /// Write this value instead (`None` = delete)
    Replace(Option<Vec<u8>>),
    /// Fail the commit with `CommitConflict`
    Abort,
}

/// User-supplied conflict handling
pub trait ConflictResolver: Send + Sync {
    /// Decide what to do with one conflicting write
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// How commits handle conflicting writes
#[derive(Clone, Default)]
pub enum ConflictResolutionStrategy {
    /// Fail the commit
    #[default]
    DoNotMerge,
    /// The incoming write wins
    OverwriteWithSource,
    /// The committed value wins
    OverwriteWithTarget,
    /// Delegate to a resolver
    Custom(Arc<dyn ConflictResolver>),
}

impl ConflictResolutionStrategy {
    /// Configuration name of the strategy
    pub fn name(&self) -> &'static str {
        match self {
            ConflictResolutionStrategy::DoNotMerge => "do_not_merge",
            ConflictResolutionStrategy::OverwriteWithSource => "overwrite_with_source",
            ConflictResolutionStrategy::OverwriteWithTarget => "overwrite_with_target",
            ConflictResolutionStrategy::Custom(_) => "custom",
        }
    }

    /// Parse a configuration name (custom resolvers are code-only)
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "do_not_merge" => Some(ConflictResolutionStrategy::DoNotMerge),
            "overwrite_with_source" => Some(ConflictResolutionStrategy::OverwriteWithSource),
            "overwrite_with_target" => Some(ConflictResolutionStrategy::OverwriteWithTarget),
            _ => None,
        }
    }

    fn decide(&self, conflict: &Conflict) -> Resolution {
        match self {
            ConflictResolutionStrategy::DoNotMerge => Resolution::Abort,
            ConflictResolutionStrategy::OverwriteWithSource => Resolution::KeepIncoming,
            ConflictResolutionStrategy::OverwriteWithTarget => Resolution::KeepExisting,
            ConflictResolutionStrategy::Custom(resolver) => resolver.resolve(conflict),
        }
    }
}

impl fmt::Debug for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Find every write in `changes` that conflicts on `branch`
///
/// Only modifications at or below `now` (the branch's committed state)
/// are considered.
pub fn detect_conflicts(
    temporal: &TemporalStore,
    branch: &BranchName,
    transaction_timestamp: u64,
    now: u64,
    changes: &ChangeSet,
) -> TempoResult<Vec<Conflict>> {
    let mut conflicts = Vec::new();
    for (key, incoming) in changes.iter() {
        let Some(existing_timestamp) = temporal.last_modification(branch, key, now)? else {
            continue;
        };
        if existing_timestamp > transaction_timestamp {
            conflicts.push(Conflict {
                branch: branch.clone(),
                key: key.clone(),
                transaction_timestamp,
                existing_timestamp,
                existing_value: temporal.get(branch, key, existing_timestamp)?,
                incoming_value: incoming.clone(),
            });
        }
    }
    Ok(conflicts)
}

/// Apply a strategy to detected conflicts, rewriting `changes` in place
///
/// Fails with `CommitConflict` on the first conflict the strategy aborts.
pub fn resolve_conflicts(
    strategy: &ConflictResolutionStrategy,
    conflicts: &[Conflict],
    changes: &mut ChangeSet,
) -> TempoResult<()> {
    for conflict in conflicts {
        let resolution = strategy.decide(conflict);
        debug!(
            target: "tempo::commit",
            key = %conflict.key,
            existing = conflict.existing_timestamp,
            strategy = strategy.name(),
            ?resolution,
            "Resolving write conflict"
        );
        match resolution {
            Resolution::KeepIncoming => {}
            Resolution::KeepExisting => {
                changes.discard(&conflict.key);
            }
            Resolution::Replace(value) => {
                changes.set(conflict.key.clone(), value);
            }
            Resolution::Abort => {
                return Err(TempoError::CommitConflict {
                    branch: conflict.branch.to_string(),
                    keyspace: conflict.key.keyspace.clone(),
                    key: conflict.key.key.clone(),
                    existing_timestamp: conflict.existing_timestamp,
                    transaction_timestamp: conflict.transaction_timestamp,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(key: &str) -> Conflict {
        Conflict {
            branch: BranchName::master(),
            key: QualifiedKey::new("kv", key),
            transaction_timestamp: 100,
            existing_timestamp: 150,
            existing_value: Some(b"theirs".to_vec()),
            incoming_value: Some(b"ours".to_vec()),
        }
    }

    fn changes() -> ChangeSet {
        let mut changes = ChangeSet::new();
        changes.put(QualifiedKey::new("kv", "x"), b"ours".to_vec());
        changes.put(QualifiedKey::new("kv", "y"), b"other".to_vec());
        changes
    }

    struct Concatenate;

    impl ConflictResolver for Concatenate {
        fn resolve(&self, conflict: &Conflict) -> Resolution {
            let mut merged = conflict.existing_value.clone().unwrap_or_default();
            merged.extend(conflict.incoming_value.clone().unwrap_or_default());
            Resolution::Replace(Some(merged))
        }
    }

    #[test]
    fn test_do_not_merge_aborts() {
        let mut changes = changes();
        let err = resolve_conflicts(
            &ConflictResolutionStrategy::DoNotMerge,
            &[conflict("x")],
            &mut changes,
        )
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_overwrite_strategies() {
        let mut source = changes();
        resolve_conflicts(
            &ConflictResolutionStrategy::OverwriteWithSource,
            &[conflict("x")],
            &mut source,
        )
        .unwrap();
        assert_eq!(source.len(), 2);

        let mut target = changes();
        resolve_conflicts(
            &ConflictResolutionStrategy::OverwriteWithTarget,
            &[conflict("x")],
            &mut target,
        )
        .unwrap();
        assert_eq!(target.len(), 1);
        assert!(target.get(&QualifiedKey::new("kv", "x")).is_none());
    }

    #[test]
    fn test_custom_resolver_replaces_value() {
        let mut changes = changes();
        let strategy = ConflictResolutionStrategy::Custom(Arc::new(Concatenate));
        resolve_conflicts(&strategy, &[conflict("x")], &mut changes).unwrap();
        assert_eq!(
            changes.get(&QualifiedKey::new("kv", "x")),
            Some(&Some(b"theirsours".to_vec()))
        );
        assert_eq!(format!("{:?}", strategy), "custom");
    }

    #[test]
    fn test_detect_conflicts_only_sees_committed_state() {
        use tempo_core::{Mutation, TemporalEntry, TemporalKey};
        use tempo_storage::{CursorTracker, QueryCache, ShardedStore};

        let store = Arc::new(ShardedStore::new());
        for ts in [50, 150, 300] {
            store
                .apply(&Mutation::PutEntries {
                    branch: BranchName::master(),
                    entries: vec![TemporalEntry::new(TemporalKey::new("kv", "x", ts), b"v".to_vec())],
                })
                .unwrap();
        }
        // the entry at 300 belongs to a commit that has not advanced `now`
        store
            .apply(&Mutation::SetNow {
                branch: BranchName::master(),
                now: 200,
            })
            .unwrap();
        let temporal = TemporalStore::new(
            store,
            Arc::new(QueryCache::disabled()),
            Arc::new(CursorTracker::new()),
        );

        let changes = changes();
        let found = detect_conflicts(&temporal, &BranchName::master(), 100, 200, &changes).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].existing_timestamp, 150);

        let none = detect_conflicts(&temporal, &BranchName::master(), 150, 200, &changes).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for name in ["do_not_merge", "overwrite_with_source", "overwrite_with_target"] {
            assert_eq!(ConflictResolutionStrategy::from_name(name).unwrap().name(), name);
        }
        assert!(ConflictResolutionStrategy::from_name("custom").is_none());
    }
}
