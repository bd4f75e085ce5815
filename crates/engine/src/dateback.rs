//! Dateback: rewriting committed history
//!
//! Dateback operations bypass transactions and edit a branch's own tables
//! directly: physical purges, injections at exact timestamps and pure
//! transformations of stored values. They run inside
//! [`Database::dateback`], which holds the branch lock for the whole
//! closure and runs [cleanup](Dateback::cleanup) at the end.
//!
//! # Guardrails
//!
//! - no timestamp at or before a child branch's branching timestamp (that
//!   history belongs to the parent)
//! - no timestamp after the clock's now
//!
//! Every operation validates all of its input before the first mutation
//! and returns the exact set of coordinates it touched.
//!
//! # Cleanup
//!
//! Invalidates cached periods of the branch and its descendants, recomputes
//! keyspace creation timestamps from the remaining entries, drops commit
//! records left without entries and notifies change consumers.

use std::collections::{BTreeMap, BTreeSet};
use tempo_core::{
    BranchInfo, BranchName, CommitRecord, Mutation, QualifiedKey, TemporalEntry, TemporalKey, TempoError,
    TempoResult,
};
use tracing::{debug, info};

use crate::database::Database;

/// Result of a transformation function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformation {
    /// Keep the stored value
    Unchanged,
    /// Store this value
    Value(Vec<u8>),
    /// Store a tombstone
    Tombstone,
}

impl Transformation {
    fn into_value(self) -> Option<Option<Vec<u8>>> {
        match self {
            Transformation::Unchanged => None,
            Transformation::Value(value) => Some(Some(value)),
            Transformation::Tombstone => Some(None),
        }
    }
}

/// Values of one commit, keyed by coordinate (`None` = tombstone)
pub type CommitContents = BTreeMap<QualifiedKey, Option<Vec<u8>>>;

/// Dateback session on one branch
///
/// Obtained through [`Database::dateback`].
pub struct Dateback<'db> {
    db: &'db Database,
    info: BranchInfo,
    earliest_touched: Option<u64>,
    affected: BTreeSet<TemporalKey>,
}

impl Database {
    /// Run dateback operations on `branch`
    ///
    /// The branch lock is held while `f` runs; cleanup runs afterwards
    /// even when `f` fails part way.
    pub fn dateback<F, T>(&self, branch: &BranchName, f: F) -> TempoResult<T>
    where
        F: FnOnce(&mut Dateback<'_>) -> TempoResult<T>,
    {
        self.check_writable("dateback")?;
        let _guard = self.locks().branch(branch)?;
        if self.coordinator().has_open_incremental(branch) {
            return Err(TempoError::invalid_operation(format!(
                "branch '{}' has an open incremental commit",
                branch
            )));
        }
        self.coordinator().recover_branch(self, branch)?;

        let mut dateback = Dateback {
            db: self,
            info: self.branch(branch)?,
            earliest_touched: None,
            affected: BTreeSet::new(),
        };
        let result = f(&mut dateback);
        let cleanup = dateback.cleanup();
        let value = result?;
        cleanup?;
        Ok(value)
    }

    /// Run dateback cleanup on `branch` as if history from `earliest_touched` changed
    pub fn dateback_cleanup(&self, branch: &BranchName, earliest_touched: u64) -> TempoResult<()> {
        self.check_writable("dateback")?;
        let _guard = self.locks().branch(branch)?;
        cleanup_branch(self, branch, earliest_touched, &BTreeSet::new())
    }
}

impl<'db> Dateback<'db> {
    /// Branch being rewritten
    pub fn branch(&self) -> &BranchName {
        &self.info.name
    }

    /// Every coordinate touched so far in this session
    pub fn affected(&self) -> &BTreeSet<TemporalKey> {
        &self.affected
    }

    // ========================================================================
    // Injection
    // ========================================================================

    /// Write `value` (`None` = tombstone) at exactly `timestamp`
    pub fn inject(
        &mut self,
        keyspace: &str,
        key: &str,
        timestamp: u64,
        value: Option<Vec<u8>>,
    ) -> TempoResult<BTreeSet<TemporalKey>> {
        let entry = TemporalEntry {
            key: TemporalKey::new(keyspace, key, timestamp),
            value,
        };
        self.inject_entries(vec![entry], None, false)
    }

    /// Write one value and attach commit metadata
    ///
    /// Metadata of an existing commit at `timestamp` is only replaced when
    /// `override_metadata` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn inject_with_metadata(
        &mut self,
        keyspace: &str,
        key: &str,
        timestamp: u64,
        value: Option<Vec<u8>>,
        metadata: Option<Vec<u8>>,
        override_metadata: bool,
    ) -> TempoResult<BTreeSet<TemporalKey>> {
        let entry = TemporalEntry {
            key: TemporalKey::new(keyspace, key, timestamp),
            value,
        };
        self.inject_entries(vec![entry], metadata, override_metadata)
    }

    /// Write many entries at their exact timestamps
    ///
    /// Creates missing commit records (carrying `metadata`), lowers
    /// keyspace creation timestamps and moves the branch's `now` forward
    /// to the latest injected timestamp.
    pub fn inject_entries(
        &mut self,
        entries: Vec<TemporalEntry>,
        metadata: Option<Vec<u8>>,
        override_metadata: bool,
    ) -> TempoResult<BTreeSet<TemporalKey>> {
        for entry in &entries {
            if entry.key.keyspace.is_empty() || entry.key.key.is_empty() {
                return Err(TempoError::invalid_argument("keyspace and key must not be empty"));
            }
            self.check_timestamp(entry.key.timestamp)?;
        }
        if entries.is_empty() {
            return Ok(BTreeSet::new());
        }

        let branch = self.info.name.clone();
        let mut mutations = Vec::new();
        let mut keyspace_floor: BTreeMap<String, u64> = BTreeMap::new();
        let mut timestamps = BTreeSet::new();
        for entry in &entries {
            let floor = keyspace_floor
                .entry(entry.key.keyspace.clone())
                .or_insert(entry.key.timestamp);
            *floor = (*floor).min(entry.key.timestamp);
            timestamps.insert(entry.key.timestamp);
        }

        {
            let shard = self.db.store().shard(&branch)?;
            let shard = shard.read();
            for (keyspace, floor) in &keyspace_floor {
                let lower = match shard.keyspaces().get(keyspace) {
                    Some(created) => floor < created,
                    None => true,
                };
                if lower {
                    mutations.push(Mutation::SetKeyspaceCreation {
                        branch: branch.clone(),
                        keyspace: keyspace.clone(),
                        timestamp: *floor,
                    });
                }
            }
            for &timestamp in &timestamps {
                let record = match shard.commits().get(timestamp) {
                    None => Some(CommitRecord::new(
                        timestamp,
                        self.db.listeners().filter_metadata(&branch, timestamp, metadata.clone()),
                    )),
                    Some(existing) if override_metadata => Some(CommitRecord {
                        metadata: self.db.listeners().filter_metadata(&branch, timestamp, metadata.clone()),
                        ..existing.clone()
                    }),
                    Some(_) => None,
                };
                if let Some(record) = record {
                    mutations.push(Mutation::PutCommit {
                        branch: branch.clone(),
                        record,
                    });
                }
            }
        }

        let affected: BTreeSet<TemporalKey> = entries.iter().map(|e| e.key.clone()).collect();
        let latest = timestamps.iter().next_back().copied().unwrap_or(0);
        mutations.insert(
            0,
            Mutation::PutEntries {
                branch: branch.clone(),
                entries,
            },
        );
        if latest > self.info.now {
            mutations.push(Mutation::SetNow {
                branch: branch.clone(),
                now: latest,
            });
        }
        self.db.persist(&mutations)?;
        if latest > self.info.now {
            self.info.now = latest;
        }
        self.record("inject", &affected);
        Ok(affected)
    }

    // ========================================================================
    // Purges
    // ========================================================================

    /// Physically delete the entry at `keyspace/key@timestamp`
    pub fn purge_entry(&mut self, keyspace: &str, key: &str, timestamp: u64) -> TempoResult<BTreeSet<TemporalKey>> {
        let coordinate = TemporalKey::new(keyspace, key, timestamp);
        let exists = self.shard_read(|shard| shard.contains(&coordinate))?;
        let keys = if exists { vec![coordinate] } else { Vec::new() };
        self.remove("purge_entry", keys)
    }

    /// Physically delete every version of `keyspace/key`
    pub fn purge_key(&mut self, keyspace: &str, key: &str) -> TempoResult<BTreeSet<TemporalKey>> {
        self.purge_key_where(keyspace, key, |_, _| true)
    }

    /// Physically delete the versions of `keyspace/key` matching `predicate`
    ///
    /// The predicate sees the timestamp and the stored value (`None` =
    /// tombstone).
    pub fn purge_key_where<P>(&mut self, keyspace: &str, key: &str, mut predicate: P) -> TempoResult<BTreeSet<TemporalKey>>
    where
        P: FnMut(u64, Option<&[u8]>) -> bool,
    {
        let qualified = QualifiedKey::new(keyspace, key);
        let versions: Vec<(u64, Option<Vec<u8>>)> = self.shard_read(|shard| {
            shard
                .chain(&qualified)
                .map(|chain| chain.iter().map(|(ts, v)| (ts, v.clone())).collect())
                .unwrap_or_default()
        })?;
        let keys = versions
            .into_iter()
            .filter(|(ts, value)| predicate(*ts, value.as_deref()))
            .map(|(ts, _)| qualified.at(ts))
            .collect();
        self.remove("purge_key", keys)
    }

    /// Physically delete every entry of `keyspace` within `[lower, upper]`
    pub fn purge_keyspace(&mut self, keyspace: &str, lower: u64, upper: u64) -> TempoResult<BTreeSet<TemporalKey>> {
        if lower > upper {
            return Err(TempoError::invalid_range(format!(
                "lower bound {} is greater than upper bound {}",
                lower, upper
            )));
        }
        let keys = self.shard_read(|shard| {
            let mut keys = Vec::new();
            if let Some(table) = shard.keyspace(keyspace) {
                for (key, chain) in table {
                    keys.extend(
                        chain
                            .range(lower, upper)
                            .map(|(ts, _)| TemporalKey::new(keyspace, key.clone(), ts)),
                    );
                }
            }
            keys
        })?;
        self.remove("purge_keyspace", keys)
    }

    /// Delete the commit at `timestamp` with every entry it wrote
    pub fn purge_commit(&mut self, timestamp: u64) -> TempoResult<BTreeSet<TemporalKey>> {
        self.purge_commits(timestamp, timestamp)
    }

    /// Delete every commit within `[lower, upper]` with the entries they wrote
    pub fn purge_commits(&mut self, lower: u64, upper: u64) -> TempoResult<BTreeSet<TemporalKey>> {
        if lower > upper {
            return Err(TempoError::invalid_range(format!(
                "lower bound {} is greater than upper bound {}",
                lower, upper
            )));
        }
        let branch = self.info.name.clone();
        let (keys, commits) = self.shard_read(|shard| {
            let commits: Vec<u64> = shard
                .commits()
                .between(lower, upper, true)
                .map(|record| record.timestamp)
                .collect();
            let keys: Vec<TemporalKey> = commits
                .iter()
                .flat_map(|ts| shard.entries_at(*ts))
                .map(|entry| entry.key)
                .collect();
            (keys, commits)
        })?;

        let affected: BTreeSet<TemporalKey> = keys.iter().cloned().collect();
        let mut mutations = Vec::new();
        if !keys.is_empty() {
            mutations.push(Mutation::RemoveEntries {
                branch: branch.clone(),
                keys,
            });
        }
        for timestamp in &commits {
            mutations.push(Mutation::RemoveCommit {
                branch: branch.clone(),
                timestamp: *timestamp,
            });
        }
        self.db.persist(&mutations)?;
        if let Some(first) = commits.first() {
            self.touch(*first);
        }
        self.record("purge_commits", &affected);
        Ok(affected)
    }

    // ========================================================================
    // Transformations
    // ========================================================================

    /// Rewrite the value at `keyspace/key@timestamp`
    ///
    /// A missing coordinate is left alone and yields an empty set.
    pub fn transform_entry<F>(&mut self, keyspace: &str, key: &str, timestamp: u64, f: F) -> TempoResult<BTreeSet<TemporalKey>>
    where
        F: FnOnce(Option<&[u8]>) -> Transformation,
    {
        let coordinate = TemporalKey::new(keyspace, key, timestamp);
        let Some(current) = self.shard_read(|shard| shard.entry(&coordinate).cloned())? else {
            return Ok(BTreeSet::new());
        };
        let entries = match f(current.as_deref()).into_value() {
            Some(value) => vec![TemporalEntry { key: coordinate, value }],
            None => Vec::new(),
        };
        self.rewrite("transform_entry", entries)
    }

    /// Rewrite every version of `keyspace/key`
    pub fn transform_values_of_key<F>(&mut self, keyspace: &str, key: &str, mut f: F) -> TempoResult<BTreeSet<TemporalKey>>
    where
        F: FnMut(u64, Option<&[u8]>) -> Transformation,
    {
        let qualified = QualifiedKey::new(keyspace, key);
        let versions: Vec<(u64, Option<Vec<u8>>)> = self.shard_read(|shard| {
            shard
                .chain(&qualified)
                .map(|chain| chain.iter().map(|(ts, v)| (ts, v.clone())).collect())
                .unwrap_or_default()
        })?;
        let entries = versions
            .into_iter()
            .filter_map(|(ts, value)| {
                f(ts, value.as_deref()).into_value().map(|value| TemporalEntry {
                    key: qualified.at(ts),
                    value,
                })
            })
            .collect();
        self.rewrite("transform_values_of_key", entries)
    }

    /// Rewrite the contents of the commit at `timestamp`
    ///
    /// `f` receives every value written at `timestamp` and returns the new
    /// contents: dropped keys are purged, new or changed keys are written.
    pub fn transform_commit<F>(&mut self, timestamp: u64, f: F) -> TempoResult<BTreeSet<TemporalKey>>
    where
        F: FnOnce(&CommitContents) -> CommitContents,
    {
        self.check_timestamp(timestamp)?;
        let current: CommitContents = self.shard_read(|shard| {
            shard
                .entries_at(timestamp)
                .into_iter()
                .map(|entry| (entry.key.qualified(), entry.value))
                .collect()
        })?;
        let updated = f(&current);
        for key in updated.keys() {
            if key.keyspace.is_empty() || key.key.is_empty() {
                return Err(TempoError::invalid_argument("keyspace and key must not be empty"));
            }
        }

        let removed: Vec<TemporalKey> = current
            .keys()
            .filter(|key| !updated.contains_key(*key))
            .map(|key| key.at(timestamp))
            .collect();
        let written: Vec<TemporalEntry> = updated
            .into_iter()
            .filter(|(key, value)| current.get(key) != Some(value))
            .map(|(key, value)| TemporalEntry {
                key: key.at(timestamp),
                value,
            })
            .collect();

        let branch = self.info.name.clone();
        let mut affected: BTreeSet<TemporalKey> = removed.iter().cloned().collect();
        affected.extend(written.iter().map(|entry| entry.key.clone()));
        let mut mutations = Vec::new();
        if !removed.is_empty() {
            mutations.push(Mutation::RemoveEntries {
                branch: branch.clone(),
                keys: removed,
            });
        }
        if !written.is_empty() {
            mutations.push(Mutation::PutEntries {
                branch: branch.clone(),
                entries: written,
            });
            let has_commit = self.shard_read(|shard| shard.commits().get(timestamp).is_some())?;
            if !has_commit {
                mutations.push(Mutation::PutCommit {
                    branch,
                    record: CommitRecord::new(timestamp, None),
                });
            }
        }
        self.db.persist(&mutations)?;
        if !affected.is_empty() {
            self.touch(timestamp);
        }
        self.record("transform_commit", &affected);
        Ok(affected)
    }

    /// Rewrite every live value of `keyspace`
    ///
    /// Tombstones are not offered to `f`, and `f` may not produce one:
    /// [`Transformation::Tombstone`] fails the whole call with
    /// `DatebackViolation` before anything is written.
    pub fn transform_values_of_keyspace<F>(&mut self, keyspace: &str, mut f: F) -> TempoResult<BTreeSet<TemporalKey>>
    where
        F: FnMut(&str, u64, &[u8]) -> Transformation,
    {
        let values: Vec<(String, u64, Vec<u8>)> = self.shard_read(|shard| {
            let mut values = Vec::new();
            if let Some(table) = shard.keyspace(keyspace) {
                for (key, chain) in table {
                    for (ts, value) in chain.iter() {
                        if let Some(value) = value {
                            values.push((key.clone(), ts, value.clone()));
                        }
                    }
                }
            }
            values
        })?;

        let mut entries = Vec::new();
        for (key, ts, value) in values {
            match f(&key, ts, &value) {
                Transformation::Unchanged => {}
                Transformation::Value(new_value) => entries.push(TemporalEntry {
                    key: TemporalKey::new(keyspace, key, ts),
                    value: Some(new_value),
                }),
                Transformation::Tombstone => {
                    return Err(TempoError::dateback(format!(
                        "keyspace transformation of '{}/{}' at {} produced a tombstone",
                        keyspace, key, ts
                    )));
                }
            }
        }
        self.rewrite("transform_values_of_keyspace", entries)
    }

    // ========================================================================
    // Commit metadata
    // ========================================================================

    /// Replace the metadata of the commit at `timestamp`
    ///
    /// Fails with `DatebackViolation` if there is no commit at `timestamp`.
    pub fn update_commit_metadata(&mut self, timestamp: u64, metadata: Option<Vec<u8>>) -> TempoResult<BTreeSet<TemporalKey>> {
        let branch = self.info.name.clone();
        let Some(existing) = self.shard_read(|shard| shard.commits().get(timestamp).cloned())? else {
            return Err(TempoError::dateback(format!(
                "branch '{}' has no commit at {}",
                branch, timestamp
            )));
        };
        let metadata = self.db.listeners().filter_metadata(&branch, timestamp, metadata);
        self.db.persist(&[Mutation::PutCommit {
            branch,
            record: CommitRecord { metadata, ..existing },
        }])?;
        debug!(target: "tempo::dateback", branch = %self.info.name, timestamp, "Commit metadata updated");
        Ok(BTreeSet::new())
    }

    /// Run cleanup now for everything touched so far
    ///
    /// Runs automatically when the dateback closure returns.
    pub fn cleanup(&mut self) -> TempoResult<()> {
        let Some(earliest) = self.earliest_touched.take() else {
            return Ok(());
        };
        let affected = std::mem::take(&mut self.affected);
        cleanup_branch(self.db, &self.info.name, earliest, &affected)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn check_timestamp(&self, timestamp: u64) -> TempoResult<()> {
        if !self.info.owns(timestamp) {
            return Err(TempoError::dateback(format!(
                "timestamp {} is at or before the branching timestamp {} of branch '{}'",
                timestamp, self.info.branching_timestamp, self.info.name
            )));
        }
        let clock_now = self.db.clock().now();
        if timestamp > clock_now {
            return Err(TempoError::dateback(format!(
                "timestamp {} is after the current time {}",
                timestamp, clock_now
            )));
        }
        Ok(())
    }

    fn shard_read<R>(&self, f: impl FnOnce(&tempo_storage::BranchShard) -> R) -> TempoResult<R> {
        let shard = self.db.store().shard(&self.info.name)?;
        let guard = shard.read();
        Ok(f(&guard))
    }

    /// Overwrite existing coordinates with new values
    fn rewrite(&mut self, operation: &'static str, entries: Vec<TemporalEntry>) -> TempoResult<BTreeSet<TemporalKey>> {
        let affected: BTreeSet<TemporalKey> = entries.iter().map(|e| e.key.clone()).collect();
        if !entries.is_empty() {
            self.db.persist(&[Mutation::PutEntries {
                branch: self.info.name.clone(),
                entries,
            }])?;
        }
        self.record(operation, &affected);
        Ok(affected)
    }

    /// Physically delete coordinates
    fn remove(&mut self, operation: &'static str, keys: Vec<TemporalKey>) -> TempoResult<BTreeSet<TemporalKey>> {
        let affected: BTreeSet<TemporalKey> = keys.iter().cloned().collect();
        if !keys.is_empty() {
            self.db.persist(&[Mutation::RemoveEntries {
                branch: self.info.name.clone(),
                keys,
            }])?;
        }
        self.record(operation, &affected);
        Ok(affected)
    }

    fn touch(&mut self, timestamp: u64) {
        self.earliest_touched = Some(match self.earliest_touched {
            Some(earliest) => earliest.min(timestamp),
            None => timestamp,
        });
    }

    fn record(&mut self, operation: &'static str, affected: &BTreeSet<TemporalKey>) {
        if let Some(earliest) = affected.iter().map(|key| key.timestamp).min() {
            self.touch(earliest);
            let mut scope = vec![self.info.name.clone()];
            scope.extend(self.db.descendants(&self.info.name));
            self.db.cache().invalidate_branches(&scope);
        }
        self.affected.extend(affected.iter().cloned());
        debug!(
            target: "tempo::dateback",
            branch = %self.info.name,
            operation,
            affected = affected.len(),
            "Dateback operation"
        );
    }
}

/// Bring a branch back to a consistent state after its history changed
fn cleanup_branch(
    db: &Database,
    branch: &BranchName,
    earliest_touched: u64,
    affected: &BTreeSet<TemporalKey>,
) -> TempoResult<()> {
    let mut scope = vec![branch.clone()];
    scope.extend(db.descendants(branch));
    db.cache().invalidate_branches(&scope);

    let mut mutations = Vec::new();
    {
        let shard = db.store().shard(branch)?;
        let shard = shard.read();

        for keyspace in shard.entry_keyspaces() {
            if let Some(earliest) = shard.earliest_in_keyspace(keyspace) {
                if shard.keyspaces().get(keyspace) != Some(&earliest) {
                    mutations.push(Mutation::SetKeyspaceCreation {
                        branch: branch.clone(),
                        keyspace: keyspace.clone(),
                        timestamp: earliest,
                    });
                }
            }
        }
        for keyspace in shard.keyspaces().keys() {
            if shard.keyspace(keyspace).is_none() {
                mutations.push(Mutation::RemoveKeyspace {
                    branch: branch.clone(),
                    keyspace: keyspace.clone(),
                });
            }
        }

        let live = shard.timestamps_from(earliest_touched);
        for record in shard.commits().between(earliest_touched, u64::MAX, true) {
            if !live.contains(&record.timestamp) {
                mutations.push(Mutation::RemoveCommit {
                    branch: branch.clone(),
                    timestamp: record.timestamp,
                });
            }
        }
    }
    db.persist(&mutations)?;

    info!(
        target: "tempo::dateback",
        branch = %branch,
        earliest_touched,
        affected = affected.len(),
        repairs = mutations.len(),
        "Dateback cleanup complete"
    );
    db.listeners().datebacked(branch, affected);
    Ok(())
}
