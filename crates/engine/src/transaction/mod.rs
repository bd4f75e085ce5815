//! Transactions
//!
//! A [`Transaction`] reads a branch at a fixed timestamp and buffers writes
//! until commit. Reads never see the transaction's own buffered writes;
//! they answer what the branch looked like at the transaction's timestamp.
//!
//! # Usage
//!
//! ```ignore
//! let mut tx = db.begin(&master)?;
//! let old = tx.get("kv", "x")?;
//! tx.put("kv", "x", b"a2".to_vec())?;
//! let ts = tx.commit(Some(b"update x".to_vec()))?;
//! ```
//!
//! # Incremental commits
//!
//! Large change sets can be flushed in batches with
//! [`commit_incremental`](Transaction::commit_incremental). The first
//! batch fixes the commit timestamp `T`; after that the transaction reads
//! at `T` so it sees its own flushed batches. Nothing becomes visible to
//! other transactions until the final [`commit`](Transaction::commit).
//! Dropping the transaction with an open sequence rolls it back.

use std::borrow::Cow;
use std::collections::BTreeSet;
use tempo_concurrency::{ChangeSet, ConflictResolutionStrategy, TransactionState};
use tempo_core::{BranchName, Order, Period, QualifiedKey, TempoError, TempoResult};
use tempo_storage::{CloseableIter, CommitMetadata, TemporalStore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::CommitRequest;
use crate::database::Database;

/// A snapshot read / buffered write session on one branch
pub struct Transaction<'db> {
    db: &'db Database,
    id: Uuid,
    branch: BranchName,
    timestamp: u64,
    changes: ChangeSet,
    state: TransactionState,
    conflict_resolution: Option<ConflictResolutionStrategy>,
    incremental_timestamp: Option<u64>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, branch: BranchName, timestamp: u64) -> Self {
        db.coordinator().record_start();
        let id = Uuid::new_v4();
        debug!(target: "tempo::commit", branch = %branch, timestamp, transaction = %id, "Transaction started");
        Transaction {
            db,
            id,
            branch,
            timestamp,
            changes: ChangeSet::new(),
            state: TransactionState::Idle,
            conflict_resolution: None,
            incremental_timestamp: None,
        }
    }

    /// Unique id of this transaction
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Branch the transaction works on
    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    /// Timestamp the transaction was opened at
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Timestamp reads are answered at
    ///
    /// Equals [`timestamp`](Self::timestamp) until the first incremental
    /// commit, the incremental commit timestamp afterwards.
    pub fn read_timestamp(&self) -> u64 {
        self.incremental_timestamp.unwrap_or(self.timestamp)
    }

    /// Life-cycle state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether an incremental commit sequence is open
    pub fn is_incremental(&self) -> bool {
        self.incremental_timestamp.is_some() && !self.state.is_terminal()
    }

    /// Number of buffered writes
    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    /// Override the database's conflict resolution strategy for this transaction
    pub fn with_conflict_resolution(&mut self, strategy: ConflictResolutionStrategy) -> &mut Self {
        self.conflict_resolution = Some(strategy);
        self
    }

    // ========================================================================
    // Reads
    // ========================================================================
    //
    // Every read holds the database lock in shared mode so it never sees a
    // half-applied import or branch deletion. Iterators take it again for
    // each batch they fetch.

    /// Value of `keyspace/key` at the read timestamp
    pub fn get(&self, keyspace: &str, key: &str) -> TempoResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let _shared = self.db.locks().database_shared();
        self.temporal()
            .get(&self.branch, &QualifiedKey::new(keyspace, key), self.read_timestamp())
    }

    /// Value of `keyspace/key` at the read timestamp with its validity period
    ///
    /// The period's upper bound may lie beyond the read timestamp but never
    /// beyond what the branch has committed.
    pub fn ranged_get(&self, keyspace: &str, key: &str) -> TempoResult<(Option<Vec<u8>>, Period)> {
        self.ensure_open()?;
        let _shared = self.db.locks().database_shared();
        self.temporal()
            .ranged_get(&self.branch, &QualifiedKey::new(keyspace, key), self.read_timestamp())
    }

    /// Keys of `keyspace` holding a value at the read timestamp
    pub fn key_set(&self, keyspace: &str) -> TempoResult<BTreeSet<String>> {
        self.ensure_open()?;
        let _shared = self.db.locks().database_shared();
        self.temporal().key_set(&self.branch, keyspace, self.read_timestamp())
    }

    /// Keyspaces that exist at the read timestamp
    pub fn keyspaces(&self) -> TempoResult<BTreeSet<String>> {
        self.ensure_open()?;
        let _shared = self.db.locks().database_shared();
        self.temporal().keyspaces(&self.branch, self.read_timestamp())
    }

    /// Timestamp of the latest modification of `keyspace/key` (deletions count)
    pub fn last_modification(&self, keyspace: &str, key: &str) -> TempoResult<Option<u64>> {
        self.ensure_open()?;
        let _shared = self.db.locks().database_shared();
        self.temporal()
            .last_modification(&self.branch, &QualifiedKey::new(keyspace, key), self.read_timestamp())
    }

    /// Modification timestamps of `keyspace/key` within `[lower, upper]`
    pub fn history(
        &self,
        keyspace: &str,
        key: &str,
        lower: u64,
        upper: u64,
        order: Order,
    ) -> TempoResult<CloseableIter<u64>> {
        self.ensure_open()?;
        self.check_bounds(lower, upper)?;
        let _shared = self.db.locks().database_shared();
        let iter = self
            .temporal()
            .history(&self.branch, &QualifiedKey::new(keyspace, key), lower, upper, order)?;
        Ok(self.gate(iter))
    }

    /// Every modification timestamp of `keyspace/key` up to the read timestamp
    pub fn full_history(&self, keyspace: &str, key: &str, order: Order) -> TempoResult<CloseableIter<u64>> {
        self.history(keyspace, key, 0, self.read_timestamp(), order)
    }

    /// `(key, timestamp)` of every modification in `keyspace` within `[lower, upper]`
    pub fn modifications_in_keyspace_between(
        &self,
        keyspace: &str,
        lower: u64,
        upper: u64,
    ) -> TempoResult<CloseableIter<(String, u64)>> {
        self.ensure_open()?;
        self.check_bounds(lower, upper)?;
        let _shared = self.db.locks().database_shared();
        let iter = self
            .temporal()
            .modifications_in_keyspace_between(&self.branch, keyspace, lower, upper)?;
        Ok(self.gate(iter))
    }

    // ========================================================================
    // Commit log reads
    // ========================================================================

    /// Commit timestamps of this branch within `[from, to]`
    pub fn commit_timestamps_between(
        &self,
        from: u64,
        to: u64,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<Vec<u64>> {
        self.ensure_open()?;
        self.check_bounds(from, to)?;
        let _shared = self.db.locks().database_shared();
        self.db
            .commit_log()
            .commit_timestamps_between(&self.branch, from, to, order, include_internal)
    }

    /// Commit timestamps and metadata of this branch within `[from, to]`
    pub fn commit_metadata_between(
        &self,
        from: u64,
        to: u64,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitMetadata>> {
        self.ensure_open()?;
        self.check_bounds(from, to)?;
        let _shared = self.db.locks().database_shared();
        self.db
            .commit_log()
            .commit_metadata_between(&self.branch, from, to, order, include_internal)
    }

    /// Number of commits of this branch within `[from, to]`
    pub fn count_commit_timestamps_between(&self, from: u64, to: u64, include_internal: bool) -> TempoResult<usize> {
        self.ensure_open()?;
        self.check_bounds(from, to)?;
        let _shared = self.db.locks().database_shared();
        self.db
            .commit_log()
            .count_commit_timestamps_between(&self.branch, from, to, include_internal)
    }

    /// Metadata of the commit at `timestamp`
    pub fn commit_metadata(&self, timestamp: u64) -> TempoResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.check_bounds(timestamp, timestamp)?;
        let _shared = self.db.locks().database_shared();
        self.db.commit_log().commit_metadata(&self.branch, timestamp)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Buffer a value for `keyspace/key`
    pub fn put(&mut self, keyspace: &str, key: &str, value: Vec<u8>) -> TempoResult<()> {
        let key = self.writable_key(keyspace, key)?;
        self.changes.put(key, value);
        self.stage();
        Ok(())
    }

    /// Buffer a delete of `keyspace/key`
    pub fn remove(&mut self, keyspace: &str, key: &str) -> TempoResult<()> {
        let key = self.writable_key(keyspace, key)?;
        self.changes.remove(key);
        self.stage();
        Ok(())
    }

    /// Commit the buffered writes and return the commit timestamp
    ///
    /// Finishes an open incremental sequence. When nothing effective is
    /// left to write the branch's current `now` is returned and no commit
    /// record is created.
    pub fn commit(&mut self, metadata: Option<Vec<u8>>) -> TempoResult<u64> {
        self.ensure_open()?;
        self.db.check_writable("commit")?;
        self.state = TransactionState::Committing;

        let strategy = self.strategy();
        let request = CommitRequest {
            transaction: self.id,
            branch: &self.branch,
            read_timestamp: self.timestamp,
            changes: self.changes.take(),
            strategy: &strategy,
        };
        let coordinator = self.db.coordinator();
        let outcome = if self.incremental_timestamp.is_some() {
            coordinator.finish_incremental(self.db, request, metadata)
        } else {
            coordinator.perform_commit(self.db, request, metadata)
        };
        self.finish(outcome)
    }

    /// Flush the buffered writes as one batch of an incremental commit
    ///
    /// Returns the incremental commit timestamp, the same for every batch.
    pub fn commit_incremental(&mut self) -> TempoResult<u64> {
        self.ensure_open()?;
        self.db.check_writable("commit_incremental")?;
        self.state = TransactionState::Committing;

        let strategy = self.strategy();
        let request = CommitRequest {
            transaction: self.id,
            branch: &self.branch,
            read_timestamp: self.timestamp,
            changes: self.changes.take(),
            strategy: &strategy,
        };
        match self.db.coordinator().perform_commit_incremental(self.db, request) {
            Ok(timestamp) => {
                self.incremental_timestamp = Some(timestamp);
                Ok(timestamp)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Discard buffered writes and revert an open incremental sequence
    pub fn rollback(&mut self) -> TempoResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.changes.clear();
        let result = if self.incremental_timestamp.is_some() {
            self.db
                .coordinator()
                .perform_incremental_rollback(self.db, &self.branch, self.id)
        } else {
            Ok(())
        };
        self.abort();
        result
    }

    fn finish(&mut self, outcome: TempoResult<u64>) -> TempoResult<u64> {
        match outcome {
            Ok(timestamp) => {
                self.state = TransactionState::Committed;
                self.db.coordinator().record_commit();
                Ok(timestamp)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn abort(&mut self) {
        self.changes.clear();
        self.state = TransactionState::Aborted;
        self.db.coordinator().record_abort();
    }

    fn stage(&mut self) {
        if self.state == TransactionState::Idle {
            self.state = TransactionState::Staged;
        }
    }

    fn strategy(&self) -> ConflictResolutionStrategy {
        self.conflict_resolution
            .clone()
            .unwrap_or_else(|| self.db.conflict_resolution())
    }

    /// Read view: the committed state, plus this transaction's own
    /// batches once an incremental commit is open
    fn temporal(&self) -> Cow<'db, TemporalStore> {
        match self.incremental_timestamp {
            Some(horizon) => Cow::Owned(self.db.temporal().with_pending_until(horizon)),
            None => Cow::Borrowed(self.db.temporal()),
        }
    }

    fn gate<T: 'static>(&self, iter: CloseableIter<T>) -> CloseableIter<T> {
        let locks = self.db.lock_handle();
        iter.gated(move || locks.database_shared())
    }

    fn ensure_open(&self) -> TempoResult<()> {
        if self.state.is_terminal() {
            return Err(TempoError::invalid_operation(format!(
                "transaction {} is closed ({:?})",
                self.id, self.state
            )));
        }
        Ok(())
    }

    fn writable_key(&self, keyspace: &str, key: &str) -> TempoResult<QualifiedKey> {
        self.ensure_open()?;
        self.db.check_writable("put")?;
        if keyspace.is_empty() || key.is_empty() {
            return Err(TempoError::invalid_argument("keyspace and key must not be empty"));
        }
        Ok(QualifiedKey::new(keyspace, key))
    }

    fn check_bounds(&self, lower: u64, upper: u64) -> TempoResult<()> {
        let read = self.read_timestamp();
        if upper > read {
            return Err(TempoError::invalid_range(format!(
                "upper bound {} is after the transaction timestamp {}",
                upper, read
            )));
        }
        if lower > upper {
            return Err(TempoError::invalid_range(format!(
                "lower bound {} is greater than upper bound {}",
                lower, upper
            )));
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.incremental_timestamp.is_some() {
            warn!(
                target: "tempo::commit",
                branch = %self.branch,
                transaction = %self.id,
                "Transaction dropped with an open incremental commit; rolling back"
            );
        }
        if let Err(e) = self.rollback() {
            warn!(target: "tempo::commit", transaction = %self.id, error = %e, "Rollback on drop failed");
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("branch", &self.branch)
            .field("timestamp", &self.timestamp)
            .field("state", &self.state)
            .field("pending", &self.changes.len())
            .field("incremental_timestamp", &self.incremental_timestamp)
            .finish()
    }
}
