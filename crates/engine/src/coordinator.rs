//! Commit coordinator
//!
//! Runs the commit protocol for a branch while holding its lock:
//!
//! ```text
//! BeginCommit marker
//!   stage 1  PrimaryIndex    entries + keyspace creation
//!   stage 2  SecondaryIndex  change consumers
//!   stage 3  Metadata        commit record
//!   stage 4  AdvanceNow      branch `now` = commit timestamp   <- commit point
//! EndCommit
//! ```
//!
//! Everything a commit writes lives above the branch's previous `now`, so
//! until stage 4 no transaction can observe it; cached periods of the
//! written keys are dropped once `now` moves. A marker left behind by a
//! crash is resolved by [`CommitCoordinator::recover_branch`]: past the
//! commit point the marker is simply cleared, otherwise everything above
//! `now` is removed.
//!
//! Incremental commits fix their timestamp on the first call and keep the
//! marker open across calls; only the final commit runs stages 3 and 4.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempo_concurrency::{
    detect_conflicts, eliminate_duplicates, resolve_conflicts, ChangeSet, ConflictResolutionStrategy,
    DuplicateVersionElimination,
};
use tempo_core::{BranchName, CommitMarker, CommitRecord, Mutation, TemporalEntry, TempoError, TempoResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::Database;

/// Points in the commit protocol where a debug hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStage {
    /// Before entries are written
    PrimaryIndex,
    /// Before change consumers are notified
    SecondaryIndex,
    /// Before the commit record is written
    Metadata,
    /// Before the branch's `now` is advanced
    AdvanceNow,
}

impl CommitStage {
    /// Every stage in protocol order
    pub const ALL: [CommitStage; 4] = [
        CommitStage::PrimaryIndex,
        CommitStage::SecondaryIndex,
        CommitStage::Metadata,
        CommitStage::AdvanceNow,
    ];
}

impl fmt::Display for CommitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitStage::PrimaryIndex => "primary_index",
            CommitStage::SecondaryIndex => "secondary_index",
            CommitStage::Metadata => "metadata",
            CommitStage::AdvanceNow => "advance_now",
        };
        f.write_str(name)
    }
}

/// Hook run before each commit stage
///
/// Returning an error simulates a crash at that point: the commit stops,
/// its marker stays in place and the caller gets `CommitFailed`.
pub type DebugHook = Arc<dyn Fn(CommitStage, &BranchName) -> TempoResult<()> + Send + Sync>;

/// What a transaction hands to the coordinator
pub(crate) struct CommitRequest<'a> {
    pub transaction: Uuid,
    pub branch: &'a BranchName,
    pub read_timestamp: u64,
    pub changes: ChangeSet,
    pub strategy: &'a ConflictResolutionStrategy,
}

/// An incremental commit sequence that has started but not finished
#[derive(Debug, Clone, Copy)]
struct OpenSequence {
    transaction: Uuid,
    timestamp: u64,
    previous_now: u64,
}

/// Error raised when a debug hook stops a commit
enum StageError {
    Interrupted(TempoError),
    Failed(TempoError),
}

/// Commit protocol driver and commit metrics
pub struct CommitCoordinator {
    hook: RwLock<Option<DebugHook>>,
    open_sequences: DashMap<BranchName, OpenSequence>,
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    total_recovered: AtomicU64,
}

impl CommitCoordinator {
    /// Create a coordinator with zeroed metrics
    pub fn new() -> Self {
        Self {
            hook: RwLock::new(None),
            open_sequences: DashMap::new(),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            total_recovered: AtomicU64::new(0),
        }
    }

    /// Install (or remove) the debug hook
    pub fn set_debug_hook(&self, hook: Option<DebugHook>) {
        *self.hook.write() = hook;
    }

    /// Whether an incremental commit is open on `branch`
    pub fn has_open_incremental(&self, branch: &BranchName) -> bool {
        self.open_sequences.contains_key(branch)
    }

    pub(crate) fn forget_branch(&self, branch: &BranchName) {
        self.open_sequences.remove(branch);
    }

    // ========================================================================
    // Regular commits
    // ========================================================================

    /// Commit a change set atomically and return the commit timestamp
    ///
    /// An effective change set that is empty writes nothing and returns
    /// the branch's current `now`.
    pub(crate) fn perform_commit(
        &self,
        db: &Database,
        request: CommitRequest<'_>,
        metadata: Option<Vec<u8>>,
    ) -> TempoResult<u64> {
        db.check_writable("commit")?;
        let branch = request.branch;
        let _guard = db.locks().branch(branch)?;

        if self.open_sequences.contains_key(branch) {
            return Err(TempoError::commit_failed(format!(
                "an incremental commit is in progress on branch '{}'",
                branch
            )));
        }
        self.recover_branch(db, branch)?;

        let now = db.store().info(branch)?.now;
        let mut changes = request.changes;
        self.prepare_changes(db, branch, request.read_timestamp, now, now, request.strategy, &mut changes)?;
        if changes.is_empty() {
            debug!(target: "tempo::commit", branch = %branch, now, "Nothing to commit");
            return Ok(now);
        }

        let timestamp = db.clock().now().max(now + 1);
        db.persist(&[Mutation::BeginCommit {
            branch: branch.clone(),
            marker: CommitMarker {
                timestamp,
                previous_now: now,
                incremental: false,
            },
        }])?;

        let entries = changes.to_entries(timestamp);
        let outcome = self
            .write_batch(db, branch, timestamp, &entries)
            .and_then(|()| self.finish_stages(db, branch, timestamp, metadata));
        match outcome {
            Ok(()) => {
                info!(
                    target: "tempo::commit",
                    branch = %branch,
                    timestamp,
                    keys = entries.len(),
                    "Commit complete"
                );
                Ok(timestamp)
            }
            Err(StageError::Interrupted(e)) => Err(e),
            Err(StageError::Failed(e)) => {
                self.roll_back(db, branch, now)?;
                Err(TempoError::commit_failed(format!(
                    "commit on branch '{}' was rolled back: {}",
                    branch, e
                )))
            }
        }
    }

    // ========================================================================
    // Incremental commits
    // ========================================================================

    /// Write one batch of an incremental commit and return its timestamp
    ///
    /// The first call fixes the timestamp and opens the sequence; later
    /// calls write at the same timestamp. Any failure rolls back the whole
    /// sequence.
    pub(crate) fn perform_commit_incremental(&self, db: &Database, request: CommitRequest<'_>) -> TempoResult<u64> {
        db.check_writable("commit_incremental")?;
        let branch = request.branch;
        let _guard = db.locks().branch(branch)?;

        let sequence = self.open_or_continue(db, branch, request.transaction)?;
        let mut changes = request.changes;
        let prepared = self.prepare_changes(
            db,
            branch,
            request.read_timestamp,
            sequence.previous_now,
            sequence.timestamp,
            request.strategy,
            &mut changes,
        );
        if let Err(e) = prepared {
            self.abandon_sequence(db, branch, sequence)?;
            return Err(e);
        }

        let entries = changes.to_entries(sequence.timestamp);
        match self.write_batch(db, branch, sequence.timestamp, &entries) {
            Ok(()) => {
                debug!(
                    target: "tempo::commit",
                    branch = %branch,
                    timestamp = sequence.timestamp,
                    keys = entries.len(),
                    "Incremental batch written"
                );
                Ok(sequence.timestamp)
            }
            Err(StageError::Interrupted(e)) => {
                self.open_sequences.remove(branch);
                Err(e)
            }
            Err(StageError::Failed(e)) => {
                self.abandon_sequence(db, branch, sequence)?;
                Err(TempoError::commit_failed(format!(
                    "incremental commit on branch '{}' was rolled back: {}",
                    branch, e
                )))
            }
        }
    }

    /// Write the last batch of an incremental commit and make it visible
    pub(crate) fn finish_incremental(
        &self,
        db: &Database,
        request: CommitRequest<'_>,
        metadata: Option<Vec<u8>>,
    ) -> TempoResult<u64> {
        db.check_writable("commit")?;
        let branch = request.branch;
        let _guard = db.locks().branch(branch)?;

        let sequence = self.owned_sequence(branch, request.transaction)?;
        let mut changes = request.changes;
        if let Err(e) = self.prepare_changes(
            db,
            branch,
            request.read_timestamp,
            sequence.previous_now,
            sequence.timestamp,
            request.strategy,
            &mut changes,
        ) {
            self.abandon_sequence(db, branch, sequence)?;
            return Err(e);
        }

        let entries = changes.to_entries(sequence.timestamp);
        let written_before = !db.store().shard(branch)?.read().entries_at(sequence.timestamp).is_empty();
        if entries.is_empty() && !written_before {
            // Every batch was elided: close the sequence without a commit
            self.open_sequences.remove(branch);
            db.persist(&[Mutation::EndCommit { branch: branch.clone() }])?;
            debug!(target: "tempo::commit", branch = %branch, "Incremental commit had nothing to write");
            return Ok(sequence.previous_now);
        }

        let outcome = self
            .write_batch(db, branch, sequence.timestamp, &entries)
            .and_then(|()| self.finish_stages(db, branch, sequence.timestamp, metadata));
        self.open_sequences.remove(branch);
        match outcome {
            Ok(()) => {
                info!(
                    target: "tempo::commit",
                    branch = %branch,
                    timestamp = sequence.timestamp,
                    "Incremental commit complete"
                );
                Ok(sequence.timestamp)
            }
            Err(StageError::Interrupted(e)) => Err(e),
            Err(StageError::Failed(e)) => {
                self.roll_back(db, branch, sequence.previous_now)?;
                Err(TempoError::commit_failed(format!(
                    "incremental commit on branch '{}' was rolled back: {}",
                    branch, e
                )))
            }
        }
    }

    /// Revert every batch of the transaction's incremental commit
    pub(crate) fn perform_incremental_rollback(
        &self,
        db: &Database,
        branch: &BranchName,
        transaction: Uuid,
    ) -> TempoResult<()> {
        let _guard = db.locks().branch(branch)?;
        let sequence = self.owned_sequence(branch, transaction)?;
        self.open_sequences.remove(branch);
        self.roll_back(db, branch, sequence.previous_now)?;
        info!(
            target: "tempo::commit",
            branch = %branch,
            timestamp = sequence.timestamp,
            "Incremental commit rolled back"
        );
        Ok(())
    }

    fn open_or_continue(&self, db: &Database, branch: &BranchName, transaction: Uuid) -> TempoResult<OpenSequence> {
        if let Some(open) = self.open_sequences.get(branch) {
            if open.transaction != transaction {
                return Err(TempoError::commit_failed(format!(
                    "another incremental commit is in progress on branch '{}'",
                    branch
                )));
            }
            return Ok(*open);
        }

        self.recover_branch(db, branch)?;
        let now = db.store().info(branch)?.now;
        let sequence = OpenSequence {
            transaction,
            timestamp: db.clock().now().max(now + 1),
            previous_now: now,
        };
        db.persist(&[Mutation::BeginCommit {
            branch: branch.clone(),
            marker: CommitMarker {
                timestamp: sequence.timestamp,
                previous_now: now,
                incremental: true,
            },
        }])?;
        self.open_sequences.insert(branch.clone(), sequence);
        debug!(
            target: "tempo::commit",
            branch = %branch,
            timestamp = sequence.timestamp,
            "Incremental commit opened"
        );
        Ok(sequence)
    }

    fn owned_sequence(&self, branch: &BranchName, transaction: Uuid) -> TempoResult<OpenSequence> {
        match self.open_sequences.get(branch) {
            Some(open) if open.transaction == transaction => Ok(*open),
            Some(_) => Err(TempoError::commit_failed(format!(
                "another incremental commit is in progress on branch '{}'",
                branch
            ))),
            None => Err(TempoError::commit_failed(format!(
                "no incremental commit of this transaction is open on branch '{}'",
                branch
            ))),
        }
    }

    fn abandon_sequence(&self, db: &Database, branch: &BranchName, sequence: OpenSequence) -> TempoResult<()> {
        self.open_sequences.remove(branch);
        self.roll_back(db, branch, sequence.previous_now)
    }

    // ========================================================================
    // Stages
    // ========================================================================

    /// Duplicate elimination, then conflict detection and resolution
    #[allow(clippy::too_many_arguments)]
    fn prepare_changes(
        &self,
        db: &Database,
        branch: &BranchName,
        read_timestamp: u64,
        committed_now: u64,
        visible_at: u64,
        strategy: &ConflictResolutionStrategy,
        changes: &mut ChangeSet,
    ) -> TempoResult<()> {
        if db.duplicate_version_elimination() == DuplicateVersionElimination::OnCommit {
            // Later batches of an incremental commit compare against the earlier ones
            let pending;
            let temporal = if visible_at > committed_now {
                pending = db.temporal().with_pending_until(visible_at);
                &pending
            } else {
                db.temporal()
            };
            let dropped = eliminate_duplicates(temporal, branch, visible_at, changes)?;
            if dropped > 0 {
                debug!(target: "tempo::commit", branch = %branch, dropped, "Elided duplicate versions");
            }
        }
        let conflicts = detect_conflicts(db.temporal(), branch, read_timestamp, committed_now, changes)?;
        resolve_conflicts(strategy, &conflicts, changes)
    }

    fn run_hook(&self, stage: CommitStage, branch: &BranchName) -> Result<(), StageError> {
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(stage, branch).map_err(|e| {
                warn!(
                    target: "tempo::commit",
                    branch = %branch,
                    stage = %stage,
                    error = %e,
                    "Commit interrupted by debug hook"
                );
                StageError::Interrupted(TempoError::commit_failed(format!(
                    "commit on branch '{}' interrupted before stage {}: {}",
                    branch, stage, e
                )))
            })?;
        }
        debug!(target: "tempo::commit", branch = %branch, stage = %stage, "Commit stage");
        Ok(())
    }

    /// Stages 1 and 2 for one batch of entries
    fn write_batch(
        &self,
        db: &Database,
        branch: &BranchName,
        timestamp: u64,
        entries: &[TemporalEntry],
    ) -> Result<(), StageError> {
        self.run_hook(CommitStage::PrimaryIndex, branch)?;
        if !entries.is_empty() {
            let mut mutations = vec![Mutation::PutEntries {
                branch: branch.clone(),
                entries: entries.to_vec(),
            }];
            {
                let shard = db.store().shard(branch).map_err(StageError::Failed)?;
                let shard = shard.read();
                let mut seen = std::collections::BTreeSet::new();
                for entry in entries {
                    let keyspace = &entry.key.keyspace;
                    if !shard.keyspaces().contains_key(keyspace) && seen.insert(keyspace.clone()) {
                        mutations.push(Mutation::SetKeyspaceCreation {
                            branch: branch.clone(),
                            keyspace: keyspace.clone(),
                            timestamp,
                        });
                    }
                }
            }
            db.persist(&mutations).map_err(StageError::Failed)?;
        }

        self.run_hook(CommitStage::SecondaryIndex, branch)?;
        if !entries.is_empty() {
            db.listeners().committed(branch, timestamp, entries);
        }
        Ok(())
    }

    /// Stages 3 and 4, then the marker is cleared
    fn finish_stages(
        &self,
        db: &Database,
        branch: &BranchName,
        timestamp: u64,
        metadata: Option<Vec<u8>>,
    ) -> Result<(), StageError> {
        self.run_hook(CommitStage::Metadata, branch)?;
        let metadata = db.listeners().filter_metadata(branch, timestamp, metadata);
        db.persist(&[Mutation::PutCommit {
            branch: branch.clone(),
            record: CommitRecord::new(timestamp, metadata),
        }])
        .map_err(StageError::Failed)?;

        self.run_hook(CommitStage::AdvanceNow, branch)?;
        db.persist(&[Mutation::SetNow {
            branch: branch.clone(),
            now: timestamp,
        }])
        .map_err(StageError::Failed)?;
        // Periods cached before the commit point end at +inf for these keys
        let written = db
            .store()
            .shard(branch)
            .map(|shard| shard.read().entries_at(timestamp))
            .unwrap_or_default();
        for entry in &written {
            db.cache().invalidate_key(branch, &entry.key.qualified());
        }

        // Past the commit point: a failure here leaves a marker that
        // recovery resolves as committed.
        if let Err(e) = db.persist(&[Mutation::EndCommit { branch: branch.clone() }]) {
            tracing::error!(
                target: "tempo::commit",
                branch = %branch,
                timestamp,
                error = %e,
                "Failed to clear commit marker after the commit point"
            );
        }
        Ok(())
    }

    // ========================================================================
    // Rollback and recovery
    // ========================================================================

    /// Remove everything a branch holds above `now` and clear its marker
    fn roll_back(&self, db: &Database, branch: &BranchName, now: u64) -> TempoResult<()> {
        let mut mutations = Vec::new();
        {
            let shard = db.store().shard(branch)?;
            let shard = shard.read();
            let keys = shard.keys_after(now);
            if !keys.is_empty() {
                mutations.push(Mutation::RemoveEntries {
                    branch: branch.clone(),
                    keys,
                });
            }
            for timestamp in shard.commits().timestamps_after(now) {
                mutations.push(Mutation::RemoveCommit {
                    branch: branch.clone(),
                    timestamp,
                });
            }
            for (keyspace, created) in shard.keyspaces() {
                if *created > now {
                    mutations.push(Mutation::RemoveKeyspace {
                        branch: branch.clone(),
                        keyspace: keyspace.clone(),
                    });
                }
            }
        }
        mutations.push(Mutation::EndCommit { branch: branch.clone() });
        db.persist(&mutations)?;
        db.cache().invalidate_branches(&[branch.clone()]);
        db.listeners().rolled_back(branch, now);
        Ok(())
    }

    /// Resolve a commit marker left on `branch`; returns whether one was found
    ///
    /// The caller must hold the branch lock. Branches with an open
    /// incremental commit are skipped.
    pub(crate) fn recover_branch(&self, db: &Database, branch: &BranchName) -> TempoResult<bool> {
        if self.open_sequences.contains_key(branch) {
            return Ok(false);
        }
        let (marker, now) = {
            let shard = db.store().shard(branch)?;
            let shard = shard.read();
            match shard.marker() {
                Some(marker) => (marker.clone(), shard.info().now),
                None => return Ok(false),
            }
        };

        if now >= marker.timestamp {
            db.persist(&[Mutation::EndCommit { branch: branch.clone() }])?;
            info!(
                target: "tempo::recovery",
                branch = %branch,
                timestamp = marker.timestamp,
                "Interrupted commit had reached its commit point; marker cleared"
            );
        } else {
            self.roll_back(db, branch, now)?;
            warn!(
                target: "tempo::recovery",
                branch = %branch,
                timestamp = marker.timestamp,
                now,
                incremental = marker.incremental,
                "Rolled back interrupted commit"
            );
        }
        self.total_recovered.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Resolve the markers of every branch; returns how many were found
    pub(crate) fn recover_all(&self, db: &Database) -> TempoResult<usize> {
        let mut recovered = 0;
        for (branch, _) in db.store().branches_with_marker() {
            let _guard = db.locks().branch(&branch)?;
            if self.recover_branch(db, &branch)? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Record transaction start
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction commit
    pub fn record_commit(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| Some(x.saturating_sub(1)));
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction abort
    pub fn record_abort(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| Some(x.saturating_sub(1)));
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the commit metrics
    pub fn metrics(&self) -> CommitMetrics {
        CommitMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: self.total_started.load(Ordering::Relaxed),
            total_committed: self.total_committed.load(Ordering::Relaxed),
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            total_recovered: self.total_recovered.load(Ordering::Relaxed),
        }
    }
}

impl Default for CommitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("open_sequences", &self.open_sequences.len())
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Transaction and recovery statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMetrics {
    /// Transactions started and not yet finished
    pub active_count: u64,
    /// Total transactions started
    pub total_started: u64,
    /// Total transactions committed
    pub total_committed: u64,
    /// Total transactions aborted or failed
    pub total_aborted: u64,
    /// Commit markers resolved by recovery
    pub total_recovered: u64,
}

impl CommitMetrics {
    /// Total transactions that finished (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }
}
