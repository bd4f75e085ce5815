//! Database struct and open/close logic
//!
//! This module provides the main Database struct that orchestrates:
//! - Storage initialization
//! - Journal opening and replay
//! - Commit marker recovery on startup
//! - Transaction API
//!
//! ## Transaction API
//!
//! 1. **Closure API** (recommended): `db.transaction(&branch, |tx| { ... })`
//!    - Automatic commit on success, rollback on error
//!    - Returns the closure's value and the commit timestamp
//!
//! 2. **Manual API**: `db.begin(&branch)` / `db.begin_at(&branch, ts)`
//!    followed by `tx.commit(metadata)` or `tx.rollback()`
//!
//! ## Persistence
//!
//! Every table change is a [`Mutation`]. [`Database::persist`] appends the
//! mutations to the journal (file backend) and then applies them to the
//! in-memory tables, serialized by one mutex so journal order is apply
//! order.

pub mod builder;
pub mod config;
mod transactions;

pub use builder::DatabaseBuilder;
pub use config::{Backend, TempoConfig, CONFIG_FILE_NAME, JOURNAL_FILE_NAME};
pub use transactions::RetryConfig;

use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempo_concurrency::{ConflictResolutionStrategy, DuplicateVersionElimination, LockManager};
use tempo_core::{BranchName, Clock, Mutation, TempoError, TempoResult};
use tempo_durability::Journal;
use tempo_storage::{CommitLog, QueryCache, ShardedStore, TemporalStore};
use tracing::{info, warn};

use crate::coordinator::{CommitCoordinator, CommitMetrics, DebugHook};
use crate::listener::Listeners;

// ============================================================================
// Database Struct
// ============================================================================

/// Main database struct
///
/// Orchestrates the tables, the journal, locking and the commit protocol.
/// Create one with [`Database::open`], [`Database::ephemeral`] or
/// [`Database::builder`].
///
/// # Example
///
/// ```text
/// use tempo_engine::Database;
/// use tempo_core::BranchName;
///
/// let db = Database::open("/path/to/data")?;
/// let master = BranchName::master();
///
/// let (_, ts) = db.transaction(&master, |tx| {
///     tx.put("kv", "x", b"a1".to_vec())
/// })?;
/// ```
pub struct Database {
    /// Data directory (None for ephemeral databases)
    data_dir: Option<PathBuf>,

    /// Configuration the database was opened with
    config: TempoConfig,

    /// Branch shards: entries, commit tables, keyspaces, markers
    store: Arc<ShardedStore>,

    /// Lineage-aware reads over `store`
    temporal: TemporalStore,

    /// Commit table queries over `store`
    commit_log: CommitLog,

    /// Mutation journal (file backend only)
    journal: Option<Journal>,

    /// Serializes journal append + apply
    persist_lock: Mutex<()>,

    /// Database and branch locks
    locks: Arc<LockManager>,

    /// Commit protocol, incremental sequences and metrics
    coordinator: CommitCoordinator,

    /// Branch listeners, change consumers, metadata filter
    listeners: Listeners,

    /// Source of commit timestamps
    clock: Arc<dyn Clock>,

    /// Default conflict strategy (per-transaction overridable)
    conflict_resolution: RwLock<ConflictResolutionStrategy>,

    /// Exclusive lock file preventing concurrent process access to the
    /// same data directory. None for ephemeral databases.
    _lock_file: Option<File>,
}

/// Everything the builder resolved before the database is assembled
pub(crate) struct DatabaseParts {
    pub data_dir: Option<PathBuf>,
    pub config: TempoConfig,
    pub clock: Arc<dyn Clock>,
    pub conflict_resolution: ConflictResolutionStrategy,
    pub listeners: Listeners,
    pub debug_hook: Option<DebugHook>,
    pub batch_size: Option<usize>,
}

impl Database {
    /// Open database at given path with automatic recovery
    ///
    /// Reads `tempo.toml` from the data directory. If no config file
    /// exists, one is created with defaults (file backend, standard
    /// durability).
    pub fn open<P: AsRef<Path>>(path: P) -> TempoResult<Arc<Self>> {
        DatabaseBuilder::new().path(path.as_ref()).open()
    }

    /// Open database at the given path with an explicit configuration.
    ///
    /// The supplied config is written to `tempo.toml` so that subsequent
    /// `Database::open()` calls pick up the same settings.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: TempoConfig) -> TempoResult<Arc<Self>> {
        DatabaseBuilder::new().path(path.as_ref()).config(config).open()
    }

    /// In-memory database with default settings and no files
    pub fn ephemeral() -> TempoResult<Arc<Self>> {
        DatabaseBuilder::new().open()
    }

    /// Builder for databases with hooks (clock, listeners, filters)
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    pub(crate) fn assemble(parts: DatabaseParts) -> TempoResult<Arc<Self>> {
        let config = parts.config;
        config.validate()?;
        let backend = config.backend()?;

        let store = Arc::new(ShardedStore::new());
        let cache = Arc::new(QueryCache::new(config.cache_capacity()));
        let cursors = Arc::new(tempo_storage::CursorTracker::new());
        let mut temporal = TemporalStore::new(Arc::clone(&store), cache, Arc::clone(&cursors));
        if let Some(batch_size) = parts.batch_size {
            temporal = temporal.with_batch_size(batch_size);
        }
        let commit_log = CommitLog::new(Arc::clone(&store), cursors);

        let (journal, lock_file) = match (&parts.data_dir, backend) {
            (Some(dir), Backend::File) => {
                let lock_file = acquire_directory_lock(dir)?;
                let (journal, mutations, report) =
                    Journal::open(dir.join(JOURNAL_FILE_NAME), config.durability_mode()?)?;
                for mutation in &mutations {
                    store.apply(mutation).map_err(|e| {
                        TempoError::corruption(format!(
                            "journal record '{}' for branch '{}' cannot be replayed: {}",
                            mutation.kind(),
                            mutation.branch(),
                            e
                        ))
                    })?;
                }
                info!(
                    target: "tempo::recovery",
                    records = report.records,
                    truncated_bytes = report.truncated_bytes,
                    branches = store.branch_count(),
                    entries = store.total_entries(),
                    "Journal replayed"
                );
                (Some(journal), Some(lock_file))
            }
            (None, Backend::File) => {
                return Err(TempoError::invalid_argument(
                    "the file backend needs a data directory",
                ));
            }
            (_, Backend::Memory) => (None, None),
        };

        let coordinator = CommitCoordinator::new();
        coordinator.set_debug_hook(parts.debug_hook);

        let db = Arc::new(Database {
            data_dir: parts.data_dir,
            store,
            temporal,
            commit_log,
            journal,
            persist_lock: Mutex::new(()),
            locks: Arc::new(LockManager::new()),
            coordinator,
            listeners: parts.listeners,
            clock: parts.clock,
            conflict_resolution: RwLock::new(parts.conflict_resolution),
            _lock_file: lock_file,
            config,
        });

        if db.is_read_only() {
            let pending = db.store.branches_with_marker();
            if !pending.is_empty() {
                warn!(
                    target: "tempo::recovery",
                    branches = pending.len(),
                    "Read-only database carries interrupted commits; recovery skipped"
                );
            }
        } else {
            db.perform_startup_recovery_if_required()?;
        }

        info!(
            target: "tempo::recovery",
            path = ?db.data_dir,
            backend = %db.config.backend,
            read_only = db.is_read_only(),
            "Database opened"
        );
        Ok(db)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Journal then apply a group of mutations
    pub(crate) fn persist(&self, mutations: &[Mutation]) -> TempoResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let _serial = self.persist_lock.lock();
        if let Some(journal) = &self.journal {
            journal.append_all(mutations)?;
        }
        for mutation in mutations {
            self.store.apply(mutation)?;
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self, operation: &str) -> TempoResult<()> {
        if self.is_read_only() {
            return Err(TempoError::read_only(operation));
        }
        Ok(())
    }

    /// Resolve commit markers left by interrupted commits
    ///
    /// Runs on open. Returns the number of branches that carried a marker.
    pub fn perform_startup_recovery_if_required(&self) -> TempoResult<usize> {
        self.check_writable("recovery")?;
        let recovered = self.coordinator.recover_all(self)?;
        if recovered > 0 {
            info!(target: "tempo::recovery", branches = recovered, "Startup recovery complete");
        }
        Ok(recovered)
    }

    /// Rewrite the journal as a minimal snapshot of current state
    ///
    /// No-op without a journal. Takes the database lock exclusively.
    pub fn compact(&self) -> TempoResult<()> {
        self.check_writable("compact")?;
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let _exclusive = self.locks.database_exclusive()?;
        let _serial = self.persist_lock.lock();
        let snapshot = crate::dump::snapshot_mutations(self)?;
        journal.compact(&snapshot)?;
        info!(target: "tempo::journal", records = snapshot.len(), "Journal compacted");
        Ok(())
    }

    /// Force journal contents to disk
    pub fn flush(&self) -> TempoResult<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Data directory, if any
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Configuration the database was opened with
    pub fn config(&self) -> &TempoConfig {
        &self.config
    }

    /// Whether every mutation is rejected
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Whether changes are journaled to disk
    pub fn is_persistent(&self) -> bool {
        self.journal.is_some()
    }

    /// Lineage-aware read access
    pub fn temporal(&self) -> &TemporalStore {
        &self.temporal
    }

    /// Per-branch commit table queries
    pub fn commit_log(&self) -> &CommitLog {
        &self.commit_log
    }

    /// Hook registration
    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// Source of commit timestamps
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Database and branch locks
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Owned handle on the locks, for iterators that outlive a borrow
    pub(crate) fn lock_handle(&self) -> Arc<LockManager> {
        Arc::clone(&self.locks)
    }

    pub(crate) fn store(&self) -> &Arc<ShardedStore> {
        self.temporal.store()
    }

    pub(crate) fn cache(&self) -> &Arc<QueryCache> {
        self.temporal.cache()
    }

    pub(crate) fn coordinator(&self) -> &CommitCoordinator {
        &self.coordinator
    }

    /// Install (or remove) the commit debug hook
    pub fn set_debug_hook(&self, hook: Option<DebugHook>) {
        self.coordinator.set_debug_hook(hook);
    }

    /// Default conflict resolution strategy
    pub fn conflict_resolution(&self) -> ConflictResolutionStrategy {
        self.conflict_resolution.read().clone()
    }

    /// Replace the default conflict resolution strategy
    pub fn set_conflict_resolution(&self, strategy: ConflictResolutionStrategy) {
        *self.conflict_resolution.write() = strategy;
    }

    /// Duplicate version elimination mode
    pub fn duplicate_version_elimination(&self) -> DuplicateVersionElimination {
        self.config
            .duplicate_version_elimination()
            .unwrap_or_default()
    }

    /// Transaction and recovery statistics
    pub fn metrics(&self) -> CommitMetrics {
        self.coordinator.metrics()
    }

    /// Whether an incremental commit is open on `branch`
    pub fn has_open_incremental_commit(&self, branch: &BranchName) -> bool {
        self.coordinator.has_open_incremental(branch)
    }

    /// Number of iterators opened and not yet closed or dropped
    pub fn open_cursors(&self) -> usize {
        self.temporal.open_cursors()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(target: "tempo::journal", error = %e, "Failed to flush journal on close");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.data_dir)
            .field("config", &self.config)
            .field("branches", &self.store().branch_count())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

fn acquire_directory_lock(dir: &Path) -> TempoResult<File> {
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(dir.join(".lock"))?;
    fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
        TempoError::invalid_operation(format!(
            "database at '{}' is already in use by another process",
            dir.display()
        ))
    })?;
    Ok(lock_file)
}
