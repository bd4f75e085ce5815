//! Lock manager
//!
//! Two kinds of locks serialize writers:
//!
//! | lock | modes | held by |
//! |------|-------|---------|
//! | database | shared / exclusive, reentrant | readers and branch-lock holders (shared); bulk import, branch deletion, compaction (exclusive) |
//! | branch | exclusive, reentrant | commits, incremental commits, dateback |
//!
//! Acquiring a branch lock acquires the database lock in shared mode first.
//! A thread holding the database lock only in shared mode may not acquire
//! it exclusively; that upgrade is rejected with `InvalidOperation` since
//! two threads attempting it would deadlock.
//!
//! All locks are released by RAII guards.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tempo_core::{BranchName, TempoError, TempoResult};

#[derive(Debug, Default)]
struct LockState {
    /// Owner and reentrancy depth of the exclusive hold
    exclusive: Option<(ThreadId, usize)>,
    /// Shared holds per thread
    shared: FxHashMap<ThreadId, usize>,
    /// Threads blocked on an exclusive acquire
    waiting_exclusive: usize,
}

/// Reentrant reader-writer lock keyed by thread identity
#[derive(Debug, Default)]
pub struct ReentrantRwLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl ReentrantRwLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire in shared mode, blocking while another thread holds it exclusively
    pub fn lock_shared(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            let owned_by_me = matches!(state.exclusive, Some((owner, _)) if owner == me);
            let already_shared = state.shared.contains_key(&me);
            let free = state.exclusive.is_none() && (state.waiting_exclusive == 0 || already_shared);
            if owned_by_me || free {
                *state.shared.entry(me).or_insert(0) += 1;
                return;
            }
            self.released.wait(&mut state);
        }
    }

    /// Acquire in exclusive mode
    ///
    /// Fails with `InvalidOperation` if the calling thread holds the lock in
    /// shared mode only.
    pub fn lock_exclusive(&self) -> TempoResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some((owner, depth)) = state.exclusive.as_mut() {
            if *owner == me {
                *depth += 1;
                return Ok(());
            }
        }
        if state.shared.contains_key(&me) {
            return Err(TempoError::invalid_operation(
                "cannot upgrade a shared lock to exclusive",
            ));
        }
        state.waiting_exclusive += 1;
        while state.exclusive.is_some() || !state.shared.is_empty() {
            self.released.wait(&mut state);
        }
        state.waiting_exclusive -= 1;
        state.exclusive = Some((me, 1));
        Ok(())
    }

    /// Release one shared hold of the calling thread
    pub fn unlock_shared(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(count) = state.shared.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                state.shared.remove(&me);
            }
        }
        drop(state);
        self.released.notify_all();
    }

    /// Release one exclusive hold of the calling thread
    pub fn unlock_exclusive(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some((owner, depth)) = state.exclusive.as_mut() {
            if *owner == me {
                *depth -= 1;
                if *depth == 0 {
                    state.exclusive = None;
                }
            }
        }
        drop(state);
        self.released.notify_all();
    }

    /// Whether the calling thread holds the lock exclusively
    pub fn is_held_exclusively_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        matches!(self.state.lock().exclusive, Some((owner, _)) if owner == me)
    }

    /// Whether any thread holds the lock in any mode
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.exclusive.is_some() || !state.shared.is_empty()
    }
}

/// Hold on the database lock
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct DatabaseGuard {
    lock: Arc<ReentrantRwLock>,
    exclusive: bool,
}

impl DatabaseGuard {
    /// Whether this guard holds the lock exclusively
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for DatabaseGuard {
    fn drop(&mut self) {
        if self.exclusive {
            self.lock.unlock_exclusive();
        } else {
            self.lock.unlock_shared();
        }
    }
}

/// Hold on a branch lock (and the database lock in shared mode)
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct BranchGuard {
    // Field order matters: the branch lock is released before the
    // database lock.
    branch_lock: Arc<ReentrantRwLock>,
    branch: BranchName,
    _database: DatabaseGuard,
}

impl BranchGuard {
    /// Branch this guard locks
    pub fn branch(&self) -> &BranchName {
        &self.branch
    }
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        self.branch_lock.unlock_exclusive();
    }
}

/// Database-wide and per-branch locks
#[derive(Debug, Default)]
pub struct LockManager {
    database: Arc<ReentrantRwLock>,
    branches: DashMap<BranchName, Arc<ReentrantRwLock>>,
}

impl LockManager {
    /// Create a lock manager with no locks held
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the database lock in shared mode
    pub fn database_shared(&self) -> DatabaseGuard {
        self.database.lock_shared();
        DatabaseGuard {
            lock: Arc::clone(&self.database),
            exclusive: false,
        }
    }

    /// Take the database lock exclusively
    pub fn database_exclusive(&self) -> TempoResult<DatabaseGuard> {
        self.database.lock_exclusive()?;
        Ok(DatabaseGuard {
            lock: Arc::clone(&self.database),
            exclusive: true,
        })
    }

    /// Take the exclusive lock of a branch
    pub fn branch(&self, branch: &BranchName) -> TempoResult<BranchGuard> {
        let database = self.database_shared();
        let branch_lock = Arc::clone(
            self.branches
                .entry(branch.clone())
                .or_insert_with(|| Arc::new(ReentrantRwLock::new()))
                .value(),
        );
        branch_lock.lock_exclusive()?;
        Ok(BranchGuard {
            branch_lock,
            branch: branch.clone(),
            _database: database,
        })
    }

    /// Whether the calling thread holds the lock of `branch`
    pub fn holds_branch(&self, branch: &BranchName) -> bool {
        self.branches
            .get(branch)
            .map(|lock| lock.is_held_exclusively_by_current_thread())
            .unwrap_or(false)
    }

    /// Drop the lock object of a deleted branch
    pub fn forget_branch(&self, branch: &BranchName) {
        self.branches.remove(branch);
    }
}
