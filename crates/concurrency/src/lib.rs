//! Concurrency layer for tempo
//!
//! This crate implements the write-side coordination primitives:
//! - LockManager: reentrant database lock (shared / exclusive) and
//!   reentrant per-branch exclusive locks
//! - ChangeSet: buffered transaction writes
//! - Duplicate-version elimination
//! - Conflict detection and resolution strategies
//!
//! Readers never take branch locks. Isolation comes from timestamps: a
//! transaction reading at `T` cannot observe commits above `T`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod change_set;
pub mod conflict;
pub mod lock;

pub use change_set::{eliminate_duplicates, ChangeSet, DuplicateVersionElimination, TransactionState};
pub use conflict::{
    detect_conflicts, resolve_conflicts, Conflict, ConflictResolutionStrategy, ConflictResolver,
    Resolution,
};
pub use lock::{BranchGuard, DatabaseGuard, LockManager, ReentrantRwLock};
