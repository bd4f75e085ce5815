//! Storage layer for tempo
//!
//! This crate implements the in-memory tables and the read paths over them:
//! - ShardedStore: DashMap of per-branch shards (entries, commits, keyspaces)
//! - BranchRegistry: lineage and branch lifecycle validation
//! - TemporalStore: lineage-aware point reads, validity periods, scans
//! - CommitLog: per-branch commit ledger queries
//! - QueryCache: LRU cache of validity periods
//! - CloseableIter: lazy batched scans with explicit close
//!
//! # Writes
//!
//! Tables are only changed through `ShardedStore::apply(&Mutation)`. The
//! engine journals each mutation before applying it, so the tables can
//! always be rebuilt by replaying the journal.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod commit_log;
pub mod commit_table;
pub mod iter;
pub mod registry;
pub mod sharded;
pub mod temporal;

pub use cache::QueryCache;
pub use commit_log::{CommitLog, CommitMetadata};
pub use commit_table::CommitTable;
pub use iter::{Batched, CloseableIter, CursorTracker, DEFAULT_BATCH_SIZE};
pub use registry::{BranchRegistry, LineageLevel};
pub use sharded::{BranchShard, KeyspaceTable, ShardedStore, VersionChain};
pub use temporal::TemporalStore;
