//! Database engine for tempo
//!
//! This crate orchestrates all lower layers:
//! - Database: open/close, configuration, journal replay, startup recovery
//! - Branch lifecycle: create, delete, bulk load
//! - Transactions and the staged commit protocol (CommitCoordinator)
//! - Dateback: purge, inject and transform committed history
//! - Dump/import of whole stores
//! - Listeners, change consumers and the commit metadata filter
//!
//! The engine is the only component that knows about:
//! - Cross-layer coordination (storage + journal + locks)
//! - Commit markers and how to resolve them

#![warn(missing_docs)]
#![warn(clippy::all)]

mod branch_ops;
pub mod coordinator;
pub mod database;
pub mod dateback;
pub mod dump;
pub mod listener;
pub mod transaction;

pub use coordinator::{CommitMetrics, CommitStage, DebugHook};
pub use database::{Backend, Database, DatabaseBuilder, RetryConfig, TempoConfig, CONFIG_FILE_NAME, JOURNAL_FILE_NAME};
pub use dateback::{CommitContents, Dateback, Transformation};
pub use dump::{BranchDump, ImportInfo, StoreDump, DUMP_FORMAT_VERSION};
pub use listener::{BranchListener, ChangeConsumer, Listeners, MetadataFilter};
pub use transaction::Transaction;

pub use tempo_concurrency::{
    Conflict, ConflictResolutionStrategy, ConflictResolver, DuplicateVersionElimination, Resolution,
    TransactionState,
};
pub use tempo_core::{
    BranchInfo, BranchName, Clock, CommitRecord, ManualClock, Order, Period, QualifiedKey, SystemClock,
    TemporalEntry, TemporalKey, TempoError, TempoResult, INFINITE,
};
pub use tempo_storage::{CloseableIter, CommitMetadata};
