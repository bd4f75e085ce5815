//! Core types for the tempo store
//!
//! This crate defines the foundational types used throughout the system:
//! - BranchName / BranchInfo: branch identity and lineage
//! - QualifiedKey / TemporalKey / TemporalEntry: coordinates and versions
//! - Period: half-open validity intervals
//! - CommitRecord / CommitMarker: commit table rows and in-flight markers
//! - Mutation: the unit of persisted change
//! - Clock: injectable time source
//! - TempoError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod clock;
pub mod commit;
pub mod error;
pub mod mutation;
pub mod period;
pub mod types;

pub use branch::{BranchInfo, BranchName, MASTER_BRANCH, MAX_BRANCH_NAME_LENGTH};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit::{CommitMarker, CommitRecord};
pub use error::{TempoError, TempoResult};
pub use mutation::Mutation;
pub use period::{Period, INFINITE};
pub use types::{Order, QualifiedKey, TemporalEntry, TemporalKey};
