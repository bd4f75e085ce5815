//! Commit records and in-flight commit markers

use serde::{Deserialize, Serialize};

/// One row of a branch's commit table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Commit timestamp (unique per branch)
    pub timestamp: u64,
    /// Opaque caller metadata, already passed through the metadata filter
    pub metadata: Option<Vec<u8>>,
    /// Housekeeping commits are hidden from history queries by default
    pub system_internal: bool,
}

impl CommitRecord {
    /// A user commit
    pub fn new(timestamp: u64, metadata: Option<Vec<u8>>) -> Self {
        CommitRecord {
            timestamp,
            metadata,
            system_internal: false,
        }
    }

    /// A housekeeping commit
    pub fn internal(timestamp: u64, metadata: Option<Vec<u8>>) -> Self {
        CommitRecord {
            timestamp,
            metadata,
            system_internal: true,
        }
    }
}

/// Persisted before the first stage of a commit and cleared after the last
///
/// Its presence on startup means the process stopped inside the commit
/// protocol. `now` of the branch decides the outcome: at or past
/// `timestamp` the commit point was reached, otherwise everything above
/// `previous_now` is rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    /// Timestamp the interrupted commit was writing at
    pub timestamp: u64,
    /// Branch `now` before the commit started
    pub previous_now: u64,
    /// Whether the commit was an incremental sequence
    pub incremental: bool,
}
