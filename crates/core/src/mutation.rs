//! Physical table mutations
//!
//! Everything that changes persisted state is expressed as a `Mutation`.
//! The storage layer applies mutations to its in-memory tables; the
//! durability layer journals them before they are applied, and replays them
//! on open. Mutations are idempotent: applying one twice leaves the same
//! state as applying it once, which is what makes journal replay after a
//! torn write safe.

use serde::{Deserialize, Serialize};

use crate::branch::{BranchInfo, BranchName};
use crate::commit::{CommitMarker, CommitRecord};
use crate::types::{TemporalEntry, TemporalKey};

/// A single idempotent change to persisted state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Register a branch (parent must already exist)
    CreateBranch(BranchInfo),
    /// Remove a branch with all its tables
    RemoveBranch(BranchName),
    /// Move a branch's `now`
    SetNow {
        /// Target branch
        branch: BranchName,
        /// New value
        now: u64,
    },
    /// Upsert entries
    PutEntries {
        /// Target branch
        branch: BranchName,
        /// Entries to write
        entries: Vec<TemporalEntry>,
    },
    /// Physically delete entries
    RemoveEntries {
        /// Target branch
        branch: BranchName,
        /// Coordinates to delete
        keys: Vec<TemporalKey>,
    },
    /// Upsert a commit record
    PutCommit {
        /// Target branch
        branch: BranchName,
        /// Record to write
        record: CommitRecord,
    },
    /// Delete a commit record
    RemoveCommit {
        /// Target branch
        branch: BranchName,
        /// Timestamp of the record
        timestamp: u64,
    },
    /// Set (or adjust) the creation timestamp of a keyspace
    SetKeyspaceCreation {
        /// Target branch
        branch: BranchName,
        /// Keyspace name
        keyspace: String,
        /// Creation timestamp
        timestamp: u64,
    },
    /// Forget a keyspace's creation record
    RemoveKeyspace {
        /// Target branch
        branch: BranchName,
        /// Keyspace name
        keyspace: String,
    },
    /// Record that a commit is in flight on a branch
    BeginCommit {
        /// Target branch
        branch: BranchName,
        /// Marker describing the commit
        marker: CommitMarker,
    },
    /// Clear the in-flight marker of a branch
    EndCommit {
        /// Target branch
        branch: BranchName,
    },
}

impl Mutation {
    /// Branch this mutation targets
    pub fn branch(&self) -> &BranchName {
        match self {
            Mutation::CreateBranch(info) => &info.name,
            Mutation::RemoveBranch(branch)
            | Mutation::SetNow { branch, .. }
            | Mutation::PutEntries { branch, .. }
            | Mutation::RemoveEntries { branch, .. }
            | Mutation::PutCommit { branch, .. }
            | Mutation::RemoveCommit { branch, .. }
            | Mutation::SetKeyspaceCreation { branch, .. }
            | Mutation::RemoveKeyspace { branch, .. }
            | Mutation::BeginCommit { branch, .. }
            | Mutation::EndCommit { branch } => branch,
        }
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::CreateBranch(_) => "create_branch",
            Mutation::RemoveBranch(_) => "remove_branch",
            Mutation::SetNow { .. } => "set_now",
            Mutation::PutEntries { .. } => "put_entries",
            Mutation::RemoveEntries { .. } => "remove_entries",
            Mutation::PutCommit { .. } => "put_commit",
            Mutation::RemoveCommit { .. } => "remove_commit",
            Mutation::SetKeyspaceCreation { .. } => "set_keyspace_creation",
            Mutation::RemoveKeyspace { .. } => "remove_keyspace",
            Mutation::BeginCommit { .. } => "begin_commit",
            Mutation::EndCommit { .. } => "end_commit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_accessor() {
        let m = Mutation::SetNow {
            branch: BranchName::master(),
            now: 10,
        };
        assert!(m.branch().is_master());
        assert_eq!(m.kind(), "set_now");
    }

    #[test]
    fn test_msgpack_encoding_preserves_tombstones() {
        let m = Mutation::PutEntries {
            branch: BranchName::master(),
            entries: vec![
                TemporalEntry::new(TemporalKey::new("kv", "a", 1), b"v".to_vec()),
                TemporalEntry::tombstone(TemporalKey::new("kv", "b", 1)),
            ],
        };
        let bytes = rmp_serde::to_vec(&m).unwrap();
        let decoded: Mutation = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, m);
    }
}
