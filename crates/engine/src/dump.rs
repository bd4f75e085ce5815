//! Dump and bulk load of store contents
//!
//! ## Export
//!
//! [`Database::export`] captures every branch (parents first) with its
//! committed entries, commit records and keyspace creation timestamps as a
//! [`StoreDump`]. Entries and commits above a branch's `now` belong to an
//! unfinished commit and are left out.
//!
//! ## Import
//!
//! [`Database::import`] loads a dump into a database whose only branch
//! holding the same names is the root. The dump's root branch is merged
//! into the existing root.
//!
//! ## Raw access
//!
//! `all_entries_iterator` and `insert_entries` read and write a single
//! branch's own table without temporal consistency checks, for external
//! dump tooling.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tempo_core::{
    BranchInfo, BranchName, CommitRecord, Mutation, TemporalEntry, TempoError, TempoResult,
};
use tempo_storage::CloseableIter;
use tracing::info;

use crate::database::Database;

/// Current dump format version
pub const DUMP_FORMAT_VERSION: u32 = 1;

/// Contents of one branch in a dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDump {
    /// Branch metadata
    pub info: BranchInfo,
    /// keyspace → creation timestamp
    pub keyspaces: BTreeMap<String, u64>,
    /// Own entries, ordered by coordinate
    pub entries: Vec<TemporalEntry>,
    /// Own commit records, ascending
    pub commits: Vec<CommitRecord>,
}

/// Serializable image of a whole store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDump {
    /// Format version, checked on import
    pub format_version: u32,
    /// Branches, parents before children
    pub branches: Vec<BranchDump>,
}

impl StoreDump {
    /// Encode as pretty-printed JSON
    pub fn to_json(&self) -> TempoResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| TempoError::serialization(e.to_string()))
    }

    /// Decode from JSON
    pub fn from_json(json: &str) -> TempoResult<Self> {
        serde_json::from_str(json).map_err(|e| TempoError::serialization(e.to_string()))
    }

    /// Write as JSON to `path`
    pub fn write_to_file(&self, path: &Path) -> TempoResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read a JSON dump from `path`
    pub fn read_from_file(path: &Path) -> TempoResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Total number of entries across branches
    pub fn entry_count(&self) -> usize {
        self.branches.iter().map(|b| b.entries.len()).sum()
    }
}

/// Summary of an import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportInfo {
    /// Branches registered (the root is merged, not counted)
    pub branches_created: usize,
    /// Entries written
    pub entries_written: usize,
    /// Commit records written
    pub commits_written: usize,
}

impl Database {
    /// Capture every branch with its committed contents
    ///
    /// Takes the database lock exclusively so the image is consistent.
    pub fn export(&self) -> TempoResult<StoreDump> {
        let _exclusive = self.locks().database_exclusive()?;
        let mut branches = Vec::new();
        for info in self.branches() {
            let shard = self.store().shard(&info.name)?;
            let shard = shard.read();
            let now = info.now;
            branches.push(BranchDump {
                keyspaces: shard
                    .keyspaces()
                    .iter()
                    .filter(|(_, created)| **created <= now)
                    .map(|(keyspace, created)| (keyspace.clone(), *created))
                    .collect(),
                entries: shard
                    .iter_entries()
                    .filter(|entry| entry.key.timestamp <= now)
                    .collect(),
                commits: shard.commits().between(0, now, true).cloned().collect(),
                info,
            });
        }
        info!(
            target: "tempo::storage",
            branches = branches.len(),
            "Store exported"
        );
        Ok(StoreDump {
            format_version: DUMP_FORMAT_VERSION,
            branches,
        })
    }

    /// Load a dump
    ///
    /// Branches must be ordered parents first and, apart from the root,
    /// must not exist yet. Everything is validated before the first
    /// mutation.
    pub fn import(&self, dump: &StoreDump) -> TempoResult<ImportInfo> {
        self.check_writable("import")?;
        if dump.format_version != DUMP_FORMAT_VERSION {
            return Err(TempoError::invalid_argument(format!(
                "unsupported dump format version {} (expected {})",
                dump.format_version, DUMP_FORMAT_VERSION
            )));
        }
        let _exclusive = self.locks().database_exclusive()?;

        let infos: Vec<BranchInfo> = dump.branches.iter().map(|b| b.info.clone()).collect();
        let mut mutations = self.prepare_branch_load(&infos)?;
        let mut summary = ImportInfo {
            branches_created: infos.iter().filter(|info| !info.is_root()).count(),
            ..ImportInfo::default()
        };

        for branch in &dump.branches {
            let info = &branch.info;
            for entry in &branch.entries {
                check_coordinate(info, entry.key.timestamp, !entry.key.keyspace.is_empty() && !entry.key.key.is_empty())?;
            }
            for record in &branch.commits {
                check_coordinate(info, record.timestamp, true)?;
            }

            if !branch.entries.is_empty() {
                mutations.push(Mutation::PutEntries {
                    branch: info.name.clone(),
                    entries: branch.entries.clone(),
                });
            }
            for record in &branch.commits {
                mutations.push(Mutation::PutCommit {
                    branch: info.name.clone(),
                    record: record.clone(),
                });
            }

            let existing = if info.is_root() {
                self.store().shard(&info.name)?.read().keyspaces().clone()
            } else {
                BTreeMap::new()
            };
            for (keyspace, created) in &branch.keyspaces {
                let created = existing.get(keyspace).map_or(*created, |e| (*e).min(*created));
                mutations.push(Mutation::SetKeyspaceCreation {
                    branch: info.name.clone(),
                    keyspace: keyspace.clone(),
                    timestamp: created,
                });
            }
            summary.entries_written += branch.entries.len();
            summary.commits_written += branch.commits.len();
        }

        self.persist(&mutations)?;
        self.cache().clear();
        for info in infos.iter().filter(|info| !info.is_root()) {
            self.listeners().branch_created(info);
        }
        info!(
            target: "tempo::storage",
            branches = summary.branches_created,
            entries = summary.entries_written,
            commits = summary.commits_written,
            "Store imported"
        );
        Ok(summary)
    }

    /// The branch's own entries within `[min_ts, max_ts]`
    ///
    /// No lineage resolution and no tombstone filtering. The iterator must
    /// be closed.
    pub fn all_entries_iterator(
        &self,
        branch: &BranchName,
        min_ts: u64,
        max_ts: u64,
    ) -> TempoResult<CloseableIter<TemporalEntry>> {
        self.temporal().all_entries(branch, min_ts, max_ts)
    }

    /// Write entries straight into a branch's table
    ///
    /// Bypasses the commit protocol: no commit records are created and no
    /// conflicts are checked. Keyspace creation timestamps are lowered and
    /// `now` is raised as needed. Without `force`, an entry at an existing
    /// coordinate or at a timestamp the branch does not own fails the
    /// whole call with `InvalidArgument`.
    ///
    /// Returns the number of entries written.
    pub fn insert_entries(&self, branch: &BranchName, entries: Vec<TemporalEntry>, force: bool) -> TempoResult<usize> {
        self.check_writable("insert_entries")?;
        let _guard = self.locks().branch(branch)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut mutations = Vec::new();
        {
            let shard = self.store().shard(branch)?;
            let shard = shard.read();
            let info = shard.info();
            let mut floors: BTreeMap<&str, u64> = BTreeMap::new();
            for entry in &entries {
                let key = &entry.key;
                if key.keyspace.is_empty() || key.key.is_empty() {
                    return Err(TempoError::invalid_argument("keyspace and key must not be empty"));
                }
                if !force && shard.contains(key) {
                    return Err(TempoError::invalid_argument(format!(
                        "entry {}/{}@{} already exists on branch '{}'",
                        key.keyspace, key.key, key.timestamp, branch
                    )));
                }
                if !force && !info.owns(key.timestamp) {
                    return Err(TempoError::invalid_argument(format!(
                        "timestamp {} is outside the range of branch '{}'",
                        key.timestamp, branch
                    )));
                }
                let floor = floors.entry(key.keyspace.as_str()).or_insert(key.timestamp);
                *floor = (*floor).min(key.timestamp);
            }

            for (keyspace, floor) in floors {
                if shard.keyspaces().get(keyspace).map_or(true, |created| floor < *created) {
                    mutations.push(Mutation::SetKeyspaceCreation {
                        branch: branch.clone(),
                        keyspace: keyspace.to_string(),
                        timestamp: floor,
                    });
                }
            }
            let latest = entries.iter().map(|e| e.key.timestamp).max().unwrap_or(0);
            if latest > info.now {
                mutations.push(Mutation::SetNow {
                    branch: branch.clone(),
                    now: latest,
                });
            }
        }

        let written = entries.len();
        mutations.insert(
            0,
            Mutation::PutEntries {
                branch: branch.clone(),
                entries,
            },
        );
        self.persist(&mutations)?;
        let mut scope = vec![branch.clone()];
        scope.extend(self.descendants(branch));
        self.cache().invalidate_branches(&scope);
        Ok(written)
    }
}

fn check_coordinate(info: &BranchInfo, timestamp: u64, key_ok: bool) -> TempoResult<()> {
    if !key_ok {
        return Err(TempoError::invalid_argument(format!(
            "branch '{}' holds an entry with an empty keyspace or key",
            info.name
        )));
    }
    if !info.owns(timestamp) || timestamp > info.now {
        return Err(TempoError::invalid_argument(format!(
            "timestamp {} is outside the range of branch '{}'",
            timestamp, info.name
        )));
    }
    Ok(())
}

/// Minimal mutation sequence rebuilding the current state
///
/// Used to compact the journal. The caller holds the database lock
/// exclusively and the persist lock, so this reads the tables directly.
pub(crate) fn snapshot_mutations(db: &Database) -> TempoResult<Vec<Mutation>> {
    let mut mutations = Vec::new();
    for info in db.branches() {
        let shard = db.store().shard(&info.name)?;
        let shard = shard.read();
        let name = info.name.clone();
        if info.is_root() {
            mutations.push(Mutation::SetNow {
                branch: name.clone(),
                now: info.now,
            });
        } else {
            mutations.push(Mutation::CreateBranch(info));
        }

        let entries: Vec<TemporalEntry> = shard.iter_entries().collect();
        if !entries.is_empty() {
            mutations.push(Mutation::PutEntries {
                branch: name.clone(),
                entries,
            });
        }
        for record in shard.commits().iter() {
            mutations.push(Mutation::PutCommit {
                branch: name.clone(),
                record: record.clone(),
            });
        }
        for (keyspace, created) in shard.keyspaces() {
            mutations.push(Mutation::SetKeyspaceCreation {
                branch: name.clone(),
                keyspace: keyspace.clone(),
                timestamp: *created,
            });
        }
        if let Some(marker) = shard.marker() {
            mutations.push(Mutation::BeginCommit {
                branch: name,
                marker: marker.clone(),
            });
        }
    }
    Ok(mutations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::TemporalKey;

    fn entry(keyspace: &str, key: &str, ts: u64, value: &[u8]) -> TemporalEntry {
        TemporalEntry::new(TemporalKey::new(keyspace, key, ts), value.to_vec())
    }

    #[test]
    fn test_dump_json_roundtrip_keeps_tombstones() {
        let dump = StoreDump {
            format_version: DUMP_FORMAT_VERSION,
            branches: vec![BranchDump {
                info: BranchInfo::master(),
                keyspaces: BTreeMap::from([("kv".to_string(), 10)]),
                entries: vec![
                    entry("kv", "x", 10, b"a"),
                    TemporalEntry::tombstone(TemporalKey::new("kv", "x", 20)),
                ],
                commits: vec![CommitRecord::new(10, None), CommitRecord::new(20, Some(b"m".to_vec()))],
            }],
        };
        let decoded = StoreDump::from_json(&dump.to_json().unwrap()).unwrap();
        assert_eq!(decoded, dump);
        assert!(decoded.branches[0].entries[1].is_tombstone());
    }

    #[test]
    fn test_insert_entries_rejects_existing_without_force() {
        let db = Database::ephemeral().unwrap();
        let master = BranchName::master();
        assert_eq!(db.insert_entries(&master, vec![entry("kv", "x", 5, b"a")], false).unwrap(), 1);

        let err = db.insert_entries(&master, vec![entry("kv", "x", 5, b"b")], false).unwrap_err();
        assert!(matches!(err, TempoError::InvalidArgument { .. }));
        assert_eq!(db.insert_entries(&master, vec![entry("kv", "x", 5, b"b")], true).unwrap(), 1);

        let key = tempo_core::QualifiedKey::new("kv", "x");
        assert_eq!(db.temporal().get(&master, &key, 5).unwrap(), Some(b"b".to_vec()));
        assert_eq!(db.branch(&master).unwrap().now, 5);
    }

    #[test]
    fn test_insert_entries_rejects_unowned_timestamp_on_child() {
        let db = Database::ephemeral().unwrap();
        let master = BranchName::master();
        db.insert_entries(&master, vec![entry("kv", "x", 100, b"a")], false).unwrap();
        let child = BranchName::new("child").unwrap();
        db.create_branch(&child, &master).unwrap();

        let err = db.insert_entries(&child, vec![entry("kv", "x", 100, b"b")], false).unwrap_err();
        assert!(matches!(err, TempoError::InvalidArgument { .. }));
        assert_eq!(db.insert_entries(&child, vec![entry("kv", "x", 101, b"b")], false).unwrap(), 1);
    }

    #[test]
    fn test_import_rejects_unknown_format_version() {
        let db = Database::ephemeral().unwrap();
        let dump = StoreDump {
            format_version: DUMP_FORMAT_VERSION + 1,
            branches: Vec::new(),
        };
        assert!(db.import(&dump).is_err());
    }
}
