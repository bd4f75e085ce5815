//! Commit log queries
//!
//! The commit log of a branch contains only the branch's own commits;
//! commits of ancestors are not inherited. All queries optionally hide
//! system-internal commits, and that filtering happens before paging or
//! counting. Records above the branch's `now` belong to a commit that has
//! not reached its commit point and are never returned.
//!
//! | query | order |
//! |-------|-------|
//! | `*_between` | as requested |
//! | `*_paged` | as requested, page cut after ordering |
//! | `*_around` / `*_before` / `*_after` | newest first |

use std::collections::BTreeSet;
use std::sync::Arc;
use tempo_core::{BranchName, CommitRecord, Order, TempoError, TempoResult};

use crate::iter::{Batched, CloseableIter, CursorTracker, DEFAULT_BATCH_SIZE};
use crate::sharded::ShardedStore;

/// A commit timestamp with its (filtered) metadata
pub type CommitMetadata = (u64, Option<Vec<u8>>);

/// Read access to per-branch commit tables
pub struct CommitLog {
    store: Arc<ShardedStore>,
    cursors: Arc<CursorTracker>,
}

impl CommitLog {
    /// Create a commit log view over `store`
    pub fn new(store: Arc<ShardedStore>, cursors: Arc<CursorTracker>) -> Self {
        CommitLog { store, cursors }
    }

    /// Commits within `[from, to]`
    pub fn commits_between(
        &self,
        branch: &BranchName,
        from: u64,
        to: u64,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<CloseableIter<CommitRecord>> {
        check_bounds(from, to)?;
        let shard = self.store.shard(branch)?;
        let to = to.min(shard.read().info().now);
        let mut resume: Option<u64> = None;
        let mut finished = false;
        let iter = Batched::new(DEFAULT_BATCH_SIZE, move |size| {
            if finished {
                return Vec::new();
            }
            let (lo, hi) = match (order, resume) {
                (_, None) => (from, to),
                (Order::Ascending, Some(last)) => match last.checked_add(1) {
                    Some(next) if next <= to => (next, to),
                    _ => return Vec::new(),
                },
                (Order::Descending, Some(last)) => match last.checked_sub(1) {
                    Some(prev) if prev >= from => (from, prev),
                    _ => return Vec::new(),
                },
            };
            let guard = shard.read();
            let matching = guard.commits().between(lo, hi, include_internal);
            let batch: Vec<CommitRecord> = match order {
                Order::Ascending => matching.take(size).cloned().collect(),
                Order::Descending => matching.rev().take(size).cloned().collect(),
            };
            match batch.last() {
                Some(last) => resume = Some(last.timestamp),
                None => finished = true,
            }
            batch
        });
        Ok(CloseableIter::new(iter, Some(Arc::clone(&self.cursors)), "commit_scan"))
    }

    /// Commit timestamps within `[from, to]`
    pub fn commit_timestamps_between(
        &self,
        branch: &BranchName,
        from: u64,
        to: u64,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<Vec<u64>> {
        Ok(self
            .commits_between(branch, from, to, order, include_internal)?
            .collect_and_close()
            .into_iter()
            .map(|record| record.timestamp)
            .collect())
    }

    /// Commit timestamps and metadata within `[from, to]`
    pub fn commit_metadata_between(
        &self,
        branch: &BranchName,
        from: u64,
        to: u64,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitMetadata>> {
        Ok(self
            .commits_between(branch, from, to, order, include_internal)?
            .collect_and_close()
            .into_iter()
            .map(|record| (record.timestamp, record.metadata))
            .collect())
    }

    /// One page of commits within `[min, max]`
    #[allow(clippy::too_many_arguments)]
    pub fn commits_paged(
        &self,
        branch: &BranchName,
        min: u64,
        max: u64,
        page_size: usize,
        page_index: usize,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitRecord>> {
        check_bounds(min, max)?;
        if page_size == 0 {
            return Err(TempoError::invalid_argument("page size must be positive"));
        }
        let shard = self.store.shard(branch)?;
        let guard = shard.read();
        let max = max.min(guard.info().now);
        Ok(guard
            .commits()
            .paged(min, max, page_size, page_index, order, include_internal))
    }

    /// One page of commit timestamps within `[min, max]`
    #[allow(clippy::too_many_arguments)]
    pub fn commit_timestamps_paged(
        &self,
        branch: &BranchName,
        min: u64,
        max: u64,
        page_size: usize,
        page_index: usize,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<Vec<u64>> {
        Ok(timestamps(self.commits_paged(
            branch,
            min,
            max,
            page_size,
            page_index,
            order,
            include_internal,
        )?))
    }

    /// One page of commit metadata within `[min, max]`
    #[allow(clippy::too_many_arguments)]
    pub fn commit_metadata_paged(
        &self,
        branch: &BranchName,
        min: u64,
        max: u64,
        page_size: usize,
        page_index: usize,
        order: Order,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitMetadata>> {
        Ok(metadata(self.commits_paged(
            branch,
            min,
            max,
            page_size,
            page_index,
            order,
            include_internal,
        )?))
    }

    /// Up to `count` commits around `timestamp`, newest first
    pub fn commits_around(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitRecord>> {
        let shard = self.store.shard(branch)?;
        let guard = shard.read();
        Ok(guard.commits().around(timestamp, guard.info().now, count, include_internal))
    }

    /// Up to `count` commits strictly before `timestamp`, newest first
    pub fn commits_before(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitRecord>> {
        let shard = self.store.shard(branch)?;
        let guard = shard.read();
        Ok(guard.commits().before(timestamp, guard.info().now, count, include_internal))
    }

    /// Up to `count` commits strictly after `timestamp`, newest first
    pub fn commits_after(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitRecord>> {
        let shard = self.store.shard(branch)?;
        let guard = shard.read();
        Ok(guard.commits().after(timestamp, guard.info().now, count, include_internal))
    }

    /// Timestamps of up to `count` commits around `timestamp`
    pub fn commit_timestamps_around(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<u64>> {
        Ok(timestamps(self.commits_around(branch, timestamp, count, include_internal)?))
    }

    /// Metadata of up to `count` commits around `timestamp`
    pub fn commit_metadata_around(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitMetadata>> {
        Ok(metadata(self.commits_around(branch, timestamp, count, include_internal)?))
    }

    /// Timestamps of up to `count` commits strictly before `timestamp`
    pub fn commit_timestamps_before(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<u64>> {
        Ok(timestamps(self.commits_before(branch, timestamp, count, include_internal)?))
    }

    /// Metadata of up to `count` commits strictly before `timestamp`
    pub fn commit_metadata_before(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitMetadata>> {
        Ok(metadata(self.commits_before(branch, timestamp, count, include_internal)?))
    }

    /// Timestamps of up to `count` commits strictly after `timestamp`
    pub fn commit_timestamps_after(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<u64>> {
        Ok(timestamps(self.commits_after(branch, timestamp, count, include_internal)?))
    }

    /// Metadata of up to `count` commits strictly after `timestamp`
    pub fn commit_metadata_after(
        &self,
        branch: &BranchName,
        timestamp: u64,
        count: usize,
        include_internal: bool,
    ) -> TempoResult<Vec<CommitMetadata>> {
        Ok(metadata(self.commits_after(branch, timestamp, count, include_internal)?))
    }

    /// Number of commits within `[from, to]`
    pub fn count_commit_timestamps_between(
        &self,
        branch: &BranchName,
        from: u64,
        to: u64,
        include_internal: bool,
    ) -> TempoResult<usize> {
        check_bounds(from, to)?;
        let shard = self.store.shard(branch)?;
        let guard = shard.read();
        Ok(guard.commits().count_between(from, to.min(guard.info().now), include_internal))
    }

    /// Number of commits on the branch
    pub fn count_commit_timestamps(&self, branch: &BranchName, include_internal: bool) -> TempoResult<usize> {
        self.count_commit_timestamps_between(branch, 0, u64::MAX, include_internal)
    }

    /// Record of the commit at exactly `timestamp`
    pub fn commit(&self, branch: &BranchName, timestamp: u64) -> TempoResult<Option<CommitRecord>> {
        let shard = self.store.shard(branch)?;
        let guard = shard.read();
        if timestamp > guard.info().now {
            return Ok(None);
        }
        Ok(guard.commits().get(timestamp).cloned())
    }

    /// Metadata of the commit at exactly `timestamp`
    ///
    /// `None` both when there is no such commit and when it carries no
    /// metadata.
    pub fn commit_metadata(&self, branch: &BranchName, timestamp: u64) -> TempoResult<Option<Vec<u8>>> {
        Ok(self.commit(branch, timestamp)?.and_then(|record| record.metadata))
    }

    /// Keys of `keyspace` written by the commit at `timestamp`
    pub fn changed_keys_at_commit(
        &self,
        branch: &BranchName,
        timestamp: u64,
        keyspace: &str,
    ) -> TempoResult<BTreeSet<String>> {
        let shard = self.store.shard(branch)?;
        let guard = shard.read();
        if timestamp > guard.info().now {
            return Ok(BTreeSet::new());
        }
        let Some(table) = guard.keyspace(keyspace) else {
            return Ok(BTreeSet::new());
        };
        Ok(table
            .iter()
            .filter(|(_, chain)| chain.get_exact(timestamp).is_some())
            .map(|(key, _)| key.clone())
            .collect())
    }
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog").finish_non_exhaustive()
    }
}

fn check_bounds(from: u64, to: u64) -> TempoResult<()> {
    if from > to {
        return Err(TempoError::invalid_range(format!(
            "lower bound {} is greater than upper bound {}",
            from, to
        )));
    }
    Ok(())
}

fn timestamps(records: Vec<CommitRecord>) -> Vec<u64> {
    records.into_iter().map(|record| record.timestamp).collect()
}

fn metadata(records: Vec<CommitRecord>) -> Vec<CommitMetadata> {
    records
        .into_iter()
        .map(|record| (record.timestamp, record.metadata))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::{Mutation, TemporalEntry, TemporalKey};

    fn setup() -> (Arc<ShardedStore>, CommitLog) {
        let store = Arc::new(ShardedStore::new());
        let master = BranchName::master();
        for ts in 1..=600u64 {
            let record = if ts % 100 == 0 {
                CommitRecord::internal(ts, None)
            } else {
                CommitRecord::new(ts, Some(ts.to_le_bytes().to_vec()))
            };
            store
                .apply(&Mutation::PutCommit {
                    branch: master.clone(),
                    record,
                })
                .unwrap();
        }
        store
            .apply(&Mutation::SetNow {
                branch: master.clone(),
                now: 600,
            })
            .unwrap();
        let log = CommitLog::new(Arc::clone(&store), Arc::new(CursorTracker::new()));
        (store, log)
    }

    #[test]
    fn test_between_spans_several_batches() {
        let (_, log) = setup();
        let master = BranchName::master();
        let all = log
            .commit_timestamps_between(&master, 0, u64::MAX, Order::Ascending, true)
            .unwrap();
        assert_eq!(all.len(), 600);
        assert!(all.windows(2).all(|w| w[0] < w[1]));

        let visible = log
            .commit_timestamps_between(&master, 0, u64::MAX, Order::Descending, false)
            .unwrap();
        assert_eq!(visible.len(), 594);
        assert_eq!(visible[0], 599);
        assert!(!visible.contains(&300));
    }

    #[test]
    fn test_paged_and_counts() {
        let (_, log) = setup();
        let master = BranchName::master();
        let page = log
            .commit_timestamps_paged(&master, 95, 110, 5, 0, Order::Ascending, false)
            .unwrap();
        assert_eq!(page, vec![95, 96, 97, 98, 99]);
        let page = log
            .commit_timestamps_paged(&master, 95, 110, 5, 1, Order::Ascending, false)
            .unwrap();
        assert_eq!(page, vec![101, 102, 103, 104, 105]);

        assert_eq!(log.count_commit_timestamps(&master, false).unwrap(), 594);
        assert_eq!(log.count_commit_timestamps(&master, true).unwrap(), 600);
        assert!(matches!(
            log.commit_timestamps_paged(&master, 0, 10, 0, 0, Order::Ascending, false),
            Err(TempoError::InvalidArgument { .. })
        ));
        assert!(matches!(
            log.count_commit_timestamps_between(&master, 10, 0, false),
            Err(TempoError::InvalidTemporalRange { .. })
        ));
    }

    #[test]
    fn test_neighbourhood_skips_internal() {
        let (_, log) = setup();
        let master = BranchName::master();
        assert_eq!(
            log.commit_timestamps_around(&master, 100, 4, false).unwrap(),
            vec![102, 101, 99, 98]
        );
        assert_eq!(
            log.commit_timestamps_before(&master, 101, 2, false).unwrap(),
            vec![99, 98]
        );
        assert_eq!(
            log.commit_timestamps_after(&master, 98, 3, true).unwrap(),
            vec![101, 100, 99]
        );
    }

    #[test]
    fn test_records_above_now_are_hidden() {
        let (store, log) = setup();
        let master = BranchName::master();
        store
            .apply(&Mutation::PutCommit {
                branch: master.clone(),
                record: CommitRecord::new(700, Some(b"pending".to_vec())),
            })
            .unwrap();

        assert_eq!(log.count_commit_timestamps(&master, true).unwrap(), 600);
        assert_eq!(log.commit_timestamps_after(&master, 598, 5, true).unwrap(), vec![600, 599]);
        assert_eq!(log.commit_timestamps_around(&master, 700, 2, true).unwrap(), vec![600, 599]);
        assert_eq!(log.commit_timestamps_before(&master, 800, 1, true).unwrap(), vec![600]);
        assert_eq!(
            log.commit_timestamps_paged(&master, 599, u64::MAX, 5, 0, Order::Descending, true)
                .unwrap(),
            vec![600, 599]
        );
        let tail = log
            .commit_timestamps_between(&master, 590, u64::MAX, Order::Descending, true)
            .unwrap();
        assert_eq!(tail.first(), Some(&600));
        assert_eq!(log.commit_metadata(&master, 700).unwrap(), None);

        store
            .apply(&Mutation::SetNow {
                branch: master.clone(),
                now: 700,
            })
            .unwrap();
        assert_eq!(log.commit_metadata(&master, 700).unwrap(), Some(b"pending".to_vec()));
        assert_eq!(log.count_commit_timestamps(&master, true).unwrap(), 601);
    }

    #[test]
    fn test_metadata_and_changed_keys() {
        let (store, log) = setup();
        let master = BranchName::master();
        assert_eq!(
            log.commit_metadata(&master, 7).unwrap(),
            Some(7u64.to_le_bytes().to_vec())
        );
        assert_eq!(log.commit_metadata(&master, 100).unwrap(), None);
        assert_eq!(log.commit_metadata(&master, 10_000).unwrap(), None);

        store
            .apply(&Mutation::PutEntries {
                branch: master.clone(),
                entries: vec![
                    TemporalEntry::new(TemporalKey::new("kv", "a", 7), b"1".to_vec()),
                    TemporalEntry::tombstone(TemporalKey::new("kv", "b", 7)),
                    TemporalEntry::new(TemporalKey::new("kv", "c", 8), b"1".to_vec()),
                ],
            })
            .unwrap();
        let keys = log.changed_keys_at_commit(&master, 7, "kv").unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(log.changed_keys_at_commit(&master, 7, "other").unwrap().is_empty());
    }
}
