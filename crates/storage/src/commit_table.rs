//! Commit table of one branch
//!
//! Commit records ordered by timestamp. Neighbourhood queries work on the
//! "visible" view of the table, which optionally hides system-internal
//! commits; internal commits are filtered out before any paging or
//! counting happens. Neighbourhood queries also take an inclusive `upper`
//! cap so records of a commit that has not reached its commit point stay
//! out of them.

use std::collections::BTreeMap;
use std::ops::Bound;
use tempo_core::{CommitRecord, Order};

/// Ordered commit records of a branch
#[derive(Debug, Clone, Default)]
pub struct CommitTable {
    records: BTreeMap<u64, CommitRecord>,
}

impl CommitTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub fn put(&mut self, record: CommitRecord) {
        self.records.insert(record.timestamp, record);
    }

    /// Remove the record at `timestamp`
    pub fn remove(&mut self, timestamp: u64) -> Option<CommitRecord> {
        self.records.remove(&timestamp)
    }

    /// Record at exactly `timestamp`
    pub fn get(&self, timestamp: u64) -> Option<&CommitRecord> {
        self.records.get(&timestamp)
    }

    /// Number of records, internal ones included
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Timestamps of every record strictly after `timestamp`
    pub fn timestamps_after(&self, timestamp: u64) -> Vec<u64> {
        self.records
            .range((Bound::Excluded(timestamp), Bound::Unbounded))
            .map(|(ts, _)| *ts)
            .collect()
    }

    /// Records in `[lower, upper]`, ascending, optionally hiding internal ones
    pub fn between(
        &self,
        lower: u64,
        upper: u64,
        include_internal: bool,
    ) -> impl DoubleEndedIterator<Item = &CommitRecord> + '_ {
        let bounds = if lower <= upper {
            (Bound::Included(lower), Bound::Included(upper))
        } else {
            (Bound::Included(0), Bound::Excluded(0))
        };
        self.records
            .range(bounds)
            .map(|(_, record)| record)
            .filter(move |record| include_internal || !record.system_internal)
    }

    /// Page of records in `[lower, upper]`
    ///
    /// `page_index` is zero-based. Pages are cut after ordering.
    pub fn paged(
        &self,
        lower: u64,
        upper: u64,
        page_size: usize,
        page_index: usize,
        order: Order,
        include_internal: bool,
    ) -> Vec<CommitRecord> {
        let skip = page_size.saturating_mul(page_index);
        let matching = self.between(lower, upper, include_internal);
        match order {
            Order::Ascending => matching.skip(skip).take(page_size).cloned().collect(),
            Order::Descending => matching.rev().skip(skip).take(page_size).cloned().collect(),
        }
    }

    /// Up to `count` records at or before `timestamp`, newest first
    pub fn at_or_before(&self, timestamp: u64, upper: u64, count: usize, include_internal: bool) -> Vec<CommitRecord> {
        self.records
            .range(..=timestamp.min(upper))
            .rev()
            .map(|(_, record)| record)
            .filter(|record| include_internal || !record.system_internal)
            .take(count)
            .cloned()
            .collect()
    }

    /// Up to `count` records strictly before `timestamp`, newest first
    pub fn before(&self, timestamp: u64, upper: u64, count: usize, include_internal: bool) -> Vec<CommitRecord> {
        let end = if timestamp <= upper {
            Bound::Excluded(timestamp)
        } else {
            Bound::Included(upper)
        };
        self.records
            .range((Bound::Unbounded, end))
            .rev()
            .map(|(_, record)| record)
            .filter(|record| include_internal || !record.system_internal)
            .take(count)
            .cloned()
            .collect()
    }

    /// Up to `count` records strictly after `timestamp`, newest first
    ///
    /// The `count` records closest to `timestamp` are selected, then
    /// returned in descending order.
    pub fn after(&self, timestamp: u64, upper: u64, count: usize, include_internal: bool) -> Vec<CommitRecord> {
        if timestamp >= upper {
            return Vec::new();
        }
        let mut selected: Vec<CommitRecord> = self
            .records
            .range((Bound::Excluded(timestamp), Bound::Included(upper)))
            .map(|(_, record)| record)
            .filter(|record| include_internal || !record.system_internal)
            .take(count)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    /// Up to `count` records around `timestamp`, newest first
    ///
    /// A record at exactly `timestamp` counts on the "before" side. Half of
    /// `count` (rounded up) is taken from the before side and half from the
    /// after side; whatever one side cannot fill is taken from the other.
    pub fn around(&self, timestamp: u64, upper: u64, count: usize, include_internal: bool) -> Vec<CommitRecord> {
        let want_after = count / 2;
        let want_before = count - want_after;

        let mut before = self.at_or_before(timestamp, upper, count, include_internal);
        let mut after = self.after(timestamp, upper, count, include_internal);

        let take_before = before.len().min(want_before);
        let take_after = after.len().min(want_after);
        let (take_before, take_after) = if take_before < want_before {
            let extra = (want_before - take_before).min(after.len() - take_after);
            (take_before, take_after + extra)
        } else if take_after < want_after {
            let extra = (want_after - take_after).min(before.len() - take_before);
            (take_before + extra, take_after)
        } else {
            (take_before, take_after)
        };

        before.truncate(take_before);
        // `after` is newest-first; keep the records closest to `timestamp`
        let drop = after.len() - take_after;
        after.drain(..drop);

        after.extend(before);
        after
    }

    /// Number of records in `[lower, upper]`
    pub fn count_between(&self, lower: u64, upper: u64, include_internal: bool) -> usize {
        self.between(lower, upper, include_internal).count()
    }

    /// Every record, ascending
    pub fn iter(&self) -> impl Iterator<Item = &CommitRecord> + '_ {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(timestamps: &[u64]) -> CommitTable {
        let mut table = CommitTable::new();
        for ts in timestamps {
            table.put(CommitRecord::new(*ts, Some(format!("c{}", ts).into_bytes())));
        }
        table
    }

    fn stamps(records: &[CommitRecord]) -> Vec<u64> {
        records.iter().map(|r| r.timestamp).collect()
    }

    #[test]
    fn test_paged_descending() {
        let table = table(&[10, 20, 30, 40, 50]);
        let page = table.paged(0, 100, 2, 1, Order::Descending, false);
        assert_eq!(stamps(&page), vec![30, 20]);
        let page = table.paged(0, 100, 2, 2, Order::Ascending, false);
        assert_eq!(stamps(&page), vec![50]);
    }

    #[test]
    fn test_before_and_after_are_strict() {
        let table = table(&[10, 20, 30, 40, 50]);
        assert_eq!(stamps(&table.before(30, u64::MAX, 5, false)), vec![20, 10]);
        assert_eq!(stamps(&table.after(30, u64::MAX, 1, false)), vec![40]);
        assert_eq!(stamps(&table.after(30, u64::MAX, 5, false)), vec![50, 40]);
    }

    #[test]
    fn test_around_splits_count() {
        let table = table(&[10, 20, 30, 40, 50]);
        assert_eq!(stamps(&table.around(30, u64::MAX, 3, false)), vec![40, 30, 20]);
        assert_eq!(stamps(&table.around(30, u64::MAX, 4, false)), vec![50, 40, 30, 20]);
    }

    #[test]
    fn test_around_redistributes_shortfall() {
        let table = table(&[10, 20, 30, 40, 50]);
        // nothing after 50, so all four come from the before side
        assert_eq!(stamps(&table.around(50, u64::MAX, 4, false)), vec![50, 40, 30, 20]);
        // only 10 at or before 10, rest from after
        assert_eq!(stamps(&table.around(10, u64::MAX, 4, false)), vec![40, 30, 20, 10]);
        assert_eq!(table.around(30, u64::MAX, 10, false).len(), 5);
    }

    #[test]
    fn test_neighbourhood_respects_upper_cap() {
        let table = table(&[10, 20, 30, 40, 50]);
        assert_eq!(stamps(&table.after(10, 30, 5, false)), vec![30, 20]);
        assert!(table.after(30, 30, 5, false).is_empty());
        assert!(table.after(40, 30, 5, false).is_empty());
        assert_eq!(stamps(&table.before(60, 30, 5, false)), vec![30, 20, 10]);
        assert_eq!(stamps(&table.before(30, 30, 5, false)), vec![20, 10]);
        assert_eq!(stamps(&table.around(50, 30, 2, false)), vec![30, 20]);
    }

    #[test]
    fn test_internal_commits_hidden_before_paging() {
        let mut table = table(&[10, 30]);
        table.put(CommitRecord::internal(20, None));
        assert_eq!(table.count_between(0, 100, false), 2);
        assert_eq!(table.count_between(0, 100, true), 3);
        let page = table.paged(0, 100, 1, 1, Order::Ascending, false);
        assert_eq!(stamps(&page), vec![30]);
    }
}
