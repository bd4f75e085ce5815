//! Extension hooks
//!
//! Collaborators plug into the engine through these traits:
//!
//! | trait | called |
//! |-------|--------|
//! | [`BranchListener`] | after a branch is created or deleted |
//! | [`ChangeConsumer`] | commit stage 2, incremental rollback, crash recovery, dateback |
//! | [`MetadataFilter`] | on commit metadata before it is stored |
//!
//! Hooks run on the committing thread while the branch lock is held. They
//! must not start commits on the same branch.

use std::collections::BTreeSet;
use std::sync::Arc;
use parking_lot::RwLock;
use tempo_core::{BranchInfo, BranchName, TemporalEntry, TemporalKey};
use tracing::warn;

/// Observes the branch life cycle
pub trait BranchListener: Send + Sync {
    /// A branch was created
    fn on_branch_created(&self, _branch: &BranchInfo) {}

    /// A branch was deleted
    fn on_branch_deleted(&self, _branch: &BranchName) {}
}

/// Secondary index maintenance
pub trait ChangeConsumer: Send + Sync {
    /// Entries written by a commit (stage 2 of the commit protocol)
    fn on_commit(&self, _branch: &BranchName, _timestamp: u64, _entries: &[TemporalEntry]) {}

    /// Everything on `branch` above `now` was rolled back
    fn on_rollback(&self, _branch: &BranchName, _now: u64) {}

    /// Dateback rewrote the given coordinates
    fn on_dateback(&self, _branch: &BranchName, _affected: &BTreeSet<TemporalKey>) {}
}

/// Rewrites commit metadata before it is persisted
///
/// The filter runs at stage 3, after the commit's entries are written, and
/// also on commit records created by dateback. A filter error never fails
/// the write: it is logged at warn level under `tempo::commit` and the
/// record is stored with no metadata. Filters that must veto a commit
/// should do so before calling `commit`.
pub trait MetadataFilter: Send + Sync {
    /// Return the metadata to store, or an error message
    fn filter(&self, branch: &BranchName, timestamp: u64, metadata: Option<&[u8]>) -> Result<Option<Vec<u8>>, String>;
}

/// Registered hooks of a database
#[derive(Default)]
pub struct Listeners {
    branch: RwLock<Vec<Arc<dyn BranchListener>>>,
    consumers: RwLock<Vec<Arc<dyn ChangeConsumer>>>,
    metadata_filter: RwLock<Option<Arc<dyn MetadataFilter>>>,
}

impl Listeners {
    /// Register a branch listener
    pub fn add_branch_listener(&self, listener: Arc<dyn BranchListener>) {
        self.branch.write().push(listener);
    }

    /// Register a change consumer
    pub fn add_change_consumer(&self, consumer: Arc<dyn ChangeConsumer>) {
        self.consumers.write().push(consumer);
    }

    /// Install (or remove) the metadata filter
    pub fn set_metadata_filter(&self, filter: Option<Arc<dyn MetadataFilter>>) {
        *self.metadata_filter.write() = filter;
    }

    pub(crate) fn branch_created(&self, info: &BranchInfo) {
        for listener in self.branch.read().iter() {
            listener.on_branch_created(info);
        }
    }

    pub(crate) fn branch_deleted(&self, branch: &BranchName) {
        for listener in self.branch.read().iter() {
            listener.on_branch_deleted(branch);
        }
    }

    pub(crate) fn committed(&self, branch: &BranchName, timestamp: u64, entries: &[TemporalEntry]) {
        for consumer in self.consumers.read().iter() {
            consumer.on_commit(branch, timestamp, entries);
        }
    }

    pub(crate) fn rolled_back(&self, branch: &BranchName, now: u64) {
        for consumer in self.consumers.read().iter() {
            consumer.on_rollback(branch, now);
        }
    }

    pub(crate) fn datebacked(&self, branch: &BranchName, affected: &BTreeSet<TemporalKey>) {
        for consumer in self.consumers.read().iter() {
            consumer.on_dateback(branch, affected);
        }
    }

    /// Run the metadata filter; failures are logged and yield `None`
    pub(crate) fn filter_metadata(
        &self,
        branch: &BranchName,
        timestamp: u64,
        metadata: Option<Vec<u8>>,
    ) -> Option<Vec<u8>> {
        let filter = self.metadata_filter.read().clone();
        let Some(filter) = filter else {
            return metadata;
        };
        match filter.filter(branch, timestamp, metadata.as_deref()) {
            Ok(filtered) => filtered,
            Err(message) => {
                warn!(
                    target: "tempo::commit",
                    branch = %branch,
                    timestamp,
                    error = %message,
                    "Commit metadata filter failed; storing no metadata"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("branch_listeners", &self.branch.read().len())
            .field("change_consumers", &self.consumers.read().len())
            .field("metadata_filter", &self.metadata_filter.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl MetadataFilter for Upper {
        fn filter(&self, _: &BranchName, _: u64, metadata: Option<&[u8]>) -> Result<Option<Vec<u8>>, String> {
            match metadata {
                Some(b"fail") => Err("rejected".to_string()),
                Some(bytes) => Ok(Some(bytes.to_ascii_uppercase())),
                None => Ok(None),
            }
        }
    }

    #[test]
    fn test_metadata_filter_rewrites_and_swallows_errors() {
        let listeners = Listeners::default();
        let master = BranchName::master();
        assert_eq!(listeners.filter_metadata(&master, 1, Some(b"abc".to_vec())), Some(b"abc".to_vec()));

        listeners.set_metadata_filter(Some(Arc::new(Upper)));
        assert_eq!(listeners.filter_metadata(&master, 1, Some(b"abc".to_vec())), Some(b"ABC".to_vec()));
        assert_eq!(listeners.filter_metadata(&master, 1, Some(b"fail".to_vec())), None);
    }
}
