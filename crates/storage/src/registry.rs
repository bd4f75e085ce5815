//! Branch registry
//!
//! The branch tree lives inside the [`ShardedStore`] (one shard per branch,
//! each carrying its [`BranchInfo`]). The registry answers lineage
//! questions over it and validates branch lifecycle requests. It never
//! mutates the store itself: `prepare_*` methods return the mutations the
//! engine journals and applies.
//!
//! ## Lineage
//!
//! A read on branch `B` at time `T` consults a chain of levels:
//!
//! | level | branch | visible entries |
//! |-------|--------|-----------------|
//! | 0 | `B` | `B`'s own entries `<= now(B)` |
//! | 1 | `parent(B)` | entries `<= bts(B)` |
//! | k | ancestor k | entries `<= bts(child on level k-1)` |
//!
//! The chain ends at `master`. Entries above `now(B)` belong to a commit
//! that has not reached its commit point; only the transaction writing an
//! incremental commit reads them, through [`BranchRegistry::lineage_until`].

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempo_core::{BranchInfo, BranchName, Mutation, TempoError, TempoResult};

use crate::sharded::{BranchShard, ShardedStore};

/// One level of a branch's lineage
#[derive(Clone)]
pub struct LineageLevel {
    /// Branch on this level
    pub branch: BranchName,
    /// Shard holding the branch's tables
    pub shard: Arc<RwLock<BranchShard>>,
    /// Highest timestamp visible from this level (inclusive)
    pub visible_upper: u64,
}

impl std::fmt::Debug for LineageLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineageLevel")
            .field("branch", &self.branch)
            .field("visible_upper", &self.visible_upper)
            .finish()
    }
}

/// Lineage and lifecycle queries over the branch tree
#[derive(Debug, Clone)]
pub struct BranchRegistry {
    store: Arc<ShardedStore>,
}

impl BranchRegistry {
    /// Create a registry over a store
    pub fn new(store: Arc<ShardedStore>) -> Self {
        BranchRegistry { store }
    }

    /// Metadata of a branch
    pub fn branch(&self, name: &BranchName) -> TempoResult<BranchInfo> {
        self.store.info(name)
    }

    /// Whether a branch exists
    pub fn exists(&self, name: &BranchName) -> bool {
        self.store.has_branch(name)
    }

    /// Every branch, parents before children, siblings by name
    pub fn branches(&self) -> Vec<BranchInfo> {
        let infos = self.store.infos();
        let mut by_parent: BTreeMap<Option<BranchName>, Vec<BranchInfo>> = BTreeMap::new();
        for info in infos {
            by_parent.entry(info.parent.clone()).or_default().push(info);
        }
        for siblings in by_parent.values_mut() {
            siblings.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let mut ordered = Vec::new();
        let mut stack: Vec<BranchInfo> = by_parent.remove(&None).unwrap_or_default();
        stack.reverse();
        while let Some(info) = stack.pop() {
            if let Some(mut children) = by_parent.remove(&Some(info.name.clone())) {
                children.reverse();
                stack.extend(children);
            }
            ordered.push(info);
        }
        ordered
    }

    /// Names of every branch, parents before children
    pub fn branch_names(&self) -> Vec<BranchName> {
        self.branches().into_iter().map(|info| info.name).collect()
    }

    /// Direct children of a branch, by name
    pub fn children(&self, name: &BranchName) -> Vec<BranchName> {
        let mut children: Vec<BranchName> = self
            .store
            .infos()
            .into_iter()
            .filter(|info| info.parent.as_ref() == Some(name))
            .map(|info| info.name)
            .collect();
        children.sort();
        children
    }

    /// Every descendant of a branch (the branch itself excluded), depth first
    pub fn descendants(&self, name: &BranchName) -> Vec<BranchName> {
        let mut result = Vec::new();
        let mut pending = self.children(name);
        pending.reverse();
        while let Some(next) = pending.pop() {
            let mut grandchildren = self.children(&next);
            grandchildren.reverse();
            pending.extend(grandchildren);
            result.push(next);
        }
        result
    }

    /// Lineage of a branch, root first, the branch itself last
    pub fn origins(&self, name: &BranchName) -> TempoResult<Vec<BranchInfo>> {
        let mut chain = Vec::new();
        let mut current = Some(name.clone());
        while let Some(branch) = current {
            let info = self.store.info(&branch)?;
            current = info.parent.clone();
            chain.push(info);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Read levels of a branch, the branch itself first
    pub fn lineage(&self, name: &BranchName) -> TempoResult<Vec<LineageLevel>> {
        self.lineage_until(name, None)
    }

    /// Read levels with the branch's own level capped at `horizon`
    ///
    /// `None` caps it at the branch's `now`.
    pub fn lineage_until(&self, name: &BranchName, horizon: Option<u64>) -> TempoResult<Vec<LineageLevel>> {
        let mut levels = Vec::new();
        let mut current = Some(name.clone());
        let mut visible_upper = None;
        while let Some(branch) = current {
            let shard = self.store.shard(&branch)?;
            let (parent, bts, now) = {
                let guard = shard.read();
                (guard.info.parent.clone(), guard.info.branching_timestamp, guard.info.now)
            };
            let upper = visible_upper.unwrap_or_else(|| horizon.unwrap_or(now));
            levels.push(LineageLevel {
                branch,
                shard,
                visible_upper: upper,
            });
            visible_upper = Some(upper.min(bts));
            current = parent;
        }
        Ok(levels)
    }

    /// Largest `now` across all branches
    pub fn max_now(&self) -> u64 {
        self.store
            .infos()
            .iter()
            .map(|info| info.now)
            .max()
            .unwrap_or(0)
    }

    /// Validate a branch creation and build its metadata
    ///
    /// `branching_timestamp` defaults to the parent's `now` and may not
    /// exceed it.
    pub fn prepare_branch(
        &self,
        name: &BranchName,
        parent: &BranchName,
        branching_timestamp: Option<u64>,
    ) -> TempoResult<BranchInfo> {
        if self.exists(name) {
            return Err(TempoError::BranchAlreadyExists {
                name: name.to_string(),
            });
        }
        let parent_info = self.store.info(parent)?;
        let bts = branching_timestamp.unwrap_or(parent_info.now);
        if bts > parent_info.now {
            return Err(TempoError::invalid_argument(format!(
                "branching timestamp {} is after now {} of parent '{}'",
                bts, parent_info.now, parent
            )));
        }
        if !parent_info.is_root() && bts < parent_info.branching_timestamp {
            return Err(TempoError::invalid_argument(format!(
                "branching timestamp {} precedes the origin {} of parent '{}'",
                bts, parent_info.branching_timestamp, parent
            )));
        }
        Ok(BranchInfo::child(name.clone(), parent.clone(), bts))
    }

    /// Validate a branch deletion and list the branches it removes
    ///
    /// The result lists descendants before their ancestors, the branch
    /// itself last.
    pub fn prepare_deletion(&self, name: &BranchName) -> TempoResult<Vec<BranchName>> {
        let info = self.store.info(name)?;
        if info.is_root() {
            return Err(TempoError::invalid_operation(format!(
                "the root branch '{}' cannot be deleted",
                name
            )));
        }
        let mut doomed = self.descendants(name);
        doomed.reverse();
        doomed.push(name.clone());
        Ok(doomed)
    }

    /// Validate a bulk registration and turn it into creation mutations
    ///
    /// Every parent must be either already registered or appear earlier in
    /// `infos`. Nothing is registered if any entry violates that order.
    /// An entry for the root updates its `now` only.
    pub fn prepare_load(&self, infos: &[BranchInfo]) -> TempoResult<Vec<Mutation>> {
        let mut known: BTreeSet<BranchName> = self.store.infos().into_iter().map(|i| i.name).collect();
        let mut mutations = Vec::with_capacity(infos.len());
        for info in infos {
            match &info.parent {
                None => {
                    if !info.name.is_master() {
                        return Err(TempoError::invalid_argument(format!(
                            "branch '{}' has no parent but is not the root",
                            info.name
                        )));
                    }
                    mutations.push(Mutation::SetNow {
                        branch: info.name.clone(),
                        now: info.now,
                    });
                }
                Some(parent) => {
                    if !known.contains(parent) {
                        return Err(TempoError::BranchOrdering {
                            branch: info.name.to_string(),
                            parent: parent.to_string(),
                        });
                    }
                    mutations.push(Mutation::CreateBranch(info.clone()));
                }
            }
            known.insert(info.name.clone());
        }
        Ok(mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> BranchName {
        BranchName::new(s).unwrap()
    }

    fn setup() -> (Arc<ShardedStore>, BranchRegistry) {
        let store = Arc::new(ShardedStore::new());
        store
            .apply(&Mutation::SetNow {
                branch: BranchName::master(),
                now: 500,
            })
            .unwrap();
        let registry = BranchRegistry::new(Arc::clone(&store));
        (store, registry)
    }

    fn create(store: &ShardedStore, registry: &BranchRegistry, child: &str, parent: &str, bts: u64) {
        let info = registry
            .prepare_branch(&name(child), &name(parent), Some(bts))
            .unwrap();
        store.apply(&Mutation::CreateBranch(info)).unwrap();
    }

    #[test]
    fn test_prepare_branch_defaults_to_parent_now() {
        let (_, registry) = setup();
        let info = registry
            .prepare_branch(&name("feature"), &BranchName::master(), None)
            .unwrap();
        assert_eq!(info.branching_timestamp, 500);
        assert_eq!(info.now, 500);
    }

    #[test]
    fn test_prepare_branch_rejects_future_and_duplicates() {
        let (store, registry) = setup();
        let err = registry
            .prepare_branch(&name("f"), &BranchName::master(), Some(501))
            .unwrap_err();
        assert!(matches!(err, TempoError::InvalidArgument { .. }));

        create(&store, &registry, "f", "master", 100);
        let err = registry
            .prepare_branch(&name("f"), &BranchName::master(), None)
            .unwrap_err();
        assert!(matches!(err, TempoError::BranchAlreadyExists { .. }));

        let err = registry
            .prepare_branch(&name("g"), &name("nope"), None)
            .unwrap_err();
        assert!(matches!(err, TempoError::BranchNotFound { .. }));
    }

    #[test]
    fn test_lineage_caps() {
        let (store, registry) = setup();
        create(&store, &registry, "a", "master", 300);
        store
            .apply(&Mutation::SetNow {
                branch: name("a"),
                now: 400,
            })
            .unwrap();
        create(&store, &registry, "b", "a", 350);

        let levels = registry.lineage(&name("b")).unwrap();
        let caps: Vec<(String, u64)> = levels
            .iter()
            .map(|l| (l.branch.to_string(), l.visible_upper))
            .collect();
        assert_eq!(
            caps,
            vec![
                ("b".to_string(), 350),
                ("a".to_string(), 350),
                ("master".to_string(), 300),
            ]
        );

        let origins: Vec<String> = registry
            .origins(&name("b"))
            .unwrap()
            .into_iter()
            .map(|i| i.name.to_string())
            .collect();
        assert_eq!(origins, vec!["master", "a", "b"]);

        let levels = registry.lineage_until(&name("b"), Some(900)).unwrap();
        assert_eq!(levels[0].visible_upper, 900);
        assert_eq!(levels[1].visible_upper, 350);
    }

    #[test]
    fn test_branches_parent_first_and_deletion_order() {
        let (store, registry) = setup();
        create(&store, &registry, "a", "master", 100);
        create(&store, &registry, "c", "a", 100);
        create(&store, &registry, "b", "master", 100);

        let names: Vec<String> = registry
            .branch_names()
            .into_iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, vec!["master", "a", "c", "b"]);

        let doomed = registry.prepare_deletion(&name("a")).unwrap();
        assert_eq!(doomed, vec![name("c"), name("a")]);
        assert!(registry.prepare_deletion(&BranchName::master()).is_err());
        assert_eq!(registry.max_now(), 500);
    }

    #[test]
    fn test_prepare_load_rejects_child_before_parent() {
        let (_, registry) = setup();
        let infos = vec![
            BranchInfo::child(name("y"), name("x"), 10),
            BranchInfo::child(name("x"), BranchName::master(), 10),
        ];
        let err = registry.prepare_load(&infos).unwrap_err();
        assert!(matches!(err, TempoError::BranchOrdering { .. }));

        let infos = vec![
            BranchInfo::child(name("x"), BranchName::master(), 10),
            BranchInfo::child(name("y"), name("x"), 10),
        ];
        assert_eq!(registry.prepare_load(&infos).unwrap().len(), 2);
    }
}
