//! Branch operations: create, delete, bulk load, lookups
//!
//! ## Operations
//!
//! - `create_branch` / `create_branch_at`: fork a child from a parent at
//!   the parent's `now` or an earlier timestamp
//! - `delete_branch`: remove a branch with all its descendants
//! - `load_branches`: register many branches at once, parents first
//!
//! Creation locks the parent branch so its `now` cannot move while the
//! branching timestamp is validated. Deletion and bulk load take the
//! database lock exclusively.

use std::collections::BTreeSet;
use tempo_core::{BranchInfo, BranchName, Mutation, TempoError, TempoResult};
use tracing::info;

use crate::database::Database;

impl Database {
    /// Fork `name` from `parent` at the parent's current `now`
    pub fn create_branch(&self, name: &BranchName, parent: &BranchName) -> TempoResult<BranchInfo> {
        self.create_branch_inner(name, parent, None)
    }

    /// Fork `name` from `parent` at `branching_timestamp`
    ///
    /// The timestamp may not be after the parent's `now`.
    pub fn create_branch_at(
        &self,
        name: &BranchName,
        parent: &BranchName,
        branching_timestamp: u64,
    ) -> TempoResult<BranchInfo> {
        self.create_branch_inner(name, parent, Some(branching_timestamp))
    }

    fn create_branch_inner(
        &self,
        name: &BranchName,
        parent: &BranchName,
        branching_timestamp: Option<u64>,
    ) -> TempoResult<BranchInfo> {
        self.check_writable("create_branch")?;
        let _parent = self.locks().branch(parent)?;
        let info = self
            .temporal()
            .registry()
            .prepare_branch(name, parent, branching_timestamp)?;
        self.persist(&[Mutation::CreateBranch(info.clone())])?;
        info!(
            target: "tempo::branch",
            branch = %info.name,
            parent = %parent,
            branching_timestamp = info.branching_timestamp,
            "Branch created"
        );
        self.listeners().branch_created(&info);
        Ok(info)
    }

    /// Delete a branch and every descendant
    ///
    /// Returns the deleted names, children before parents. The root branch
    /// cannot be deleted.
    pub fn delete_branch(&self, name: &BranchName) -> TempoResult<Vec<BranchName>> {
        self.check_writable("delete_branch")?;
        let _exclusive = self.locks().database_exclusive()?;
        let doomed = self.temporal().registry().prepare_deletion(name)?;

        let mutations: Vec<Mutation> = doomed.iter().cloned().map(Mutation::RemoveBranch).collect();
        self.persist(&mutations)?;
        self.cache().invalidate_branches(&doomed);
        for branch in &doomed {
            self.locks().forget_branch(branch);
            self.coordinator().forget_branch(branch);
            info!(target: "tempo::branch", branch = %branch, "Branch deleted");
            self.listeners().branch_deleted(branch);
        }
        Ok(doomed)
    }

    /// Register branches in bulk
    ///
    /// Parents must be registered already or appear earlier in `infos`;
    /// otherwise `BranchOrdering` is returned and nothing is registered.
    /// An entry for the root only moves its `now` forward.
    pub fn load_branches(&self, infos: &[BranchInfo]) -> TempoResult<()> {
        self.check_writable("load_branches")?;
        let _exclusive = self.locks().database_exclusive()?;
        let mutations = self.prepare_branch_load(infos)?;
        self.persist(&mutations)?;
        for info in infos.iter().filter(|info| !info.is_root()) {
            info!(target: "tempo::branch", branch = %info.name, "Branch loaded");
            self.listeners().branch_created(info);
        }
        Ok(())
    }

    /// Validate a bulk registration; the caller holds the database lock
    pub(crate) fn prepare_branch_load(&self, infos: &[BranchInfo]) -> TempoResult<Vec<Mutation>> {
        let registry = self.temporal().registry();
        let mut names = BTreeSet::new();
        for info in infos {
            if !names.insert(info.name.clone()) || (!info.is_root() && registry.exists(&info.name)) {
                return Err(TempoError::BranchAlreadyExists {
                    name: info.name.to_string(),
                });
            }
            if info.now < info.branching_timestamp {
                return Err(TempoError::invalid_argument(format!(
                    "branch '{}' has now {} before its branching timestamp {}",
                    info.name, info.now, info.branching_timestamp
                )));
            }
        }
        let mut mutations = registry.prepare_load(infos)?;
        for mutation in &mut mutations {
            if let Mutation::SetNow { branch, now } = mutation {
                *now = (*now).max(self.store().info(branch)?.now);
            }
        }
        Ok(mutations)
    }

    /// Metadata of a branch
    pub fn branch(&self, name: &BranchName) -> TempoResult<BranchInfo> {
        self.temporal().registry().branch(name)
    }

    /// Every branch, parents before children
    pub fn branches(&self) -> Vec<BranchInfo> {
        self.temporal().registry().branches()
    }

    /// Names of every branch, parents before children
    pub fn branch_names(&self) -> Vec<BranchName> {
        self.temporal().registry().branch_names()
    }

    /// Whether a branch exists
    pub fn branch_exists(&self, name: &BranchName) -> bool {
        self.temporal().registry().exists(name)
    }

    /// Direct children of a branch
    pub fn children(&self, name: &BranchName) -> Vec<BranchName> {
        self.temporal().registry().children(name)
    }

    /// Every branch below `name`
    pub fn descendants(&self, name: &BranchName) -> Vec<BranchName> {
        self.temporal().registry().descendants(name)
    }

    /// Lineage of a branch, root first
    pub fn origins(&self, name: &BranchName) -> TempoResult<Vec<BranchInfo>> {
        self.temporal().registry().origins(name)
    }

    /// Largest `now` across all branches
    pub fn max_now(&self) -> u64 {
        self.temporal().registry().max_now()
    }
}
