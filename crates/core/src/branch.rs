//! Branch identity and lineage metadata
//!
//! Every branch except the root (`master`) has a parent and a branching
//! timestamp. History at or below the branching timestamp is read through
//! the parent; the branch itself owns `(branching_timestamp, +inf)`.
//!
//! ## Validation
//!
//! Branch names must:
//! - Be 1-256 characters
//! - Contain only alphanumeric, dash, underscore, dot
//! - Not start with a dash or dot

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{TempoError, TempoResult};

/// Maximum length of a branch name
pub const MAX_BRANCH_NAME_LENGTH: usize = 256;

/// Name of the root branch
pub const MASTER_BRANCH: &str = "master";

/// User-facing identifier for a branch
///
/// ## Validation Rules
///
/// - Length: 1-256 characters
/// - Characters: `[a-zA-Z0-9_.-]`
/// - Cannot start with `-` or `.`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchName(String);

impl BranchName {
    /// Create a new BranchName, validating the input
    pub fn new(name: impl Into<String>) -> TempoResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(BranchName(name))
    }

    /// The root branch
    pub fn master() -> Self {
        BranchName(MASTER_BRANCH.to_string())
    }

    /// Validate a branch name
    pub fn validate(name: &str) -> TempoResult<()> {
        let Some(first) = name.chars().next() else {
            return Err(TempoError::invalid_argument("branch name cannot be empty"));
        };

        if name.len() > MAX_BRANCH_NAME_LENGTH {
            return Err(TempoError::invalid_argument(format!(
                "branch name too long: {} chars (max {})",
                name.len(),
                MAX_BRANCH_NAME_LENGTH
            )));
        }

        if !first.is_ascii_alphanumeric() && first != '_' {
            return Err(TempoError::invalid_argument(format!(
                "branch name cannot start with '{}'",
                first
            )));
        }

        if let Some((pos, ch)) = name.chars().enumerate().find(|(_, c)| !Self::is_valid_char(*c)) {
            return Err(TempoError::invalid_argument(format!(
                "invalid character '{}' at position {} in branch name",
                ch, pos
            )));
        }

        Ok(())
    }

    #[inline]
    fn is_valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
    }

    /// Get the name as a string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root branch
    pub fn is_master(&self) -> bool {
        self.0 == MASTER_BRANCH
    }
}

impl AsRef<str> for BranchName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for BranchName {
    type Error = TempoError;

    fn try_from(value: &str) -> TempoResult<Self> {
        BranchName::new(value)
    }
}

/// Lineage and clock state of one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Branch name
    pub name: BranchName,
    /// Parent branch, `None` only for the root
    pub parent: Option<BranchName>,
    /// Timestamp at which the branch forked from its parent (fixed)
    pub branching_timestamp: u64,
    /// Latest commit timestamp on this branch (monotone)
    pub now: u64,
}

impl BranchInfo {
    /// Metadata of a fresh root branch
    pub fn master() -> Self {
        BranchInfo {
            name: BranchName::master(),
            parent: None,
            branching_timestamp: 0,
            now: 0,
        }
    }

    /// Metadata of a fresh child branch
    pub fn child(name: BranchName, parent: BranchName, branching_timestamp: u64) -> Self {
        BranchInfo {
            name,
            parent: Some(parent),
            branching_timestamp,
            now: branching_timestamp,
        }
    }

    /// Whether this branch is the root of the tree
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether `timestamp` falls into the range owned by this branch
    ///
    /// The root owns every timestamp; a child owns only timestamps strictly
    /// after its branching timestamp.
    pub fn owns(&self, timestamp: u64) -> bool {
        self.is_root() || timestamp > self.branching_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(BranchName::new("master").is_ok());
        assert!(BranchName::new("feature-1.x_y").is_ok());
        assert!(BranchName::new("_hidden").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(BranchName::new("").is_err());
        assert!(BranchName::new("-dash").is_err());
        assert!(BranchName::new(".dot").is_err());
        assert!(BranchName::new("has space").is_err());
        assert!(BranchName::new("a".repeat(MAX_BRANCH_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_master() {
        let master = BranchInfo::master();
        assert!(master.is_root());
        assert!(master.name.is_master());
        assert!(master.owns(0));
    }

    #[test]
    fn test_child_owns_only_after_branching() {
        let child = BranchInfo::child(
            BranchName::new("child").unwrap(),
            BranchName::master(),
            100,
        );
        assert_eq!(child.now, 100);
        assert!(!child.owns(100));
        assert!(child.owns(101));
    }

    #[test]
    fn test_info_json_shape() {
        let child = BranchInfo::child(BranchName::new("child").unwrap(), BranchName::master(), 7);
        let json = serde_json::to_value(&child).unwrap();
        assert_eq!(json["name"], "child");
        assert_eq!(json["parent"], "master");
        assert_eq!(json["branching_timestamp"], 7);

        let decoded: BranchInfo = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, child);
    }
}
