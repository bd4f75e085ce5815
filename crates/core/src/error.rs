//! Error types for the tempo store
//!
//! A single error enum is shared by every layer. We use `thiserror` for
//! `Display` and `Error` implementations; constructors mirror the variants
//! so call sites stay short (`TempoError::invalid_argument(..)`).
//!
//! ## Taxonomy
//!
//! | Kind | Variants | Applied partially? |
//! |------|----------|--------------------|
//! | Precondition | `InvalidArgument`, `InvalidTemporalRange`, `InvalidOperation` | never |
//! | Registry | `BranchNotFound`, `BranchAlreadyExists`, `BranchOrdering` | never |
//! | Commit | `CommitConflict`, `CommitFailed` | recovered on restart |
//! | Dateback | `DatebackViolation` | never |
//! | Configuration | `ReadOnlyViolation` | never |
//! | Persistence | `Io`, `Serialization`, `Corruption` | recovered on restart |

use std::io;
use thiserror::Error;

/// Result type alias for tempo operations
pub type TempoResult<T> = std::result::Result<T, TempoError>;

/// Error types for the tempo store
#[derive(Debug, Error)]
pub enum TempoError {
    /// A caller-supplied argument is malformed (empty name, zero page size, ...)
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the violation
        message: String,
    },

    /// Temporal bounds are above the snapshot timestamp or inverted
    #[error("Invalid temporal range: {message}")]
    InvalidTemporalRange {
        /// Description of the violation
        message: String,
    },

    /// The operation is not valid in the current state
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// Description of the violation
        message: String,
    },

    /// Branch does not exist
    #[error("Branch not found: '{name}'")]
    BranchNotFound {
        /// Name of the missing branch
        name: String,
    },

    /// Branch name is already taken
    #[error("Branch already exists: '{name}'")]
    BranchAlreadyExists {
        /// Name of the existing branch
        name: String,
    },

    /// A branch was supplied before its parent during a bulk load
    #[error("Branch '{branch}' was loaded before its parent '{parent}'")]
    BranchOrdering {
        /// The branch that arrived too early
        branch: String,
        /// Its parent, not yet registered
        parent: String,
    },

    /// Two transactions modified the same coordinate and no strategy resolved it
    #[error("Commit conflict on branch '{branch}' at {keyspace}/{key}: modified at {existing_timestamp}, transaction reads at {transaction_timestamp}")]
    CommitConflict {
        /// Branch of the conflicting commit
        branch: String,
        /// Keyspace of the conflicting key
        keyspace: String,
        /// The conflicting key
        key: String,
        /// Timestamp of the concurrent modification
        existing_timestamp: u64,
        /// Snapshot timestamp of the committing transaction
        transaction_timestamp: u64,
    },

    /// A commit stage failed; the commit is rolled back now or on recovery
    #[error("Commit failed: {message}")]
    CommitFailed {
        /// Description of the failure
        message: String,
    },

    /// A dateback guardrail was violated; nothing was mutated
    #[error("Dateback violation: {message}")]
    DatebackViolation {
        /// Description of the violation
        message: String,
    },

    /// A mutating call was made on a read-only database
    #[error("Read-only violation: '{operation}' is not permitted on a read-only database")]
    ReadOnlyViolation {
        /// Name of the rejected operation
        operation: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Codec message
        message: String,
    },

    /// Persisted data failed validation
    #[error("Data corruption: {message}")]
    Corruption {
        /// Description of the corruption
        message: String,
    },
}

impl TempoError {
    /// Create an `InvalidArgument` error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        TempoError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an `InvalidTemporalRange` error
    pub fn invalid_range(message: impl Into<String>) -> Self {
        TempoError::InvalidTemporalRange {
            message: message.into(),
        }
    }

    /// Create an `InvalidOperation` error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        TempoError::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a `BranchNotFound` error
    pub fn branch_not_found(name: impl Into<String>) -> Self {
        TempoError::BranchNotFound { name: name.into() }
    }

    /// Create a `CommitFailed` error
    pub fn commit_failed(message: impl Into<String>) -> Self {
        TempoError::CommitFailed {
            message: message.into(),
        }
    }

    /// Create a `DatebackViolation` error
    pub fn dateback(message: impl Into<String>) -> Self {
        TempoError::DatebackViolation {
            message: message.into(),
        }
    }

    /// Create a `ReadOnlyViolation` error
    pub fn read_only(operation: impl Into<String>) -> Self {
        TempoError::ReadOnlyViolation {
            operation: operation.into(),
        }
    }

    /// Create a `Serialization` error
    pub fn serialization(message: impl Into<String>) -> Self {
        TempoError::Serialization {
            message: message.into(),
        }
    }

    /// Create a `Corruption` error
    pub fn corruption(message: impl Into<String>) -> Self {
        TempoError::Corruption {
            message: message.into(),
        }
    }

    /// Whether this error is a commit conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, TempoError::CommitConflict { .. })
    }

    /// Whether this error was raised before anything was mutated
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            TempoError::InvalidArgument { .. }
                | TempoError::InvalidTemporalRange { .. }
                | TempoError::InvalidOperation { .. }
                | TempoError::BranchNotFound { .. }
                | TempoError::BranchAlreadyExists { .. }
                | TempoError::BranchOrdering { .. }
                | TempoError::DatebackViolation { .. }
                | TempoError::ReadOnlyViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_temporal_range() {
        let err = TempoError::invalid_range("upper bound 200 exceeds snapshot 150");
        let msg = err.to_string();
        assert!(msg.contains("Invalid temporal range"));
        assert!(msg.contains("200"));
    }

    #[test]
    fn test_error_display_conflict() {
        let err = TempoError::CommitConflict {
            branch: "master".to_string(),
            keyspace: "kv".to_string(),
            key: "x".to_string(),
            existing_timestamp: 120,
            transaction_timestamp: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("kv/x"));
        assert!(msg.contains("120"));
        assert!(err.is_conflict());
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_error_display_read_only() {
        let err = TempoError::read_only("commit");
        assert!(err.to_string().contains("'commit'"));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: TempoError = io_err.into();
        assert!(matches!(err, TempoError::Io(_)));
    }

    #[test]
    fn test_branch_ordering_display() {
        let err = TempoError::BranchOrdering {
            branch: "feature".to_string(),
            parent: "develop".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("feature"));
        assert!(msg.contains("develop"));
    }
}
