//! Database configuration via `tempo.toml`
//!
//! On first open of a data directory a default `tempo.toml` is written.
//! To change settings, edit the file and reopen the database. Hooks that
//! cannot be expressed in a file (clock, listeners, custom conflict
//! resolver, metadata filter) go through [`DatabaseBuilder`](super::DatabaseBuilder).

use serde::{Deserialize, Serialize};
use std::path::Path;
use tempo_concurrency::{ConflictResolutionStrategy, DuplicateVersionElimination};
use tempo_core::{TempoError, TempoResult};
use tempo_durability::DurabilityMode;

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "tempo.toml";

/// Journal file name placed in the database data directory.
pub const JOURNAL_FILE_NAME: &str = "tempo.journal";

/// Where tables live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Nothing survives the process
    Memory,
    /// Tables are rebuilt from the journal on open
    File,
}

/// Database configuration loaded from `tempo.toml`.
///
/// # Example
///
/// ```toml
/// backend = "file"
/// durability = "standard"
/// read_only = false
/// cache_enabled = true
/// cache_max_entries = 10000
/// conflict_resolution = "do_not_merge"
/// duplicate_version_elimination = "on_commit"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoConfig {
    /// Storage backend: `"memory"` or `"file"`.
    #[serde(default = "default_backend_str")]
    pub backend: String,
    /// Durability mode: `"standard"` or `"always"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Reject every mutating operation.
    #[serde(default)]
    pub read_only: bool,
    /// Serve point reads from the validity-period cache.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// Capacity of the validity-period cache.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Default conflict resolution strategy.
    #[serde(default = "default_conflict_resolution_str")]
    pub conflict_resolution: String,
    /// Duplicate version elimination mode.
    #[serde(default = "default_duplicate_version_elimination_str")]
    pub duplicate_version_elimination: String,
}

fn default_backend_str() -> String {
    "file".to_string()
}

fn default_durability_str() -> String {
    "standard".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_conflict_resolution_str() -> String {
    "do_not_merge".to_string()
}

fn default_duplicate_version_elimination_str() -> String {
    "on_commit".to_string()
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            backend: default_backend_str(),
            durability: default_durability_str(),
            read_only: false,
            cache_enabled: true,
            cache_max_entries: default_cache_max_entries(),
            conflict_resolution: default_conflict_resolution_str(),
            duplicate_version_elimination: default_duplicate_version_elimination_str(),
        }
    }
}

impl TempoConfig {
    /// Configuration of an in-memory database
    pub fn in_memory() -> Self {
        Self {
            backend: "memory".to_string(),
            ..Self::default()
        }
    }

    /// Parse the backend string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"memory"` or `"file"`.
    pub fn backend(&self) -> TempoResult<Backend> {
        match self.backend.as_str() {
            "memory" => Ok(Backend::Memory),
            "file" => Ok(Backend::File),
            other => Err(TempoError::invalid_argument(format!(
                "Invalid backend '{}' in tempo.toml. Expected \"memory\" or \"file\".",
                other
            ))),
        }
    }

    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"standard"` or `"always"`.
    pub fn durability_mode(&self) -> TempoResult<DurabilityMode> {
        DurabilityMode::from_name(&self.durability).ok_or_else(|| {
            TempoError::invalid_argument(format!(
                "Invalid durability mode '{}' in tempo.toml. Expected \"standard\" or \"always\".",
                self.durability
            ))
        })
    }

    /// Parse the conflict resolution string.
    ///
    /// Custom resolvers cannot be named in the file; install them with
    /// [`DatabaseBuilder::conflict_resolver`](super::DatabaseBuilder::conflict_resolver).
    pub fn conflict_resolution(&self) -> TempoResult<ConflictResolutionStrategy> {
        ConflictResolutionStrategy::from_name(&self.conflict_resolution).ok_or_else(|| {
            TempoError::invalid_argument(format!(
                "Invalid conflict resolution '{}' in tempo.toml. Expected \"do_not_merge\", \
                 \"overwrite_with_source\" or \"overwrite_with_target\".",
                self.conflict_resolution
            ))
        })
    }

    /// Parse the duplicate version elimination string.
    pub fn duplicate_version_elimination(&self) -> TempoResult<DuplicateVersionElimination> {
        DuplicateVersionElimination::from_name(&self.duplicate_version_elimination).ok_or_else(|| {
            TempoError::invalid_argument(format!(
                "Invalid duplicate version elimination '{}' in tempo.toml. Expected \"on_commit\" or \"disabled\".",
                self.duplicate_version_elimination
            ))
        })
    }

    /// Effective cache capacity (0 when the cache is disabled)
    pub fn cache_capacity(&self) -> usize {
        if self.cache_enabled {
            self.cache_max_entries
        } else {
            0
        }
    }

    /// Check every enumerated field
    pub fn validate(&self) -> TempoResult<()> {
        self.backend()?;
        self.durability_mode()?;
        self.conflict_resolution()?;
        self.duplicate_version_elimination()?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tempo database configuration
#
# Storage backend: "file" (default) or "memory"
#   "file"   = every change is journaled to tempo.journal and replayed on open
#   "memory" = nothing is written to disk
backend = "file"

# Durability mode: "standard" (default) or "always"
#   "standard" = flush every journal append to the OS
#   "always"   = fsync every journal append, zero data loss
durability = "standard"

# Reject every write, branch change and dateback operation
read_only = false

# Cache of point-in-time reads, keyed by validity period
cache_enabled = true
cache_max_entries = 10000

# What a commit does when a key it writes was modified after the
# transaction's timestamp:
#   "do_not_merge"          = fail the commit (default)
#   "overwrite_with_source" = the transaction's value wins
#   "overwrite_with_target" = the committed value wins
conflict_resolution = "do_not_merge"

# Drop writes that do not change the visible value: "on_commit" or "disabled"
duplicate_version_elimination = "on_commit"
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> TempoResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TempoConfig = toml::from_str(&content).map_err(|e| {
            TempoError::invalid_argument(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> TempoResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TempoResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TempoError::serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
