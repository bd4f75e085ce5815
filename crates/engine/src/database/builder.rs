//! Database builder for fluent configuration
//!
//! `tempo.toml` covers everything that can be written down as text. The
//! builder adds the programmatic hooks: clock, listeners, change
//! consumers, metadata filter, custom conflict resolver and debug hook.
//!
//! # Three Ways to Open a Database
//!
//! ```ignore
//! use tempo_engine::Database;
//!
//! // 1. Simple open, settings from tempo.toml
//! let db = Database::open("/data/mydb")?;
//!
//! // 2. Builder with hooks
//! let db = Database::builder()
//!     .path("/data/mydb")
//!     .clock(Arc::new(ManualClock::new(1_000)))
//!     .change_consumer(Arc::new(MyIndex::default()))
//!     .open()?;
//!
//! // 3. Ephemeral (no files, testing)
//! let db = Database::ephemeral()?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tempo_concurrency::{ConflictResolutionStrategy, ConflictResolver};
use tempo_core::{Clock, SystemClock, TempoResult};

use super::config::{TempoConfig, CONFIG_FILE_NAME};
use super::{Database, DatabaseParts};
use crate::coordinator::DebugHook;
use crate::listener::{BranchListener, ChangeConsumer, Listeners, MetadataFilter};

/// Builder for Database configuration
#[derive(Default)]
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    config: Option<TempoConfig>,
    clock: Option<Arc<dyn Clock>>,
    conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    metadata_filter: Option<Arc<dyn MetadataFilter>>,
    branch_listeners: Vec<Arc<dyn BranchListener>>,
    change_consumers: Vec<Arc<dyn ChangeConsumer>>,
    debug_hook: Option<DebugHook>,
    batch_size: Option<usize>,
}

impl DatabaseBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data directory
    ///
    /// Without a path the database is in-memory.
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Use this configuration instead of `tempo.toml`
    ///
    /// With a path, the configuration is also written to `tempo.toml`.
    pub fn config(mut self, config: TempoConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Source of commit timestamps (defaults to the system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Resolve conflicts with a custom resolver instead of the configured strategy
    pub fn conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    /// Rewrite commit metadata before it is stored
    pub fn metadata_filter(mut self, filter: Arc<dyn MetadataFilter>) -> Self {
        self.metadata_filter = Some(filter);
        self
    }

    /// Observe branch creation and deletion
    pub fn branch_listener(mut self, listener: Arc<dyn BranchListener>) -> Self {
        self.branch_listeners.push(listener);
        self
    }

    /// Receive committed entries, rollbacks and dateback changes
    pub fn change_consumer(mut self, consumer: Arc<dyn ChangeConsumer>) -> Self {
        self.change_consumers.push(consumer);
        self
    }

    /// Run a hook before every commit stage (crash simulation)
    pub fn debug_hook(mut self, hook: DebugHook) -> Self {
        self.debug_hook = Some(hook);
        self
    }

    /// Number of items iterators fetch per batch
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Open the database
    ///
    /// With a path: creates the directory, reads or writes `tempo.toml`,
    /// replays the journal and resolves interrupted commits. Without a
    /// path: an in-memory database.
    pub fn open(self) -> TempoResult<Arc<Database>> {
        let config = match &self.path {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let config_path = dir.join(CONFIG_FILE_NAME);
                match self.config {
                    Some(config) => {
                        config.validate()?;
                        config.write_to_file(&config_path)?;
                        config
                    }
                    None => {
                        TempoConfig::write_default_if_missing(&config_path)?;
                        TempoConfig::from_file(&config_path)?
                    }
                }
            }
            None => self.config.unwrap_or_else(TempoConfig::in_memory),
        };

        let conflict_resolution = match self.conflict_resolver {
            Some(resolver) => ConflictResolutionStrategy::Custom(resolver),
            None => config.conflict_resolution()?,
        };

        let listeners = Listeners::default();
        for listener in self.branch_listeners {
            listeners.add_branch_listener(listener);
        }
        for consumer in self.change_consumers {
            listeners.add_change_consumer(consumer);
        }
        listeners.set_metadata_filter(self.metadata_filter);

        Database::assemble(DatabaseParts {
            data_dir: self.path,
            config,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            conflict_resolution,
            listeners,
            debug_hook: self.debug_hook,
            batch_size: self.batch_size,
        })
    }
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("branch_listeners", &self.branch_listeners.len())
            .field("change_consumers", &self.change_consumers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builder_without_path_is_ephemeral() {
        let db = DatabaseBuilder::new().open().unwrap();
        assert!(!db.is_persistent());
        assert!(db.data_dir().is_none());
    }

    #[test]
    fn test_file_backend_without_path_is_rejected() {
        let result = DatabaseBuilder::new().config(TempoConfig::default()).open();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_writes_config() {
        let dir = TempDir::new().unwrap();
        let config = TempoConfig {
            durability: "always".to_string(),
            ..TempoConfig::default()
        };
        let db = DatabaseBuilder::new().path(dir.path()).config(config.clone()).open().unwrap();
        assert!(db.is_persistent());
        drop(db);

        let written = TempoConfig::from_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(written, config);
    }

    #[test]
    fn test_second_open_of_same_directory_fails() {
        let dir = TempDir::new().unwrap();
        let first = Database::open(dir.path()).unwrap();
        assert!(Database::open(dir.path()).is_err());
        drop(first);
        assert!(Database::open(dir.path()).is_ok());
    }
}
