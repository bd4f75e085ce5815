//! tempo - bitemporal, branch-aware embedded key-value store
//!
//! Every value lives at a `(keyspace, key, timestamp)` coordinate on a
//! branch. Branches fork from their parent at a branching timestamp and
//! inherit the parent's history up to it. Commits are transactional and
//! crash-safe; dateback rewrites history in place.
//!
//! # Quick Start
//!
//! ```ignore
//! use tempo::{BranchName, Database};
//!
//! let db = Database::ephemeral()?;
//! let master = BranchName::master();
//!
//! let (_, ts) = db.transaction(&master, |tx| tx.put("kv", "x", b"a1".to_vec()))?;
//! let tx = db.begin(&master)?;
//! assert_eq!(tx.get("kv", "x")?, Some(b"a1".to_vec()));
//! ```
//!
//! # Architecture
//!
//! The [`Database`] in `tempo-engine` is the entry point; the lower crates
//! (core types, storage, concurrency, durability) are re-exported for
//! callers that need their types directly.

pub use tempo_engine::*;

pub use tempo_concurrency as concurrency;
pub use tempo_core as types;
pub use tempo_durability as durability;
pub use tempo_storage as storage;
