//! Durability layer for tempo
//!
//! This crate handles everything that touches disk:
//!
//! - Journal: append-only log of table mutations, replayed on open
//! - Durability modes: Standard (flush per append), Always (fsync per append)
//! - Torn-tail detection and truncation
//! - Compaction of the journal into a minimal snapshot of current state

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod journal;
pub mod mode;

pub use journal::{decode_records, encode_record, DecodedRecords, Journal, ReplayReport, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use mode::DurabilityMode;
