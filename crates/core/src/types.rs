//! Key and entry types
//!
//! Coordinates in the store are layered:
//! - `QualifiedKey`: `(keyspace, key)`, a logical key inside a branch
//! - `TemporalKey`: `(keyspace, key, timestamp)`, one stored version
//! - `TemporalEntry`: a `TemporalKey` plus its value or tombstone
//!
//! All three order lexicographically by keyspace, key, then timestamp, which
//! is the order of the persisted entry table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A key qualified by its keyspace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedKey {
    /// Keyspace the key lives in
    pub keyspace: String,
    /// User key
    pub key: String,
}

impl QualifiedKey {
    /// Create a new qualified key
    pub fn new(keyspace: impl Into<String>, key: impl Into<String>) -> Self {
        QualifiedKey {
            keyspace: keyspace.into(),
            key: key.into(),
        }
    }

    /// Attach a timestamp to this key
    pub fn at(&self, timestamp: u64) -> TemporalKey {
        TemporalKey {
            keyspace: self.keyspace.clone(),
            key: self.key.clone(),
            timestamp,
        }
    }
}

impl fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.key)
    }
}

/// One version coordinate: `(keyspace, key, timestamp)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemporalKey {
    /// Keyspace the key lives in
    pub keyspace: String,
    /// User key
    pub key: String,
    /// Timestamp of the version
    pub timestamp: u64,
}

impl TemporalKey {
    /// Create a new temporal key
    pub fn new(keyspace: impl Into<String>, key: impl Into<String>, timestamp: u64) -> Self {
        TemporalKey {
            keyspace: keyspace.into(),
            key: key.into(),
            timestamp,
        }
    }

    /// Drop the timestamp
    pub fn qualified(&self) -> QualifiedKey {
        QualifiedKey {
            keyspace: self.keyspace.clone(),
            key: self.key.clone(),
        }
    }
}

impl fmt::Display for TemporalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.keyspace, self.key, self.timestamp)
    }
}

/// A stored version: coordinate plus value, `None` being a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalEntry {
    /// Coordinate of the version
    pub key: TemporalKey,
    /// Payload, or `None` for a deletion marker
    pub value: Option<Vec<u8>>,
}

impl TemporalEntry {
    /// Create an entry carrying a payload
    pub fn new(key: TemporalKey, value: Vec<u8>) -> Self {
        TemporalEntry {
            key,
            value: Some(value),
        }
    }

    /// Create a deletion marker
    pub fn tombstone(key: TemporalKey) -> Self {
        TemporalEntry { key, value: None }
    }

    /// Whether this entry is a deletion marker
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Iteration order for history and commit queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Order {
    /// Oldest first
    #[default]
    Ascending,
    /// Newest first
    Descending,
}

impl Order {
    /// Sort a vector of timestamps (or anything ordered) in this order
    pub fn sort<T: Ord>(&self, items: &mut [T]) {
        match self {
            Order::Ascending => items.sort(),
            Order::Descending => items.sort_by(|a, b| b.cmp(a)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_key_ordering() {
        let a = TemporalKey::new("kv", "a", 200);
        let b = TemporalKey::new("kv", "b", 100);
        let a_early = TemporalKey::new("kv", "a", 100);
        assert!(a_early < a);
        assert!(a < b);
    }

    #[test]
    fn test_qualified_at_roundtrip() {
        let qk = QualifiedKey::new("kv", "x");
        let tk = qk.at(42);
        assert_eq!(tk.timestamp, 42);
        assert_eq!(tk.qualified(), qk);
        assert_eq!(tk.to_string(), "kv/x@42");
    }

    #[test]
    fn test_order_sort() {
        let mut ts = vec![3, 1, 2];
        Order::Descending.sort(&mut ts);
        assert_eq!(ts, vec![3, 2, 1]);
        Order::Ascending.sort(&mut ts);
        assert_eq!(ts, vec![1, 2, 3]);
    }

    #[test]
    fn test_tombstone() {
        let entry = TemporalEntry::tombstone(TemporalKey::new("kv", "x", 1));
        assert!(entry.is_tombstone());
    }
}
