//! Object keys and key hashing
//!
//! Every object lives in a table and is identified by arbitrary key bytes.
//! Routing uses a 64-bit hash of the key, seeded by the table id, so the
//! same key bytes in two tables land on unrelated tablets.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Identifier of a table in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit hash of a key within its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyHash(pub u64);

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A key within a table
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    table_id: TableId,
    bytes: Vec<u8>,
}

impl Key {
    /// Create a key from a table id and raw key bytes
    pub fn new(table_id: TableId, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            table_id,
            bytes: bytes.into(),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hash of this key, used for tablet routing
    pub fn hash(&self) -> KeyHash {
        Self::hash_of(self.table_id, &self.bytes)
    }

    /// Hash arbitrary key bytes for a table without building a `Key`
    pub fn hash_of(table_id: TableId, bytes: &[u8]) -> KeyHash {
        KeyHash(xxh3_64_with_seed(bytes, table_id.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Key({}, {:?})",
            self.table_id,
            String::from_utf8_lossy(&self.bytes)
        )
    }
}
