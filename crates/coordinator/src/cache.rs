//! Staged operation cache
//!
//! Operations staged by a transaction are kept in an ordered multimap keyed
//! by `(table id, key hash)`. Distinct keys may collide on the hash, so a key
//! maps to a small group of entries that is scanned linearly, comparing the
//! full key bytes. Entries are never removed; an [`EntryId`] therefore stays
//! valid for the lifetime of the cache.

use proven_common::{Key, KeyHash, RpcId, TableId};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordering key of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub table_id: TableId,
    pub key_hash: KeyHash,
}

impl CacheKey {
    pub fn new(table_id: TableId, key_hash: KeyHash) -> Self {
        Self { table_id, key_hash }
    }

    pub fn of(key: &Key) -> Self {
        Self::new(key.table_id(), key.hash())
    }
}

/// Position of one entry: its group and its slot within the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    key: CacheKey,
    slot: usize,
}

impl EntryId {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn table_id(&self) -> TableId {
        self.key.table_id
    }

    pub fn key_hash(&self) -> KeyHash {
        self.key.key_hash
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Kind of staged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Remove,
    /// Never shipped; skipped with a warning
    Invalid,
}

/// Progress of a staged operation through the commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Pending,
    /// Shipped in a prepare exchange
    Prepared,
    /// Shipped in a decision exchange
    Decided,
    /// Given up on after its server kept failing; never shipped again
    Failed,
}

/// Owned key and value bytes of a staged operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectBuffer {
    key: Key,
    value: Vec<u8>,
}

impl ObjectBuffer {
    pub fn new(key: Key, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// One staged operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedOperation {
    pub kind: OpKind,
    pub state: OpState,
    pub object: ObjectBuffer,
    /// Participant rpc id, assigned when the participant list is built
    pub rpc_id: RpcId,
    /// Failed exchanges this entry was part of in the current phase
    pub attempts: u32,
}

impl StagedOperation {
    pub fn new(kind: OpKind, object: ObjectBuffer) -> Self {
        Self {
            kind,
            state: OpState::Pending,
            object,
            rpc_id: 0,
            attempts: 0,
        }
    }

    /// Replace kind and buffer in place
    ///
    /// The entry keeps its position even if the new key bytes would hash
    /// elsewhere.
    pub fn overwrite(&mut self, kind: OpKind, key: Key, value: Vec<u8>) {
        self.kind = kind;
        self.object = ObjectBuffer::new(key, value);
    }
}

/// Ordered multimap of staged operations
#[derive(Debug, Clone, Default)]
pub struct CommitCache {
    groups: BTreeMap<CacheKey, Vec<StagedOperation>>,
    len: usize,
}

impl CommitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry after any entries with the same `(table, hash)`
    pub fn insert(&mut self, key: Key, kind: OpKind, value: Vec<u8>) -> EntryId {
        let cache_key = CacheKey::of(&key);
        let group = self.groups.entry(cache_key).or_default();
        group.push(StagedOperation::new(kind, ObjectBuffer::new(key, value)));
        self.len += 1;
        EntryId {
            key: cache_key,
            slot: group.len() - 1,
        }
    }

    /// First entry whose buffer holds exactly this key
    pub fn find(&self, key: &Key) -> Option<EntryId> {
        let cache_key = CacheKey::of(key);
        let group = self.groups.get(&cache_key)?;
        group
            .iter()
            .position(|op| op.object.key() == key)
            .map(|slot| EntryId {
                key: cache_key,
                slot,
            })
    }

    pub fn get(&self, id: EntryId) -> Option<&StagedOperation> {
        self.groups.get(&id.key)?.get(id.slot)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut StagedOperation> {
        self.groups.get_mut(&id.key)?.get_mut(id.slot)
    }

    pub fn first(&self) -> Option<EntryId> {
        self.groups
            .iter()
            .find(|(_, group)| !group.is_empty())
            .map(|(key, _)| EntryId { key: *key, slot: 0 })
    }

    /// Entry following `id` in canonical order
    pub fn next_after(&self, id: EntryId) -> Option<EntryId> {
        if let Some(group) = self.groups.get(&id.key)
            && id.slot + 1 < group.len()
        {
            return Some(EntryId {
                key: id.key,
                slot: id.slot + 1,
            });
        }
        self.groups
            .range((Bound::Excluded(id.key), Bound::Unbounded))
            .find(|(_, group)| !group.is_empty())
            .map(|(key, _)| EntryId { key: *key, slot: 0 })
    }

    /// Entries ordered by table id, key hash, then insertion
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &StagedOperation)> {
        self.groups.iter().flat_map(|(key, group)| {
            group
                .iter()
                .enumerate()
                .map(move |(slot, op)| (EntryId { key: *key, slot }, op))
        })
    }

    /// Groups of entries sharing a `(table, hash)`, in order
    pub(crate) fn groups_mut(
        &mut self,
    ) -> impl Iterator<Item = (&CacheKey, &mut Vec<StagedOperation>)> {
        self.groups.iter_mut()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of entries sharing a `(table, hash)`
    pub fn count(&self, table_id: TableId, key_hash: KeyHash) -> usize {
        self.groups
            .get(&CacheKey::new(table_id, key_hash))
            .map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
