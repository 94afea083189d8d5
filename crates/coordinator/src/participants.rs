//! Participant list of a committing transaction

use crate::cache::CommitCache;
use crate::error::{CoordinatorError, Result};
use proven_common::RpcId;
use proven_protocol::TxParticipant;

/// Every distinct `(table, key hash)` group touched by a transaction, in
/// cache order, with the rpc id assigned to it
///
/// Built once when the commit starts and never modified afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantList {
    participants: Vec<TxParticipant>,
}

impl ParticipantList {
    /// Assign consecutive rpc ids starting at `first_rpc_id` to the groups
    /// of the cache and stamp them on every staged operation
    pub fn build(cache: &mut CommitCache, first_rpc_id: RpcId) -> Result<Self> {
        if cache.is_empty() {
            return Err(CoordinatorError::EmptyTransaction);
        }

        let mut participants = Vec::with_capacity(cache.group_count());
        let mut rpc_id = first_rpc_id;
        for (key, group) in cache.groups_mut() {
            if group.is_empty() {
                continue;
            }
            for op in group.iter_mut() {
                op.rpc_id = rpc_id;
            }
            participants.push(TxParticipant::new(key.table_id, key.key_hash, rpc_id));
            rpc_id += 1;
        }

        Ok(Self { participants })
    }

    pub fn as_slice(&self) -> &[TxParticipant] {
        &self.participants
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxParticipant> {
        self.participants.iter()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
