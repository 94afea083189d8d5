//! Typed requests sent by the commit coordinator

use proven_common::{ClientLease, KeyHash, RpcId, TableId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a transaction as decided by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Not yet decided; never sent on the wire
    Undecided,
    /// All participants voted to commit
    Commit,
    /// At least one participant could not prepare
    Abort,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undecided => "undecided",
            Self::Commit => "commit",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant of a transaction: a distinct `(table, key hash)` group
/// and the rpc id assigned to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParticipant {
    pub table_id: TableId,
    pub key_hash: KeyHash,
    pub rpc_id: RpcId,
}

impl TxParticipant {
    pub fn new(table_id: TableId, key_hash: KeyHash, rpc_id: RpcId) -> Self {
        Self {
            table_id,
            key_hash,
            rpc_id,
        }
    }
}

impl fmt::Display for TxParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}, {}}}", self.table_id, self.key_hash, self.rpc_id)
    }
}

/// A single staged operation shipped in a prepare request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareOp {
    Read {
        table_id: TableId,
        rpc_id: RpcId,
        key: Vec<u8>,
    },
    Remove {
        table_id: TableId,
        rpc_id: RpcId,
        key: Vec<u8>,
    },
    Write {
        table_id: TableId,
        rpc_id: RpcId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl PrepareOp {
    pub fn table_id(&self) -> TableId {
        match self {
            Self::Read { table_id, .. }
            | Self::Remove { table_id, .. }
            | Self::Write { table_id, .. } => *table_id,
        }
    }

    pub fn rpc_id(&self) -> RpcId {
        match self {
            Self::Read { rpc_id, .. } | Self::Remove { rpc_id, .. } | Self::Write { rpc_id, .. } => {
                *rpc_id
            }
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Self::Read { key, .. } | Self::Remove { key, .. } | Self::Write { key, .. } => key,
        }
    }

    /// Short tag used in logs
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Read { .. } => "READ",
            Self::Remove { .. } => "REMOVE",
            Self::Write { .. } => "WRITE",
        }
    }
}

/// Vote request: lock and validate a batch of operations on one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub lease: ClientLease,
    /// Rpc ids up to this one have been acknowledged and may be pruned
    pub ack_id: RpcId,
    pub txn_id: TransactionId,
    /// Full participant manifest of the transaction
    pub participants: Vec<TxParticipant>,
    pub ops: Vec<PrepareOp>,
}

impl fmt::Display for PrepareRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PrepareRequest :: lease{{{}}} ackId{{{}}} participantCount{{{}}} opCount{{{}}} ParticipantList[",
            self.lease.lease_id,
            self.ack_id,
            self.participants.len(),
            self.ops.len()
        )?;
        for participant in &self.participants {
            write!(f, " {}", participant)?;
        }
        write!(f, " ] OpSet[")?;
        for op in &self.ops {
            write!(f, " {}{{{}, {}}}", op.tag(), op.table_id(), op.rpc_id())?;
        }
        write!(f, " ]")
    }
}

/// Decision notification for a batch of participants on one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub lease_id: u64,
    pub txn_id: TransactionId,
    pub decision: Decision,
    pub participants: Vec<TxParticipant>,
}

impl fmt::Display for DecisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecisionRequest :: lease{{{}}} decision{{{}}} participantCount{{{}}} ParticipantList[",
            self.lease_id,
            self.decision,
            self.participants.len()
        )?;
        for participant in &self.participants {
            write!(f, " {}", participant)?;
        }
        write!(f, " ]")
    }
}

/// Plain read of the current value of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub table_id: TableId,
    pub key: Vec<u8>,
}

/// Any request a server accepts from a transaction client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRequest {
    Prepare(PrepareRequest),
    Decision(DecisionRequest),
    Read(ReadRequest),
}

impl TxRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prepare(_) => "prepare",
            Self::Decision(_) => "decision",
            Self::Read(_) => "read",
        }
    }
}
