//! Transaction identifier derived from the client lease
//!
//! A client reserves a contiguous block of rpc ids when a transaction starts
//! committing, one per participant. The transaction is identified by the
//! lease that reserved the block and the first id of that block, which is
//! unique for the lifetime of the lease.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-lease rpc sequence number
pub type RpcId = u64;

/// Transaction identifier (lease id + first rpc id of the reserved block)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TransactionId {
    pub lease_id: u64,
    pub rpc_id: RpcId,
}

impl TransactionId {
    pub fn new(lease_id: u64, rpc_id: RpcId) -> Self {
        Self { lease_id, rpc_id }
    }

    /// Parse from the `lease:rpc` string representation
    pub fn parse(s: &str) -> Result<Self, String> {
        let (lease, rpc) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid transaction ID: {}", s))?;
        let lease_id = lease
            .parse()
            .map_err(|e| format!("Invalid transaction ID: {}", e))?;
        let rpc_id = rpc
            .parse()
            .map_err(|e| format!("Invalid transaction ID: {}", e))?;
        Ok(Self { lease_id, rpc_id })
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lease_id, self.rpc_id)
    }
}
