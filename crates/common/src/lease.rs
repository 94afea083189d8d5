//! Client lease issued by the cluster

use serde::{Deserialize, Serialize};

/// Lease identifying a client to the servers
///
/// Servers use the lease id to attribute RPC records (for duplicate
/// detection) and lock ownership to a live client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientLease {
    /// Cluster-unique lease id
    pub lease_id: u64,
    /// Cluster time at which the lease expires
    pub lease_expiration: u64,
    /// Cluster time when the lease was last observed
    pub timestamp: u64,
}

impl ClientLease {
    pub fn new(lease_id: u64, lease_expiration: u64, timestamp: u64) -> Self {
        Self {
            lease_id,
            lease_expiration,
            timestamp,
        }
    }
}
