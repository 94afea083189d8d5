//! Contracts of the cluster services a transaction client depends on

use crate::Result;
use crate::rpc::RpcHandle;
use proven_common::{ClientLease, KeyHash, RpcId, TableId};
use std::sync::Arc;

/// Connection to one storage server
pub trait ServerSession: Send + Sync {
    /// Service locator of the server, e.g. `mock:host=master1`
    fn locator(&self) -> &str;

    /// Send encoded request bytes; never blocks
    fn send(&self, request: Vec<u8>) -> RpcHandle;
}

/// Maps keys to the server owning their tablet
pub trait LocationResolver: Send + Sync {
    /// Find the session for the server currently believed to own the key
    ///
    /// Fails with `TableDoesntExist` if the table is unknown to the cluster.
    fn resolve(&self, table_id: TableId, key_hash: KeyHash) -> Result<Arc<dyn ServerSession>>;

    /// Forget cached routing for the tablet containing the key
    fn invalidate(&self, table_id: TableId, key_hash: KeyHash);
}

/// Cache of open server sessions
pub trait SessionCache: Send + Sync {
    /// Drop the session to a server after a transport failure
    fn flush(&self, locator: &str);
}

/// Client lease and rpc id issuance
pub trait LeaseService: Send + Sync {
    fn lease(&self) -> ClientLease;

    /// Highest rpc id whose result the client no longer needs
    fn ack_id(&self) -> RpcId;

    /// Reserve `count` consecutive rpc ids and return the first one
    fn new_rpc_id_block(&self, count: usize) -> RpcId;
}

/// Bundle of the services a transaction needs
#[derive(Clone)]
pub struct ClusterClient {
    pub resolver: Arc<dyn LocationResolver>,
    pub sessions: Arc<dyn SessionCache>,
    pub leases: Arc<dyn LeaseService>,
}

impl ClusterClient {
    pub fn new(
        resolver: Arc<dyn LocationResolver>,
        sessions: Arc<dyn SessionCache>,
        leases: Arc<dyn LeaseService>,
    ) -> Self {
        Self {
            resolver,
            sessions,
            leases,
        }
    }
}
