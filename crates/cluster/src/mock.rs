//! In-memory cluster implementing the client service contracts
//!
//! `MockCluster` plays every role a transaction client needs: it resolves
//! keys to servers through a client-side routing cache, hands out sessions
//! that deliver requests to in-memory [`MockServer`]s, flushes sessions, and
//! issues the client lease and rpc ids.
//!
//! The routing cache is deliberately separate from the authoritative tablet
//! map, so moving a table makes the client's view stale until it is
//! invalidated, exactly as in a real cluster.

use crate::rpc::{RpcHandle, TransportError};
use crate::server::{MockServer, Tablet, TabletMap};
use crate::services::{ClusterClient, LeaseService, LocationResolver, ServerSession, SessionCache};
use crate::{ClusterError, Result};
use parking_lot::Mutex;
use proven_common::{ClientLease, Key, KeyHash, RpcId, TableId, TransactionId};
use proven_protocol::TxRequest;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mutable cluster state shared by the cluster and its sessions
#[derive(Debug, Default)]
struct ClusterState {
    /// Authoritative tablet assignment
    tablets: TabletMap,

    /// Client's cached copy of the tablet map, filled lazily
    routing: HashMap<TableId, Vec<Tablet>>,

    servers: HashMap<String, MockServer>,

    flushed_sessions: Vec<String>,

    invalidated_tables: Vec<TableId>,
}

impl ClusterState {
    fn server_mut(&mut self, locator: &str) -> Result<&mut MockServer> {
        self.servers
            .get_mut(locator)
            .ok_or_else(|| ClusterError::ServerNotFound(locator.to_string()))
    }

    fn owner_server(&self, table_id: TableId, key: &[u8]) -> Result<&MockServer> {
        let locator = self
            .tablets
            .owner(table_id, Key::hash_of(table_id, key))
            .map_err(|_| ClusterError::TableDoesntExist(table_id))?;
        self.servers
            .get(locator)
            .ok_or_else(|| ClusterError::ServerNotFound(locator.to_string()))
    }
}

/// Session to one mock server
struct MockSession {
    locator: String,
    state: Arc<Mutex<ClusterState>>,
}

impl ServerSession for MockSession {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn send(&self, request: Vec<u8>) -> RpcHandle {
        let (replier, handle) = RpcHandle::channel();
        let mut state = self.state.lock();
        let ClusterState {
            tablets, servers, ..
        } = &mut *state;
        match servers.get_mut(&self.locator) {
            Some(server) => server.dispatch(tablets, request, replier),
            None => replier.fail(TransportError::ConnectionLost(self.locator.clone())),
        }
        handle
    }
}

/// In-memory cluster of storage servers
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    lease: Mutex<ClientLease>,
    next_rpc_id: AtomicU64,
    ack_id: AtomicU64,
}

impl MockCluster {
    /// Create an empty cluster; the client lease has id 1
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::default())),
            lease: Mutex::new(ClientLease::new(1, u64::MAX, 0)),
            next_rpc_id: AtomicU64::new(1),
            ack_id: AtomicU64::new(0),
        }
    }

    /// Create a cluster with the given servers
    pub fn with_servers(locators: &[&str]) -> Self {
        let cluster = Self::new();
        for locator in locators {
            cluster.add_server(*locator);
        }
        cluster
    }

    /// Service bundle backed by this cluster
    pub fn client(self: &Arc<Self>) -> ClusterClient {
        ClusterClient::new(self.clone(), self.clone(), self.clone())
    }

    pub fn add_server(&self, locator: impl Into<String>) {
        let locator = locator.into();
        self.state
            .lock()
            .servers
            .insert(locator.clone(), MockServer::new(locator));
    }

    /// Create a table served entirely by one server
    pub fn create_table(&self, table_id: TableId, locator: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.server_mut(locator)?;
        state.tablets.insert(Tablet {
            table_id,
            start_hash: KeyHash(0),
            end_hash: KeyHash(u64::MAX),
            locator: locator.to_string(),
        });
        Ok(())
    }

    /// Move every tablet of a table, and its objects, to another server
    ///
    /// The client's routing cache is not updated.
    pub fn move_table(&self, table_id: TableId, locator: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.server_mut(locator)?;

        let tablets = state
            .tablets
            .tablets_mut(table_id)
            .ok_or(ClusterError::TableDoesntExist(table_id))?;
        for tablet in tablets.iter_mut() {
            tablet.locator = locator.to_string();
        }

        let mut moved = Vec::new();
        for server in state.servers.values_mut() {
            if server.locator() != locator {
                moved.extend(server.take_table(table_id));
            }
        }
        let target = state.server_mut(locator)?;
        for (key, value) in moved {
            target.put_object(key, value);
        }
        tracing::info!("moved table {} to {}", table_id, locator);
        Ok(())
    }

    /// Session to a server, bypassing routing
    pub fn session(&self, locator: &str) -> Result<Arc<dyn ServerSession>> {
        if !self.state.lock().servers.contains_key(locator) {
            return Err(ClusterError::ServerNotFound(locator.to_string()));
        }
        Ok(Arc::new(MockSession {
            locator: locator.to_string(),
            state: self.state.clone(),
        }))
    }

    /// Store an object on the server that owns it
    pub fn write_object(&self, table_id: TableId, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let locator = state
            .tablets
            .owner(table_id, Key::hash_of(table_id, key))
            .map_err(|_| ClusterError::TableDoesntExist(table_id))?
            .to_string();
        state
            .server_mut(&locator)?
            .put_object((table_id, key.to_vec()), value.to_vec());
        Ok(())
    }

    /// Current value of an object on the server that owns it
    pub fn read_object(&self, table_id: TableId, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let server = state.owner_server(table_id, key).ok()?;
        server.object(&(table_id, key.to_vec())).cloned()
    }

    /// Transactions holding a lock on an object
    pub fn lock_holders(&self, table_id: TableId, key: &[u8]) -> Vec<TransactionId> {
        let state = self.state.lock();
        state
            .owner_server(table_id, key)
            .map(|server| server.lock_holders(&(table_id, key.to_vec())))
            .unwrap_or_default()
    }

    /// Make the next `count` requests to a server fail in transport
    pub fn fail_next_rpcs(&self, locator: &str, count: usize) -> Result<()> {
        self.state.lock().server_mut(locator)?.fail_next(count);
        Ok(())
    }

    /// Queue replies from a server until `release_replies`
    pub fn hold_replies(&self, locator: &str) -> Result<()> {
        self.state.lock().server_mut(locator)?.hold();
        Ok(())
    }

    /// Process queued requests of a server; returns how many were released
    pub fn release_replies(&self, locator: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let ClusterState {
            tablets, servers, ..
        } = &mut *state;
        let server = servers
            .get_mut(locator)
            .ok_or_else(|| ClusterError::ServerNotFound(locator.to_string()))?;
        Ok(server.release(tablets))
    }

    /// Requests a server has processed, in order
    pub fn requests(&self, locator: &str) -> Vec<TxRequest> {
        self.state
            .lock()
            .servers
            .get(locator)
            .map(|server| server.received().to_vec())
            .unwrap_or_default()
    }

    pub fn flushed_sessions(&self) -> Vec<String> {
        self.state.lock().flushed_sessions.clone()
    }

    pub fn invalidated_tables(&self) -> Vec<TableId> {
        self.state.lock().invalidated_tables.clone()
    }

    pub fn set_lease(&self, lease: ClientLease) {
        *self.lease.lock() = lease;
    }

    pub fn set_ack_id(&self, ack_id: RpcId) {
        self.ack_id.store(ack_id, Ordering::SeqCst);
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationResolver for MockCluster {
    fn resolve(&self, table_id: TableId, key_hash: KeyHash) -> Result<Arc<dyn ServerSession>> {
        let locator = {
            let mut state = self.state.lock();
            if !state.routing.contains_key(&table_id) {
                let tablets = state
                    .tablets
                    .tablets(table_id)
                    .ok_or(ClusterError::TableDoesntExist(table_id))?
                    .to_vec();
                state.routing.insert(table_id, tablets);
            }
            state.routing[&table_id]
                .iter()
                .find(|tablet| tablet.contains(key_hash))
                .map(|tablet| tablet.locator.clone())
                .ok_or(ClusterError::TableDoesntExist(table_id))?
        };
        self.session(&locator)
    }

    fn invalidate(&self, table_id: TableId, _key_hash: KeyHash) {
        let mut state = self.state.lock();
        state.routing.remove(&table_id);
        state.invalidated_tables.push(table_id);
        tracing::info!("flushing tablet map for table {}", table_id);
    }
}

impl SessionCache for MockCluster {
    fn flush(&self, locator: &str) {
        tracing::info!("flushing session for {}", locator);
        self.state
            .lock()
            .flushed_sessions
            .push(locator.to_string());
    }
}

impl LeaseService for MockCluster {
    fn lease(&self) -> ClientLease {
        *self.lease.lock()
    }

    fn ack_id(&self) -> RpcId {
        self.ack_id.load(Ordering::SeqCst)
    }

    fn new_rpc_id_block(&self, count: usize) -> RpcId {
        self.next_rpc_id.fetch_add(count as u64, Ordering::SeqCst)
    }
}
