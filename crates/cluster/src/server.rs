//! In-memory storage server
//!
//! A `MockServer` owns the objects of the tablets assigned to it, a lock
//! table, and the operations of transactions that are prepared but not yet
//! decided. It answers the three transaction requests (prepare, decision,
//! read) and can be told to drop or hold requests to simulate faults.

use crate::lock::{LockAttemptResult, LockManager, LockMode, ObjectKey};
use crate::rpc::{RpcOutcome, RpcReplier, TransportError};
use proven_common::{Key, KeyHash, RpcId, TableId, TransactionId};
use proven_protocol::{
    Decision, DecisionRequest, DecisionResponse, PrepareOp, PrepareRequest, PrepareResponse,
    ReadRequest, ReadResponse, Status, TxRequest, TxResponse, decode, encode,
};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Contiguous key-hash range of a table owned by one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablet {
    pub table_id: TableId,
    pub start_hash: KeyHash,
    pub end_hash: KeyHash,
    pub locator: String,
}

impl Tablet {
    pub fn contains(&self, key_hash: KeyHash) -> bool {
        self.start_hash <= key_hash && key_hash <= self.end_hash
    }
}

/// Authoritative assignment of tablets to servers
#[derive(Debug, Clone, Default)]
pub struct TabletMap {
    tables: BTreeMap<TableId, Vec<Tablet>>,
}

impl TabletMap {
    pub fn tablets(&self, table_id: TableId) -> Option<&[Tablet]> {
        self.tables.get(&table_id).map(Vec::as_slice)
    }

    pub fn tablets_mut(&mut self, table_id: TableId) -> Option<&mut Vec<Tablet>> {
        self.tables.get_mut(&table_id)
    }

    pub fn insert(&mut self, tablet: Tablet) {
        self.tables.entry(tablet.table_id).or_default().push(tablet);
    }

    /// Locator of the server owning a key hash
    pub fn owner(&self, table_id: TableId, key_hash: KeyHash) -> Result<&str, Status> {
        let tablets = self.tables.get(&table_id).ok_or(Status::TableDoesntExist)?;
        tablets
            .iter()
            .find(|tablet| tablet.contains(key_hash))
            .map(|tablet| tablet.locator.as_str())
            .ok_or(Status::UnknownTablet)
    }
}

/// In-memory storage server
#[derive(Debug)]
pub struct MockServer {
    locator: String,
    objects: HashMap<ObjectKey, Vec<u8>>,
    locks: LockManager,
    /// Ops of prepared transactions, by participant rpc id
    prepared: HashMap<(TransactionId, RpcId), Vec<PrepareOp>>,
    received: Vec<TxRequest>,
    fail_next: usize,
    holding: bool,
    held: VecDeque<(Vec<u8>, RpcReplier)>,
}

impl MockServer {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            objects: HashMap::new(),
            locks: LockManager::new(),
            prepared: HashMap::new(),
            received: Vec::new(),
            fail_next: 0,
            holding: false,
            held: VecDeque::new(),
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Accept a request; the reply is delivered now, later, or as a failure
    pub fn dispatch(&mut self, tablets: &TabletMap, request: Vec<u8>, replier: RpcReplier) {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            tracing::debug!("{} dropping request", self.locator);
            replier.fail(TransportError::ConnectionLost(self.locator.clone()));
            return;
        }
        if self.holding {
            self.held.push_back((request, replier));
            return;
        }
        replier.complete(self.handle(tablets, &request));
    }

    /// Process held requests in arrival order and stop holding
    pub fn release(&mut self, tablets: &TabletMap) -> usize {
        self.holding = false;
        let held: Vec<_> = self.held.drain(..).collect();
        let count = held.len();
        for (request, replier) in held {
            replier.complete(self.handle(tablets, &request));
        }
        count
    }

    pub fn hold(&mut self) {
        self.holding = true;
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn fail_next(&mut self, count: usize) {
        self.fail_next = count;
    }

    pub fn received(&self) -> &[TxRequest] {
        &self.received
    }

    pub fn object(&self, key: &ObjectKey) -> Option<&Vec<u8>> {
        self.objects.get(key)
    }

    pub fn put_object(&mut self, key: ObjectKey, value: Vec<u8>) {
        self.objects.insert(key, value);
    }

    /// Remove and return every object of a table (tablet migration)
    pub fn take_table(&mut self, table_id: TableId) -> Vec<(ObjectKey, Vec<u8>)> {
        let keys: Vec<_> = self
            .objects
            .keys()
            .filter(|(table, _)| *table == table_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.objects.remove(&key).map(|value| (key, value)))
            .collect()
    }

    pub fn lock_holders(&self, key: &ObjectKey) -> Vec<TransactionId> {
        self.locks.holders(key)
    }

    fn handle(&mut self, tablets: &TabletMap, bytes: &[u8]) -> RpcOutcome {
        let request: TxRequest =
            decode(bytes).map_err(|e| TransportError::Malformed(e.to_string()))?;
        tracing::debug!("{} received {} request", self.locator, request.kind());
        self.received.push(request.clone());

        let response = match request {
            TxRequest::Prepare(request) => TxResponse::Prepare(self.prepare(tablets, request)),
            TxRequest::Decision(request) => TxResponse::Decision(self.decide(tablets, request)),
            TxRequest::Read(request) => TxResponse::Read(self.read(tablets, request)),
        };
        encode(&response).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    fn check_owner(
        &self,
        tablets: &TabletMap,
        table_id: TableId,
        key_hash: KeyHash,
    ) -> Result<(), Status> {
        if tablets.owner(table_id, key_hash)? == self.locator {
            Ok(())
        } else {
            Err(Status::UnknownTablet)
        }
    }

    fn prepare(&mut self, tablets: &TabletMap, request: PrepareRequest) -> PrepareResponse {
        for op in &request.ops {
            let key_hash = Key::hash_of(op.table_id(), op.key());
            if let Err(status) = self.check_owner(tablets, op.table_id(), key_hash) {
                return PrepareResponse::failed(status);
            }
        }

        let txn = request.txn_id;
        let mut vote_abort = false;
        for op in request.ops {
            let key = (op.table_id(), op.key().to_vec());
            let mode = match op {
                PrepareOp::Read { .. } => LockMode::Shared,
                PrepareOp::Remove { .. } | PrepareOp::Write { .. } => LockMode::Exclusive,
            };
            match self.locks.check(txn, &key, mode) {
                LockAttemptResult::WouldGrant => {
                    if !self.locks.holders(&key).contains(&txn) {
                        self.locks.grant(txn, key, mode);
                    }
                    let ops = self.prepared.entry((txn, op.rpc_id())).or_default();
                    if !ops.contains(&op) {
                        ops.push(op);
                    }
                }
                LockAttemptResult::Conflict { holders } => {
                    tracing::debug!(
                        "{} lock conflict for txn {} with {:?}",
                        self.locator,
                        txn,
                        holders
                    );
                    vote_abort = true;
                }
            }
        }

        if vote_abort {
            PrepareResponse::abort()
        } else {
            PrepareResponse::prepared()
        }
    }

    fn decide(&mut self, tablets: &TabletMap, request: DecisionRequest) -> DecisionResponse {
        for participant in &request.participants {
            if let Err(status) =
                self.check_owner(tablets, participant.table_id, participant.key_hash)
            {
                return DecisionResponse { status };
            }
        }

        let txn = request.txn_id;
        for participant in &request.participants {
            let Some(ops) = self.prepared.remove(&(txn, participant.rpc_id)) else {
                continue;
            };
            for op in ops {
                let key = (op.table_id(), op.key().to_vec());
                if request.decision == Decision::Commit {
                    match op {
                        PrepareOp::Write { value, .. } => {
                            self.objects.insert(key.clone(), value);
                        }
                        PrepareOp::Remove { .. } => {
                            self.objects.remove(&key);
                        }
                        PrepareOp::Read { .. } => {}
                    }
                }
                self.locks.release(txn, &key);
            }
        }

        DecisionResponse { status: Status::Ok }
    }

    fn read(&self, tablets: &TabletMap, request: ReadRequest) -> ReadResponse {
        let key_hash = Key::hash_of(request.table_id, &request.key);
        if let Err(status) = self.check_owner(tablets, request.table_id, key_hash) {
            return ReadResponse {
                status,
                value: None,
            };
        }
        match self.objects.get(&(request.table_id, request.key)) {
            Some(value) => ReadResponse {
                status: Status::Ok,
                value: Some(value.clone()),
            },
            None => ReadResponse {
                status: Status::ObjectDoesntExist,
                value: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcHandle;
    use proven_common::ClientLease;
    use proven_protocol::{TxParticipant, Vote};

    const MASTER1: &str = "mock:host=master1";

    fn tablets() -> TabletMap {
        let mut map = TabletMap::default();
        map.insert(Tablet {
            table_id: TableId(1),
            start_hash: KeyHash(0),
            end_hash: KeyHash(u64::MAX),
            locator: MASTER1.to_string(),
        });
        map
    }

    fn roundtrip(server: &mut MockServer, tablets: &TabletMap, request: TxRequest) -> TxResponse {
        let (replier, mut handle) = RpcHandle::channel();
        server.dispatch(tablets, encode(&request).unwrap(), replier);
        let bytes = handle.take_outcome().unwrap().unwrap();
        decode(&bytes).unwrap()
    }

    fn prepare(txn: u64, ops: Vec<PrepareOp>) -> TxRequest {
        TxRequest::Prepare(PrepareRequest {
            lease: ClientLease::new(1, 0, 0),
            ack_id: 0,
            txn_id: TransactionId::new(1, txn),
            participants: Vec::new(),
            ops,
        })
    }

    fn write(rpc_id: u64, key: &str, value: &str) -> PrepareOp {
        PrepareOp::Write {
            table_id: TableId(1),
            rpc_id,
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn decision(txn: u64, rpc_id: u64, key: &str, decision: Decision) -> TxRequest {
        TxRequest::Decision(DecisionRequest {
            lease_id: 1,
            txn_id: TransactionId::new(1, txn),
            decision,
            participants: vec![TxParticipant::new(
                TableId(1),
                Key::hash_of(TableId(1), key.as_bytes()),
                rpc_id,
            )],
        })
    }

    #[test]
    fn test_prepare_commit_applies_write() {
        let tablets = tablets();
        let mut server = MockServer::new(MASTER1);

        let response = roundtrip(&mut server, &tablets, prepare(1, vec![write(1, "k", "v")]));
        assert_eq!(response, TxResponse::Prepare(PrepareResponse::prepared()));
        assert!(server.object(&(TableId(1), b"k".to_vec())).is_none());

        let response = roundtrip(&mut server, &tablets, decision(1, 1, "k", Decision::Commit));
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(
            server.object(&(TableId(1), b"k".to_vec())),
            Some(&b"v".to_vec())
        );
        assert!(server.lock_holders(&(TableId(1), b"k".to_vec())).is_empty());
    }

    #[test]
    fn test_conflicting_prepare_votes_abort() {
        let tablets = tablets();
        let mut server = MockServer::new(MASTER1);

        roundtrip(&mut server, &tablets, prepare(1, vec![write(1, "k", "a")]));
        let response = roundtrip(&mut server, &tablets, prepare(5, vec![write(5, "k", "b")]));
        match response {
            TxResponse::Prepare(r) => {
                assert_eq!(r.status, Status::Ok);
                assert_eq!(r.vote, Vote::Abort);
            }
            other => panic!("Expected prepare response, got {:?}", other),
        }

        // Abort of the first releases the lock without applying
        roundtrip(&mut server, &tablets, decision(1, 1, "k", Decision::Abort));
        assert!(server.object(&(TableId(1), b"k".to_vec())).is_none());
        assert!(server.lock_holders(&(TableId(1), b"k".to_vec())).is_empty());
    }

    #[test]
    fn test_wrong_server_reports_unknown_tablet() {
        let tablets = tablets();
        let mut server = MockServer::new("mock:host=master2");
        let response = roundtrip(&mut server, &tablets, prepare(1, vec![write(1, "k", "v")]));
        assert_eq!(response.status(), Status::UnknownTablet);
    }

    #[test]
    fn test_unknown_table() {
        let tablets = TabletMap::default();
        let mut server = MockServer::new(MASTER1);
        let response = roundtrip(&mut server, &tablets, prepare(1, vec![write(1, "k", "v")]));
        assert_eq!(response.status(), Status::TableDoesntExist);
    }

    #[test]
    fn test_hold_and_release() {
        let tablets = tablets();
        let mut server = MockServer::new(MASTER1);
        server.hold();

        let (replier, mut handle) = RpcHandle::channel();
        server.dispatch(&tablets, encode(&prepare(1, vec![])).unwrap(), replier);
        assert!(!handle.is_ready());
        assert_eq!(server.held_count(), 1);

        assert_eq!(server.release(&tablets), 1);
        assert!(handle.is_ready());
    }

    #[test]
    fn test_fail_next() {
        let tablets = tablets();
        let mut server = MockServer::new(MASTER1);
        server.fail_next(1);

        let (replier, mut handle) = RpcHandle::channel();
        server.dispatch(&tablets, encode(&prepare(1, vec![])).unwrap(), replier);
        assert!(matches!(
            handle.take_outcome(),
            Some(Err(TransportError::ConnectionLost(_)))
        ));
        assert!(server.received().is_empty());
    }
}
