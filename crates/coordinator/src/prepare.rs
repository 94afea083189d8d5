//! Prepare exchange: ships a batch of staged operations to one server and
//! collects its vote

use crate::cache::{CommitCache, EntryId, OpKind, OpState};
use crate::error::Result;
use crate::exchange::{ExchangeState, Reply, Rpc};
use crate::participants::ParticipantList;
use proven_cluster::ServerSession;
use proven_common::{ClientLease, RpcId, TransactionId};
use proven_protocol::{PrepareOp, PrepareRequest, PrepareResponse, TxRequest, TxResponse};
use std::sync::Arc;

/// One batched prepare RPC to one server
pub struct PrepareExchange {
    rpc: Rpc,
    request: PrepareRequest,
    entries: Vec<EntryId>,
}

impl PrepareExchange {
    pub fn new(
        session: Arc<dyn ServerSession>,
        lease: ClientLease,
        txn_id: TransactionId,
        participants: &ParticipantList,
    ) -> Self {
        Self {
            rpc: Rpc::new(session),
            request: PrepareRequest {
                lease,
                ack_id: 0,
                txn_id,
                participants: participants.as_slice().to_vec(),
                ops: Vec::new(),
            },
            entries: Vec::new(),
        }
    }

    /// Add a staged operation to the batch
    ///
    /// Returns false, leaving the entry pending, for an operation of unknown
    /// kind.
    pub fn append_op(&mut self, cache: &mut CommitCache, id: EntryId) -> bool {
        let Some(entry) = cache.get_mut(id) else {
            return false;
        };
        let table_id = id.table_id();
        let rpc_id = entry.rpc_id;
        let key = entry.object.key().bytes().to_vec();
        let op = match entry.kind {
            OpKind::Read => PrepareOp::Read {
                table_id,
                rpc_id,
                key,
            },
            OpKind::Remove => PrepareOp::Remove {
                table_id,
                rpc_id,
                key,
            },
            OpKind::Write => PrepareOp::Write {
                table_id,
                rpc_id,
                key,
                value: entry.object.value().to_vec(),
            },
            OpKind::Invalid => {
                tracing::warn!("Unknown transaction op type");
                return false;
            }
        };

        self.request.ops.push(op);
        entry.state = OpState::Prepared;
        self.entries.push(id);
        true
    }

    /// Stamp the ack id and hand the request to the transport
    pub fn send(&mut self, ack_id: RpcId) -> Result<()> {
        self.request.ack_id = ack_id;
        tracing::debug!("sending {} to {}", self.request, self.rpc.locator());
        self.rpc.send(&TxRequest::Prepare(self.request.clone()))
    }

    pub fn locator(&self) -> &str {
        self.rpc.locator()
    }

    pub fn state(&self) -> ExchangeState {
        self.rpc.state()
    }

    pub fn request(&self) -> &PrepareRequest {
        &self.request
    }

    pub fn op_count(&self) -> usize {
        self.request.ops.len()
    }

    /// Cache entries included in this exchange
    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    /// Whether the reply (or a transport failure) has arrived
    pub fn is_ready(&mut self) -> bool {
        self.rpc.is_ready()
    }

    pub fn take_reply(&mut self) -> Result<Reply<PrepareResponse>> {
        self.rpc.take_reply("prepare", |response| match response {
            TxResponse::Prepare(response) => Some(response),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_cluster::MockCluster;
    use proven_common::{Key, TableId};
    use proven_protocol::{Status, Vote};

    const MASTER1: &str = "mock:host=master1";

    fn exchange(cluster: &MockCluster) -> PrepareExchange {
        PrepareExchange::new(
            cluster.session(MASTER1).unwrap(),
            ClientLease::new(1, 0, 0),
            TransactionId::new(1, 1),
            &ParticipantList::default(),
        )
    }

    #[test]
    fn test_append_op() {
        let cluster = MockCluster::with_servers(&[MASTER1]);
        let mut exchange = exchange(&cluster);
        let mut cache = CommitCache::new();
        let read = cache.insert(Key::new(TableId(1), "r"), OpKind::Read, Vec::new());
        let remove = cache.insert(Key::new(TableId(2), "d"), OpKind::Remove, Vec::new());
        let write = cache.insert(Key::new(TableId(3), "w"), OpKind::Write, b"v".to_vec());
        let invalid = cache.insert(Key::new(TableId(4), "x"), OpKind::Invalid, Vec::new());
        cache.get_mut(read).unwrap().rpc_id = 42;

        assert!(exchange.append_op(&mut cache, read));
        assert!(exchange.append_op(&mut cache, remove));
        assert!(exchange.append_op(&mut cache, write));
        assert!(!exchange.append_op(&mut cache, invalid));

        assert_eq!(exchange.op_count(), 3);
        assert_eq!(exchange.entries(), &[read, remove, write]);
        assert_eq!(cache.get(read).unwrap().state, OpState::Prepared);
        assert_eq!(cache.get(write).unwrap().state, OpState::Prepared);
        assert_eq!(cache.get(invalid).unwrap().state, OpState::Pending);
        assert_eq!(
            exchange.request().ops[0],
            PrepareOp::Read {
                table_id: TableId(1),
                rpc_id: 42,
                key: b"r".to_vec(),
            }
        );
        assert_eq!(
            exchange.request().to_string(),
            "PrepareRequest :: lease{1} ackId{0} participantCount{0} opCount{3} \
             ParticipantList[ ] OpSet[ READ{1, 42} REMOVE{2, 0} WRITE{3, 0} ]"
        );
    }

    #[test]
    fn test_send_stamps_ack_id() {
        let cluster = MockCluster::with_servers(&[MASTER1]);
        cluster.create_table(TableId(1), MASTER1).unwrap();
        let mut exchange = exchange(&cluster);
        let mut cache = CommitCache::new();
        let id = cache.insert(Key::new(TableId(1), "k"), OpKind::Write, b"v".to_vec());
        exchange.append_op(&mut cache, id);

        assert_eq!(exchange.state(), ExchangeState::NotStarted);
        exchange.send(7).unwrap();
        assert_eq!(exchange.state(), ExchangeState::InProgress);
        assert_eq!(exchange.request().ack_id, 7);

        assert!(exchange.is_ready());
        match exchange.take_reply().unwrap() {
            Reply::Response(response) => {
                assert_eq!(response.status, Status::Ok);
                assert_eq!(response.vote, Vote::Prepared);
            }
            Reply::Failed(error) => panic!("Unexpected transport error: {}", error),
        }
        assert_eq!(exchange.state(), ExchangeState::Finished);
    }

    #[test]
    fn test_take_reply_before_send() {
        let cluster = MockCluster::with_servers(&[MASTER1]);
        let mut exchange = exchange(&cluster);
        assert!(!exchange.is_ready());
        assert!(exchange.take_reply().is_err());
    }
}
