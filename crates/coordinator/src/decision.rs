//! Decision exchange: tells one server the outcome for a batch of
//! participants

use crate::cache::{CommitCache, EntryId, OpKind, OpState};
use crate::error::Result;
use crate::exchange::{ExchangeState, Reply, Rpc};
use proven_cluster::ServerSession;
use proven_common::TransactionId;
use proven_protocol::{
    Decision, DecisionRequest, DecisionResponse, TxParticipant, TxRequest, TxResponse,
};
use std::sync::Arc;

/// One batched decision RPC to one server
pub struct DecisionExchange {
    rpc: Rpc,
    request: DecisionRequest,
    entries: Vec<EntryId>,
}

impl DecisionExchange {
    pub fn new(
        session: Arc<dyn ServerSession>,
        lease_id: u64,
        txn_id: TransactionId,
        decision: Decision,
    ) -> Self {
        Self {
            rpc: Rpc::new(session),
            request: DecisionRequest {
                lease_id,
                txn_id,
                decision,
                participants: Vec::new(),
            },
            entries: Vec::new(),
        }
    }

    /// Add the participant of a staged operation to the batch
    pub fn append_op(&mut self, cache: &mut CommitCache, id: EntryId) -> bool {
        let Some(entry) = cache.get_mut(id) else {
            return false;
        };
        if entry.kind == OpKind::Invalid {
            tracing::warn!("Unknown transaction op type");
            return false;
        }

        self.request.participants.push(TxParticipant::new(
            id.table_id(),
            id.key_hash(),
            entry.rpc_id,
        ));
        entry.state = OpState::Decided;
        self.entries.push(id);
        true
    }

    pub fn send(&mut self) -> Result<()> {
        tracing::debug!("sending {} to {}", self.request, self.rpc.locator());
        self.rpc.send(&TxRequest::Decision(self.request.clone()))
    }

    pub fn locator(&self) -> &str {
        self.rpc.locator()
    }

    pub fn state(&self) -> ExchangeState {
        self.rpc.state()
    }

    pub fn request(&self) -> &DecisionRequest {
        &self.request
    }

    pub fn participant_count(&self) -> usize {
        self.request.participants.len()
    }

    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    pub fn is_ready(&mut self) -> bool {
        self.rpc.is_ready()
    }

    pub fn take_reply(&mut self) -> Result<Reply<DecisionResponse>> {
        self.rpc.take_reply("decision", |response| match response {
            TxResponse::Decision(response) => Some(response),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_cluster::MockCluster;
    use proven_common::{Key, TableId};

    const MASTER3: &str = "mock:host=master3";

    #[test]
    fn test_constructor() {
        let cluster = MockCluster::with_servers(&[MASTER3]);
        let exchange = DecisionExchange::new(
            cluster.session(MASTER3).unwrap(),
            42,
            TransactionId::new(42, 1),
            Decision::Abort,
        );
        assert_eq!(exchange.request().decision, Decision::Abort);
        assert_eq!(exchange.request().lease_id, 42);
        assert_eq!(exchange.participant_count(), 0);
        assert_eq!(exchange.locator(), MASTER3);
        assert_eq!(exchange.state(), ExchangeState::NotStarted);
    }

    #[test]
    fn test_append_op() {
        let cluster = MockCluster::with_servers(&[MASTER3]);
        let mut exchange = DecisionExchange::new(
            cluster.session(MASTER3).unwrap(),
            1,
            TransactionId::new(1, 1),
            Decision::Commit,
        );
        let mut cache = CommitCache::new();
        let key = Key::new(TableId(1), "0");
        let id = cache.insert(key.clone(), OpKind::Read, Vec::new());
        cache.get_mut(id).unwrap().rpc_id = 42;
        let invalid = cache.insert(Key::new(TableId(2), "x"), OpKind::Invalid, Vec::new());

        assert!(exchange.append_op(&mut cache, id));
        assert!(!exchange.append_op(&mut cache, invalid));

        assert_eq!(cache.get(id).unwrap().state, OpState::Decided);
        assert_eq!(cache.get(invalid).unwrap().state, OpState::Pending);
        assert_eq!(exchange.entries(), &[id]);
        assert_eq!(
            exchange.request().to_string(),
            format!(
                "DecisionRequest :: lease{{1}} decision{{commit}} participantCount{{1}} \
                 ParticipantList[ {{1, {}, 42}} ]",
                key.hash()
            )
        );
    }
}
