//! Commit state machine of one transaction
//!
//! A `TransactionTask` owns the staged operations of a transaction and
//! drives them through two phases. In PREPARE, pending operations are
//! batched per server into prepare exchanges and each server votes. In
//! DECISION, the outcome is sent to every participant so locks are released
//! and writes applied. All progress happens in [`TransactionTask::step`],
//! which does a bounded amount of work and never blocks.
//!
//! Exchanges are consumed strictly in the order they were issued: a finished
//! exchange behind an unfinished one waits its turn.

use crate::cache::{CommitCache, EntryId, OpKind, OpState};
use crate::config::CommitConfig;
use crate::decision::DecisionExchange;
use crate::error::{CoordinatorError, Result};
use crate::exchange::Reply;
use crate::participants::ParticipantList;
use crate::prepare::PrepareExchange;
use proven_cluster::ClusterClient;
use proven_common::{ClientLease, Key, TableId, TransactionId};
use proven_protocol::{Decision, Status, Vote};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// Phase of the commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Prepare,
    Decision,
    Done,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Prepare => "PREPARE",
            Self::Decision => "DECISION",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Client-side coordinator for committing one transaction
pub struct TransactionTask {
    client: ClusterClient,
    config: CommitConfig,

    cache: CommitCache,
    participants: ParticipantList,

    state: TaskState,
    decision: Decision,
    lease: ClientLease,
    txn_id: TransactionId,

    /// Next entry to consider for batching; `None` once the cache is
    /// exhausted
    cursor: Option<EntryId>,

    prepare_exchanges: VecDeque<PrepareExchange>,
    decision_exchanges: VecDeque<DecisionExchange>,

    retries: u32,
    consecutive_retries: u32,
    backoff_until: Option<Instant>,

    failure: Option<CoordinatorError>,
}

impl TransactionTask {
    pub fn new(client: ClusterClient, config: CommitConfig) -> Self {
        let lease = client.leases.lease();
        Self {
            client,
            config,
            cache: CommitCache::new(),
            participants: ParticipantList::default(),
            state: TaskState::Init,
            decision: Decision::Undecided,
            lease,
            txn_id: TransactionId::default(),
            cursor: None,
            prepare_exchanges: VecDeque::new(),
            decision_exchanges: VecDeque::new(),
            retries: 0,
            consecutive_retries: 0,
            backoff_until: None,
            failure: None,
        }
    }

    /// Stage an operation; only allowed before the commit starts
    pub fn insert(&mut self, key: Key, kind: OpKind, value: Vec<u8>) -> Result<EntryId> {
        Ok(self.cache_mut()?.insert(key, kind, value))
    }

    pub fn find(&self, key: &Key) -> Option<EntryId> {
        self.cache.find(key)
    }

    pub fn cache(&self) -> &CommitCache {
        &self.cache
    }

    /// Mutable access to the staged operations before the commit starts
    pub fn cache_mut(&mut self) -> Result<&mut CommitCache> {
        if self.state != TaskState::Init {
            return Err(CoordinatorError::InvalidState(format!(
                "cannot stage operations in state {}",
                self.state
            )));
        }
        Ok(&mut self.cache)
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    pub fn participants(&self) -> &ParticipantList {
        &self.participants
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    /// Error that terminated the commit, if any
    pub fn failure(&self) -> Option<&CoordinatorError> {
        self.failure.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Done
    }

    pub fn cursor(&self) -> Option<EntryId> {
        self.cursor
    }

    /// Restart batching from the first entry
    pub fn rewind(&mut self) {
        self.cursor = self.cache.first();
    }

    pub fn prepare_exchanges(&self) -> &VecDeque<PrepareExchange> {
        &self.prepare_exchanges
    }

    pub fn prepare_exchanges_mut(&mut self) -> &mut VecDeque<PrepareExchange> {
        &mut self.prepare_exchanges
    }

    pub fn decision_exchanges(&self) -> &VecDeque<DecisionExchange> {
        &self.decision_exchanges
    }

    pub fn decision_exchanges_mut(&mut self) -> &mut VecDeque<DecisionExchange> {
        &mut self.decision_exchanges
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// End of the retry backoff if that is all the task is waiting for
    pub fn idle_until(&self) -> Option<Instant> {
        if !self.prepare_exchanges.is_empty() || !self.decision_exchanges.is_empty() {
            return None;
        }
        self.backoff_until.filter(|until| Instant::now() < *until)
    }

    /// Do one unit of work; returns the number of exchanges issued or
    /// processed, 0 meaning nothing could be done right now
    ///
    /// A failure before the decision is final ends the commit: the task
    /// moves to DONE with an abort decision. Once deciding, a failure only
    /// gives up on the participants it concerns; the others are still
    /// informed and the task reaches DONE as usual. Only a missing table is
    /// returned as an error; anything else is recorded in
    /// [`failure`](Self::failure).
    pub fn step(&mut self) -> Result<usize> {
        let state = self.state;
        match self.try_step() {
            Ok(work) => Ok(work),
            Err(error) => {
                if state == TaskState::Decision {
                    tracing::error!(
                        "Unexpected error '{}' while deciding transaction commit",
                        error
                    );
                } else {
                    tracing::error!(
                        "Unexpected error '{}' while preparing transaction commit",
                        error
                    );
                    self.decision = Decision::Abort;
                    self.state = TaskState::Done;
                }
                self.failure = Some(error.clone());
                if error.is_fatal() { Err(error) } else { Ok(1) }
            }
        }
    }

    fn try_step(&mut self) -> Result<usize> {
        match self.state {
            TaskState::Init => {
                self.init()?;
                Ok(1)
            }
            TaskState::Prepare => {
                if self.head_prepare_ready() {
                    return self.process_prepare_results();
                }
                if self.cursor.is_some() {
                    if self.backing_off() {
                        return Ok(0);
                    }
                    return self.send_prepare_exchange();
                }
                if self.prepare_exchanges.is_empty() {
                    if self.decision == Decision::Undecided {
                        self.decision = Decision::Commit;
                    }
                    tracing::debug!("txn {} prepared, decision {}", self.txn_id, self.decision);
                    self.cache
                        .groups_mut()
                        .flat_map(|(_, group)| group.iter_mut())
                        .for_each(|op| op.attempts = 0);
                    self.rewind();
                    self.state = TaskState::Decision;
                    return Ok(1);
                }
                Ok(0)
            }
            TaskState::Decision => {
                if self.head_decision_ready() {
                    return self.process_decision_results();
                }
                if self.cursor.is_some() {
                    if self.backing_off() {
                        return Ok(0);
                    }
                    return match self.batch_decision() {
                        Ok(work) => Ok(work),
                        Err(batch) => {
                            self.give_up(&batch.entries);
                            Err(batch.error)
                        }
                    };
                }
                if self.decision_exchanges.is_empty() {
                    tracing::debug!("txn {} done, decision {}", self.txn_id, self.decision);
                    self.state = TaskState::Done;
                    return Ok(1);
                }
                Ok(0)
            }
            TaskState::Done => Ok(0),
        }
    }

    /// Build the participant list, derive the transaction id and start
    /// preparing
    pub fn init(&mut self) -> Result<()> {
        if self.state != TaskState::Init {
            return Err(CoordinatorError::InvalidState(format!(
                "commit already started, state {}",
                self.state
            )));
        }
        if self.cache.is_empty() {
            return Err(CoordinatorError::EmptyTransaction);
        }

        self.lease = self.client.leases.lease();
        let first_rpc_id = self
            .client
            .leases
            .new_rpc_id_block(self.cache.group_count());
        self.participants = ParticipantList::build(&mut self.cache, first_rpc_id)?;
        self.txn_id = TransactionId::new(self.lease.lease_id, first_rpc_id);
        self.rewind();
        self.state = TaskState::Prepare;
        tracing::debug!(
            "txn {} preparing {} ops on {} participants",
            self.txn_id,
            self.cache.len(),
            self.participants.len()
        );
        Ok(())
    }

    /// Batch pending operations bound for one server into a prepare exchange
    /// and send it
    ///
    /// Returns 1 if an exchange was sent, 0 if nothing was left to send. On
    /// error nothing is sent and the entries and cursor are left as they
    /// were.
    pub fn send_prepare_exchange(&mut self) -> Result<usize> {
        self.batch_prepare().map_err(|batch| batch.error)
    }

    fn batch_prepare(&mut self) -> std::result::Result<usize, BatchError> {
        let start = self.cursor;
        let mut exchange: Option<PrepareExchange> = None;

        while let Some(id) = self.cursor {
            let pending = self
                .cache
                .get(id)
                .is_some_and(|op| op.state == OpState::Pending);
            if !pending {
                self.cursor = self.cache.next_after(id);
                continue;
            }

            let session = match self.client.resolver.resolve(id.table_id(), id.key_hash()) {
                Ok(session) => session,
                Err(error) => {
                    self.unwind(exchange.as_ref().map_or(&[][..], |e| e.entries()), start);
                    return Err(BatchError::new(vec![id], error));
                }
            };
            if let Some(current) = exchange.as_ref()
                && current.locator() != session.locator()
            {
                break;
            }
            let current = exchange.get_or_insert_with(|| {
                PrepareExchange::new(session, self.lease, self.txn_id, &self.participants)
            });

            current.append_op(&mut self.cache, id);
            self.cursor = self.cache.next_after(id);
            if current.op_count() >= self.config.max_ops_per_exchange {
                break;
            }
        }

        match exchange {
            Some(mut exchange) if exchange.op_count() > 0 => {
                if let Err(error) = exchange.send(self.client.leases.ack_id()) {
                    self.unwind(exchange.entries(), start);
                    return Err(BatchError::new(exchange.entries().to_vec(), error));
                }
                self.prepare_exchanges.push_back(exchange);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    /// Batch undecided participants on one server into a decision exchange
    /// and send it
    pub fn send_decision_exchange(&mut self) -> Result<usize> {
        self.batch_decision().map_err(|batch| batch.error)
    }

    fn batch_decision(&mut self) -> std::result::Result<usize, BatchError> {
        let start = self.cursor;
        let mut exchange: Option<DecisionExchange> = None;

        while let Some(id) = self.cursor {
            let eligible = self.cache.get(id).is_some_and(|op| {
                matches!(op.state, OpState::Pending | OpState::Prepared)
                    && op.kind != OpKind::Invalid
            });
            if !eligible {
                self.cursor = self.cache.next_after(id);
                continue;
            }

            let session = match self.client.resolver.resolve(id.table_id(), id.key_hash()) {
                Ok(session) => session,
                Err(error) => {
                    self.unwind(exchange.as_ref().map_or(&[][..], |e| e.entries()), start);
                    return Err(BatchError::new(vec![id], error));
                }
            };
            if let Some(current) = exchange.as_ref()
                && current.locator() != session.locator()
            {
                break;
            }
            let current = exchange.get_or_insert_with(|| {
                DecisionExchange::new(session, self.lease.lease_id, self.txn_id, self.decision)
            });

            current.append_op(&mut self.cache, id);
            self.cursor = self.cache.next_after(id);
            if current.participant_count() >= self.config.max_ops_per_exchange {
                break;
            }
        }

        match exchange {
            Some(mut exchange) if exchange.participant_count() > 0 => {
                if let Err(error) = exchange.send() {
                    self.unwind(exchange.entries(), start);
                    return Err(BatchError::new(exchange.entries().to_vec(), error));
                }
                self.decision_exchanges.push_back(exchange);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    /// Apply the result of the oldest prepare exchange if it has finished
    ///
    /// Returns 1 if an exchange was processed, 0 if the oldest one is still
    /// in flight (or there is none).
    pub fn process_prepare_results(&mut self) -> Result<usize> {
        if !self.head_prepare_ready() {
            return Ok(0);
        }
        let Some(mut exchange) = self.prepare_exchanges.pop_front() else {
            return Ok(0);
        };

        match exchange.take_reply()? {
            Reply::Failed(error) => {
                tracing::debug!("prepare exchange to {} FAILED: {}", exchange.locator(), error);
                self.client.sessions.flush(exchange.locator());
                self.retry(exchange.entries())
                    .map_err(|batch| batch.error)?;
            }
            Reply::Response(response) => {
                tracing::debug!("prepare exchange to {}: {}", exchange.locator(), response.status);
                match response.status {
                    Status::Ok => {
                        self.consecutive_retries = 0;
                        if response.vote == Vote::Abort {
                            self.decision = Decision::Abort;
                        }
                    }
                    Status::UnknownTablet => {
                        self.invalidate(exchange.entries());
                        self.retry(exchange.entries())
                            .map_err(|batch| batch.error)?;
                    }
                    Status::TableDoesntExist => {
                        return Err(CoordinatorError::TableDoesntExist(table_of(
                            exchange.entries(),
                        )));
                    }
                    status => {
                        return Err(CoordinatorError::UnexpectedStatus {
                            phase: "prepare",
                            status,
                        });
                    }
                }
            }
        }
        Ok(1)
    }

    /// Apply the result of the oldest decision exchange if it has finished
    ///
    /// Participants whose exchange failed for good are marked
    /// [`OpState::Failed`] and the error is returned; the rest of the
    /// transaction is unaffected.
    pub fn process_decision_results(&mut self) -> Result<usize> {
        if !self.head_decision_ready() {
            return Ok(0);
        }
        let Some(exchange) = self.decision_exchanges.pop_front() else {
            return Ok(0);
        };

        match self.apply_decision_reply(exchange) {
            Ok(()) => Ok(1),
            Err(batch) => {
                self.give_up(&batch.entries);
                Err(batch.error)
            }
        }
    }

    fn apply_decision_reply(
        &mut self,
        mut exchange: DecisionExchange,
    ) -> std::result::Result<(), BatchError> {
        let reply = match exchange.take_reply() {
            Ok(reply) => reply,
            Err(error) => return Err(BatchError::new(exchange.entries().to_vec(), error)),
        };

        match reply {
            Reply::Failed(error) => {
                tracing::debug!("decision exchange to {} FAILED: {}", exchange.locator(), error);
                self.client.sessions.flush(exchange.locator());
                self.retry(exchange.entries())
            }
            Reply::Response(response) => {
                tracing::debug!("decision exchange to {}: {}", exchange.locator(), response.status);
                match response.status {
                    Status::Ok => {
                        self.consecutive_retries = 0;
                        Ok(())
                    }
                    Status::UnknownTablet => {
                        self.invalidate(exchange.entries());
                        self.retry(exchange.entries())
                    }
                    Status::TableDoesntExist => Err(BatchError::new(
                        exchange.entries().to_vec(),
                        CoordinatorError::TableDoesntExist(table_of(exchange.entries())),
                    )),
                    status => Err(BatchError::new(
                        exchange.entries().to_vec(),
                        CoordinatorError::UnexpectedStatus {
                            phase: "decision",
                            status,
                        },
                    )),
                }
            }
        }
    }

    fn head_prepare_ready(&mut self) -> bool {
        self.prepare_exchanges
            .front_mut()
            .is_some_and(PrepareExchange::is_ready)
    }

    fn head_decision_ready(&mut self) -> bool {
        self.decision_exchanges
            .front_mut()
            .is_some_and(DecisionExchange::is_ready)
    }

    fn backing_off(&mut self) -> bool {
        match self.backoff_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.backoff_until = None;
                false
            }
            None => false,
        }
    }

    fn invalidate(&self, entries: &[EntryId]) {
        for id in entries {
            self.client.resolver.invalidate(id.table_id(), id.key_hash());
        }
    }

    /// Return entries to pending and restart batching from the first entry
    ///
    /// Entries that have now failed more than `max_retries` times are
    /// returned in the error.
    fn retry(&mut self, entries: &[EntryId]) -> std::result::Result<(), BatchError> {
        let mut exhausted = Vec::new();
        for id in entries {
            if let Some(op) = self.cache.get_mut(*id) {
                op.state = OpState::Pending;
                op.attempts += 1;
                if op.attempts > self.config.max_retries {
                    exhausted.push(*id);
                }
            }
        }
        self.rewind();
        self.retries += 1;
        if !exhausted.is_empty() {
            return Err(BatchError::new(
                exhausted,
                CoordinatorError::RetriesExhausted(self.config.max_retries),
            ));
        }

        self.consecutive_retries += 1;
        let backoff = self.config.backoff_for(self.consecutive_retries);
        if !backoff.is_zero() {
            tracing::warn!(
                "txn {} retrying exchanges in {:?} (attempt {})",
                self.txn_id,
                backoff,
                self.retries
            );
            self.backoff_until = Some(Instant::now() + backoff);
        }
        Ok(())
    }

    /// Rewind a batch that could not be sent
    fn unwind(&mut self, entries: &[EntryId], start: Option<EntryId>) {
        for id in entries {
            if let Some(op) = self.cache.get_mut(*id) {
                op.state = OpState::Pending;
            }
        }
        self.cursor = start;
    }

    /// Stop informing participants that cannot be reached
    fn give_up(&mut self, entries: &[EntryId]) {
        tracing::warn!(
            "txn {} giving up on {} participants, decision {}",
            self.txn_id,
            entries.len(),
            self.decision
        );
        for id in entries {
            if let Some(op) = self.cache.get_mut(*id) {
                op.state = OpState::Failed;
            }
        }
    }
}

/// Batch that could not be built, sent or completed, with the entries
/// concerned
#[derive(Debug)]
struct BatchError {
    entries: Vec<EntryId>,
    error: CoordinatorError,
}

impl BatchError {
    fn new(entries: Vec<EntryId>, error: impl Into<CoordinatorError>) -> Self {
        Self {
            entries,
            error: error.into(),
        }
    }
}

fn table_of(entries: &[EntryId]) -> TableId {
    entries.first().map_or(TableId(0), EntryId::table_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_cluster::{LeaseService, MockCluster};
    use std::sync::Arc;
    use std::time::Duration;

    const MASTER1: &str = "mock:host=master1";

    fn setup() -> (Arc<MockCluster>, TransactionTask) {
        let cluster = Arc::new(MockCluster::with_servers(&[MASTER1]));
        cluster.create_table(TableId(1), MASTER1).unwrap();
        let task = TransactionTask::new(cluster.client(), CommitConfig::default());
        (cluster, task)
    }

    fn write(task: &mut TransactionTask, key: &str) -> EntryId {
        task.insert(Key::new(TableId(1), key), OpKind::Write, b"hello".to_vec())
            .unwrap()
    }

    #[test]
    fn test_init_derives_transaction_id() {
        let (cluster, mut task) = setup();
        cluster.new_rpc_id_block(4);
        write(&mut task, "a");
        write(&mut task, "b");

        task.init().unwrap();
        assert_eq!(task.state(), TaskState::Prepare);
        assert_eq!(task.txn_id(), TransactionId::new(1, 5));
        assert_eq!(task.participants().len(), 2);
        assert_eq!(task.cursor(), task.cache().first());
        assert!(task.init().is_err());
    }

    #[test]
    fn test_staging_after_start_is_rejected() {
        let (_cluster, mut task) = setup();
        write(&mut task, "a");
        task.step().unwrap();
        assert!(matches!(
            task.insert(Key::new(TableId(1), "b"), OpKind::Write, Vec::new()),
            Err(CoordinatorError::InvalidState(_))
        ));
    }

    #[test]
    fn test_empty_transaction_aborts() {
        let (_cluster, mut task) = setup();
        assert_eq!(task.step().unwrap(), 1);
        assert!(task.is_ready());
        assert_eq!(task.decision(), Decision::Abort);
        assert_eq!(task.failure(), Some(&CoordinatorError::EmptyTransaction));
    }

    #[test]
    fn test_retry_resets_entries_and_rewinds() {
        let (_cluster, mut task) = setup();
        let a = write(&mut task, "a");
        let b = write(&mut task, "b");
        for id in [a, b] {
            task.cache.get_mut(id).unwrap().state = OpState::Decided;
        }
        task.cursor = None;

        task.retry(&[a, b]).unwrap();
        assert_eq!(task.cache().get(a).unwrap().state, OpState::Pending);
        assert_eq!(task.cache().get(b).unwrap().state, OpState::Pending);
        assert_eq!(task.cursor(), task.cache().first());
        assert_eq!(task.retries(), 1);
    }

    #[test]
    fn test_retry_budget() {
        let (cluster, _) = setup();
        let mut task = TransactionTask::new(
            cluster.client(),
            CommitConfig::default().with_max_retries(1),
        );
        let a = write(&mut task, "a");
        let b = write(&mut task, "b");
        task.retry(&[a]).unwrap();

        // The budget is per entry
        let batch = task.retry(&[a, b]).unwrap_err();
        assert_eq!(batch.entries, vec![a]);
        assert_eq!(batch.error, CoordinatorError::RetriesExhausted(1));
        assert_eq!(task.cache().get(a).unwrap().state, OpState::Pending);
        assert_eq!(task.retries(), 2);
    }

    #[test]
    fn test_backoff_holds_new_exchanges() {
        let (cluster, _) = setup();
        let mut task = TransactionTask::new(
            cluster.client(),
            CommitConfig::default()
                .with_retry_backoff(Duration::from_secs(60))
                .with_max_retry_backoff(Duration::from_secs(60)),
        );
        let a = write(&mut task, "a");
        task.step().unwrap();
        task.retry(&[a]).unwrap();

        assert_eq!(task.step().unwrap(), 0);
        assert!(task.prepare_exchanges().is_empty());
        assert_eq!(task.state(), TaskState::Prepare);
        assert!(task.idle_until().is_some_and(|until| until > Instant::now()));
    }

    #[test]
    fn test_unsent_batch_is_rewound() {
        let (cluster, mut task) = setup();
        let a = write(&mut task, "a");
        let x = task
            .insert(Key::new(TableId(5), "x"), OpKind::Write, Vec::new())
            .unwrap();
        task.init().unwrap();

        assert_eq!(
            task.send_prepare_exchange(),
            Err(CoordinatorError::TableDoesntExist(TableId(5)))
        );
        assert_eq!(task.cache().get(a).unwrap().state, OpState::Pending);
        assert_eq!(task.cache().get(x).unwrap().state, OpState::Pending);
        assert_eq!(task.cursor(), Some(a));
        assert!(task.prepare_exchanges().is_empty());
        assert!(cluster.requests(MASTER1).is_empty());

        assert_eq!(
            task.send_decision_exchange(),
            Err(CoordinatorError::TableDoesntExist(TableId(5)))
        );
        assert_eq!(task.cache().get(a).unwrap().state, OpState::Pending);
        assert_eq!(task.cursor(), Some(a));
        assert!(task.decision_exchanges().is_empty());
    }
}
