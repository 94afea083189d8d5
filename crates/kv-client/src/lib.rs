//! Transactional KV client
//!
//! A [`Transaction`] buffers writes and removes locally, serves reads from
//! its own buffer when possible, and commits everything atomically through a
//! [`TransactionTask`] when [`Transaction::commit`] is awaited.

use parking_lot::Mutex;
use proven_cluster::{ClusterClient, ClusterError, TransportError};
use proven_common::{Key, TableId, TransactionId};
use proven_coordinator::{
    CommitConfig, CoordinatorError, Dispatch, OpKind, TaskState, TransactionTask, start,
};
use proven_protocol::{
    Decision, ProtocolError, ReadRequest, Status, TxRequest, TxResponse, decode, encode,
};
use std::sync::Arc;

/// A multi-key transaction against the cluster
pub struct Transaction {
    client: ClusterClient,
    task: Arc<Mutex<TransactionTask>>,
    committed: bool,
}

impl Transaction {
    /// Start a transaction with the default commit configuration
    pub fn new(client: ClusterClient) -> Self {
        Self::with_config(client, CommitConfig::default())
    }

    pub fn with_config(client: ClusterClient, config: CommitConfig) -> Self {
        let task = TransactionTask::new(client.clone(), config);
        Self {
            client,
            task: Arc::new(Mutex::new(task)),
            committed: false,
        }
    }

    /// Buffer a write; replaces anything already staged for the key
    pub fn write(
        &mut self,
        table_id: TableId,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), KvError> {
        self.stage(Key::new(table_id, key), OpKind::Write, value.into())
    }

    /// Buffer a remove; replaces anything already staged for the key
    pub fn remove(&mut self, table_id: TableId, key: impl Into<Vec<u8>>) -> Result<(), KvError> {
        self.stage(Key::new(table_id, key), OpKind::Remove, Vec::new())
    }

    pub fn write_string(
        &mut self,
        table_id: TableId,
        key: impl Into<Vec<u8>>,
        value: impl Into<String>,
    ) -> Result<(), KvError> {
        self.write(table_id, key, value.into().into_bytes())
    }

    /// Read a value as seen by this transaction
    ///
    /// Staged writes and removes are returned without contacting the
    /// cluster. Otherwise the value is fetched from its server and the read
    /// is staged, so the commit verifies nobody changed it in between.
    pub async fn read(
        &mut self,
        table_id: TableId,
        key: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, KvError> {
        self.check_open()?;
        let key = Key::new(table_id, key);

        let max_retries = {
            let task = self.task.lock();
            if let Some(id) = task.find(&key)
                && let Some(op) = task.cache().get(id)
            {
                return Ok(match op.kind {
                    OpKind::Read | OpKind::Write => Some(op.object.value().to_vec()),
                    OpKind::Remove | OpKind::Invalid => None,
                });
            }
            task.config().max_retries
        };

        let mut attempts = 0;
        let value = loop {
            match self.fetch(&key).await? {
                Fetched::Value(value) => break value,
                Fetched::Missing => return Ok(None),
                Fetched::Moved if attempts < max_retries => {
                    attempts += 1;
                    self.client.resolver.invalidate(table_id, key.hash());
                }
                Fetched::Moved => return Err(KvError::Status(Status::UnknownTablet)),
            }
        };

        self.stage(key, OpKind::Read, value.clone())?;
        Ok(Some(value))
    }

    pub async fn read_string(
        &mut self,
        table_id: TableId,
        key: impl Into<Vec<u8>>,
    ) -> Result<Option<String>, KvError> {
        match self.read(table_id, key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| KvError::TypeMismatch),
            None => Ok(None),
        }
    }

    /// Commit all staged operations atomically
    ///
    /// Returns the decision reached by the participants. A transaction that
    /// staged nothing commits trivially.
    pub async fn commit(&mut self) -> Result<Decision, KvError> {
        self.check_open()?;
        self.committed = true;

        let empty = self.task.lock().cache().is_empty();
        if empty {
            return Ok(Decision::Commit);
        }

        let mut dispatch = Dispatch::new();
        start(self.task.clone(), &mut dispatch);
        dispatch.run().await;

        let task = self.task.lock();
        tracing::debug!("txn {} finished: {}", task.txn_id(), task.decision());
        match task.failure() {
            Some(error) => Err(error.clone().into()),
            None => Ok(task.decision()),
        }
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.task.lock().cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transaction id; assigned when the commit starts
    pub fn txn_id(&self) -> TransactionId {
        self.task.lock().txn_id()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Phase the commit task is in
    pub fn state(&self) -> TaskState {
        self.task.lock().state()
    }

    fn check_open(&self) -> Result<(), KvError> {
        if self.committed {
            Err(KvError::Committed)
        } else {
            Ok(())
        }
    }

    /// Stage an operation, overwriting the entry of the same key if any
    fn stage(&mut self, key: Key, kind: OpKind, value: Vec<u8>) -> Result<(), KvError> {
        self.check_open()?;
        let mut task = self.task.lock();
        let cache = task.cache_mut()?;
        match cache.find(&key).and_then(|id| cache.get_mut(id)) {
            Some(op) => op.overwrite(kind, key, value),
            None => {
                cache.insert(key, kind, value);
            }
        }
        Ok(())
    }

    async fn fetch(&self, key: &Key) -> Result<Fetched, KvError> {
        let session = self.client.resolver.resolve(key.table_id(), key.hash())?;
        let request = TxRequest::Read(ReadRequest {
            table_id: key.table_id(),
            key: key.bytes().to_vec(),
        });

        let bytes = match session.send(encode(&request)?).wait().await {
            Ok(bytes) => bytes,
            Err(error) => {
                self.client.sessions.flush(session.locator());
                return Err(error.into());
            }
        };

        let response: TxResponse = decode(&bytes)?;
        let response = match response {
            TxResponse::Read(response) => response,
            other => {
                return Err(ProtocolError::UnexpectedResponse {
                    expected: "read",
                    actual: other.kind(),
                }
                .into());
            }
        };
        match response.status {
            Status::Ok => Ok(Fetched::Value(response.value.unwrap_or_default())),
            Status::ObjectDoesntExist => Ok(Fetched::Missing),
            Status::UnknownTablet => Ok(Fetched::Moved),
            Status::TableDoesntExist => Err(ClusterError::TableDoesntExist(key.table_id()).into()),
            status => Err(KvError::Status(status)),
        }
    }
}

enum Fetched {
    Value(Vec<u8>),
    Missing,
    Moved,
}

/// KV-specific error type
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected status {0}")]
    Status(Status),

    #[error("Transaction already committed")]
    Committed,

    #[error("Type mismatch")]
    TypeMismatch,
}
