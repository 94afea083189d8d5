//! Error types for the coordinator

use proven_cluster::ClusterError;
use proven_common::TableId;
use proven_protocol::{ProtocolError, Status};
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("table doesn't exist: {0}")]
    TableDoesntExist(TableId),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Transaction has no staged operations")]
    EmptyTransaction,

    #[error("Unexpected status {status} in {phase} response")]
    UnexpectedStatus { phase: &'static str, status: Status },

    #[error("Gave up after {0} retries")]
    RetriesExhausted(u32),

    #[error("Cluster error: {0}")]
    Cluster(ClusterError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Whether the error must be surfaced to the creator of the transaction
    /// instead of being absorbed into an abort
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TableDoesntExist(_))
    }
}

impl From<ClusterError> for CoordinatorError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::TableDoesntExist(table_id) => Self::TableDoesntExist(table_id),
            other => Self::Cluster(other),
        }
    }
}

impl From<ProtocolError> for CoordinatorError {
    fn from(error: ProtocolError) -> Self {
        Self::Protocol(error.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(error: serde_json::Error) -> Self {
        Self::Config(error.to_string())
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
