//! Cluster services used by transaction clients
//!
//! The commit coordinator never talks to the network, the tablet map or the
//! lease manager directly. It goes through the narrow contracts defined in
//! [`services`], bundled in a [`ClusterClient`]. This crate also provides
//! [`MockCluster`], an in-memory implementation of those contracts with
//! servers, tablets, key locks and fault injection, for testing.

use proven_common::TableId;
use thiserror::Error;

pub mod lock;
pub mod mock;
pub mod rpc;
pub mod server;
pub mod services;

pub use mock::MockCluster;
pub use rpc::{RpcHandle, RpcOutcome, RpcReplier, TransportError};
pub use services::{ClusterClient, LeaseService, LocationResolver, ServerSession, SessionCache};

/// Cluster service errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("table doesn't exist: {0}")]
    TableDoesntExist(TableId),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
