//! Protocol definitions for client-to-server transaction commit
//!
//! This crate defines the typed requests and responses exchanged between the
//! client-side commit coordinator and the storage servers, plus the codec
//! that turns them into bytes for the transport.

pub mod codec;
pub mod messages;
pub mod responses;

pub use codec::{ProtocolError, decode, encode};
pub use messages::{
    Decision, DecisionRequest, PrepareOp, PrepareRequest, ReadRequest, TxParticipant, TxRequest,
};
pub use responses::{DecisionResponse, PrepareResponse, ReadResponse, Status, TxResponse, Vote};
