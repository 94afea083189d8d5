//! Shared plumbing of prepare and decision exchanges
//!
//! An exchange is one batched RPC to one server. It moves from
//! `NotStarted` to `InProgress` when sent and to `Finished` once its reply
//! (or transport failure) has been taken.

use crate::error::{CoordinatorError, Result};
use proven_cluster::{RpcHandle, ServerSession, TransportError};
use proven_protocol::{ProtocolError, TxRequest, TxResponse, decode, encode};
use std::sync::Arc;

/// Lifecycle of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    NotStarted,
    InProgress,
    Finished,
}

/// What came back from a finished exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Response(T),
    Failed(TransportError),
}

/// Session, handle and state of one exchange
pub(crate) struct Rpc {
    session: Arc<dyn ServerSession>,
    handle: Option<RpcHandle>,
    state: ExchangeState,
}

impl Rpc {
    pub(crate) fn new(session: Arc<dyn ServerSession>) -> Self {
        Self {
            session,
            handle: None,
            state: ExchangeState::NotStarted,
        }
    }

    pub(crate) fn locator(&self) -> &str {
        self.session.locator()
    }

    pub(crate) fn state(&self) -> ExchangeState {
        self.state
    }

    pub(crate) fn send(&mut self, request: &TxRequest) -> Result<()> {
        let bytes = encode(request)?;
        self.handle = Some(self.session.send(bytes));
        self.state = ExchangeState::InProgress;
        Ok(())
    }

    pub(crate) fn is_ready(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => handle.is_ready(),
            None => false,
        }
    }

    /// Consume the reply, mapping it through `extract`
    pub(crate) fn take_reply<T>(
        &mut self,
        expected: &'static str,
        extract: impl FnOnce(TxResponse) -> Option<T>,
    ) -> Result<Reply<T>> {
        let outcome = self
            .handle
            .as_mut()
            .and_then(RpcHandle::take_outcome)
            .ok_or_else(|| {
                CoordinatorError::InvalidState(format!(
                    "{} exchange to {} has no reply",
                    expected,
                    self.session.locator()
                ))
            })?;
        self.handle = None;
        self.state = ExchangeState::Finished;

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(error) => return Ok(Reply::Failed(error)),
        };
        let response: TxResponse = decode(&bytes)?;
        let actual = response.kind();
        extract(response)
            .map(Reply::Response)
            .ok_or_else(|| ProtocolError::UnexpectedResponse { expected, actual }.into())
    }
}
