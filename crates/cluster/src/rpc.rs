//! Asynchronous RPC handles
//!
//! A request handed to a [`ServerSession`](crate::ServerSession) returns an
//! [`RpcHandle`] immediately. The handle can be polled without blocking
//! (`is_ready`) from a cooperative loop, or awaited from async code.

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Failure of the transport underneath an RPC
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection to {0} lost")]
    ConnectionLost(String),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Reply channel closed")]
    ChannelClosed,

    #[error("Outcome already consumed")]
    Consumed,
}

/// Raw reply bytes or the transport failure that prevented them
pub type RpcOutcome = std::result::Result<Vec<u8>, TransportError>;

/// Client side of an in-flight RPC
#[derive(Debug)]
pub struct RpcHandle {
    receiver: Option<oneshot::Receiver<RpcOutcome>>,
    outcome: Option<RpcOutcome>,
}

/// Server side of an in-flight RPC
#[derive(Debug)]
pub struct RpcReplier {
    sender: oneshot::Sender<RpcOutcome>,
}

impl RpcHandle {
    /// Create a connected replier/handle pair
    pub fn channel() -> (RpcReplier, RpcHandle) {
        let (sender, receiver) = oneshot::channel();
        (
            RpcReplier { sender },
            RpcHandle {
                receiver: Some(receiver),
                outcome: None,
            },
        )
    }

    /// A handle whose outcome is already known
    pub fn completed(outcome: RpcOutcome) -> Self {
        Self {
            receiver: None,
            outcome: Some(outcome),
        }
    }

    /// Check, without blocking, whether the outcome has arrived
    pub fn is_ready(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };
        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Closed) => Err(TransportError::ChannelClosed),
        };
        self.receiver = None;
        self.outcome = Some(outcome);
        true
    }

    /// Take the outcome if it has arrived
    pub fn take_outcome(&mut self) -> Option<RpcOutcome> {
        if self.is_ready() {
            self.outcome.take()
        } else {
            None
        }
    }

    /// Wait for the outcome
    pub async fn wait(mut self) -> RpcOutcome {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.receiver.take() {
            Some(receiver) => receiver
                .await
                .unwrap_or(Err(TransportError::ChannelClosed)),
            None => Err(TransportError::Consumed),
        }
    }
}

impl RpcReplier {
    /// Deliver the outcome; a handle that was dropped is ignored
    pub fn complete(self, outcome: RpcOutcome) {
        let _ = self.sender.send(outcome);
    }

    pub fn reply(self, bytes: Vec<u8>) {
        self.complete(Ok(bytes));
    }

    pub fn fail(self, error: TransportError) {
        self.complete(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_not_ready_until_reply() {
        let (replier, mut handle) = RpcHandle::channel();
        assert!(!handle.is_ready());
        assert!(handle.take_outcome().is_none());

        replier.reply(b"pong".to_vec());
        assert!(handle.is_ready());
        assert_eq!(handle.take_outcome(), Some(Ok(b"pong".to_vec())));

        // Consumed
        assert!(!handle.is_ready());
    }

    #[test]
    fn test_dropped_replier_is_a_transport_failure() {
        let (replier, mut handle) = RpcHandle::channel();
        drop(replier);
        assert!(handle.is_ready());
        assert_eq!(
            handle.take_outcome(),
            Some(Err(TransportError::ChannelClosed))
        );
    }

    #[test]
    fn test_completed_handle() {
        let mut handle = RpcHandle::completed(Err(TransportError::ConnectionLost(
            "mock:host=master1".to_string(),
        )));
        assert!(handle.is_ready());
        assert!(matches!(
            handle.take_outcome(),
            Some(Err(TransportError::ConnectionLost(_)))
        ));
    }

    #[tokio::test]
    async fn test_wait() {
        let (replier, handle) = RpcHandle::channel();
        tokio::spawn(async move {
            replier.reply(b"later".to_vec());
        });
        assert_eq!(handle.wait().await, Ok(b"later".to_vec()));
    }
}
