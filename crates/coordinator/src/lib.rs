//! Client-side commit coordinator for sharded key-value transactions
//!
//! A transaction stages reads, writes and removes in a [`CommitCache`] and
//! commits them atomically with two-phase commit against the servers owning
//! the keys:
//!
//! 1. **Prepare**: staged operations are batched per server into
//!    [`PrepareExchange`]s; each server locks and validates its share and
//!    votes.
//! 2. **Decision**: the outcome (commit unless some server voted abort) is
//!    sent to every participant in [`DecisionExchange`]s.
//!
//! [`TransactionTask`] is the poll-driven state machine running both phases,
//! recovering from stale tablet routing and transport failures by resending.
//! [`Dispatch`] and [`CommitPoller`] drive tasks from a cooperative loop.

pub mod cache;
pub mod config;
pub mod decision;
pub mod error;
pub mod exchange;
pub mod participants;
pub mod poller;
pub mod prepare;
pub mod task;

pub use cache::{CacheKey, CommitCache, EntryId, ObjectBuffer, OpKind, OpState, StagedOperation};
pub use config::CommitConfig;
pub use decision::DecisionExchange;
pub use error::{CoordinatorError, Result};
pub use exchange::{ExchangeState, Reply};
pub use participants::ParticipantList;
pub use poller::{CommitPoller, Dispatch, PollResult, Poller, start};
pub use prepare::PrepareExchange;
pub use task::{TaskState, TransactionTask};
