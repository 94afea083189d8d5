//! Cooperative scheduling of commit tasks
//!
//! A [`Dispatch`] owns a set of [`Poller`]s and ticks each of them in turn.
//! Pollers report whether they did any work and whether they are finished;
//! finished pollers are dropped.

use crate::task::TransactionTask;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollResult {
    /// Units of work done during the poll
    pub work: usize,
    /// The poller has nothing left to do and can be deregistered
    pub finished: bool,
    /// Nothing can happen before this time, so the poller needs no ticks
    /// until then
    pub idle_until: Option<Instant>,
}

/// Something that makes progress when ticked
pub trait Poller: Send {
    fn poll(&mut self) -> PollResult;
}

/// Cooperative loop over registered pollers
#[derive(Default)]
pub struct Dispatch {
    pollers: Vec<Box<dyn Poller>>,
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, poller: Box<dyn Poller>) {
        self.pollers.push(poller);
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Tick every poller once; returns the total work done
    pub fn poll(&mut self) -> usize {
        self.tick().0
    }

    /// Tick every poller once; also returns the earliest time a poller can
    /// make progress if every remaining one is idle until some time
    fn tick(&mut self) -> (usize, Option<Instant>) {
        let mut work = 0;
        let mut all_idle = true;
        let mut earliest: Option<Instant> = None;
        self.pollers.retain_mut(|poller| {
            let result = poller.poll();
            work += result.work;
            if !result.finished {
                match result.idle_until {
                    Some(until) => earliest = Some(earliest.map_or(until, |e| e.min(until))),
                    None => all_idle = false,
                }
            }
            !result.finished
        });
        (work, earliest.filter(|_| all_idle))
    }

    /// Tick until every poller has finished
    ///
    /// Yields between idle ticks, and sleeps when every poller is waiting
    /// for a deadline.
    pub async fn run(&mut self) {
        while !self.is_empty() {
            let (work, idle_until) = self.tick();
            if work > 0 {
                continue;
            }
            match idle_until {
                Some(until) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(until)).await;
                }
                None => tokio::task::yield_now().await,
            }
        }
    }
}

/// Drives a [`TransactionTask`] from a [`Dispatch`]
pub struct CommitPoller {
    task: Arc<Mutex<TransactionTask>>,
}

impl CommitPoller {
    pub fn new(task: Arc<Mutex<TransactionTask>>) -> Self {
        Self { task }
    }
}

impl Poller for CommitPoller {
    fn poll(&mut self) -> PollResult {
        // Someone else is inspecting or driving the task; skip this tick
        let Some(mut task) = self.task.try_lock() else {
            return PollResult::default();
        };
        let work = match task.step() {
            Ok(work) => work,
            Err(e) => {
                tracing::debug!("commit of txn {} failed: {}", task.txn_id(), e);
                1
            }
        };
        PollResult {
            work,
            finished: task.is_ready(),
            idle_until: task.idle_until(),
        }
    }
}

/// Register a task with a dispatch so it is driven to completion
pub fn start(task: Arc<Mutex<TransactionTask>>, dispatch: &mut Dispatch) {
    dispatch.register(Box::new(CommitPoller::new(task)));
}
