//! Object lock table for the mock servers
//!
//! Provides object-level locking with shared/exclusive modes. Prepared
//! transactions hold their locks until the decision for them arrives.

use proven_common::{TableId, TransactionId};
use std::collections::HashMap;

/// Identity of an object on a server
pub type ObjectKey = (TableId, Vec<u8>);

/// Lock modes for staged operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock for reads
    Shared,
    /// Exclusive lock for writes and removes
    Exclusive,
}

impl LockMode {
    /// Check if two lock modes are compatible
    pub fn is_compatible_with(&self, other: LockMode) -> bool {
        matches!((*self, other), (LockMode::Shared, LockMode::Shared))
    }
}

#[derive(Debug, Clone)]
struct LockInfo {
    holder: TransactionId,
    mode: LockMode,
}

/// Result of checking if a lock can be acquired
#[derive(Debug, Clone, PartialEq)]
pub enum LockAttemptResult {
    WouldGrant,
    Conflict {
        /// Transactions holding conflicting locks, oldest first
        holders: Vec<(TransactionId, LockMode)>,
    },
}

/// Lock table keyed by object
#[derive(Debug, Default)]
pub struct LockManager {
    locks: HashMap<ObjectKey, Vec<LockInfo>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a lock can be acquired without modifying state
    pub fn check(&self, txn: TransactionId, key: &ObjectKey, mode: LockMode) -> LockAttemptResult {
        let Some(holders) = self.locks.get(key) else {
            return LockAttemptResult::WouldGrant;
        };

        let mut conflicts: Vec<_> = holders
            .iter()
            // Re-entrant for the same transaction
            .filter(|lock| lock.holder != txn && !lock.mode.is_compatible_with(mode))
            .map(|lock| (lock.holder, lock.mode))
            .collect();

        if conflicts.is_empty() {
            LockAttemptResult::WouldGrant
        } else {
            conflicts.sort_by_key(|(holder, _)| *holder);
            LockAttemptResult::Conflict { holders: conflicts }
        }
    }

    /// Grant a lock that was previously checked
    pub fn grant(&mut self, txn: TransactionId, key: ObjectKey, mode: LockMode) {
        self.locks.entry(key).or_default().push(LockInfo { holder: txn, mode });
    }

    /// Release every lock a transaction holds on one object
    pub fn release(&mut self, txn: TransactionId, key: &ObjectKey) {
        if let Some(holders) = self.locks.get_mut(key) {
            holders.retain(|lock| lock.holder != txn);
            if holders.is_empty() {
                self.locks.remove(key);
            }
        }
    }

    /// Release all locks held by a transaction
    pub fn release_all(&mut self, txn: TransactionId) {
        self.locks.retain(|_, holders| {
            holders.retain(|lock| lock.holder != txn);
            !holders.is_empty()
        });
    }

    pub fn has_locks(&self, txn: TransactionId) -> bool {
        self.locks
            .values()
            .any(|holders| holders.iter().any(|lock| lock.holder == txn))
    }

    /// Transactions currently holding a lock on an object
    pub fn holders(&self, key: &ObjectKey) -> Vec<TransactionId> {
        self.locks
            .get(key)
            .map(|holders| holders.iter().map(|lock| lock.holder).collect())
            .unwrap_or_default()
    }
}
