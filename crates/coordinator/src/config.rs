//! Commit tuning parameters

use crate::error::Result;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Tunables for driving a commit
///
/// Durations are given in milliseconds when deserialized, e.g.
/// `{"max_ops_per_exchange": 50, "retry_backoff": 5}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Upper bound on operations (prepare) or participants (decision)
    /// batched into one exchange
    pub max_ops_per_exchange: usize,

    /// Cursor rewinds allowed before the commit gives up
    pub max_retries: u32,

    /// Delay before re-issuing exchanges after the first rewind
    #[serde(deserialize_with = "millis")]
    pub retry_backoff: Duration,

    /// Cap on the doubled backoff
    #[serde(deserialize_with = "millis")]
    pub max_retry_backoff: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_ops_per_exchange: 75,
            max_retries: 64,
            retry_backoff: Duration::ZERO,
            max_retry_backoff: Duration::from_millis(100),
        }
    }
}

impl CommitConfig {
    pub fn with_max_ops_per_exchange(mut self, max: usize) -> Self {
        self.max_ops_per_exchange = max.max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_retry_backoff(mut self, backoff: Duration) -> Self {
        self.max_retry_backoff = backoff;
        self
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        let max_ops = config.max_ops_per_exchange;
        Ok(config.with_max_ops_per_exchange(max_ops))
    }

    /// Backoff before the `attempt`-th consecutive retry (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.retry_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_retry_backoff)
            .min(self.max_retry_backoff)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
