// Retry budget and backoff schedule

use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Per-task retry budget with capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub retries: u32,
    /// Delay before the first retry
    pub backoff_ms: u64,
    /// Upper bound for any single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            retries,
            backoff_ms,
            max_backoff_ms,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let ms = self
            .backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
