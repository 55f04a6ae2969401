//! Exponential retry delays.

use chrono::{DateTime, Utc};
use std::time::Duration;

use pkg_constants::controller::{BACKOFF_BASE_MS, BACKOFF_MAX_SECS};

/// Doubling delay starting at `base`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(BACKOFF_BASE_MS),
            max: Duration::from_secs(BACKOFF_MAX_SECS),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Wall-clock time at which retry number `attempt` is due.
    pub fn retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(BACKOFF_MAX_SECS as i64));
        now + delay
    }
}
