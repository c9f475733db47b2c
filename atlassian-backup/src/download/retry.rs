//! Exponential backoff for interrupted downloads.

use std::time::Duration;

/// How often, and how patiently, a broken download is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a download makes at most `max_retries + 1` attempts
    pub max_retries: u32,

    /// Sleep before the first retry
    pub initial_delay: Duration,

    /// Factor applied to the delay after every retry
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (zero based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.initial_delay.saturating_mul(factor)
    }
}
