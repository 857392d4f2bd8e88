//! Background refresh configuration.

use std::time::Duration;

/// Configuration for the refresh worker of an
/// [`InvalidationService`](super::InvalidationService).
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// How often the worker drains the queue.
    pub interval: Duration,

    /// High-priority tasks taken per tick.
    pub high_batch: usize,

    /// Normal-priority tasks taken per tick.
    pub normal_batch: usize,

    /// Low-priority tasks taken per tick.
    pub low_batch: usize,

    /// Failed attempts tolerated before a task is dropped.
    pub max_retries: u32,

    /// Base delay before a failed task is eligible again.
    /// Doubles with every further failure.
    pub retry_backoff: Duration,

    /// Upper bound on a single refill call.
    pub refresh_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            high_batch: 5,
            normal_batch: 2,
            low_batch: 1,
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(30),
        }
    }
}

impl RefreshConfig {
    /// Set the worker tick interval (builder pattern).
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set per-tick batch sizes for high, normal and low priority.
    #[must_use]
    pub fn batch_sizes(mut self, high: usize, normal: usize, low: usize) -> Self {
        self.high_batch = high;
        self.normal_batch = normal;
        self.low_batch = low;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Delay before attempt number `retries + 1`.
    pub(crate) fn backoff_for(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1 << exponent)
    }
}
