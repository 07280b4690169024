//! Backoff policy for transient delivery failures within one replay run.

use std::time::Duration;

/// How often, and how patiently, one delivery is retried.
///
/// Only failures for which [`deferq_common::Error::is_transient`] holds are
/// retried. Delays double from `initial_delay` up to `max_delay`, each
/// jittered by up to a quarter either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Transport tries allowed after the first.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// Whether another try is allowed after `retries` retries have run.
    pub fn allows(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * 2f64.powi(retry.min(63) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jittered = capped * (0.75 + rand::random::<f64>() * 0.5);
        Duration::from_millis(jittered as u64)
    }
}
