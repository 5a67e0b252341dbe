//! Store-error backoff for background loops.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::QueueError;

/// Consecutive failures logged at `warn` before switching to `debug`.
const LOUD_FAILURES: u32 = 3;

/// While quiet, one `warn` summary every this many failures.
const SUMMARY_EVERY: u32 = 50;

/// Tracks consecutive store errors of one loop, yielding jittered exponential
/// delays and keeping a failing store from flooding the logs.
#[derive(Debug, Clone)]
pub(crate) struct ErrorStreak {
    task: &'static str,
    queue: String,
    base: Duration,
    max: Duration,
    failures: u32,
}

impl ErrorStreak {
    pub fn new(task: &'static str, queue: impl Into<String>) -> Self {
        Self {
            task,
            queue: queue.into(),
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            failures: 0,
        }
    }

    #[cfg(test)]
    fn with_bounds(mut self, base: Duration, max: Duration) -> Self {
        self.base = base;
        self.max = max;
        self
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to pause.
    pub fn fail(&mut self, error: &QueueError) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let n = self.failures;

        if n <= LOUD_FAILURES {
            warn!(
                task = self.task,
                queue = %self.queue,
                failures = n,
                transient = error.is_transient(),
                error = %error,
                "Background loop failed"
            );
        } else if n % SUMMARY_EVERY == 0 {
            warn!(
                task = self.task,
                queue = %self.queue,
                failures = n,
                error = %error,
                "Background loop still failing"
            );
        } else {
            debug!(
                task = self.task,
                queue = %self.queue,
                failures = n,
                error = %error,
                "Background loop failed"
            );
        }

        self.delay()
    }

    /// Record a success, ending the streak.
    pub fn succeed(&mut self) {
        if self.failures > 0 {
            debug!(
                task = self.task,
                queue = %self.queue,
                failures = self.failures,
                "Background loop recovered"
            );
            self.failures = 0;
        }
    }

    /// Jittered delay, uniform in `[ceiling / 2, ceiling]`.
    fn delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(16);
        let ceiling = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
            .as_millis() as u64;
        let floor = ceiling / 2;
        let millis = if ceiling > floor {
            rand::rng().random_range(floor..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(millis)
    }
}
