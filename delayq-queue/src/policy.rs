//! Retry and dead-letter decisions.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt number, the
//! queue's retry limit and the failure reason. Worker failures and visibility
//! timeouts both go through it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Retry limit for a queue or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryLimit {
    /// Retry forever.
    #[default]
    Unlimited,
    /// Give up once this many attempts have failed.
    Limited(u32),
}

impl RetryLimit {
    /// Build a limit from an optional count. `None` and `0` mean unlimited.
    pub fn from_count(count: Option<u32>) -> Self {
        match count {
            None | Some(0) => Self::Unlimited,
            Some(n) => Self::Limited(n),
        }
    }

    /// The finite limit, if any.
    pub fn count(&self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Limited(n) => Some(*n),
        }
    }

    /// Whether `attempts` failed deliveries exhaust this limit.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        match self {
            Self::Unlimited => false,
            Self::Limited(n) => attempts >= *n,
        }
    }
}

/// Delay applied before a failed message becomes visible again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay for every attempt.
    Fixed {
        #[serde(rename = "delay_ms", with = "crate::config::millis")]
        delay: Duration,
    },
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        #[serde(rename = "initial_ms", with = "crate::config::millis")]
        initial: Duration,
        multiplier: f64,
        #[serde(rename = "max_ms", with = "crate::config::millis")]
        max: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(15 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Fixed delay for every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Delay before the next delivery after `attempt` failures (1-based).
    ///
    /// Non-decreasing in `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let millis = initial.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    max
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
        }
    }
}

/// What to do with a message whose retries are exhausted and whose queue has
/// no dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Put it back on the ready list.
    #[default]
    Requeue,
    /// Drop it.
    Discard,
}

/// Why a delivery did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Handler returned an error.
    Handler,
    /// Handler panicked.
    Panicked,
    /// Visibility timeout elapsed before acknowledgement.
    Timeout,
    /// Typed handler could not decode the payload.
    Deserialize,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Handler => "handler error",
            Self::Panicked => "handler panicked",
            Self::Timeout => "visibility timeout",
            Self::Deserialize => "payload decode failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Back on the ready list right away.
    RequeueImmediate,
    /// Back on the delayed set after this delay.
    RequeueDelayed(Duration),
    /// Onto the queue's dead-letter list.
    DeadLetter,
    /// Dropped.
    Discard,
}

/// Retry policy shared by the worker pool and the visibility enforcer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryPolicy {
    /// Delay curve for retries.
    pub backoff: BackoffPolicy,
    /// Fallback when retries run out and no dead-letter queue exists.
    pub exhausted_action: ExhaustedAction,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(backoff: BackoffPolicy, exhausted_action: ExhaustedAction) -> Self {
        Self {
            backoff,
            exhausted_action,
        }
    }

    /// Decide what happens after `attempt` failed deliveries.
    ///
    /// # Examples
    ///
    /// ```
    /// use delayq_queue::{Decision, FailureReason, RetryLimit, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    ///
    /// let first = policy.decide(1, RetryLimit::Limited(3), true, FailureReason::Handler);
    /// assert_eq!(first, Decision::RequeueDelayed(Duration::from_secs(1)));
    ///
    /// let last = policy.decide(3, RetryLimit::Limited(3), true, FailureReason::Timeout);
    /// assert_eq!(last, Decision::DeadLetter);
    /// ```
    pub fn decide(
        &self,
        attempt: u32,
        limit: RetryLimit,
        has_dead_letter: bool,
        reason: FailureReason,
    ) -> Decision {
        if limit.is_exhausted(attempt) {
            if has_dead_letter {
                return Decision::DeadLetter;
            }
            return match self.exhausted_action {
                ExhaustedAction::Requeue => {
                    tracing::warn!(
                        attempt,
                        reason = %reason,
                        "Retries exhausted without dead-letter queue, requeueing"
                    );
                    Decision::RequeueImmediate
                }
                ExhaustedAction::Discard => {
                    tracing::warn!(
                        attempt,
                        reason = %reason,
                        "Retries exhausted without dead-letter queue, discarding"
                    );
                    Decision::Discard
                }
            };
        }

        Decision::RequeueDelayed(self.backoff.delay_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_limit_from_count() {
        assert_eq!(RetryLimit::from_count(None), RetryLimit::Unlimited);
        assert_eq!(RetryLimit::from_count(Some(0)), RetryLimit::Unlimited);
        assert_eq!(RetryLimit::from_count(Some(3)), RetryLimit::Limited(3));
        assert_eq!(RetryLimit::Limited(3).count(), Some(3));
        assert_eq!(RetryLimit::Unlimited.count(), None);
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(11), Duration::from_secs(900));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(900));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let backoff = BackoffPolicy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 1.5,
            max: Duration::from_secs(60),
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let delay = backoff.delay_for(attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            previous = delay;
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffPolicy::fixed(Duration::from_millis(50));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(50));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(50));
    }

    #[test]
    fn test_decide_retries_until_limit() {
        let policy = RetryPolicy::default();
        let limit = RetryLimit::Limited(2);

        assert_eq!(
            policy.decide(1, limit, true, FailureReason::Handler),
            Decision::RequeueDelayed(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(2, limit, true, FailureReason::Handler),
            Decision::DeadLetter
        );
    }

    #[test]
    fn test_decide_unlimited_never_exhausts() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.decide(10_000, RetryLimit::Unlimited, false, FailureReason::Timeout),
            Decision::RequeueDelayed(_)
        ));
    }

    #[test]
    fn test_decide_exhausted_without_dead_letter() {
        let requeue = RetryPolicy::default();
        assert_eq!(
            requeue.decide(3, RetryLimit::Limited(3), false, FailureReason::Panicked),
            Decision::RequeueImmediate
        );

        let discard = RetryPolicy::new(BackoffPolicy::default(), ExhaustedAction::Discard);
        assert_eq!(
            discard.decide(3, RetryLimit::Limited(3), false, FailureReason::Panicked),
            Decision::Discard
        );
    }

    #[test]
    fn test_backoff_serde() {
        let json = r#"{"kind":"fixed","delay_ms":250}"#;
        let backoff: BackoffPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(backoff, BackoffPolicy::fixed(Duration::from_millis(250)));
    }
}
