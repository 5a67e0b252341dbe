//! Visibility timeout enforcer: reclaims in-flight entries whose deadline
//! passed without an acknowledgement.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ErrorStreak;
use crate::broker::MessageBroker;
use crate::config::EngineConfig;
use crate::error::QueueResult;
use crate::policy::{FailureReason, RetryPolicy};
use crate::reclaim::{reclaim, reclaim_corrupt};
use crate::stats::StatsRecorder;
use crate::topology::QueueDetail;

/// Outcome of one enforcer sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Expired entries found
    pub scanned: usize,
    /// Entries this sweep resolved (others lost the race to another actor)
    pub reclaimed: usize,
}

/// Reclaims expired entries of one queue's processing set through the retry
/// policy.
pub struct VisibilityEnforcer {
    broker: Arc<dyn MessageBroker>,
    queue: Arc<QueueDetail>,
    policy: RetryPolicy,
    stats: StatsRecorder,
    interval: Duration,
    batch: usize,
}

impl VisibilityEnforcer {
    /// Create an enforcer for `queue`.
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: Arc<QueueDetail>,
        config: &EngineConfig,
    ) -> Self {
        let stats =
            StatsRecorder::new(broker.clone(), config.stats_retention, config.record_stats);
        Self {
            broker,
            queue,
            policy: config.retry_policy(),
            stats,
            interval: config.enforcer_interval,
            batch: config.enforcer_batch.max(1),
        }
    }

    /// Reclaim one batch of entries expired at `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> QueueResult<Sweep> {
        let expired = self
            .broker
            .scan_expired_processing(&self.queue, now, self.batch)
            .await?;

        let mut sweep = Sweep {
            scanned: expired.len(),
            reclaimed: 0,
        };

        for delivery in expired {
            match delivery.message() {
                Ok(message) => {
                    debug!(
                        queue = %self.queue.name,
                        id = %message.id,
                        deadline = %delivery.deadline,
                        "Visibility timeout elapsed"
                    );
                    let reclaimed = reclaim(
                        self.broker.as_ref(),
                        &self.policy,
                        &self.queue,
                        &delivery.raw,
                        message,
                        FailureReason::Timeout,
                        None,
                    )
                    .await?;
                    if reclaimed.applied {
                        sweep.reclaimed += 1;
                        self.stats.failure(&self.queue, reclaimed.decision, None).await;
                    }
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue.name,
                        error = %e,
                        "Expired entry is not a valid envelope"
                    );
                    if reclaim_corrupt(self.broker.as_ref(), &self.queue, &delivery.raw).await? {
                        sweep.reclaimed += 1;
                    }
                }
            }
        }

        Ok(sweep)
    }

    /// Sweep until `shutdown` fires, with the same catch-up and backoff
    /// discipline as the delay mover.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            queue = %self.queue.name,
            interval_ms = self.interval.as_millis() as u64,
            visibility_timeout_ms = self.queue.visibility_timeout.as_millis() as u64,
            "Visibility enforcer started"
        );
        let mut streak = ErrorStreak::new("visibility_enforcer", self.queue.name.clone());

        while !shutdown.is_cancelled() {
            let pause = match self.sweep(Utc::now()).await {
                Ok(sweep) => {
                    streak.succeed();
                    if sweep.reclaimed > 0 {
                        info!(
                            queue = %self.queue.name,
                            reclaimed = sweep.reclaimed,
                            "Reclaimed expired messages"
                        );
                    }
                    if sweep.scanned >= self.batch {
                        continue;
                    }
                    self.interval
                }
                Err(e) => streak.fail(&e),
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(queue = %self.queue.name, "Visibility enforcer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::broker::flaky::{FlakyBroker, Op};
    use crate::message::Message;
    use crate::policy::{BackoffPolicy, ExhaustedAction};
    use crate::topology::{QueueRegistry, QueueSettings};

    fn setup(settings: QueueSettings) -> (Arc<MemoryBroker>, Arc<QueueDetail>, EngineConfig) {
        let config = EngineConfig::default()
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10)))
            .with_enforcer_interval(Duration::from_millis(10));
        let name = settings.name.clone();
        let registry = QueueRegistry::build(&config, vec![settings]).unwrap();
        let queue = registry.require(&name).unwrap().clone();
        (Arc::new(MemoryBroker::new()), queue, config)
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_only() {
        let (broker, queue, config) = setup(QueueSettings::new("emails"));
        broker.enqueue_ready(&queue, &Message::new("emails", "a")).await.unwrap();
        broker.enqueue_ready(&queue, &Message::new("emails", "b")).await.unwrap();

        let now = Utc::now();
        broker
            .try_pop_ready(&queue, now - chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        broker
            .try_pop_ready(&queue, now + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        let enforcer = VisibilityEnforcer::new(broker.clone(), queue.clone(), &config);
        let sweep = enforcer.sweep(now).await.unwrap();
        assert_eq!(sweep, Sweep { scanned: 1, reclaimed: 1 });

        // retried through the delayed set with one recorded attempt
        assert_eq!(broker.size(&queue.keys.processing).await.unwrap(), 1);
        assert_eq!(broker.size(&queue.keys.delayed).await.unwrap(), 1);
        let moved = broker
            .move_due_delayed(&queue, Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(moved[0].retry_count, 1);
        assert_eq!(moved[0].failure.as_deref(), Some("visibility timeout"));
    }

    #[tokio::test]
    async fn test_timeout_exhaustion_discards() {
        let (broker, queue, mut config) = setup(QueueSettings::new("emails").with_num_retry(1));
        config = config.with_exhausted_action(ExhaustedAction::Discard);

        broker.enqueue_ready(&queue, &Message::new("emails", "a")).await.unwrap();
        broker
            .try_pop_ready(&queue, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        let enforcer = VisibilityEnforcer::new(broker.clone(), queue.clone(), &config);
        assert_eq!(enforcer.sweep(Utc::now()).await.unwrap().reclaimed, 1);
        assert_eq!(broker.key_count(), 1, "only the statistics hash remains");
        assert!(broker.exists(&queue.keys.stats).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_reclaims_in_background() {
        let (broker, queue, config) = setup(
            QueueSettings::new("emails")
                .with_delayed(false)
                .with_visibility_timeout(Duration::from_millis(20)),
        );
        broker.enqueue_ready(&queue, &Message::new("emails", "a")).await.unwrap();
        broker
            .pop_ready_blocking(&queue, queue.visibility_timeout, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            VisibilityEnforcer::new(broker.clone(), queue.clone(), &config).run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!broker.exists(&queue.keys.processing).await.unwrap());
        assert_eq!(broker.size(&queue.keys.ready).await.unwrap(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_survives_store_errors() {
        let (_, queue, config) = setup(
            QueueSettings::new("emails")
                .with_delayed(false)
                .with_visibility_timeout(Duration::from_millis(20)),
        );
        let broker = Arc::new(FlakyBroker::new());
        broker.enqueue_ready(&queue, &Message::new("emails", "a")).await.unwrap();
        broker
            .try_pop_ready(&queue, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        broker.fail_next(Op::ScanExpired, 3);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            VisibilityEnforcer::new(broker.clone(), queue.clone(), &config).run(shutdown.clone()),
        );

        for _ in 0..150 {
            if broker.size(&queue.keys.ready).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(broker.failures_left(Op::ScanExpired), 0);
        assert_eq!(broker.size(&queue.keys.ready).await.unwrap(), 1);
        assert!(!broker.exists(&queue.keys.processing).await.unwrap());
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
