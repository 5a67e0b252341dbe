//! Worker pool: pollers that claim ready messages and run the queue's handler.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ErrorStreak;
use crate::broker::MessageBroker;
use crate::config::EngineConfig;
use crate::error::QueueResult;
use crate::handler::MessageHandler;
use crate::message::{Delivery, ExecutionStatus, ExecutionSummary, Message, MessageMetadata};
use crate::policy::{Decision, FailureReason, RetryPolicy};
use crate::reclaim::{reclaim, reclaim_corrupt};
use crate::stats::StatsRecorder;
use crate::topology::{KeySpace, QueueDetail};

/// What happened to one claimed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded and the entry was acknowledged.
    Succeeded,
    /// Handler failed or panicked and the policy decided.
    Failed(Decision),
    /// Message was soft-deleted; acknowledged without running the handler.
    Skipped,
    /// Entry was not a valid envelope.
    Corrupt,
}

/// Pollers serving one queue.
pub struct WorkerPool {
    broker: Arc<dyn MessageBroker>,
    queue: Arc<QueueDetail>,
    handler: MessageHandler,
    keys: KeySpace,
    policy: RetryPolicy,
    stats: StatsRecorder,
    poll_timeout: Duration,
    metadata_ttl: Duration,
}

impl WorkerPool {
    /// Create a pool for `queue`.
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: Arc<QueueDetail>,
        handler: MessageHandler,
        keys: KeySpace,
        config: &EngineConfig,
    ) -> Self {
        let stats =
            StatsRecorder::new(broker.clone(), config.stats_retention, config.record_stats);
        Self {
            broker,
            queue,
            handler,
            keys,
            policy: config.retry_policy(),
            stats,
            poll_timeout: config.poll_timeout,
            metadata_ttl: config.metadata_ttl,
        }
    }

    /// Number of pollers [`spawn`](Self::spawn) starts.
    pub fn concurrency(&self) -> usize {
        self.queue.concurrency
    }

    /// Start one task per poller.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            queue = %self.queue.name,
            concurrency = self.queue.concurrency,
            "Starting worker pool"
        );
        (0..self.queue.concurrency)
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.poll(worker, shutdown).await })
            })
            .collect()
    }

    /// Claim and process messages until `shutdown` fires. The message in hand
    /// is always finished first.
    async fn poll(&self, worker: usize, shutdown: CancellationToken) {
        debug!(queue = %self.queue.name, worker = worker, "Poller started");
        let mut streak = ErrorStreak::new("worker", self.queue.name.clone());

        while !shutdown.is_cancelled() {
            let result = match self
                .broker
                .pop_ready_blocking(&self.queue, self.queue.visibility_timeout, self.poll_timeout)
                .await
            {
                Ok(Some(delivery)) => self.process(delivery).await.map(|_| ()),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => streak.succeed(),
                Err(e) => {
                    let pause = streak.fail(&e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        debug!(queue = %self.queue.name, worker = worker, "Poller stopped");
    }

    /// Process one claimed delivery: skip it if soft-deleted, run the
    /// handler, then acknowledge or route the failure through the policy.
    pub async fn process(&self, delivery: Delivery) -> QueueResult<Outcome> {
        let message = match delivery.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    queue = %self.queue.name,
                    error = %e,
                    "Claimed entry is not a valid envelope"
                );
                reclaim_corrupt(self.broker.as_ref(), &self.queue, &delivery.raw).await?;
                return Ok(Outcome::Corrupt);
            }
        };

        let metadata_key = self.keys.metadata(message.metadata_ref());
        let metadata = self.broker.load_metadata(&metadata_key).await?;
        if metadata.as_ref().is_some_and(|m| m.deleted) {
            info!(queue = %self.queue.name, id = %message.id, "Skipping deleted message");
            self.broker.ack_processing(&self.queue, &delivery).await?;
            return Ok(Outcome::Skipped);
        }

        let attempt = message.retry_count.saturating_add(1);
        debug!(queue = %self.queue.name, id = %message.id, attempt = attempt, "Running handler");

        let started = Instant::now();
        let handler = self.handler.clone();
        let input = message.clone();
        let result = AssertUnwindSafe(async move { handler(input).await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let (reason, detail) = match result {
            Ok(Ok(())) => {
                if !self.broker.ack_processing(&self.queue, &delivery).await? {
                    // The enforcer already reclaimed it; it will be delivered again
                    warn!(
                        queue = %self.queue.name,
                        id = %message.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Handler finished after the visibility timeout"
                    );
                }
                self.stats.success(&self.queue, elapsed).await;
                self.record_execution(
                    &metadata_key,
                    &message,
                    metadata,
                    ExecutionStatus::Succeeded,
                    elapsed,
                    None,
                )
                .await;
                debug!(queue = %self.queue.name, id = %message.id, "Message processed");
                return Ok(Outcome::Succeeded);
            }
            Ok(Err(e)) => {
                warn!(
                    queue = %self.queue.name,
                    id = %message.id,
                    attempt = attempt,
                    error = %e,
                    "Handler failed"
                );
                (e.reason(), e.to_string())
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(
                    queue = %self.queue.name,
                    id = %message.id,
                    attempt = attempt,
                    panic = %detail,
                    "Handler panicked"
                );
                (FailureReason::Panicked, detail)
            }
        };

        let reclaimed = reclaim(
            self.broker.as_ref(),
            &self.policy,
            &self.queue,
            &delivery.raw,
            message,
            reason,
            Some(&detail),
        )
        .await?;

        if reclaimed.applied {
            self.stats
                .failure(&self.queue, reclaimed.decision, Some(elapsed))
                .await;
            let status = match reclaimed.decision {
                Decision::RequeueImmediate | Decision::RequeueDelayed(_) => {
                    ExecutionStatus::Retried
                }
                Decision::DeadLetter => ExecutionStatus::DeadLettered,
                Decision::Discard => ExecutionStatus::Discarded,
            };
            self.record_execution(
                &metadata_key,
                &reclaimed.message,
                metadata,
                status,
                elapsed,
                reclaimed.message.failure.clone(),
            )
            .await;
        }

        Ok(Outcome::Failed(reclaimed.decision))
    }

    async fn record_execution(
        &self,
        key: &str,
        message: &Message,
        metadata: Option<MessageMetadata>,
        status: ExecutionStatus,
        elapsed: Duration,
        failure: Option<String>,
    ) {
        if !self.stats.enabled() {
            return;
        }
        let mut metadata =
            metadata.unwrap_or_else(|| MessageMetadata::new(&message.id, &message.queue_name));
        metadata.last_execution = Some(ExecutionSummary {
            status,
            attempt: match status {
                ExecutionStatus::Succeeded => message.retry_count.saturating_add(1),
                _ => message.retry_count,
            },
            finished_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
            failure,
        });
        if let Err(e) = self
            .broker
            .store_metadata(key, &metadata, self.metadata_ttl)
            .await
        {
            debug!(
                queue = %self.queue.name,
                id = %message.id,
                error = %e,
                "Failed to store execution summary"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
