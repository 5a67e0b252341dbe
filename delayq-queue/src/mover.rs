//! Delay mover: promotes due delayed entries to the ready list.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::backoff::ErrorStreak;
use crate::broker::MessageBroker;
use crate::config::EngineConfig;
use crate::error::QueueResult;
use crate::topology::QueueDetail;

/// Moves due entries of one queue's delayed set onto its ready list.
///
/// Any number of movers may run against the same queue, in one process or
/// many; each due entry is moved exactly once.
pub struct DelayMover {
    broker: Arc<dyn MessageBroker>,
    queue: Arc<QueueDetail>,
    interval: Duration,
    batch: usize,
}

impl DelayMover {
    /// Create a mover for `queue`.
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: Arc<QueueDetail>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            broker,
            queue,
            interval: config.mover_interval,
            batch: config.mover_batch.max(1),
        }
    }

    /// Move one batch of entries due at `now`. Returns how many moved.
    pub async fn sweep(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let moved = self
            .broker
            .move_due_delayed(&self.queue, now, self.batch)
            .await?;
        if !moved.is_empty() {
            debug!(queue = %self.queue.name, moved = moved.len(), "Promoted delayed messages");
            for message in &moved {
                trace!(queue = %self.queue.name, id = %message.id, "Delayed message is due");
            }
        }
        Ok(moved.len())
    }

    /// Sweep until `shutdown` fires.
    ///
    /// A full batch is followed by another sweep right away; otherwise the
    /// mover sleeps for the configured interval. Store errors pause the loop
    /// with a jittered backoff and never end it.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            queue = %self.queue.name,
            interval_ms = self.interval.as_millis() as u64,
            batch = self.batch,
            "Delay mover started"
        );
        let mut streak = ErrorStreak::new("delay_mover", self.queue.name.clone());

        while !shutdown.is_cancelled() {
            let pause = match self.sweep(Utc::now()).await {
                Ok(moved) => {
                    streak.succeed();
                    if moved >= self.batch {
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

        info!(queue = %self.queue.name, "Delay mover stopped");
    }
}
