//! Applying retry decisions to in-flight entries.
//!
//! Shared by the worker pool (handler failures) and the visibility enforcer
//! (expired deadlines). The processing entry is removed and the next envelope
//! placed in one atomic step; losing the race to another actor is normal.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::broker::{MessageBroker, Resolution};
use crate::error::QueueResult;
use crate::message::Message;
use crate::policy::{Decision, FailureReason, RetryPolicy};
use crate::topology::QueueDetail;

/// Result of reclaiming one in-flight entry.
#[derive(Debug, Clone)]
pub(crate) struct Reclaimed {
    pub decision: Decision,
    /// `false` when another actor resolved the entry first
    pub applied: bool,
    /// Envelope after recording the failure
    pub message: Message,
}

/// Route a failed delivery of `message`, stored in processing as `raw`.
pub(crate) async fn reclaim(
    broker: &dyn MessageBroker,
    policy: &RetryPolicy,
    queue: &QueueDetail,
    raw: &str,
    mut message: Message,
    reason: FailureReason,
    detail: Option<&str>,
) -> QueueResult<Reclaimed> {
    let attempt = message.retry_count.saturating_add(1);
    let limit = queue.retry_limit_for(message.max_retries);

    let decision = match policy.decide(attempt, limit, queue.has_dead_letter(), reason) {
        // No mover serves a queue without a delayed set
        Decision::RequeueDelayed(_) if !queue.delayed_queue => Decision::RequeueImmediate,
        decision => decision,
    };

    message.record_failure(reason, detail);
    let resolution = match decision {
        Decision::RequeueImmediate => {
            message.scheduled_at = Utc::now();
            Resolution::Ready {
                raw: message.encode()?,
            }
        }
        Decision::RequeueDelayed(delay) => {
            message = message.schedule_after(delay);
            Resolution::Delayed {
                raw: message.encode()?,
                at: message.scheduled_at,
            }
        }
        Decision::DeadLetter => Resolution::DeadLetter {
            raw: message.encode()?,
        },
        Decision::Discard => Resolution::Discard,
    };

    let applied = broker.resolve(queue, raw, &resolution).await?;
    if !applied {
        debug!(queue = %queue.name, id = %message.id, "Entry already reclaimed elsewhere");
    } else {
        match decision {
            Decision::DeadLetter => warn!(
                queue = %queue.name,
                id = %message.id,
                attempts = message.retry_count,
                dead_letter_queue = ?queue.dead_letter_queue,
                "Message moved to dead-letter queue"
            ),
            Decision::Discard => warn!(
                queue = %queue.name,
                id = %message.id,
                attempts = message.retry_count,
                "Message discarded"
            ),
            _ => info!(
                queue = %queue.name,
                id = %message.id,
                attempt = attempt,
                reason = %reason,
                decision = ?decision,
                "Message scheduled for retry"
            ),
        }
    }

    Ok(Reclaimed {
        decision,
        applied,
        message,
    })
}

/// Route an in-flight entry that is not a valid envelope: dead-lettered as is,
/// or dropped when the queue has no dead-letter queue.
pub(crate) async fn reclaim_corrupt(
    broker: &dyn MessageBroker,
    queue: &QueueDetail,
    raw: &str,
) -> QueueResult<bool> {
    let resolution = if queue.has_dead_letter() {
        Resolution::DeadLetter {
            raw: raw.to_string(),
        }
    } else {
        Resolution::Discard
    };
    let applied = broker.resolve(queue, raw, &resolution).await?;
    if applied {
        warn!(
            queue = %queue.name,
            dead_lettered = queue.has_dead_letter(),
            "Removed undecodable entry from processing"
        );
    }
    Ok(applied)
}
