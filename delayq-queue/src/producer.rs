//! Producer API.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::broker::MessageBroker;
use crate::error::{QueueError, QueueResult};
use crate::message::Message;
use crate::topology::QueueRegistry;

/// Enqueues messages onto registered queues. Cheap to clone.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<QueueRegistry>,
}

impl Producer {
    /// Create a producer.
    pub fn new(broker: Arc<dyn MessageBroker>, registry: Arc<QueueRegistry>) -> Self {
        Self { broker, registry }
    }

    /// Enqueue a JSON payload for immediate delivery. Returns the message id.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use delayq_queue::*;
    /// use serde_json::json;
    /// use std::time::Duration;
    ///
    /// # async fn example(producer: Producer) -> QueueResult<()> {
    /// let id = producer.enqueue("emails", &json!({"to": "user@example.com"})).await?;
    ///
    /// // Visible to consumers in ten minutes
    /// producer
    ///     .enqueue_in("emails", &json!({"to": "late@example.com"}), Duration::from_secs(600))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
    ) -> QueueResult<String> {
        self.send(Message::new(queue, serde_json::to_string(payload)?))
            .await
    }

    /// Enqueue a JSON payload that becomes visible after `delay`.
    pub async fn enqueue_in<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        delay: Duration,
    ) -> QueueResult<String> {
        let message = Message::new(queue, serde_json::to_string(payload)?);
        self.send(Self::delayed(message, delay)).await
    }

    /// Enqueue a JSON payload after `delay`, overriding the queue's retry limit.
    pub async fn enqueue_in_with_retry<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        max_retries: u32,
        delay: Duration,
    ) -> QueueResult<String> {
        let message =
            Message::new(queue, serde_json::to_string(payload)?).with_max_retries(max_retries);
        self.send(Self::delayed(message, delay)).await
    }

    /// Enqueue a JSON payload that becomes visible at `at`.
    pub async fn enqueue_at<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        at: DateTime<Utc>,
    ) -> QueueResult<String> {
        let message = Message::new(queue, serde_json::to_string(payload)?).schedule_at(at);
        self.send(message).await
    }

    /// Enqueue an already serialized payload for immediate delivery.
    pub async fn enqueue_raw(
        &self,
        queue: &str,
        payload: impl Into<String>,
    ) -> QueueResult<String> {
        self.send(Message::new(queue, payload)).await
    }

    /// Enqueue a prepared message. Messages scheduled in the future go to the
    /// delayed set, everything else to the ready list.
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownQueue`] for unregistered queues,
    /// [`QueueError::DelayNotSupported`] for future messages on a queue
    /// without delayed delivery, and any store failure.
    pub async fn send(&self, message: Message) -> QueueResult<String> {
        let queue = self.registry.require(&message.queue_name)?;

        if message.scheduled_at > Utc::now() {
            if !queue.delayed_queue {
                return Err(QueueError::DelayNotSupported(queue.name.clone()));
            }
            self.broker.enqueue_delayed(queue, &message).await?;
            debug!(
                queue = %queue.name,
                id = %message.id,
                scheduled_at = %message.scheduled_at,
                "Message scheduled"
            );
        } else {
            self.broker.enqueue_ready(queue, &message).await?;
            debug!(queue = %queue.name, id = %message.id, "Message enqueued");
        }

        Ok(message.id)
    }

    fn delayed(message: Message, delay: Duration) -> Message {
        if delay.is_zero() {
            message
        } else {
            message.schedule_after(delay)
        }
    }
}
