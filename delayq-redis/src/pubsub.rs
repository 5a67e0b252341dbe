//! Redis Pub/Sub support.
//!
//! Notifications are handed over a bounded channel; when the consumer falls
//! behind, new notifications are dropped instead of blocking the reader.

use futures::StreamExt;
use redis::Client;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{RedisConfig, RedisError, Result};

/// Capacity of the channel between the pub/sub reader task and the consumer.
const SUBSCRIPTION_BUFFER: usize = 256;

/// A notification received on a channel.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Channel name.
    pub channel: String,
    /// Message payload.
    pub payload: String,
    /// Pattern that matched (for pattern subscriptions).
    pub pattern: Option<String>,
}

/// A subscription handle.
pub struct Subscription {
    receiver: mpsc::Receiver<Notification>,
    topic: String,
}

impl Subscription {
    fn new(receiver: mpsc::Receiver<Notification>, topic: String) -> Self {
        Self { receiver, topic }
    }

    /// The channel or pattern this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next notification.
    ///
    /// Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }
}

/// Redis Pub/Sub client.
#[derive(Clone)]
pub struct PubSub {
    client: Client,
}

impl PubSub {
    /// Create a new Pub/Sub client.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let url = config.connection_url()?;
        let client = Client::open(url).map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Subscribe to every channel matching `pattern`.
    pub async fn psubscribe(&self, pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern_str = pattern.to_string();

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        pubsub
            .psubscribe(&pattern_str)
            .await
            .map_err(|e| RedisError::PubSub(e.to_string()))?;

        info!(pattern = %pattern_str, "Subscribed to Redis pattern");

        let pattern_clone = pattern_str.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "Failed to decode notification payload");
                        continue;
                    }
                };

                let notification = Notification {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                    pattern: Some(pattern_clone.clone()),
                };

                // Slow consumers lose wake-ups, never block the reader
                match tx.try_send(notification) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(pattern = %pattern_clone, "Notification buffer full, dropping");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(pattern = %pattern_clone, "Subscription receiver dropped");
                        break;
                    }
                }
            }
            debug!(pattern = %pattern_clone, "Pub/sub stream ended");
        });

        Ok(Subscription::new(rx, pattern_str))
    }
}
