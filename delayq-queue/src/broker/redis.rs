//! Redis message broker
//!
//! Durable broker shared by every producer and worker process. Multi-key
//! steps run as Lua scripts; idle pollers are woken through pattern
//! subscriptions on the queue channels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delayq_redis::{RedisConfig, RedisService};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::scripts::Scripts;
use crate::broker::{DataType, MessageBroker, Resolution, StoredData};
use crate::error::{QueueError, QueueResult};
use crate::message::{Delivery, Message, MessageMetadata};
use crate::topology::{QueueDetail, QueueRegistry};

/// Redis-backed message broker
pub struct RedisBroker {
    redis: Arc<RedisService>,
    scripts: Scripts,
    signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl RedisBroker {
    /// Create a broker over an existing service.
    pub fn new(redis: Arc<RedisService>) -> Self {
        Self {
            redis,
            scripts: Scripts::new(),
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to Redis and create a broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or the server does not
    /// answer a `PING`.
    pub async fn connect(config: RedisConfig) -> QueueResult<Self> {
        debug!(url = %config.url, "Connecting message broker to Redis");
        let redis = RedisService::new(config).await?;
        Ok(Self::new(Arc::new(redis)))
    }

    /// The underlying Redis service.
    pub fn service(&self) -> &Arc<RedisService> {
        &self.redis
    }

    fn signal(&self, ready_key: &str) -> Arc<Notify> {
        self.signals
            .lock()
            .entry(ready_key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn decode_all(queue: &QueueDetail, raws: Vec<String>) -> Vec<Message> {
        raws.into_iter()
            .filter_map(|raw| match Message::decode(&raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(queue = %queue.name, error = %e, "Moved undecodable delayed entry");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn enqueue_ready(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()> {
        let raw = message.encode()?;
        let mut conn = self.redis.get().await?;
        let len: i64 = self
            .redis
            .timed(
                self.scripts
                    .enqueue_ready
                    .key(&queue.keys.ready)
                    .key(&queue.keys.channel)
                    .arg(&raw)
                    .arg(&queue.name)
                    .invoke_async(&mut *conn),
            )
            .await?;
        trace!(queue = %queue.name, id = %message.id, len = len, "Enqueued ready message");
        Ok(())
    }

    async fn enqueue_delayed(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()> {
        let raw = message.encode()?;
        let mut conn = self.redis.get().await?;
        let _: i64 = self
            .redis
            .timed(
                redis::cmd("ZADD")
                    .arg(&queue.keys.delayed)
                    .arg(message.score())
                    .arg(&raw)
                    .query_async(&mut *conn),
            )
            .await?;
        trace!(queue = %queue.name, id = %message.id, "Enqueued delayed message");
        Ok(())
    }

    async fn try_pop_ready(
        &self,
        queue: &QueueDetail,
        deadline: DateTime<Utc>,
    ) -> QueueResult<Option<Delivery>> {
        let mut conn = self.redis.get().await?;
        let raw: Option<String> = self
            .redis
            .timed(
                self.scripts
                    .pop_ready
                    .key(&queue.keys.ready)
                    .key(&queue.keys.processing)
                    .arg(deadline.timestamp_millis())
                    .invoke_async(&mut *conn),
            )
            .await?;
        Ok(raw.map(|raw| Delivery::new(raw, deadline)))
    }

    fn ready_signal(&self, queue: &QueueDetail) -> Arc<Notify> {
        self.signal(&queue.keys.ready)
    }

    async fn move_due_delayed(
        &self,
        queue: &QueueDetail,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Message>> {
        let mut conn = self.redis.get().await?;
        let moved: Vec<String> = self
            .redis
            .timed(
                self.scripts
                    .move_due
                    .key(&queue.keys.delayed)
                    .key(&queue.keys.ready)
                    .key(&queue.keys.channel)
                    .arg(now.timestamp_millis())
                    .arg(limit)
                    .arg(&queue.name)
                    .invoke_async(&mut *conn),
            )
            .await?;
        Ok(Self::decode_all(queue, moved))
    }

    async fn track_processing(
        &self,
        queue: &QueueDetail,
        raw: &str,
        deadline: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut conn = self.redis.get().await?;
        let _: i64 = self
            .redis
            .timed(
                redis::cmd("ZADD")
                    .arg(&queue.keys.processing)
                    .arg(deadline.timestamp_millis())
                    .arg(raw)
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(())
    }

    async fn ack_processing(&self, queue: &QueueDetail, delivery: &Delivery) -> QueueResult<bool> {
        let mut conn = self.redis.get().await?;
        let removed: i64 = self
            .redis
            .timed(
                redis::cmd("ZREM")
                    .arg(&queue.keys.processing)
                    .arg(&delivery.raw)
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn scan_expired_processing(
        &self,
        queue: &QueueDetail,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.redis.get().await?;
        let expired: Vec<(String, f64)> = self
            .redis
            .timed(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&queue.keys.processing)
                    .arg("-inf")
                    .arg(now.timestamp_millis())
                    .arg("WITHSCORES")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit)
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(expired
            .into_iter()
            .map(|(raw, score)| {
                let deadline = DateTime::from_timestamp_millis(score as i64).unwrap_or(now);
                Delivery::new(raw, deadline)
            })
            .collect())
    }

    async fn resolve(
        &self,
        queue: &QueueDetail,
        raw: &str,
        resolution: &Resolution,
    ) -> QueueResult<bool> {
        let (action, target, new_raw, score) = match resolution {
            Resolution::Ready { raw } => ("ready", queue.keys.ready.as_str(), raw.as_str(), 0),
            Resolution::Delayed { raw, at } => (
                "delayed",
                queue.keys.delayed.as_str(),
                raw.as_str(),
                at.timestamp_millis(),
            ),
            Resolution::DeadLetter { raw } => {
                let dlq = queue.keys.dead_letter.as_deref().ok_or_else(|| {
                    QueueError::Config(format!("queue {} has no dead-letter queue", queue.name))
                })?;
                ("dead_letter", dlq, raw.as_str(), 0)
            }
            Resolution::Discard => ("discard", queue.keys.processing.as_str(), "", 0),
        };

        let mut conn = self.redis.get().await?;
        let applied: i64 = self
            .redis
            .timed(
                self.scripts
                    .resolve
                    .key(&queue.keys.processing)
                    .key(target)
                    .key(&queue.keys.channel)
                    .arg(raw)
                    .arg(action)
                    .arg(new_raw)
                    .arg(score)
                    .arg(&queue.name)
                    .invoke_async(&mut *conn),
            )
            .await?;
        Ok(applied == 1)
    }

    async fn move_to_dead_letter(
        &self,
        queue: &QueueDetail,
        message: &Message,
    ) -> QueueResult<()> {
        let key = queue.keys.dead_letter.as_deref().ok_or_else(|| {
            QueueError::Config(format!("queue {} has no dead-letter queue", queue.name))
        })?;
        let raw = message.encode()?;
        let mut conn = self.redis.get().await?;
        let _: i64 = self
            .redis
            .timed(redis::cmd("RPUSH").arg(key).arg(&raw).query_async(&mut *conn))
            .await?;
        Ok(())
    }

    async fn load_metadata(&self, key: &str) -> QueueResult<Option<MessageMetadata>> {
        let mut conn = self.redis.get().await?;
        let raw: Option<String> = self
            .redis
            .timed(redis::cmd("GET").arg(key).query_async(&mut *conn))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store_metadata(
        &self,
        key: &str,
        metadata: &MessageMetadata,
        ttl: Duration,
    ) -> QueueResult<()> {
        let raw = serde_json::to_string(metadata)?;
        let mut conn = self.redis.get().await?;
        let _: () = self
            .redis
            .timed(
                redis::cmd("SET")
                    .arg(key)
                    .arg(&raw)
                    .arg("PX")
                    .arg(ttl.as_millis().max(1) as u64)
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(())
    }

    async fn increment_stats(
        &self,
        key: &str,
        increments: &[(String, i64)],
        prune_before: &str,
        ttl: Duration,
    ) -> QueueResult<()> {
        let mut invocation = self.scripts.increment_stats.key(key);
        invocation
            .arg(ttl.as_millis().max(1) as u64)
            .arg(prune_before);
        for (field, by) in increments {
            invocation.arg(field).arg(*by);
        }

        let mut conn = self.redis.get().await?;
        let _: i64 = self
            .redis
            .timed(invocation.invoke_async(&mut *conn))
            .await?;
        Ok(())
    }

    async fn read_stats(&self, key: &str) -> QueueResult<HashMap<String, i64>> {
        let mut conn = self.redis.get().await?;
        let stats: HashMap<String, i64> = self
            .redis
            .timed(redis::cmd("HGETALL").arg(key).query_async(&mut *conn))
            .await?;
        Ok(stats)
    }

    async fn data_type(&self, key: &str) -> QueueResult<DataType> {
        let mut conn = self.redis.get().await?;
        let name: String = self
            .redis
            .timed(redis::cmd("TYPE").arg(key).query_async(&mut *conn))
            .await?;
        Ok(DataType::from_type_name(&name))
    }

    async fn size(&self, key: &str) -> QueueResult<u64> {
        let mut conn = self.redis.get().await?;
        let size: u64 = self
            .redis
            .timed(self.scripts.size.key(key).invoke_async(&mut *conn))
            .await?;
        Ok(size)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.redis.get().await?;
        let count: i64 = self
            .redis
            .timed(redis::cmd("EXISTS").arg(key).query_async(&mut *conn))
            .await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> QueueResult<Option<Duration>> {
        let mut conn = self.redis.get().await?;
        let millis: i64 = self
            .redis
            .timed(redis::cmd("PTTL").arg(key).query_async(&mut *conn))
            .await?;
        // -2: missing, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn read_range(
        &self,
        key: &str,
        data_type: DataType,
        start: usize,
        count: usize,
    ) -> QueueResult<StoredData> {
        let (first, last) = index_range(start, count);
        let mut conn = self.redis.get().await?;

        let data = match data_type {
            DataType::List if count == 0 => StoredData::List(Vec::new()),
            DataType::SortedSet if count == 0 => StoredData::SortedSet(Vec::new()),
            DataType::List => {
                let entries: Vec<String> = self
                    .redis
                    .timed(
                        redis::cmd("LRANGE")
                            .arg(key)
                            .arg(first)
                            .arg(last)
                            .query_async(&mut *conn),
                    )
                    .await?;
                StoredData::List(entries)
            }
            DataType::SortedSet => {
                let entries: Vec<(String, f64)> = self
                    .redis
                    .timed(
                        redis::cmd("ZRANGE")
                            .arg(key)
                            .arg(first)
                            .arg(last)
                            .arg("WITHSCORES")
                            .query_async(&mut *conn),
                    )
                    .await?;
                StoredData::SortedSet(
                    entries
                        .into_iter()
                        .map(|(member, score)| (member, score as i64))
                        .collect(),
                )
            }
            DataType::Hash => {
                let hash: HashMap<String, String> = self
                    .redis
                    .timed(redis::cmd("HGETALL").arg(key).query_async(&mut *conn))
                    .await?;
                let mut fields: Vec<(String, String)> = hash.into_iter().collect();
                fields.sort();
                StoredData::Hash(fields.into_iter().skip(start).take(count).collect())
            }
            DataType::String => {
                let value: Option<String> = self
                    .redis
                    .timed(redis::cmd("GET").arg(key).query_async(&mut *conn))
                    .await?;
                StoredData::Value(value)
            }
            DataType::None => StoredData::Value(None),
        };
        Ok(data)
    }

    async fn delete_key(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.redis.get().await?;
        let removed: i64 = self
            .redis
            .timed(redis::cmd("DEL").arg(key).query_async(&mut *conn))
            .await?;
        Ok(removed > 0)
    }

    async fn move_entries(
        &self,
        src: &str,
        src_type: DataType,
        dst: &str,
        dst_type: DataType,
        max: usize,
        score: i64,
    ) -> QueueResult<u64> {
        for (key, ty) in [(src, src_type), (dst, dst_type)] {
            if !matches!(ty, DataType::List | DataType::SortedSet) {
                return Err(QueueError::Store(format!(
                    "cannot move entries with {} ({})",
                    key, ty
                )));
            }
        }

        let mut conn = self.redis.get().await?;
        let moved: u64 = self
            .redis
            .timed(
                self.scripts
                    .move_entries
                    .key(src)
                    .key(dst)
                    .arg(src_type.type_name())
                    .arg(dst_type.type_name())
                    .arg(max)
                    .arg(score)
                    .invoke_async(&mut *conn),
            )
            .await?;
        Ok(moved)
    }

    async fn listen(
        &self,
        registry: Arc<QueueRegistry>,
        shutdown: CancellationToken,
    ) -> QueueResult<()> {
        let pattern = registry.keys().channel_pattern();
        let mut subscription = self.redis.pubsub()?.psubscribe(&pattern).await?;
        info!(pattern = %subscription.topic(), "Listening for queue notifications");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                notification = subscription.recv() => {
                    let Some(notification) = notification else {
                        return Err(QueueError::Store("notification stream ended".into()));
                    };
                    if let Some(queue) = registry.keys().queue_of_channel(&notification.channel) {
                        trace!(queue = %queue, "Ready notification");
                        self.signal(&registry.keys().ready(queue)).notify_waiters();
                    }
                }
            }
        }
    }

    fn broker_type(&self) -> &'static str {
        "redis"
    }
}

/// Inclusive `LRANGE`/`ZRANGE` bounds for `count` entries from `start`,
/// clamped to what Redis accepts.
fn index_range(start: usize, count: usize) -> (i64, i64) {
    let clamp = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    (clamp(start), clamp(start.saturating_add(count)) - 1)
}
