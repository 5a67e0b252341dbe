//! Message store backends
//!
//! - **Memory**: in-process store with the same atomicity guarantees, for tests
//!   and single-process use
//! - **Redis**: durable store shared by every producer and worker process
//!
//! Every operation that touches more than one structure is atomic: a message
//! is resident in exactly one of the delayed set, the ready list, the
//! processing set and the dead-letter list at any instant.

#[cfg(test)]
pub(crate) mod flaky;
mod memory;
#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
mod scripts;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::QueueResult;
use crate::message::{Delivery, Message, MessageMetadata};
use crate::topology::{QueueDetail, QueueRegistry};

/// Kind of structure stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    List,
    SortedSet,
    Hash,
    String,
    None,
}

impl DataType {
    /// Parse the name returned by the Redis `TYPE` command.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "list" => Self::List,
            "zset" => Self::SortedSet,
            "hash" => Self::Hash,
            "string" => Self::String,
            _ => Self::None,
        }
    }

    /// Name as used by the Redis `TYPE` command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::SortedSet => "zset",
            Self::Hash => "hash",
            Self::String => "string",
            Self::None => "none",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Page of a stored structure.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredData {
    List(Vec<String>),
    /// Members with their scores (epoch milliseconds)
    SortedSet(Vec<(String, i64)>),
    /// Field/value pairs ordered by field
    Hash(Vec<(String, String)>),
    Value(Option<String>),
}

impl StoredData {
    pub fn len(&self) -> usize {
        match self {
            Self::List(v) => v.len(),
            Self::SortedSet(v) => v.len(),
            Self::Hash(v) => v.len(),
            Self::Value(v) => usize::from(v.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a reclaimed in-flight message goes next.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Ready list, with a wake-up notification.
    Ready { raw: String },
    /// Delayed set, scored by `at`.
    Delayed { raw: String, at: DateTime<Utc> },
    /// The queue's dead-letter list.
    DeadLetter { raw: String },
    /// Nowhere.
    Discard,
}

/// Trait for message store backends
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Push onto the ready list and publish on the queue channel, atomically.
    async fn enqueue_ready(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()>;

    /// Add to the delayed set scored by `scheduled_at`.
    async fn enqueue_delayed(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()>;

    /// Pop the head of the ready list into the processing set with `deadline`,
    /// atomically. `None` when the list is empty.
    async fn try_pop_ready(
        &self,
        queue: &QueueDetail,
        deadline: DateTime<Utc>,
    ) -> QueueResult<Option<Delivery>>;

    /// Signal notified whenever the queue's ready list may have grown.
    fn ready_signal(&self, queue: &QueueDetail) -> Arc<Notify>;

    /// Pop like [`try_pop_ready`](Self::try_pop_ready), waiting up to
    /// `timeout` for a message when the list is empty.
    async fn pop_ready_blocking(
        &self,
        queue: &QueueDetail,
        visibility_timeout: Duration,
        timeout: Duration,
    ) -> QueueResult<Option<Delivery>> {
        let signal = self.ready_signal(queue);
        let until = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before looking so a push in between is not missed
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self
                .try_pop_ready(queue, deadline_after(visibility_timeout))
                .await?
            {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(until, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Move up to `limit` delayed entries due at `now` onto the ready list and
    /// publish a notification, atomically. Returns the moved messages.
    async fn move_due_delayed(
        &self,
        queue: &QueueDetail,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Message>>;

    /// (Re)arm the processing deadline of an in-flight entry.
    async fn track_processing(
        &self,
        queue: &QueueDetail,
        raw: &str,
        deadline: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Remove an in-flight entry. `false` when another actor already reclaimed it.
    async fn ack_processing(&self, queue: &QueueDetail, delivery: &Delivery) -> QueueResult<bool>;

    /// Up to `limit` in-flight entries whose deadline is at or before `now`.
    async fn scan_expired_processing(
        &self,
        queue: &QueueDetail,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Remove `raw` from the processing set and, only if it was there, apply
    /// `resolution`, atomically. Returns whether the entry was present.
    async fn resolve(
        &self,
        queue: &QueueDetail,
        raw: &str,
        resolution: &Resolution,
    ) -> QueueResult<bool>;

    /// Push a message onto the queue's dead-letter list.
    async fn move_to_dead_letter(&self, queue: &QueueDetail, message: &Message)
    -> QueueResult<()>;

    /// Read a metadata entry.
    async fn load_metadata(&self, key: &str) -> QueueResult<Option<MessageMetadata>>;

    /// Write a metadata entry with a retention TTL.
    async fn store_metadata(
        &self,
        key: &str,
        metadata: &MessageMetadata,
        ttl: Duration,
    ) -> QueueResult<()>;

    /// Increment counters in a statistics hash and refresh its TTL. Fields
    /// sorting below `prune_before` are deleted in the same write.
    async fn increment_stats(
        &self,
        key: &str,
        increments: &[(String, i64)],
        prune_before: &str,
        ttl: Duration,
    ) -> QueueResult<()>;

    /// Read every counter of a statistics hash.
    async fn read_stats(&self, key: &str) -> QueueResult<HashMap<String, i64>>;

    /// Kind of structure stored under `key`.
    async fn data_type(&self, key: &str) -> QueueResult<DataType>;

    /// Number of entries stored under `key`.
    async fn size(&self, key: &str) -> QueueResult<u64>;

    async fn exists(&self, key: &str) -> QueueResult<bool>;

    /// Remaining time to live. `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> QueueResult<Option<Duration>>;

    /// Read `count` entries starting at `start` from a structure of kind
    /// `data_type`.
    async fn read_range(
        &self,
        key: &str,
        data_type: DataType,
        start: usize,
        count: usize,
    ) -> QueueResult<StoredData>;

    /// Delete a key. Returns whether it existed.
    async fn delete_key(&self, key: &str) -> QueueResult<bool>;

    /// Move up to `max` entries from the head of `src` to `dst`, atomically.
    /// Sorted-set destinations receive `score`. Returns the number moved.
    async fn move_entries(
        &self,
        src: &str,
        src_type: DataType,
        dst: &str,
        dst_type: DataType,
        max: usize,
        score: i64,
    ) -> QueueResult<u64>;

    /// Feed the ready signals from an external notification source until
    /// `shutdown` fires. Backends without one simply wait.
    async fn listen(
        &self,
        _registry: Arc<QueueRegistry>,
        shutdown: CancellationToken,
    ) -> QueueResult<()> {
        shutdown.cancelled().await;
        Ok(())
    }

    /// Get broker type name for debugging
    fn broker_type(&self) -> &'static str;
}

/// Deadline of a delivery claimed now.
pub(crate) fn deadline_after(visibility_timeout: Duration) -> DateTime<Utc> {
    let timeout = chrono::Duration::from_std(visibility_timeout).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
