//! Administration primitives: inspect, move and delete queue data.
//!
//! Everything here goes through the broker, so the same calls work against
//! the in-memory store and Redis.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::broker::{DataType, MessageBroker, StoredData};
use crate::config::{DEFAULT_PAGE_SIZE, EngineConfig};
use crate::error::{QueueError, QueueResult};
use crate::message::{Message, MessageMetadata};
use crate::stats::DailyStats;
use crate::topology::{QueueDetail, QueueRegistry};

/// One page of a stored structure.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPage {
    pub key: String,
    pub data_type: DataType,
    /// Total entries under the key
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    /// Remaining time to live, if the key expires
    pub ttl: Option<Duration>,
    pub data: StoredData,
}

/// Where a message currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Ready,
    /// Waiting in the delayed set until its score
    Delayed,
    /// Claimed by a worker until its deadline
    Processing,
}

/// A message found in one of a queue's structures.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub location: Location,
    /// Due time (delayed) or visibility deadline (processing)
    pub score: Option<DateTime<Utc>>,
    pub message: Message,
}

/// Entry counts of a queue's structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSizes {
    pub ready: u64,
    pub delayed: u64,
    pub processing: u64,
    /// `None` when the queue has no dead-letter queue
    pub dead_letter: Option<u64>,
}

/// Administrative access to queue data.
#[derive(Clone)]
pub struct QueueAdmin {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<QueueRegistry>,
    metadata_ttl: Duration,
}

impl QueueAdmin {
    /// Create an admin handle.
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        registry: Arc<QueueRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            metadata_ttl: config.metadata_ttl,
        }
    }

    /// Kind of structure stored under `key`.
    pub async fn data_type(&self, key: &str) -> QueueResult<DataType> {
        self.broker.data_type(key).await
    }

    /// Read page `page` (0-based) of the structure under `key`.
    ///
    /// `data_type` defaults to whatever is stored; `page_size` defaults to 20.
    pub async fn view(
        &self,
        key: &str,
        data_type: Option<DataType>,
        page: usize,
        page_size: Option<usize>,
    ) -> QueueResult<DataPage> {
        let data_type = match data_type {
            Some(data_type) => data_type,
            None => self.broker.data_type(key).await?,
        };
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let start = page.saturating_mul(page_size);

        let data = self
            .broker
            .read_range(key, data_type, start, page_size)
            .await?;
        let total = self.broker.size(key).await?;
        let ttl = self.broker.ttl(key).await?;

        Ok(DataPage {
            key: key.to_string(),
            data_type,
            total,
            page,
            page_size,
            ttl,
            data,
        })
    }

    /// Delete whatever is stored under `key`.
    pub async fn delete_structure(&self, key: &str) -> QueueResult<bool> {
        let deleted = self.broker.delete_key(key).await?;
        info!(key = %key, deleted = deleted, "Deleted data structure");
        Ok(deleted)
    }

    /// Delete a queue's ready list, delayed set and processing set. The
    /// dead-letter queue and statistics are kept. Returns the number of keys
    /// that existed.
    pub async fn delete_queue(&self, name: &str) -> QueueResult<usize> {
        let queue = self.registry.require(name)?;
        let mut deleted = 0;
        for key in [&queue.keys.ready, &queue.keys.delayed, &queue.keys.processing] {
            if self.broker.delete_key(key).await? {
                deleted += 1;
            }
        }
        info!(queue = %name, keys = deleted, "Deleted queue data");
        Ok(deleted)
    }

    /// Move up to `max` entries from the head of `src` to `dst`.
    ///
    /// Entries moved into a sorted set are scored with the current time, so
    /// moving into a delayed set makes them due right away.
    pub async fn move_messages(
        &self,
        src: &str,
        src_type: DataType,
        dst: &str,
        dst_type: DataType,
        max: usize,
    ) -> QueueResult<u64> {
        if src == dst {
            return Err(QueueError::Config("source and destination must differ".into()));
        }
        let moved = self
            .broker
            .move_entries(src, src_type, dst, dst_type, max, Utc::now().timestamp_millis())
            .await?;
        info!(src = %src, dst = %dst, moved = moved, "Moved messages");
        Ok(moved)
    }

    /// Soft-delete a message: workers acknowledge it without running the
    /// handler when it is next claimed.
    pub async fn delete_message(&self, queue: &str, id: &str) -> QueueResult<()> {
        let queue = self.registry.require(queue)?;
        let key = self.registry.keys().metadata(id);
        let mut metadata = self
            .broker
            .load_metadata(&key)
            .await?
            .unwrap_or_else(|| MessageMetadata::new(id, &queue.name));
        metadata.mark_deleted();
        self.broker
            .store_metadata(&key, &metadata, self.metadata_ttl)
            .await?;
        info!(queue = %queue.name, id = %id, "Message marked as deleted");
        Ok(())
    }

    /// Every message of a queue: ready, delayed and in flight.
    ///
    /// Entries that are not valid envelopes are skipped.
    pub async fn messages(&self, queue: &str) -> QueueResult<Vec<QueuedMessage>> {
        let queue = self.registry.require(queue)?;
        let mut messages = Vec::new();

        self.collect(queue, &queue.keys.ready, DataType::List, Location::Ready, &mut messages)
            .await?;
        self.collect(
            queue,
            &queue.keys.delayed,
            DataType::SortedSet,
            Location::Delayed,
            &mut messages,
        )
        .await?;
        self.collect(
            queue,
            &queue.keys.processing,
            DataType::SortedSet,
            Location::Processing,
            &mut messages,
        )
        .await?;

        Ok(messages)
    }

    async fn collect(
        &self,
        queue: &QueueDetail,
        key: &str,
        data_type: DataType,
        location: Location,
        out: &mut Vec<QueuedMessage>,
    ) -> QueueResult<()> {
        let size = self.broker.size(key).await? as usize;
        if size == 0 {
            return Ok(());
        }
        let entries: Vec<(String, Option<i64>)> =
            match self.broker.read_range(key, data_type, 0, size).await? {
                StoredData::List(entries) => entries.into_iter().map(|raw| (raw, None)).collect(),
                StoredData::SortedSet(entries) => entries
                    .into_iter()
                    .map(|(raw, score)| (raw, Some(score)))
                    .collect(),
                _ => Vec::new(),
            };

        for (raw, score) in entries {
            match Message::decode(&raw) {
                Ok(message) => out.push(QueuedMessage {
                    location,
                    score: score.and_then(DateTime::from_timestamp_millis),
                    message,
                }),
                Err(e) => {
                    tracing::debug!(queue = %queue.name, error = %e, "Skipping undecodable entry")
                }
            }
        }
        Ok(())
    }

    /// Entry counts of a queue.
    pub async fn sizes(&self, queue: &str) -> QueueResult<QueueSizes> {
        let queue = self.registry.require(queue)?;
        let dead_letter = match &queue.keys.dead_letter {
            Some(key) => Some(self.broker.size(key).await?),
            None => None,
        };
        Ok(QueueSizes {
            ready: self.broker.size(&queue.keys.ready).await?,
            delayed: self.broker.size(&queue.keys.delayed).await?,
            processing: self.broker.size(&queue.keys.processing).await?,
            dead_letter,
        })
    }

    /// Daily statistics of the last `days` days, oldest first, ending today.
    pub async fn daily_stats(&self, queue: &str, days: u32) -> QueueResult<Vec<DailyStats>> {
        let queue = self.registry.require(queue)?;
        let counters = self.broker.read_stats(&queue.keys.stats).await?;
        let today = Utc::now().date_naive();

        Ok((0..days)
            .rev()
            .filter_map(|back| today.checked_sub_days(chrono::Days::new(back as u64)))
            .map(|date| DailyStats::from_counters(date, &counters))
            .collect())
    }
}
