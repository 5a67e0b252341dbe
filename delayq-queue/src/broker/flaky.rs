//! Test broker that fails chosen operations a set number of times before
//! delegating to an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::broker::{DataType, MemoryBroker, MessageBroker, Resolution, StoredData};
use crate::error::{QueueError, QueueResult};
use crate::message::{Delivery, Message, MessageMetadata};
use crate::topology::QueueDetail;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    PopReady,
    MoveDue,
    ScanExpired,
}

pub(crate) struct FlakyBroker {
    inner: MemoryBroker,
    pending: Mutex<HashMap<Op, u32>>,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self {
            inner: MemoryBroker::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: Op, times: u32) {
        self.pending.lock().insert(op, times);
    }

    /// Failures of `op` still to be served.
    pub fn failures_left(&self, op: Op) -> u32 {
        self.pending.lock().get(&op).copied().unwrap_or(0)
    }

    fn trip(&self, op: Op) -> QueueResult<()> {
        let mut pending = self.pending.lock();
        match pending.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(QueueError::Store(format!("{:?}: connection reset", op)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn enqueue_ready(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()> {
        self.inner.enqueue_ready(queue, message).await
    }

    async fn enqueue_delayed(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()> {
        self.inner.enqueue_delayed(queue, message).await
    }

    async fn try_pop_ready(
        &self,
        queue: &QueueDetail,
        deadline: DateTime<Utc>,
    ) -> QueueResult<Option<Delivery>> {
        self.trip(Op::PopReady)?;
        self.inner.try_pop_ready(queue, deadline).await
    }

    fn ready_signal(&self, queue: &QueueDetail) -> Arc<Notify> {
        self.inner.ready_signal(queue)
    }

    async fn move_due_delayed(
        &self,
        queue: &QueueDetail,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Message>> {
        self.trip(Op::MoveDue)?;
        self.inner.move_due_delayed(queue, now, limit).await
    }

    async fn track_processing(
        &self,
        queue: &QueueDetail,
        raw: &str,
        deadline: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.inner.track_processing(queue, raw, deadline).await
    }

    async fn ack_processing(&self, queue: &QueueDetail, delivery: &Delivery) -> QueueResult<bool> {
        self.inner.ack_processing(queue, delivery).await
    }

    async fn scan_expired_processing(
        &self,
        queue: &QueueDetail,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Delivery>> {
        self.trip(Op::ScanExpired)?;
        self.inner.scan_expired_processing(queue, now, limit).await
    }

    async fn resolve(
        &self,
        queue: &QueueDetail,
        raw: &str,
        resolution: &Resolution,
    ) -> QueueResult<bool> {
        self.inner.resolve(queue, raw, resolution).await
    }

    async fn move_to_dead_letter(
        &self,
        queue: &QueueDetail,
        message: &Message,
    ) -> QueueResult<()> {
        self.inner.move_to_dead_letter(queue, message).await
    }

    async fn load_metadata(&self, key: &str) -> QueueResult<Option<MessageMetadata>> {
        self.inner.load_metadata(key).await
    }

    async fn store_metadata(
        &self,
        key: &str,
        metadata: &MessageMetadata,
        ttl: Duration,
    ) -> QueueResult<()> {
        self.inner.store_metadata(key, metadata, ttl).await
    }

    async fn increment_stats(
        &self,
        key: &str,
        increments: &[(String, i64)],
        prune_before: &str,
        ttl: Duration,
    ) -> QueueResult<()> {
        self.inner
            .increment_stats(key, increments, prune_before, ttl)
            .await
    }

    async fn read_stats(&self, key: &str) -> QueueResult<HashMap<String, i64>> {
        self.inner.read_stats(key).await
    }

    async fn data_type(&self, key: &str) -> QueueResult<DataType> {
        self.inner.data_type(key).await
    }

    async fn size(&self, key: &str) -> QueueResult<u64> {
        self.inner.size(key).await
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> QueueResult<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn read_range(
        &self,
        key: &str,
        data_type: DataType,
        start: usize,
        count: usize,
    ) -> QueueResult<StoredData> {
        self.inner.read_range(key, data_type, start, count).await
    }

    async fn delete_key(&self, key: &str) -> QueueResult<bool> {
        self.inner.delete_key(key).await
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
        self.inner
            .move_entries(src, src_type, dst, dst_type, max, score)
            .await
    }

    fn broker_type(&self) -> &'static str {
        "flaky"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::topology::{QueueRegistry, QueueSettings};

    #[tokio::test]
    async fn test_fails_the_requested_number_of_times() {
        let registry =
            QueueRegistry::build(&EngineConfig::default(), vec![QueueSettings::new("emails")])
                .unwrap();
        let queue = registry.require("emails").unwrap();
        let broker = FlakyBroker::new();
        broker.fail_next(Op::MoveDue, 2);

        assert!(broker.move_due_delayed(queue, Utc::now(), 10).await.is_err());
        assert!(broker.move_due_delayed(queue, Utc::now(), 10).await.is_err());
        assert_eq!(broker.failures_left(Op::MoveDue), 0);
        assert!(broker.move_due_delayed(queue, Utc::now(), 10).await.is_ok());
        assert!(broker.scan_expired_processing(queue, Utc::now(), 10).await.is_ok());
    }
}
