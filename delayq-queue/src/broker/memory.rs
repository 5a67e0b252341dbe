//! In-memory message broker
//!
//! Keeps lists, sorted sets, hashes and strings keyed by physical key behind a
//! single lock, so every multi-structure operation is atomic just like the
//! Redis scripts. Suitable for tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::broker::{DataType, MessageBroker, Resolution, StoredData};
use crate::error::{QueueError, QueueResult};
use crate::message::{Delivery, Message, MessageMetadata};
use crate::topology::QueueDetail;

/// Sorted set ordered by (score, member), like a Redis zset.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: i64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range_by_score(&self, max: i64, limit: usize) -> Vec<(String, i64)> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max)
            .take(limit)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn range_by_rank(&self, start: usize, count: usize) -> Vec<(String, i64)> {
        self.ordered
            .iter()
            .skip(start)
            .take(count)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, SortedSet>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    expirations: HashMap<String, Instant>,
}

impl State {
    fn evict_if_expired(&mut self, key: &str) {
        if let Some(at) = self.expirations.get(key)
            && *at <= Instant::now()
        {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expirations.remove(key);
        self.lists.remove(key).is_some()
            | self.zsets.remove(key).is_some()
            | self.hashes.remove(key).is_some()
            | self.strings.remove(key).is_some()
    }

    fn data_type(&mut self, key: &str) -> DataType {
        self.evict_if_expired(key);
        if self.lists.contains_key(key) {
            DataType::List
        } else if self.zsets.contains_key(key) {
            DataType::SortedSet
        } else if self.hashes.contains_key(key) {
            DataType::Hash
        } else if self.strings.contains_key(key) {
            DataType::String
        } else {
            DataType::None
        }
    }

    fn expect_type(&mut self, key: &str, expected: DataType) -> QueueResult<()> {
        match self.data_type(key) {
            DataType::None => Ok(()),
            actual if actual == expected => Ok(()),
            actual => Err(QueueError::Store(format!(
                "WRONGTYPE {} holds a {}, expected {}",
                key, actual, expected
            ))),
        }
    }

    fn list(&mut self, key: &str) -> QueueResult<&mut VecDeque<String>> {
        self.expect_type(key, DataType::List)?;
        Ok(self.lists.entry(key.to_string()).or_default())
    }

    fn zset(&mut self, key: &str) -> QueueResult<&mut SortedSet> {
        self.expect_type(key, DataType::SortedSet)?;
        Ok(self.zsets.entry(key.to_string()).or_default())
    }

    fn push_back(&mut self, key: &str, value: String) -> QueueResult<()> {
        self.list(key)?.push_back(value);
        Ok(())
    }

    fn pop_front(&mut self, key: &str) -> QueueResult<Option<String>> {
        let value = self.list(key)?.pop_front();
        self.drop_if_empty(key);
        Ok(value)
    }

    fn zadd(&mut self, key: &str, member: String, score: i64) -> QueueResult<()> {
        self.zset(key)?.insert(member, score);
        Ok(())
    }

    fn zrem(&mut self, key: &str, member: &str) -> QueueResult<bool> {
        self.expect_type(key, DataType::SortedSet)?;
        let removed = self
            .zsets
            .get_mut(key)
            .is_some_and(|zset| zset.remove(member));
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// Empty containers disappear, as in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = self.lists.get(key).is_some_and(VecDeque::is_empty)
            || self.zsets.get(key).is_some_and(SortedSet::is_empty)
            || self.hashes.get(key).is_some_and(HashMap::is_empty);
        if empty {
            self.remove(key);
        }
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        if let Some(at) = Instant::now().checked_add(ttl) {
            self.expirations.insert(key.to_string(), at);
        }
    }
}

/// In-memory message broker
pub struct MemoryBroker {
    state: Mutex<State>,
    signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MemoryBroker {
    /// Create a new in-memory broker
    pub fn new() -> Self {
        debug!("Creating new in-memory message broker");
        Self {
            state: Mutex::new(State::default()),
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Get the number of stored keys (for monitoring)
    pub fn key_count(&self) -> usize {
        let state = self.state.lock();
        state.lists.len() + state.zsets.len() + state.hashes.len() + state.strings.len()
    }

    /// `(key, raw entry)` pairs of every list or sorted set in `keys`, read
    /// under one lock so they describe a single instant.
    pub fn entries(&self, keys: &[&str]) -> Vec<(String, String)> {
        let state = self.state.lock();
        let mut entries = Vec::new();
        for &key in keys {
            if let Some(list) = state.lists.get(key) {
                entries.extend(list.iter().map(|raw| (key.to_string(), raw.clone())));
            }
            if let Some(zset) = state.zsets.get(key) {
                entries.extend(
                    zset.ordered
                        .iter()
                        .map(|(_, raw)| (key.to_string(), raw.clone())),
                );
            }
        }
        entries
    }

    fn signal(&self, ready_key: &str) -> Arc<Notify> {
        self.signals
            .lock()
            .entry(ready_key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, ready_key: &str) {
        self.signal(ready_key).notify_waiters();
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn enqueue_ready(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()> {
        let raw = message.encode()?;
        self.state.lock().push_back(&queue.keys.ready, raw)?;
        self.wake(&queue.keys.ready);
        trace!(queue = %queue.name, id = %message.id, "Enqueued ready message");
        Ok(())
    }

    async fn enqueue_delayed(&self, queue: &QueueDetail, message: &Message) -> QueueResult<()> {
        let raw = message.encode()?;
        self.state
            .lock()
            .zadd(&queue.keys.delayed, raw, message.score())?;
        trace!(queue = %queue.name, id = %message.id, "Enqueued delayed message");
        Ok(())
    }

    async fn try_pop_ready(
        &self,
        queue: &QueueDetail,
        deadline: DateTime<Utc>,
    ) -> QueueResult<Option<Delivery>> {
        let mut state = self.state.lock();
        let Some(raw) = state.pop_front(&queue.keys.ready)? else {
            return Ok(None);
        };
        state.zadd(&queue.keys.processing, raw.clone(), deadline.timestamp_millis())?;
        Ok(Some(Delivery::new(raw, deadline)))
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
        let moved = {
            let mut state = self.state.lock();
            state.expect_type(&queue.keys.ready, DataType::List)?;
            let due = match state.zsets.get(&queue.keys.delayed) {
                Some(zset) => zset.range_by_score(now.timestamp_millis(), limit),
                None => return Ok(Vec::new()),
            };
            for (raw, _) in &due {
                state.zrem(&queue.keys.delayed, raw)?;
                state.push_back(&queue.keys.ready, raw.clone())?;
            }
            due
        };

        if moved.is_empty() {
            return Ok(Vec::new());
        }
        self.wake(&queue.keys.ready);

        Ok(moved
            .into_iter()
            .filter_map(|(raw, _)| match Message::decode(&raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(queue = %queue.name, error = %e, "Moved undecodable delayed entry");
                    None
                }
            })
            .collect())
    }

    async fn track_processing(
        &self,
        queue: &QueueDetail,
        raw: &str,
        deadline: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.state.lock().zadd(
            &queue.keys.processing,
            raw.to_string(),
            deadline.timestamp_millis(),
        )
    }

    async fn ack_processing(&self, queue: &QueueDetail, delivery: &Delivery) -> QueueResult<bool> {
        self.state
            .lock()
            .zrem(&queue.keys.processing, &delivery.raw)
    }

    async fn scan_expired_processing(
        &self,
        queue: &QueueDetail,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.state.lock();
        state.expect_type(&queue.keys.processing, DataType::SortedSet)?;
        let expired = match state.zsets.get(&queue.keys.processing) {
            Some(zset) => zset.range_by_score(now.timestamp_millis(), limit),
            None => Vec::new(),
        };
        Ok(expired
            .into_iter()
            .map(|(raw, score)| {
                let deadline = DateTime::from_timestamp_millis(score).unwrap_or(now);
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
        let dead_letter = match resolution {
            Resolution::DeadLetter { .. } => Some(queue.keys.dead_letter.as_deref().ok_or_else(
                || QueueError::Config(format!("queue {} has no dead-letter queue", queue.name)),
            )?),
            _ => None,
        };

        {
            let mut state = self.state.lock();
            let target = match resolution {
                Resolution::Ready { .. } => Some((queue.keys.ready.as_str(), DataType::List)),
                Resolution::Delayed { .. } => {
                    Some((queue.keys.delayed.as_str(), DataType::SortedSet))
                }
                Resolution::DeadLetter { .. } => dead_letter.map(|key| (key, DataType::List)),
                Resolution::Discard => None,
            };
            // The target must accept the entry before it leaves processing
            if let Some((key, ty)) = target {
                state.expect_type(key, ty)?;
            }
            if !state.zrem(&queue.keys.processing, raw)? {
                return Ok(false);
            }
            match resolution {
                Resolution::Ready { raw } => state.push_back(&queue.keys.ready, raw.clone())?,
                Resolution::Delayed { raw, at } => {
                    state.zadd(&queue.keys.delayed, raw.clone(), at.timestamp_millis())?
                }
                Resolution::DeadLetter { raw } => {
                    if let Some(key) = dead_letter {
                        state.push_back(key, raw.clone())?;
                    }
                }
                Resolution::Discard => {}
            }
        }

        if let Resolution::Ready { .. } = resolution {
            self.wake(&queue.keys.ready);
        }
        Ok(true)
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
        self.state.lock().push_back(key, raw)
    }

    async fn load_metadata(&self, key: &str) -> QueueResult<Option<MessageMetadata>> {
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        match state.strings.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
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
        let mut state = self.state.lock();
        state.expect_type(key, DataType::String)?;
        state.strings.insert(key.to_string(), raw);
        state.expire(key, ttl);
        Ok(())
    }

    async fn increment_stats(
        &self,
        key: &str,
        increments: &[(String, i64)],
        prune_before: &str,
        ttl: Duration,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.expect_type(key, DataType::Hash)?;
        let hash = state.hashes.entry(key.to_string()).or_default();
        hash.retain(|field, _| field.as_str() >= prune_before);
        for (field, by) in increments {
            let current = hash
                .get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            hash.insert(field.clone(), (current + by).to_string());
        }
        state.expire(key, ttl);
        Ok(())
    }

    async fn read_stats(&self, key: &str) -> QueueResult<HashMap<String, i64>> {
        let mut state = self.state.lock();
        state.expect_type(key, DataType::Hash)?;
        Ok(state
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .filter_map(|(k, v)| v.parse().ok().map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn data_type(&self, key: &str) -> QueueResult<DataType> {
        Ok(self.state.lock().data_type(key))
    }

    async fn size(&self, key: &str) -> QueueResult<u64> {
        let mut state = self.state.lock();
        let len = match state.data_type(key) {
            DataType::List => state.lists.get(key).map_or(0, VecDeque::len),
            DataType::SortedSet => state.zsets.get(key).map_or(0, SortedSet::len),
            DataType::Hash => state.hashes.get(key).map_or(0, HashMap::len),
            DataType::String => 1,
            DataType::None => 0,
        };
        Ok(len as u64)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        Ok(self.state.lock().data_type(key) != DataType::None)
    }

    async fn ttl(&self, key: &str) -> QueueResult<Option<Duration>> {
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        Ok(state
            .expirations
            .get(key)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn read_range(
        &self,
        key: &str,
        data_type: DataType,
        start: usize,
        count: usize,
    ) -> QueueResult<StoredData> {
        let mut state = self.state.lock();
        state.expect_type(key, data_type)?;
        Ok(match data_type {
            DataType::List => StoredData::List(
                state
                    .lists
                    .get(key)
                    .map(|list| list.iter().skip(start).take(count).cloned().collect())
                    .unwrap_or_default(),
            ),
            DataType::SortedSet => StoredData::SortedSet(
                state
                    .zsets
                    .get(key)
                    .map(|zset| zset.range_by_rank(start, count))
                    .unwrap_or_default(),
            ),
            DataType::Hash => {
                let mut fields: Vec<(String, String)> = state
                    .hashes
                    .get(key)
                    .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                fields.sort();
                StoredData::Hash(fields.into_iter().skip(start).take(count).collect())
            }
            DataType::String => StoredData::Value(state.strings.get(key).cloned()),
            DataType::None => StoredData::Value(None),
        })
    }

    async fn delete_key(&self, key: &str) -> QueueResult<bool> {
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        Ok(state.remove(key))
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

        let moved = {
            let mut state = self.state.lock();
            state.expect_type(src, src_type)?;
            state.expect_type(dst, dst_type)?;

            let entries: Vec<String> = match src_type {
                DataType::List => {
                    let list = state.list(src)?;
                    let n = max.min(list.len());
                    list.drain(..n).collect()
                }
                DataType::SortedSet => {
                    let members: Vec<String> = state
                        .zset(src)?
                        .range_by_rank(0, max)
                        .into_iter()
                        .map(|(member, _)| member)
                        .collect();
                    for member in &members {
                        state.zrem(src, member)?;
                    }
                    members
                }
                _ => Vec::new(),
            };
            state.drop_if_empty(src);

            for entry in &entries {
                if dst_type == DataType::SortedSet {
                    state.zadd(dst, entry.clone(), score)?;
                } else {
                    state.push_back(dst, entry.clone())?;
                }
            }
            entries.len()
        };

        if dst_type == DataType::List && moved > 0 {
            self.wake(dst);
        }
        Ok(moved as u64)
    }

    fn broker_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::topology::{QueueRegistry, QueueSettings};

    fn queue(name: &str) -> Arc<QueueDetail> {
        let registry = QueueRegistry::build(
            &EngineConfig::default(),
            vec![QueueSettings::new(name).with_dead_letter_queue(format!("{name}-dlq"))],
        )
        .unwrap();
        registry.require(name).unwrap().clone()
    }

    #[tokio::test]
    async fn test_enqueue_and_pop() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let message = Message::new("emails", "hello");

        broker.enqueue_ready(&q, &message).await.unwrap();
        assert_eq!(broker.size(&q.keys.ready).await.unwrap(), 1);

        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let delivery = broker.try_pop_ready(&q, deadline).await.unwrap().unwrap();
        assert_eq!(delivery.message().unwrap().id, message.id);

        // ready list is gone, processing holds the entry
        assert_eq!(broker.data_type(&q.keys.ready).await.unwrap(), DataType::None);
        assert_eq!(broker.size(&q.keys.processing).await.unwrap(), 1);

        assert!(broker.ack_processing(&q, &delivery).await.unwrap());
        assert!(!broker.ack_processing(&q, &delivery).await.unwrap());
        assert!(!broker.exists(&q.keys.processing).await.unwrap());
    }

    #[tokio::test]
    async fn test_pop_blocking_times_out() {
        let broker = MemoryBroker::new();
        let q = queue("emails");

        let delivery = broker
            .pop_ready_blocking(&q, Duration::from_secs(30), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn test_pop_blocking_wakes_on_enqueue() {
        let broker = Arc::new(MemoryBroker::new());
        let q = queue("emails");

        let waiter = {
            let broker = broker.clone();
            let q = q.clone();
            tokio::spawn(async move {
                broker
                    .pop_ready_blocking(&q, Duration::from_secs(30), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .enqueue_ready(&q, &Message::new("emails", "late"))
            .await
            .unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message().unwrap().payload, "late");
    }

    #[tokio::test]
    async fn test_move_due_delayed() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let now = Utc::now();

        let due = Message::new("emails", "due").schedule_at(now - chrono::Duration::seconds(1));
        let later = Message::new("emails", "later").schedule_at(now + chrono::Duration::hours(1));
        broker.enqueue_delayed(&q, &due).await.unwrap();
        broker.enqueue_delayed(&q, &later).await.unwrap();

        let moved = broker.move_due_delayed(&q, now, 10).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, due.id);
        assert_eq!(broker.size(&q.keys.ready).await.unwrap(), 1);
        assert_eq!(broker.size(&q.keys.delayed).await.unwrap(), 1);

        assert!(broker.move_due_delayed(&q, now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_due_respects_limit() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let past = Utc::now() - chrono::Duration::seconds(5);

        for i in 0..5 {
            let message = Message::new("emails", format!("m{i}")).schedule_at(past);
            broker.enqueue_delayed(&q, &message).await.unwrap();
        }

        assert_eq!(broker.move_due_delayed(&q, Utc::now(), 3).await.unwrap().len(), 3);
        assert_eq!(broker.move_due_delayed(&q, Utc::now(), 3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_only_once() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        broker
            .enqueue_ready(&q, &Message::new("emails", "x"))
            .await
            .unwrap();
        let delivery = broker
            .try_pop_ready(&q, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        let expired = broker
            .scan_expired_processing(&q, Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].raw, delivery.raw);

        let resolution = Resolution::DeadLetter {
            raw: delivery.raw.clone(),
        };
        assert!(broker.resolve(&q, &delivery.raw, &resolution).await.unwrap());
        assert!(!broker.resolve(&q, &delivery.raw, &resolution).await.unwrap());

        let dlq = q.keys.dead_letter.as_deref().unwrap();
        assert_eq!(broker.size(dlq).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_delayed() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let raw = Message::new("emails", "x").encode().unwrap();
        let at = Utc::now() + chrono::Duration::seconds(10);

        broker.track_processing(&q, &raw, Utc::now()).await.unwrap();
        let resolution = Resolution::Delayed {
            raw: raw.clone(),
            at,
        };
        assert!(broker.resolve(&q, &raw, &resolution).await.unwrap());

        match broker
            .read_range(&q.keys.delayed, DataType::SortedSet, 0, 10)
            .await
            .unwrap()
        {
            StoredData::SortedSet(entries) => {
                assert_eq!(entries, vec![(raw, at.timestamp_millis())]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        broker
            .increment_stats(&q.keys.ready, &[("x".into(), 1)], "", Duration::from_secs(60))
            .await
            .unwrap();

        let err = broker
            .enqueue_ready(&q, &Message::new("emails", "x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
    }

    #[tokio::test]
    async fn test_metadata_and_stats() {
        let broker = MemoryBroker::new();
        let mut meta = MessageMetadata::new("m-1", "emails");
        meta.mark_deleted();

        broker
            .store_metadata("meta", &meta, Duration::from_secs(60))
            .await
            .unwrap();
        let loaded = broker.load_metadata("meta").await.unwrap().unwrap();
        assert!(loaded.deleted);
        assert!(broker.ttl("meta").await.unwrap().is_some());
        assert!(broker.load_metadata("missing").await.unwrap().is_none());

        let ttl = Duration::from_secs(60);
        broker
            .increment_stats("stats", &[("a".into(), 2), ("b".into(), 1)], "", ttl)
            .await
            .unwrap();
        broker
            .increment_stats("stats", &[("a".into(), 3)], "", ttl)
            .await
            .unwrap();
        let stats = broker.read_stats("stats").await.unwrap();
        assert_eq!(stats.get("a"), Some(&5));
        assert_eq!(stats.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn test_expired_metadata_disappears() {
        let broker = MemoryBroker::new();
        broker
            .store_metadata(
                "meta",
                &MessageMetadata::new("m-1", "emails"),
                Duration::from_millis(1),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(broker.load_metadata("meta").await.unwrap().is_none());
        assert!(!broker.exists("meta").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_entries() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let dlq = q.keys.dead_letter.clone().unwrap();
        for i in 0..4 {
            broker
                .move_to_dead_letter(&q, &Message::new("emails", format!("m{i}")))
                .await
                .unwrap();
        }

        let moved = broker
            .move_entries(&dlq, DataType::List, &q.keys.ready, DataType::List, 3, 0)
            .await
            .unwrap();
        assert_eq!(moved, 3);
        assert_eq!(broker.size(&dlq).await.unwrap(), 1);
        assert_eq!(broker.size(&q.keys.ready).await.unwrap(), 3);

        let moved = broker
            .move_entries(
                &q.keys.ready,
                DataType::List,
                &q.keys.delayed,
                DataType::SortedSet,
                10,
                42,
            )
            .await
            .unwrap();
        assert_eq!(moved, 3);
        assert!(!broker.exists(&q.keys.ready).await.unwrap());
        assert_eq!(broker.size(&q.keys.delayed).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_entries_spans_lists_and_sets() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let later = Utc::now() + chrono::Duration::minutes(1);
        broker
            .enqueue_ready(&q, &Message::new("emails", "a"))
            .await
            .unwrap();
        broker
            .enqueue_delayed(&q, &Message::new("emails", "b").schedule_at(later))
            .await
            .unwrap();

        let entries = broker.entries(&[&q.keys.ready, &q.keys.delayed, "missing"]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, q.keys.ready);
        assert_eq!(entries[1].0, q.keys.delayed);
        assert_eq!(Message::decode(&entries[1].1).unwrap().payload, "b");
    }

    #[tokio::test]
    async fn test_move_entries_into_unsupported_type_keeps_source() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let dlq = q.keys.dead_letter.clone().unwrap();
        for i in 0..2 {
            broker
                .move_to_dead_letter(&q, &Message::new("emails", format!("m{i}")))
                .await
                .unwrap();
        }

        let err = broker
            .move_entries(&dlq, DataType::List, "somewhere", DataType::Hash, 10, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
        assert_eq!(broker.size(&dlq).await.unwrap(), 2);
        assert!(!broker.exists("somewhere").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_entries_into_wrong_type_keeps_source() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let dlq = q.keys.dead_letter.clone().unwrap();
        broker
            .move_to_dead_letter(&q, &Message::new("emails", "m"))
            .await
            .unwrap();
        broker
            .increment_stats(&q.keys.ready, &[("x".into(), 1)], "", Duration::from_secs(60))
            .await
            .unwrap();

        let err = broker
            .move_entries(&dlq, DataType::List, &q.keys.ready, DataType::List, 10, 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
        assert_eq!(broker.size(&dlq).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_into_wrong_type_keeps_processing_entry() {
        let broker = MemoryBroker::new();
        let q = queue("emails");
        let dlq = q.keys.dead_letter.clone().unwrap();
        let raw = Message::new("emails", "x").encode().unwrap();
        broker.track_processing(&q, &raw, Utc::now()).await.unwrap();
        broker
            .increment_stats(&dlq, &[("x".into(), 1)], "", Duration::from_secs(60))
            .await
            .unwrap();

        let resolution = Resolution::DeadLetter { raw: raw.clone() };
        let err = broker.resolve(&q, &raw, &resolution).await.unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
        assert_eq!(broker.size(&q.keys.processing).await.unwrap(), 1);
    }
}
