//! Redis broker tests. Run with a local server:
//!
//! ```sh
//! REDIS_URL=redis://localhost:6379 cargo test -p delayq-queue --test redis_broker -- --ignored
//! ```
#![cfg(feature = "redis")]

use chrono::Utc;
use delayq_queue::*;
use delayq_redis::RedisConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Registry under a fresh prefix so runs never see each other's keys.
fn registry(queues: Vec<QueueSettings>) -> (EngineConfig, Arc<QueueRegistry>) {
    let config = EngineConfig::default()
        .with_key_prefix(format!("delayq-test-{}", uuid::Uuid::new_v4().simple()))
        .with_poll_timeout(Duration::from_millis(200))
        .with_mover_interval(Duration::from_millis(20))
        .with_enforcer_interval(Duration::from_millis(20))
        .with_backoff(BackoffPolicy::fixed(Duration::from_millis(50)));
    let registry = Arc::new(QueueRegistry::build(&config, queues).unwrap());
    (config, registry)
}

async fn broker() -> Arc<RedisBroker> {
    Arc::new(
        RedisBroker::connect(RedisConfig::new(redis_url()))
            .await
            .unwrap(),
    )
}

async fn cleanup(broker: &RedisBroker, queue: &QueueDetail) {
    for key in [
        Some(&queue.keys.ready),
        Some(&queue.keys.delayed),
        Some(&queue.keys.processing),
        Some(&queue.keys.stats),
        queue.keys.dead_letter.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        broker.delete_key(key).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_enqueue_pop_ack() {
    let broker = broker().await;
    let (_, registry) = registry(vec![QueueSettings::new("emails")]);
    let queue = registry.require("emails").unwrap();

    let message = Message::new("emails", "hello");
    broker.enqueue_ready(queue, &message).await.unwrap();
    assert_eq!(broker.data_type(&queue.keys.ready).await.unwrap(), DataType::List);

    let delivery = broker
        .try_pop_ready(queue, Utc::now() + chrono::Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.message().unwrap().id, message.id);
    assert_eq!(broker.size(&queue.keys.processing).await.unwrap(), 1);
    assert!(broker.try_pop_ready(queue, Utc::now()).await.unwrap().is_none());

    assert!(broker.ack_processing(queue, &delivery).await.unwrap());
    assert!(!broker.ack_processing(queue, &delivery).await.unwrap());

    cleanup(&broker, queue).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_move_due_and_scan_expired() {
    let broker = broker().await;
    let (_, registry) = registry(vec![QueueSettings::new("emails")]);
    let queue = registry.require("emails").unwrap();
    let now = Utc::now();

    let due = Message::new("emails", "due").schedule_at(now - chrono::Duration::seconds(1));
    let later = Message::new("emails", "later").schedule_at(now + chrono::Duration::minutes(5));
    broker.enqueue_delayed(queue, &due).await.unwrap();
    broker.enqueue_delayed(queue, &later).await.unwrap();

    let moved = broker.move_due_delayed(queue, now, 10).await.unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].id, due.id);
    assert_eq!(broker.size(&queue.keys.delayed).await.unwrap(), 1);

    broker
        .try_pop_ready(queue, now - chrono::Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    let expired = broker.scan_expired_processing(queue, now, 10).await.unwrap();
    assert_eq!(expired.len(), 1);

    let raw = &expired[0].raw;
    let resolution = Resolution::Ready { raw: raw.clone() };
    assert!(broker.resolve(queue, raw, &resolution).await.unwrap());
    assert!(!broker.resolve(queue, raw, &resolution).await.unwrap());
    assert_eq!(broker.size(&queue.keys.ready).await.unwrap(), 1);

    cleanup(&broker, queue).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_wrong_type_targets_keep_entries() {
    let broker = broker().await;
    let (_, registry) = registry(vec![
        QueueSettings::new("emails").with_dead_letter_queue("emails-dlq"),
    ]);
    let queue = registry.require("emails").unwrap();
    let dlq = queue.keys.dead_letter.clone().unwrap();

    let raw = Message::new("emails", "x").encode().unwrap();
    broker.track_processing(queue, &raw, Utc::now()).await.unwrap();
    broker
        .increment_stats(&dlq, &[("x".to_string(), 1)], "", Duration::from_secs(60))
        .await
        .unwrap();

    let resolution = Resolution::DeadLetter { raw: raw.clone() };
    assert!(broker.resolve(queue, &raw, &resolution).await.is_err());
    assert_eq!(broker.size(&queue.keys.processing).await.unwrap(), 1);

    let due = Message::new("emails", "due").schedule_at(Utc::now() - chrono::Duration::seconds(1));
    broker.enqueue_delayed(queue, &due).await.unwrap();
    broker
        .increment_stats(&queue.keys.ready, &[("x".to_string(), 1)], "", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(broker.move_due_delayed(queue, Utc::now(), 10).await.is_err());
    assert_eq!(broker.size(&queue.keys.delayed).await.unwrap(), 1);

    let moved = broker
        .move_entries(&queue.keys.delayed, DataType::SortedSet, &dlq, DataType::List, 10, 0)
        .await;
    assert!(moved.is_err());
    assert_eq!(broker.size(&queue.keys.delayed).await.unwrap(), 1);

    cleanup(&broker, queue).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_metadata_and_stats_expire() {
    let broker = broker().await;
    let (config, registry) = registry(vec![QueueSettings::new("emails")]);
    let queue = registry.require("emails").unwrap();

    let key = registry.keys().metadata("m-1");
    let mut metadata = MessageMetadata::new("m-1", "emails");
    metadata.mark_deleted();
    broker
        .store_metadata(&key, &metadata, config.metadata_ttl)
        .await
        .unwrap();
    assert!(broker.load_metadata(&key).await.unwrap().unwrap().deleted);
    assert!(broker.ttl(&key).await.unwrap().is_some());

    broker
        .increment_stats(
            &queue.keys.stats,
            &[("2024-01-01:success".to_string(), 2)],
            "",
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    let stats = broker.read_stats(&queue.keys.stats).await.unwrap();
    assert_eq!(stats.get("2024-01-01:success"), Some(&2));

    broker
        .increment_stats(
            &queue.keys.stats,
            &[("2024-01-03:success".to_string(), 1)],
            "2024-01-02",
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    let stats = broker.read_stats(&queue.keys.stats).await.unwrap();
    assert!(!stats.contains_key("2024-01-01:success"));
    assert_eq!(stats.get("2024-01-03:success"), Some(&1));

    broker.delete_key(&key).await.unwrap();
    cleanup(&broker, queue).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires Redis"]
async fn test_engine_round_trip() {
    let broker = broker().await;
    let (config, _) = registry(Vec::new());
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();

    let engine = QueueEngine::builder_shared(broker.clone())
        .config(config)
        .queue(QueueSettings::new("emails").with_dead_letter_queue("emails-dlq"))
        .handler("emails", move |_message: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let producer = engine.producer();
    producer.enqueue("emails", "now").await.unwrap();
    producer
        .enqueue_in("emails", "soon", Duration::from_millis(300))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 2);

    let queue = engine.registry().require("emails").unwrap().clone();
    engine.shutdown().await;
    cleanup(&broker, &queue).await;
}
