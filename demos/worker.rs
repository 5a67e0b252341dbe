//! Worker process demo.
//!
//! Loads queue declarations from a TOML file, serves every declared queue
//! with a logging handler and enqueues any extra arguments as messages.
//!
//! ```sh
//! cargo run --example worker -- delayq.toml emails "hello" "world"
//! ```
//!
//! Payloads prefixed with `+<seconds>:` are delayed, e.g. `+30:later`.

use delayq::prelude::*;
use std::time::Duration;
use tracing::{error, info};

fn parse_payload(arg: &str) -> (Option<Duration>, &str) {
    if let Some(rest) = arg.strip_prefix('+')
        && let Some((secs, payload)) = rest.split_once(':')
        && let Ok(secs) = secs.parse::<u64>()
    {
        return (Some(Duration::from_secs(secs)), payload);
    }
    (None, arg)
}

#[tokio::main]
async fn main() -> Result<(), QueueError> {
    delayq::delayq_log::init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "delayq.toml".to_string());
    let settings = Settings::from_file(&path)?;

    info!(path = %path, queues = settings.queues.len(), "Loaded settings");

    let mut handlers = HandlerRegistry::new();
    for queue in &settings.queues {
        handlers.register(queue.name.clone(), |message: Message| async move {
            info!(
                queue = %message.queue_name,
                id = %message.id,
                attempt = message.retry_count + 1,
                payload = %message.payload,
                "Received message"
            );
            Ok(())
        });
    }

    let broker = RedisBroker::connect(settings.redis.clone()).await?;
    broker.service().health_check().await?;
    let pool = broker.service().pool_stats();
    info!(
        connections = pool.connections,
        idle = pool.idle_connections,
        "Connected to Redis"
    );
    let engine = QueueEngine::builder(broker)
        .config(settings.engine.clone())
        .queues(settings.queues.clone())
        .handlers(handlers)
        .build()?;
    engine.start().await?;

    if let Some(queue) = args.next() {
        let producer = engine.producer();
        for arg in args {
            let (delay, payload) = parse_payload(&arg);
            let result = match delay {
                Some(delay) => producer.enqueue_in(&queue, payload, delay).await,
                None => producer.enqueue(&queue, payload).await,
            };
            match result {
                Ok(id) => info!(queue = %queue, id = %id, "Enqueued"),
                Err(e) => error!(queue = %queue, error = %e, "Enqueue failed"),
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
    engine.shutdown().await;
    Ok(())
}
