//! Durable delayed message queue on Redis.
//!
//! Provides an at-least-once queue with:
//! - Immediate and delayed (scheduled) delivery
//! - Visibility timeouts that reclaim messages from crashed or slow consumers
//! - Retry limits with fixed or exponential backoff
//! - Dead-letter queues
//! - Worker pools with per-queue concurrency
//! - Soft deletion, daily statistics and administration primitives
//!
//! Redis is the production store ([`RedisBroker`], behind the default `redis`
//! feature). [`MemoryBroker`] implements the same contract in process and is
//! used by tests and single-process setups.
//!
//! ## Quick Start - Queue Declarations
//!
//! ```
//! use delayq_queue::{EngineConfig, QueueRegistry, QueueSettings, RetryLimit};
//! use std::time::Duration;
//!
//! let registry = QueueRegistry::build(
//!     &EngineConfig::default(),
//!     vec![
//!         QueueSettings::new("emails")
//!             .with_num_retry(3)
//!             .with_visibility_timeout(Duration::from_secs(60))
//!             .with_dead_letter_queue("emails-dlq"),
//!         QueueSettings::new("sms").with_delayed(false),
//!     ],
//! )
//! .unwrap();
//!
//! let emails = registry.require("emails").unwrap();
//! assert_eq!(emails.keys.ready, "__dq::queue::emails");
//! assert_eq!(emails.keys.delayed, "__dq::d-queue::emails");
//! assert_eq!(emails.num_retry, RetryLimit::Limited(3));
//! ```
//!
//! ## Retry Policy
//!
//! ```
//! use delayq_queue::{
//!     BackoffPolicy, Decision, ExhaustedAction, FailureReason, RetryLimit, RetryPolicy,
//! };
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(
//!     BackoffPolicy::fixed(Duration::from_secs(5)),
//!     ExhaustedAction::Requeue,
//! );
//!
//! // Second failure of a message allowed two attempts goes to the dead-letter queue
//! let decision = policy.decide(2, RetryLimit::Limited(2), true, FailureReason::Handler);
//! assert_eq!(decision, Decision::DeadLetter);
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use delayq_queue::*;
//! use delayq_redis::RedisConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let broker = RedisBroker::connect(RedisConfig::new("redis://localhost:6379")).await?;
//!
//!     let engine = QueueEngine::builder(broker)
//!         .queue(QueueSettings::new("emails").with_num_retry(5))
//!         .handler("emails", |message: Message| async move {
//!             println!("sending {}", message.payload);
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     engine.start().await?;
//!
//!     let producer = engine.producer();
//!     producer
//!         .enqueue_in(
//!             "emails",
//!             &serde_json::json!({"to": "user@example.com"}),
//!             Duration::from_secs(30),
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admin;
mod backoff;
pub mod broker;
pub mod config;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod handler;
pub mod message;
pub mod mover;
pub mod policy;
pub mod producer;
mod reclaim;
pub mod settings;
pub mod stats;
pub mod topology;
pub mod worker;

pub use admin::{DataPage, Location, QueueAdmin, QueueSizes, QueuedMessage};
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
pub use broker::{DataType, MemoryBroker, MessageBroker, Resolution, StoredData};
pub use config::EngineConfig;
pub use enforcer::{Sweep, VisibilityEnforcer};
pub use engine::{QueueEngine, QueueEngineBuilder};
pub use error::{QueueError, QueueResult};
pub use handler::{HandlerError, HandlerRegistry, HandlerResult, MessageHandler};
pub use message::{Delivery, ExecutionStatus, ExecutionSummary, Message, MessageMetadata};
pub use mover::DelayMover;
pub use policy::{BackoffPolicy, Decision, ExhaustedAction, FailureReason, RetryLimit, RetryPolicy};
pub use producer::Producer;
pub use settings::Settings;
pub use stats::DailyStats;
pub use topology::{KeySpace, QueueDetail, QueueKeys, QueueRegistry, QueueSettings};
pub use worker::{Outcome, WorkerPool};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admin::QueueAdmin;
    pub use crate::broker::{MemoryBroker, MessageBroker};
    pub use crate::config::EngineConfig;
    pub use crate::engine::QueueEngine;
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::handler::{HandlerError, HandlerRegistry, HandlerResult};
    pub use crate::message::Message;
    pub use crate::policy::{BackoffPolicy, ExhaustedAction};
    pub use crate::producer::Producer;
    pub use crate::settings::Settings;
    pub use crate::topology::QueueSettings;

    #[cfg(feature = "redis")]
    pub use crate::broker::RedisBroker;
}
