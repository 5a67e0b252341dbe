//! # delayq Redis
//!
//! Redis plumbing for the delayq queue engine.
//!
//! ## Features
//!
//! - **Connection Pooling**: Efficient connection management with bb8
//! - **Command Timeouts**: Every broker command runs under a bounded timeout
//! - **Pub/Sub**: Pattern subscriptions used to wake idle pollers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use delayq_redis::{RedisConfig, RedisService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .url("redis://localhost:6379")
//!         .pool_size(10)
//!         .build();
//!
//!     let redis = RedisService::new(config).await?;
//!     redis.health_check().await?;
//!
//!     let mut conn = redis.get().await?;
//!     let len: u64 = redis
//!         .timed(redis::cmd("LLEN").arg("__dq::queue::emails").query_async(&mut *conn))
//!         .await?;
//!     println!("{} messages ready", len);
//!
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod pool;
mod pubsub;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use pool::{RedisConnection, RedisPool};
pub use pubsub::{Notification, PubSub, Subscription};
pub use service::{PoolStats, RedisService};

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::error::{RedisError, Result};
    pub use crate::pool::{RedisConnection, RedisPool};
    pub use crate::pubsub::{Notification, PubSub, Subscription};
    pub use crate::service::RedisService;
}
