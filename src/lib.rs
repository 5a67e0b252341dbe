// delayq - A durable delayed message queue on Redis
//
// This library re-exports the queue engine together with the Redis plumbing
// and logging setup it is usually deployed with.

// Re-export the queue engine
pub use delayq_queue::*;

// Re-export optional crates
#[cfg(feature = "redis")]
pub use delayq_redis;

#[cfg(feature = "log")]
pub use delayq_log;

pub mod prelude {
    pub use delayq_queue::prelude::*;

    #[cfg(feature = "redis")]
    pub use delayq_redis::RedisConfig;

    #[cfg(feature = "log")]
    pub use delayq_log::LogConfig;
}
