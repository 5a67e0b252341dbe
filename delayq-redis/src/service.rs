//! Redis service shared by brokers and admin tooling.

use std::future::Future;

use crate::{
    RedisConfig, RedisError, Result,
    pool::{self, RedisConnection, RedisPool},
    pubsub::PubSub,
};

/// Redis service providing the connection pool and pub/sub access.
pub struct RedisService {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisService {
    /// Create a new Redis service.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = pool::open(&config).await?;
        Ok(Self { config, pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> Result<RedisConnection<'_>> {
        Ok(self.pool.get().await?)
    }

    /// Run a command future under the configured command timeout.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let mut conn = redis.get().await?;
    /// let len: u64 = redis
    ///     .timed(redis::cmd("LLEN").arg("jobs").query_async(&mut *conn))
    ///     .await?;
    /// ```
    pub async fn timed<T, F>(&self, command: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, command).await {
            Ok(result) => result.map_err(RedisError::from),
            Err(_) => Err(RedisError::Timeout),
        }
    }

    /// Create a Pub/Sub client.
    pub fn pubsub(&self) -> Result<PubSub> {
        PubSub::new(&self.config)
    }

    /// Publish a message to a channel, returning the number of receivers.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<u64> {
        let mut conn = self.get().await?;
        let receivers: u64 = self
            .timed(
                redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(message)
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(receivers)
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get().await?;
        let _: String = self.timed(redis::cmd("PING").query_async(&mut *conn)).await?;
        Ok(())
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
}
