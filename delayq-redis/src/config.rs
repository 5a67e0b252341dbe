//! Redis configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::{RedisError, Result};

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Minimum idle connections.
    pub min_idle: Option<u32>,
    /// Connection timeout.
    #[serde(rename = "connection_timeout_ms", with = "millis")]
    pub connection_timeout: Duration,
    /// Command timeout.
    #[serde(rename = "command_timeout_ms", with = "millis")]
    pub command_timeout: Duration,
    /// Database number (0-15).
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Use TLS.
    pub tls: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            min_idle: Some(1),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            database: None,
            username: None,
            password: None,
            tls: false,
        }
    }
}

impl RedisConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> RedisConfigBuilder {
        let mut builder = RedisConfigBuilder::new();

        if let Ok(url) = std::env::var("DELAYQ_REDIS_URL") {
            builder = builder.url(url);
        }

        if let Ok(pool_size) = std::env::var("DELAYQ_REDIS_POOL_SIZE")
            && let Ok(size) = pool_size.parse()
        {
            builder = builder.pool_size(size);
        }

        if let Ok(db) = std::env::var("DELAYQ_REDIS_DATABASE")
            && let Ok(db_num) = db.parse()
        {
            builder = builder.database(db_num);
        }

        if let Ok(username) = std::env::var("DELAYQ_REDIS_USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = std::env::var("DELAYQ_REDIS_PASSWORD") {
            builder = builder.password(password);
        }

        if std::env::var("DELAYQ_REDIS_TLS").is_ok() {
            builder = builder.tls(true);
        }

        builder
    }

    /// Get the full Redis URL with auth and database applied.
    pub fn connection_url(&self) -> Result<String> {
        let mut url =
            Url::parse(&self.url).map_err(|e| RedisError::Config(format!("{}: {}", self.url, e)))?;

        match url.scheme() {
            "redis" | "rediss" => {}
            other => {
                return Err(RedisError::Config(format!(
                    "unsupported scheme '{}', expected redis or rediss",
                    other
                )));
            }
        }

        if self.tls && url.scheme() == "redis" {
            url.set_scheme("rediss")
                .map_err(|_| RedisError::Config("cannot switch to rediss scheme".to_string()))?;
        }

        if let Some(password) = &self.password {
            let username = self.username.as_deref().unwrap_or("");
            url.set_username(username)
                .map_err(|_| RedisError::Config("URL cannot carry credentials".to_string()))?;
            url.set_password(Some(password))
                .map_err(|_| RedisError::Config("URL cannot carry credentials".to_string()))?;
        }

        if let Some(db) = self.database {
            url.set_path(&format!("/{}", db));
        }

        Ok(url.to_string())
    }
}

/// Builder for Redis configuration.
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RedisConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the pool size.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the minimum idle connections.
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.config.min_idle = Some(min_idle);
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the database number.
    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// Set the username (Redis 6+ ACL).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Enable TLS.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_url() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, 16);
    }

    #[test]
    fn test_connection_url_with_password_and_db() {
        let config = RedisConfig::builder()
            .url("redis://cache.internal:6380")
            .password("s3cret")
            .database(3)
            .build();

        assert_eq!(
            config.connection_url().unwrap(),
            "redis://:s3cret@cache.internal:6380/3"
        );
    }

    #[test]
    fn test_connection_url_with_acl_user() {
        let config = RedisConfig::builder()
            .url("redis://localhost:6379")
            .username("worker")
            .password("pw")
            .build();

        assert_eq!(
            config.connection_url().unwrap(),
            "redis://worker:pw@localhost:6379"
        );
    }

    #[test]
    fn test_tls_switches_scheme() {
        let config = RedisConfig::builder()
            .url("redis://localhost:6379")
            .tls(true)
            .build();

        assert!(config.connection_url().unwrap().starts_with("rediss://"));
    }

    #[test]
    fn test_rejects_foreign_scheme() {
        let config = RedisConfig::new("http://localhost:6379");
        assert!(matches!(config.connection_url(), Err(RedisError::Config(_))));
    }

    #[test]
    fn test_deserialize_millis() {
        let config: RedisConfig = serde_json::from_str(
            r#"{"url":"redis://10.0.0.1:6379","command_timeout_ms":250}"#,
        )
        .unwrap();

        assert_eq!(config.url, "redis://10.0.0.1:6379");
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
    }
}
