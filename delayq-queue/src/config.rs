//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};
use crate::policy::{BackoffPolicy, ExhaustedAction, RetryPolicy};

/// Default prefix for every physical key.
pub const DEFAULT_KEY_PREFIX: &str = "__dq";

/// Default page size used by the admin views.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Engine-wide configuration shared by the mover, the enforcer and the pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for every physical key
    pub key_prefix: String,

    /// How long an idle poller waits for a ready message before looping
    #[serde(rename = "poll_timeout_ms", with = "millis")]
    pub poll_timeout: Duration,

    /// Sleep between delay mover sweeps that found less than a full batch
    #[serde(rename = "mover_interval_ms", with = "millis")]
    pub mover_interval: Duration,

    /// Maximum entries promoted per mover sweep
    pub mover_batch: usize,

    /// Sleep between visibility enforcer sweeps
    #[serde(rename = "enforcer_interval_ms", with = "millis")]
    pub enforcer_interval: Duration,

    /// Maximum expired entries reclaimed per enforcer sweep
    pub enforcer_batch: usize,

    /// Pollers per queue unless the queue overrides it
    pub default_concurrency: usize,

    /// Retry delay curve
    pub backoff: BackoffPolicy,

    /// Fallback for exhausted messages on queues without a dead-letter queue
    pub exhausted_action: ExhaustedAction,

    /// Retention of message metadata entries
    #[serde(rename = "metadata_ttl_ms", with = "millis")]
    pub metadata_ttl: Duration,

    /// Retention of per-queue daily statistics
    #[serde(rename = "stats_retention_ms", with = "millis")]
    pub stats_retention: Duration,

    /// Whether pollers write execution statistics and summaries
    pub record_stats: bool,

    /// Upper bound on graceful shutdown before tasks are aborted
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            poll_timeout: Duration::from_secs(1),
            mover_interval: Duration::from_millis(250),
            mover_batch: 100,
            enforcer_interval: Duration::from_millis(500),
            enforcer_batch: 100,
            default_concurrency: 4,
            backoff: BackoffPolicy::default(),
            exhausted_action: ExhaustedAction::default(),
            metadata_ttl: Duration::from_secs(30 * 24 * 3600),
            stats_retention: Duration::from_secs(180 * 24 * 3600),
            record_stats: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from `DELAYQ_*` environment variables.
    ///
    /// Recognised: `DELAYQ_KEY_PREFIX`, `DELAYQ_POLL_TIMEOUT_MS`,
    /// `DELAYQ_MOVER_INTERVAL_MS`, `DELAYQ_ENFORCER_INTERVAL_MS`,
    /// `DELAYQ_CONCURRENCY`, `DELAYQ_EXHAUSTED_ACTION` and
    /// `DELAYQ_SHUTDOWN_TIMEOUT_MS`.
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();

        if let Ok(prefix) = env::var("DELAYQ_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(ms) = env_parse::<u64>("DELAYQ_POLL_TIMEOUT_MS")? {
            config.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DELAYQ_MOVER_INTERVAL_MS")? {
            config.mover_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DELAYQ_ENFORCER_INTERVAL_MS")? {
            config.enforcer_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("DELAYQ_CONCURRENCY")? {
            config.default_concurrency = n;
        }
        if let Ok(action) = env::var("DELAYQ_EXHAUSTED_ACTION") {
            config.exhausted_action = match action.to_lowercase().as_str() {
                "requeue" => ExhaustedAction::Requeue,
                "discard" => ExhaustedAction::Discard,
                other => {
                    return Err(QueueError::Config(format!(
                        "DELAYQ_EXHAUSTED_ACTION: unknown action '{}'",
                        other
                    )));
                }
            };
        }
        if let Some(ms) = env_parse::<u64>("DELAYQ_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the idle poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the delay mover interval.
    pub fn with_mover_interval(mut self, interval: Duration) -> Self {
        self.mover_interval = interval;
        self
    }

    /// Set the delay mover batch size.
    pub fn with_mover_batch(mut self, batch: usize) -> Self {
        self.mover_batch = batch;
        self
    }

    /// Set the visibility enforcer interval.
    pub fn with_enforcer_interval(mut self, interval: Duration) -> Self {
        self.enforcer_interval = interval;
        self
    }

    /// Set the visibility enforcer batch size.
    pub fn with_enforcer_batch(mut self, batch: usize) -> Self {
        self.enforcer_batch = batch;
        self
    }

    /// Set the default pollers per queue.
    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency;
        self
    }

    /// Set the retry backoff curve.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the fallback for exhausted messages without a dead-letter queue.
    pub fn with_exhausted_action(mut self, action: ExhaustedAction) -> Self {
        self.exhausted_action = action;
        self
    }

    /// Set the metadata retention.
    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }

    /// Set the statistics retention.
    pub fn with_stats_retention(mut self, retention: Duration) -> Self {
        self.stats_retention = retention;
        self
    }

    /// Enable or disable statistics recording.
    pub fn with_record_stats(mut self, record: bool) -> Self {
        self.record_stats = record;
        self
    }

    /// Set the graceful shutdown bound.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff, self.exhausted_action)
    }

    /// Reject values the background loops cannot work with.
    pub fn validate(&self) -> QueueResult<()> {
        if self.key_prefix.is_empty() {
            return Err(QueueError::Config("key_prefix must not be empty".into()));
        }
        if self.mover_batch == 0 || self.enforcer_batch == 0 {
            return Err(QueueError::Config("batch sizes must be at least 1".into()));
        }
        if self.default_concurrency == 0 {
            return Err(QueueError::Config(
                "default_concurrency must be at least 1".into(),
            ));
        }
        if self.poll_timeout.is_zero()
            || self.mover_interval.is_zero()
            || self.enforcer_interval.is_zero()
        {
            return Err(QueueError::Config(
                "poll timeout and sweep intervals must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> QueueResult<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| QueueError::Config(format!("{}: invalid value '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
