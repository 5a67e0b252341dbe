//! Queue topology: per-queue policy and physical key derivation.
//!
//! The registry is built once before any task starts and is shared
//! read-only through `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, millis};
use crate::error::{QueueError, QueueResult};
use crate::policy::RetryLimit;

/// Derives physical keys from logical names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, kind: &str, name: &str) -> String {
        format!("{}::{}::{}", self.prefix, kind, name)
    }

    /// Ready list of a queue.
    pub fn ready(&self, queue: &str) -> String {
        self.key("queue", queue)
    }

    /// Delayed sorted set of a queue.
    pub fn delayed(&self, queue: &str) -> String {
        self.key("d-queue", queue)
    }

    /// Processing sorted set of a queue.
    pub fn processing(&self, queue: &str) -> String {
        self.key("p-queue", queue)
    }

    /// Notification channel of a queue.
    pub fn channel(&self, queue: &str) -> String {
        self.key("channel", queue)
    }

    /// Pattern matching every queue channel.
    pub fn channel_pattern(&self) -> String {
        self.key("channel", "*")
    }

    /// Queue name carried by a channel name, if it belongs to this key space.
    pub fn queue_of_channel<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("::channel::")
    }

    /// Daily statistics hash of a queue.
    pub fn stats(&self, queue: &str) -> String {
        self.key("q-stat", queue)
    }

    /// Metadata entry of a message.
    pub fn metadata(&self, id: &str) -> String {
        self.key("m-meta", id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_KEY_PREFIX)
    }
}

/// Physical keys of one logical queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub delayed: String,
    pub processing: String,
    pub channel: String,
    pub dead_letter: Option<String>,
    pub stats: String,
}

impl QueueKeys {
    /// Derive the keys of `queue`.
    pub fn derive(space: &KeySpace, queue: &str, dead_letter_queue: Option<&str>) -> Self {
        Self {
            ready: space.ready(queue),
            delayed: space.delayed(queue),
            processing: space.processing(queue),
            channel: space.channel(queue),
            dead_letter: dead_letter_queue.map(|dlq| space.ready(dlq)),
            stats: space.stats(queue),
        }
    }
}

/// Declared queue, as written in settings files or built in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,

    /// Retry limit; absent or `0` means unlimited
    #[serde(default)]
    pub num_retry: Option<u32>,

    #[serde(
        rename = "visibility_timeout_ms",
        with = "millis",
        default = "default_visibility_timeout"
    )]
    pub visibility_timeout: Duration,

    #[serde(default = "default_delayed")]
    pub delayed: bool,

    #[serde(default)]
    pub dead_letter_queue: Option<String>,

    /// Pollers for this queue; falls back to the engine default
    #[serde(default)]
    pub concurrency: Option<usize>,
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_delayed() -> bool {
    true
}

impl QueueSettings {
    /// Declare a queue with defaults: unlimited retries, 5 minute visibility
    /// timeout, delayed delivery enabled, no dead-letter queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_retry: None,
            visibility_timeout: default_visibility_timeout(),
            delayed: default_delayed(),
            dead_letter_queue: None,
            concurrency: None,
        }
    }

    /// Set the retry limit.
    pub fn with_num_retry(mut self, num_retry: u32) -> Self {
        self.num_retry = Some(num_retry);
        self
    }

    /// Set the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Enable or disable delayed delivery.
    pub fn with_delayed(mut self, delayed: bool) -> Self {
        self.delayed = delayed;
        self
    }

    /// Route exhausted messages to a dead-letter queue.
    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(name.into());
        self
    }

    /// Set the pollers for this queue.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// Resolved policy and keys of one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDetail {
    pub name: String,
    pub keys: QueueKeys,
    pub num_retry: RetryLimit,
    pub visibility_timeout: Duration,
    pub delayed_queue: bool,
    pub dead_letter_queue: Option<String>,
    pub concurrency: usize,
}

impl QueueDetail {
    /// Whether exhausted messages have somewhere to go.
    pub fn has_dead_letter(&self) -> bool {
        self.dead_letter_queue.is_some()
    }

    /// Effective retry limit for a message, honouring its override.
    pub fn retry_limit_for(&self, max_retries: Option<u32>) -> RetryLimit {
        match max_retries {
            Some(n) => RetryLimit::from_count(Some(n)),
            None => self.num_retry,
        }
    }
}

/// Immutable map of logical queue names to their details.
#[derive(Debug, Clone)]
pub struct QueueRegistry {
    keys: KeySpace,
    queues: HashMap<String, Arc<QueueDetail>>,
    order: Vec<String>,
}

/// Queue and dead-letter names end up inside Redis keys and patterns.
fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        Err("must not be empty")
    } else if name.contains("::") || name.contains('*') {
        Err("must not contain '::' or '*'")
    } else {
        Ok(())
    }
}

impl QueueRegistry {
    /// Validate the declarations and derive every queue's keys.
    pub fn build(config: &EngineConfig, queues: Vec<QueueSettings>) -> QueueResult<Self> {
        let keys = KeySpace::new(config.key_prefix.clone());
        let mut map = HashMap::with_capacity(queues.len());
        let mut order = Vec::with_capacity(queues.len());

        for settings in queues {
            let name = settings.name.trim().to_string();
            validate_name(&name).map_err(|reason| {
                QueueError::Config(format!("queue {:?}: name {}", name, reason))
            })?;
            let dead_letter_queue = match settings.dead_letter_queue.as_deref().map(str::trim) {
                Some(dlq) => {
                    validate_name(dlq).map_err(|reason| {
                        QueueError::Config(format!(
                            "queue {}: dead-letter queue {:?} {}",
                            name, dlq, reason
                        ))
                    })?;
                    Some(dlq.to_string())
                }
                None => None,
            };
            if map.contains_key(&name) {
                return Err(QueueError::Config(format!("queue {} declared twice", name)));
            }
            if settings.visibility_timeout.is_zero() {
                return Err(QueueError::Config(format!(
                    "queue {}: visibility timeout must be positive",
                    name
                )));
            }
            if dead_letter_queue.as_deref() == Some(name.as_str()) {
                return Err(QueueError::Config(format!(
                    "queue {}: dead-letter queue must differ from the queue",
                    name
                )));
            }
            let concurrency = settings.concurrency.unwrap_or(config.default_concurrency);
            if concurrency == 0 {
                return Err(QueueError::Config(format!(
                    "queue {}: concurrency must be at least 1",
                    name
                )));
            }

            let detail = QueueDetail {
                keys: QueueKeys::derive(&keys, &name, dead_letter_queue.as_deref()),
                name: name.clone(),
                num_retry: RetryLimit::from_count(settings.num_retry),
                visibility_timeout: settings.visibility_timeout,
                delayed_queue: settings.delayed,
                dead_letter_queue,
                concurrency,
            };

            order.push(name.clone());
            map.insert(name, Arc::new(detail));
        }

        Ok(Self {
            keys,
            queues: map,
            order,
        })
    }

    /// Key derivation shared by every queue.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Look up a queue.
    pub fn get(&self, name: &str) -> Option<&Arc<QueueDetail>> {
        self.queues.get(name)
    }

    /// Look up a queue or fail with [`QueueError::UnknownQueue`].
    pub fn require(&self, name: &str) -> QueueResult<&Arc<QueueDetail>> {
        self.get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    /// Queues in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<QueueDetail>> {
        self.order.iter().filter_map(|name| self.queues.get(name))
    }

    /// Queue names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
