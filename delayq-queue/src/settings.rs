//! File-based configuration.
//!
//! ```toml
//! [engine]
//! key_prefix = "__dq"
//! poll_timeout_ms = 1000
//!
//! [engine.backoff]
//! kind = "fixed"
//! delay_ms = 5000
//!
//! [redis]
//! url = "redis://localhost:6379"
//!
//! [[queues]]
//! name = "emails"
//! num_retry = 3
//! dead_letter_queue = "emails-dlq"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::EngineConfig;
use crate::error::{QueueError, QueueResult};
use crate::topology::{QueueRegistry, QueueSettings};

/// Everything needed to run an engine, as read from one TOML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub queues: Vec<QueueSettings>,
    #[cfg(feature = "redis")]
    pub redis: delayq_redis::RedisConfig,
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(input: &str) -> QueueResult<Self> {
        toml::from_str(input).map_err(|e| QueueError::Config(e.to_string()))
    }

    /// Read settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| QueueError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&input)
    }

    /// Validate the engine section and build the queue registry.
    pub fn registry(&self) -> QueueResult<QueueRegistry> {
        self.engine.validate()?;
        QueueRegistry::build(&self.engine, self.queues.clone())
    }
}
