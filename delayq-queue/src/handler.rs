//! Handler registration.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::message::Message;
use crate::policy::FailureReason;

/// Result type returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Error returned by a handler. Every variant is routed through the retry
/// policy.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler reported a failure
    #[error("{0}")]
    Failed(String),

    /// Typed handler could not decode the payload
    #[error("payload decode failed: {0}")]
    Deserialize(String),

    /// Any other error
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Build a failure from any message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// How the retry policy sees this error.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Deserialize(_) => FailureReason::Deserialize,
            _ => FailureReason::Handler,
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for HandlerError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Other(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialize(err.to_string())
    }
}

impl From<crate::error::QueueError> for HandlerError {
    fn from(err: crate::error::QueueError) -> Self {
        Self::Other(Box::new(err))
    }
}

/// Message handler function type.
pub type MessageHandler =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Handlers keyed by queue name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, MessageHandler>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler receiving the whole message.
    ///
    /// Registering twice for the same queue replaces the earlier handler.
    ///
    /// # Examples
    ///
    /// ```
    /// use delayq_queue::{HandlerRegistry, HandlerError};
    ///
    /// let mut handlers = HandlerRegistry::new();
    /// handlers.register("emails", |message| async move {
    ///     if message.payload.is_empty() {
    ///         return Err(HandlerError::msg("empty payload"));
    ///     }
    ///     Ok(())
    /// });
    ///
    /// assert!(handlers.contains("emails"));
    /// ```
    pub fn register<F, Fut>(&mut self, queue: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let wrapped: MessageHandler = Arc::new(
            move |message: Message| -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> {
                Box::pin(handler(message))
            },
        );
        self.handlers.insert(queue.into(), wrapped);
        self
    }

    /// Register a handler receiving the payload decoded from JSON.
    ///
    /// Decode failures count as handler failures.
    ///
    /// # Examples
    ///
    /// ```
    /// use delayq_queue::HandlerRegistry;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Welcome {
    ///     to: String,
    /// }
    ///
    /// let mut handlers = HandlerRegistry::new();
    /// handlers.register_json("emails", |welcome: Welcome| async move {
    ///     println!("welcome {}", welcome.to);
    ///     Ok(())
    /// });
    /// ```
    pub fn register_json<T, F, Fut>(&mut self, queue: impl Into<String>, handler: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(queue, move |message: Message| {
            let handler = handler.clone();
            async move {
                let payload: T = serde_json::from_str(&message.payload)?;
                handler(payload).await
            }
        })
    }

    /// Handler of a queue.
    pub fn get(&self, queue: &str) -> Option<&MessageHandler> {
        self.handlers.get(queue)
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    /// Queues with a handler.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut queues: Vec<_> = self.queues().collect();
        queues.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("queues", &queues)
            .finish()
    }
}
