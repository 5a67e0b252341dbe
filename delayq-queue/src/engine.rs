//! Queue engine: owns the background tasks serving every registered queue.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::QueueAdmin;
use crate::backoff::ErrorStreak;
use crate::broker::MessageBroker;
use crate::config::EngineConfig;
use crate::enforcer::VisibilityEnforcer;
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerRegistry;
use crate::mover::DelayMover;
use crate::producer::Producer;
use crate::topology::{QueueRegistry, QueueSettings};
use crate::worker::WorkerPool;

/// Runs delay movers, visibility enforcers and worker pools for a set of
/// queues against one broker.
///
/// Every queue gets an enforcer, delayed queues get a mover, and queues
/// with a handler get a worker pool. Queues without a handler are
/// producer-only in this process.
///
/// # Examples
///
/// ```
/// use delayq_queue::*;
///
/// # #[tokio::main]
/// # async fn main() -> QueueResult<()> {
/// let mut handlers = HandlerRegistry::new();
/// handlers.register("emails", |message: Message| async move {
///     println!("sending {}", message.payload);
///     Ok(())
/// });
///
/// let engine = QueueEngine::builder(MemoryBroker::new())
///     .queue(QueueSettings::new("emails").with_num_retry(3))
///     .handlers(handlers)
///     .build()?;
///
/// engine.start().await?;
/// engine.producer().enqueue("emails", "hello").await?;
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct QueueEngine {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<QueueRegistry>,
    handlers: HandlerRegistry,
    config: EngineConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl QueueEngine {
    /// Start building an engine on `broker`.
    pub fn builder(broker: impl MessageBroker + 'static) -> QueueEngineBuilder {
        QueueEngineBuilder::new(Arc::new(broker))
    }

    /// Start building an engine on a shared broker.
    pub fn builder_shared(broker: Arc<dyn MessageBroker>) -> QueueEngineBuilder {
        QueueEngineBuilder::new(broker)
    }

    /// Spawn the background tasks.
    ///
    /// # Errors
    ///
    /// [`QueueError::AlreadyRunning`] if the engine was started before.
    pub async fn start(&self) -> QueueResult<()> {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let mut handles = Vec::new();
        handles.push(tokio::spawn(listen(
            self.broker.clone(),
            self.registry.clone(),
            self.shutdown.clone(),
        )));

        for queue in self.registry.iter() {
            if queue.delayed_queue {
                let mover = DelayMover::new(self.broker.clone(), queue.clone(), &self.config);
                handles.push(tokio::spawn(mover.run(self.shutdown.clone())));
            }

            let enforcer =
                VisibilityEnforcer::new(self.broker.clone(), queue.clone(), &self.config);
            handles.push(tokio::spawn(enforcer.run(self.shutdown.clone())));

            if let Some(handler) = self.handlers.get(&queue.name) {
                let pool = Arc::new(WorkerPool::new(
                    self.broker.clone(),
                    queue.clone(),
                    handler.clone(),
                    self.registry.keys().clone(),
                    &self.config,
                ));
                handles.extend(pool.spawn(self.shutdown.clone()));
            }
        }

        info!(
            broker = self.broker.broker_type(),
            queues = self.registry.len(),
            consumers = self.handlers.len(),
            tasks = handles.len(),
            "Queue engine started"
        );
        *tasks = Some(handles);
        Ok(())
    }

    /// Stop every task. Handlers in progress get up to the configured
    /// shutdown timeout to finish; whatever is left is aborted, and its
    /// message comes back once its visibility timeout expires.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = self.tasks.lock().take().unwrap_or_default();
        if handles.is_empty() {
            return;
        }

        info!(tasks = handles.len(), "Stopping queue engine");
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut aborted = 0;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(aborted = aborted, "Tasks did not stop within the shutdown timeout");
        }
        info!("Queue engine stopped");
    }

    /// Whether [`start`](Self::start) ran and [`shutdown`](Self::shutdown) did not.
    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Producer for the registered queues.
    pub fn producer(&self) -> Producer {
        Producer::new(self.broker.clone(), self.registry.clone())
    }

    /// Administrative access to the registered queues.
    pub fn admin(&self) -> QueueAdmin {
        QueueAdmin::new(self.broker.clone(), self.registry.clone(), &self.config)
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token cancelled on shutdown; lets callers tie their own tasks to the
    /// engine's lifetime.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Drop for QueueEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Keep the broker's notification listener alive, reconnecting with
/// backoff. Pollers fall back to their poll timeout while it is down.
async fn listen(
    broker: Arc<dyn MessageBroker>,
    registry: Arc<QueueRegistry>,
    shutdown: CancellationToken,
) {
    let mut streak = ErrorStreak::new("listener", "*");

    while !shutdown.is_cancelled() {
        let pause = match broker.listen(registry.clone(), shutdown.clone()).await {
            Ok(()) => {
                streak.succeed();
                Duration::from_secs(1)
            }
            Err(e) => streak.fail(&e),
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(pause) => debug!("Restarting notification listener"),
        }
    }
}

/// Builder for [`QueueEngine`].
pub struct QueueEngineBuilder {
    broker: Arc<dyn MessageBroker>,
    config: EngineConfig,
    queues: Vec<QueueSettings>,
    handlers: HandlerRegistry,
}

impl QueueEngineBuilder {
    fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            config: EngineConfig::default(),
            queues: Vec::new(),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare a queue.
    pub fn queue(mut self, settings: QueueSettings) -> Self {
        self.queues.push(settings);
        self
    }

    /// Declare several queues.
    pub fn queues(mut self, settings: impl IntoIterator<Item = QueueSettings>) -> Self {
        self.queues.extend(settings);
        self
    }

    /// Replace the handler registry.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register one handler.
    pub fn handler<F, Fut>(mut self, queue: impl Into<String>, handler: F) -> Self
    where
        F: Fn(crate::message::Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::handler::HandlerResult> + Send + 'static,
    {
        self.handlers.register(queue, handler);
        self
    }

    /// Validate everything and build the engine.
    ///
    /// # Errors
    ///
    /// [`QueueError::Config`] for invalid configuration or queue
    /// declarations, [`QueueError::UnknownQueue`] for a handler whose queue
    /// is not declared.
    pub fn build(self) -> QueueResult<QueueEngine> {
        self.config.validate()?;
        let registry = QueueRegistry::build(&self.config, self.queues)?;

        if let Some(queue) = self.handlers.queues().find(|q| registry.get(q).is_none()) {
            return Err(QueueError::UnknownQueue(queue.to_string()));
        }

        Ok(QueueEngine {
            broker: self.broker,
            registry: Arc::new(registry),
            handlers: self.handlers,
            config: self.config,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(None),
        })
    }
}
