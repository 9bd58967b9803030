use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::error::QueueError;
use super::handoff::Handoff;
use super::poller::run_poller;
use super::recovery::install_panic_hook;
use super::worker::{run_worker, WorkerContext};
use crate::config::DispatcherConfig;
use crate::job::handler::{HandlerRegistry, QueueHandler, RecoveryListener};
use crate::job::job::QueuePayload;
use crate::queue::queue::JobQueue;
use crate::queue::redis::{RedisConfig, RedisStore};
use crate::queue::store::QueueStore;

/// Optional metrics sink to expose counters without coupling to a specific backend.
///
/// Counters emitted by the dispatcher: `job_completed`, `job_failed`,
/// `job_retry`, `job_timeout`, `job_fault`, `job_unroutable`, `job_poisoned`,
/// `job_dead_lettered` and `worker_restarted`. Durations: `job_execution`.
///
/// # Examples
///
/// ```rust
/// use dispatch_q::MetricsSink;
/// use std::time::Duration;
///
/// struct LoggingMetrics;
///
/// impl MetricsSink for LoggingMetrics {
///     fn inc_counter(&self, name: &str, value: u64) {
///         println!("METRIC: {} += {}", name, value);
///     }
///
///     fn observe_duration(&self, name: &str, duration: Duration) {
///         println!("METRIC: {} = {:?}", name, duration);
///     }
/// }
/// ```
pub trait MetricsSink: Send + Sync + 'static {
    /// Increment a counter metric by the specified value.
    fn inc_counter(&self, name: &str, value: u64);

    /// Record a duration metric. No-op unless overridden.
    fn observe_duration(&self, _name: &str, _dur: Duration) {}
}

/// No-op metrics sink that discards all metrics.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _value: u64) {}
}

/// Work-queue dispatcher: one poller per registered (topic, group) feeding a
/// fixed pool of workers.
///
/// Handlers and the recovery listener are registered on a stopped dispatcher;
/// [`start()`](Dispatcher::start) then freezes the registry for the lifetime of
/// the returned [`DispatcherHandle`].
///
/// # Examples
///
/// ```rust,no_run
/// use dispatch_q::{Dispatcher, QueueHandler, QueuePayload, QueueResult};
/// use async_trait::async_trait;
/// use std::sync::Arc;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl QueueHandler for SendEmail {
///     async fn execute(&self, payload: &QueuePayload) -> QueueResult {
///         println!("sending {}", payload.body);
///         QueueResult::ok("sent")
///     }
/// }
///
/// # async fn example() -> Result<(), dispatch_q::QueueError> {
/// let mut dispatcher = Dispatcher::builder()
///     .redis_url("redis://127.0.0.1:6379")
///     .workers(4)
///     .build()
///     .await?;
/// dispatcher.register_handler("email", "welcome", Arc::new(SendEmail))?;
///
/// let mut job = dispatcher.payload("email", serde_json::json!({"to": "user@example.com"}))
///     .group("welcome");
/// dispatcher.enqueue(&mut job).await?;
///
/// // Runs until Ctrl+C or SIGTERM.
/// dispatcher.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    queue: JobQueue,
    handlers: HandlerRegistry,
    config: DispatcherConfig,
    metrics: Arc<dyn MetricsSink>,
    on_recovery: Option<RecoveryListener>,
    running: Arc<RwLock<bool>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn QueueStore>, config: DispatcherConfig) -> Self {
        Self {
            queue: JobQueue::new(store),
            handlers: HandlerRegistry::new(),
            config,
            metrics: Arc::new(NoopMetrics),
            on_recovery: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn with_metrics(&mut self, sink: Arc<dyn MetricsSink>) {
        self.metrics = sink;
    }

    /// Register the callback receiving stack traces of handler panics.
    pub fn register_on_recovery<F>(&mut self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_recovery = Some(Arc::new(listener));
    }

    /// Register the handler for jobs of (topic, group) and poll its queue once
    /// the dispatcher starts. Replaces a previous handler for the same pair.
    pub fn register_handler(
        &mut self,
        topic: &str,
        group: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<(), QueueError> {
        if self.handlers.register(topic, group, handler)?.is_some() {
            warn!(%topic, %group, "Replaced previously registered handler");
        }
        Ok(())
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// A new payload carrying the configured retry budget.
    pub fn payload(&self, topic: impl Into<String>, body: serde_json::Value) -> QueuePayload {
        QueuePayload::new(topic, body).max_retry(self.config.max_retry)
    }

    /// Validate, identify and push a job to its durable queue.
    pub async fn enqueue(&self, payload: &mut QueuePayload) -> Result<(), QueueError> {
        self.queue.push(payload).await
    }

    /// Spawns the pollers and the worker pool.
    ///
    /// Returns `QueueError::AlreadyRunning` while a previous handle has not been
    /// shut down.
    pub async fn start(&self) -> Result<DispatcherHandle, QueueError> {
        self.config.validate()?;
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(QueueError::AlreadyRunning);
            }
            *running = true;
        }

        install_panic_hook();
        if self.handlers.is_empty() {
            warn!("Starting dispatcher without any registered handler");
        }
        info!(
            workers = self.config.worker_count,
            queues = self.handlers.len(),
            "Starting dispatcher"
        );

        let cancel = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            on_recovery: self.on_recovery.clone(),
            fast: Handoff::new(),
            fallback: Handoff::new(),
            cancel: cancel.clone(),
            retries: TaskTracker::new(),
        });

        let pollers = self
            .handlers
            .keys()
            .into_iter()
            .map(|(topic, group)| tokio::spawn(run_poller(topic, group, ctx.clone())))
            .collect();

        let workers = (0..self.config.worker_count)
            .map(|worker_id| spawn_supervised_worker(worker_id, ctx.clone()))
            .collect();

        Ok(DispatcherHandle {
            cancel,
            pollers,
            workers,
            ctx,
            running: self.running.clone(),
        })
    }

    /// Starts the dispatcher and blocks until Ctrl+C or SIGTERM, then shuts
    /// down gracefully.
    pub async fn run(&self) -> Result<(), QueueError> {
        let handle = self.start().await?;
        wait_for_shutdown().await;
        handle.shutdown().await;
        Ok(())
    }
}

/// Keeps a worker slot occupied: a worker task that dies is replaced.
fn spawn_supervised_worker(worker_id: usize, ctx: Arc<WorkerContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match tokio::spawn(run_worker(worker_id, ctx.clone())).await {
                Ok(()) => break,
                Err(e) if e.is_panic() && !ctx.cancel.is_cancelled() => {
                    ctx.metrics.inc_counter("worker_restarted", 1);
                    error!(worker_id, error = %e, "Worker task panicked, restarting");
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Worker task ended abnormally");
                    break;
                }
            }
        }
    })
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C signal"); },
        _ = terminate => { info!("Received SIGTERM signal"); },
    }
}

/// Running dispatcher tasks.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    pollers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    ctx: Arc<WorkerContext>,
    running: Arc<RwLock<bool>>,
}

impl DispatcherHandle {
    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the pollers, lets workers finish their current job and returns
    /// every job not yet started to the head of its durable queue.
    pub async fn shutdown(self) {
        info!("Stopping dispatcher");
        self.cancel.cancel();

        for poller in self.pollers {
            if let Err(e) = poller.await {
                error!(error = %e, "Poller task failed");
            }
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker supervisor failed");
            }
        }
        self.ctx.retries.close();
        self.ctx.retries.wait().await;

        *self.running.write().await = false;
        debug!("All dispatcher tasks joined");
        info!("Dispatcher stopped");
    }
}

/// Builder for creating a Redis-backed [`Dispatcher`] with fluent configuration.
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    redis_config: Option<RedisConfig>,
    store: Option<Arc<dyn QueueStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    on_recovery: Option<RecoveryListener>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            redis_config: None,
            store: None,
            metrics: None,
            on_recovery: None,
        }
    }

    /// Replaces the whole configuration, e.g. one from [`DispatcherConfig::load`].
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn redis_url(mut self, url: &str) -> Self {
        self.config.redis_url = url.to_string();
        self
    }

    pub fn redis_config(mut self, config: RedisConfig) -> Self {
        self.redis_config = Some(config);
        self
    }

    /// Uses `store` instead of connecting to Redis.
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.config.max_retry = max_retry;
        self
    }

    /// First idle sleep of a poller; the backoff cap is raised to match when lower.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self.config.max_poll_interval_ms = self
            .config
            .max_poll_interval_ms
            .max(self.config.poll_interval_ms);
        self
    }

    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.config.max_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.config.retry_backoff_ms = base.as_millis() as u64;
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn on_recovery<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_recovery = Some(Arc::new(listener));
        self
    }

    /// Builds the dispatcher, connecting to Redis unless a store was given.
    pub async fn build(self) -> Result<Dispatcher, QueueError> {
        self.config.validate()?;

        let store: Arc<dyn QueueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                RedisStore::connect(
                    &self.config.redis_url,
                    self.redis_config.unwrap_or_default(),
                )
                .await?,
            ),
        };

        let mut dispatcher = Dispatcher::new(store, self.config);
        if let Some(metrics) = self.metrics {
            dispatcher.with_metrics(metrics);
        }
        dispatcher.on_recovery = self.on_recovery;
        Ok(dispatcher)
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
