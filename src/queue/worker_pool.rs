//! Worker pool for processing messages from an acknowledged queue.
//!
//! Each worker runs as an independent async task: it pops a batch, runs the
//! handler on every message and acknowledges or returns it depending on the
//! outcome. Idle workers sleep until a `message` notification arrives or the
//! poll interval passes.
//!
//! # Features
//!
//! - Configurable number of workers and batch size
//! - Graceful shutdown with broadcast channel
//! - Handler failures, panics and timeouts all become `unack`
//! - Pool statistics tracking

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::listener::{ListenerGuard, QueueEvents};
use super::{AckQueue, Message};
use crate::codec::Codec;
use crate::error::{HandlerError, QueueError};
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),
}

/// Processes one delivered message.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, message: Message<T>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: Message<T>) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Messages popped per round trip.
    pub batch_size: usize,
    /// How often idle workers poll when no notification arrives.
    pub poll_interval: Duration,
    /// Maximum time allowed for handling a single message. Keep it below the
    /// queue's visibility timeout or messages get redelivered mid-flight.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            batch_size: 1,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Sets the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-message timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a handler.
    pub active_workers: usize,
    /// Messages handled and acknowledged.
    pub messages_acked: u64,
    /// Messages returned after a failure, panic or timeout.
    pub messages_failed: u64,
    /// Average handler duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of messages processed.
    pub fn total_processed(&self) -> u64 {
        self.messages_acked + self.messages_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.messages_acked as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    messages_acked: AtomicU64,
    messages_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_success(&self, duration: Duration) {
        self.messages_acked.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.messages_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let acked = self.messages_acked.load(Ordering::SeqCst);
        let failed = self.messages_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = acked + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            messages_acked: acked,
            messages_failed: failed,
            average_duration,
        }
    }
}

/// Wakes one idle worker per ready message.
struct WakeWorkers {
    notify: Arc<Notify>,
}

#[async_trait]
impl QueueEvents for WakeWorkers {
    async fn on_message(&self, queue: &str, id: &str) {
        debug!(queue = %queue, id = %id, "Waking a worker");
        self.notify.notify_one();
    }
}

/// Worker pool that runs a handler over messages from one queue.
pub struct WorkerPool<T, C, H> {
    config: WorkerPoolConfig,
    queue: Arc<AckQueue<T, C>>,
    handler: Arc<H>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    wake: Arc<Notify>,
    listener: Option<ListenerGuard>,
    is_running: AtomicBool,
}

impl<T, C, H> WorkerPool<T, C, H>
where
    T: Send + 'static,
    C: Codec<T>,
    H: MessageHandler<T>,
{
    /// Creates a worker pool over `queue`.
    pub fn new(config: WorkerPoolConfig, queue: Arc<AckQueue<T, C>>, handler: H) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handler: Arc::new(handler),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            wake: Arc::new(Notify::new()),
            listener: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Also starts the queue listener, which keeps visibility timeouts swept
    /// and wakes idle workers on `message` events.
    ///
    /// If a listener for the same queue is already registered (another pool,
    /// or a plain `listen` call), that listener is shared and keeps its own
    /// callbacks: this pool's workers are then not woken by events and pick up
    /// new messages on `poll_interval` only.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        self.listener = Some(self.queue.listen(WakeWorkers {
            notify: Arc::clone(&self.wake),
        }));

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                wake: Arc::clone(&self.wake),
                batch_size: self.config.batch_size.max(1),
                poll_interval: self.config.poll_interval,
                job_timeout: self.config.job_timeout,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queue = %self.queue.name(),
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the message they are handling; unhandled messages of a
    /// popped batch are returned to the queue.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue = %self.queue.name(), "Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());
        self.wake.notify_waiters();

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;

        self.listener = None;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!(queue = %self.queue.name(), "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns a reference to the queue.
    pub fn queue(&self) -> &Arc<AckQueue<T, C>> {
        &self.queue
    }
}

/// A single worker that processes messages from the queue.
struct Worker<T, C, H> {
    /// Identifier used in logs.
    id: String,
    queue: Arc<AckQueue<T, C>>,
    handler: Arc<H>,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
    /// Signalled when a message becomes ready.
    wake: Arc<Notify>,
    batch_size: usize,
    /// Interval between poll attempts when queue is empty.
    poll_interval: Duration,
    /// Maximum time for handling a single message.
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl<T, C, H> Worker<T, C, H>
where
    T: Send + 'static,
    C: Codec<T>,
    H: MessageHandler<T>,
{
    /// Main worker loop.
    ///
    /// Pops and handles messages until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, queue = %self.queue.name(), "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.pop(self.batch_size).await {
                Ok(messages) if !messages.is_empty() => {
                    let mut messages = messages.into_iter();
                    while let Some(message) = messages.next() {
                        self.process(message).await;

                        if self.shutdown_requested() {
                            let rest: Vec<String> = messages.by_ref().map(|m| m.id).collect();
                            self.return_unprocessed(&rest).await;
                            info!(worker_id = %self.id, "Worker received shutdown signal");
                            return;
                        }
                    }
                }
                Ok(_) => {
                    debug!(worker_id = %self.id, "No messages available");
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to pop messages");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Waits for a wake-up, the poll interval or shutdown. Returns `true` on
    /// shutdown.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = self.wake.notified() => false,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        !matches!(
            self.shutdown_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }

    async fn return_unprocessed(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.queue.unack(ids).await {
            error!(
                worker_id = %self.id,
                error = %e,
                count = ids.len(),
                "Failed to return unprocessed messages"
            );
        }
    }

    /// Runs the handler on one message and settles it.
    async fn process(&self, message: Message<T>) {
        let id = message.id.clone();
        let start_time = Instant::now();

        debug!(worker_id = %self.id, id = %id, "Processing message");

        self.stats.active_workers.fetch_add(1, Ordering::SeqCst);
        self.metrics.worker_started();

        let execution = AssertUnwindSafe(self.handler.handle(message)).catch_unwind();
        let result = tokio::time::timeout(self.job_timeout, execution).await;
        let duration = start_time.elapsed();

        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);
        self.metrics.worker_finished();
        self.metrics.record_handler_duration("message", duration);

        let failure = match result {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(_)) => Some("handler panicked".to_string()),
            Err(_) => Some(format!("handler timed out after {:?}", self.job_timeout)),
        };

        match failure {
            None => {
                self.stats.record_success(duration);
                if let Err(e) = self.queue.ack(&[id.clone()]).await {
                    error!(worker_id = %self.id, id = %id, error = %e, "Failed to ack message");
                    return;
                }
                debug!(
                    worker_id = %self.id,
                    id = %id,
                    duration_ms = duration.as_millis(),
                    "Message handled"
                );
            }
            Some(reason) => {
                self.stats.record_failure(duration);
                warn!(
                    worker_id = %self.id,
                    id = %id,
                    error = %reason,
                    "Message handler failed, returning message"
                );
                if let Err(e) = self.queue.unack(&[id.clone()]).await {
                    error!(worker_id = %self.id, id = %id, error = %e, "Failed to unack message");
                }
            }
        }
    }
}
