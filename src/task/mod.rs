//! Delayed task engine.
//!
//! Tasks are offered with a due time, promoted into a ready queue when due
//! and run by a handler. Failed or lost tasks are rescheduled after a retry
//! delay.
//!
//! # Features
//!
//! - Upsert scheduling: offering a known id again moves it in place
//! - Best-effort cancellation before a task is claimed
//! - One scheduler and one consumer per task name per process, shared
//!   through [`TaskRegistry`]
//! - Optional retry ceiling with a dead set
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ackqueue::store::MemoryStore;
//! use ackqueue::task::DelayedTask;
//!
//! let tasks = DelayedTask::<String>::builder(Arc::new(MemoryStore::new()), "mail")
//!     .start(|task_id: &str, address: String| -> anyhow::Result<()> {
//!         println!("{} -> {}", task_id, address);
//!         Ok(())
//!     });
//! tasks.offer_in("welcome-42", &"user@example.com".to_string(), Duration::from_secs(60)).await?;
//! ```

pub mod consumer;
pub mod registry;
pub mod scheduler;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::codec::{Codec, JsonCodec};
use crate::config::TaskConfig;
use crate::driver::Driver;
use crate::error::{HandlerError, TaskError};
use crate::keys::TaskKeys;
use crate::metrics::{MetricsCollector, TaskOutcome};
use crate::store::{TaskStats, TaskStore};
use crate::utils::deadline_after;

pub use consumer::TaskConsumer;
pub use registry::TaskRegistry;
pub use scheduler::TaskScheduler;

/// Runs a due task.
///
/// An `Err` or a panic reschedules the task after the retry delay.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync + 'static {
    async fn execute(&self, task_id: &str, payload: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F> TaskHandler<T> for F
where
    T: Send + 'static,
    F: Fn(&str, T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn execute(&self, task_id: &str, payload: T) -> Result<(), HandlerError> {
        (self)(task_id, payload)
    }
}

/// Configures a [`DelayedTask`] before it starts.
pub struct DelayedTaskBuilder<T, C> {
    store: Arc<dyn TaskStore>,
    keys: TaskKeys,
    config: TaskConfig,
    codec: C,
    registry: Arc<TaskRegistry>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> DelayedTaskBuilder<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Places the task keys under `prefix` instead of the default.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.keys = TaskKeys::with_prefix(prefix, &self.keys.name);
        self
    }

    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_codec<C2: Codec<T>>(self, codec: C2) -> DelayedTaskBuilder<T, C2> {
        DelayedTaskBuilder {
            store: self.store,
            keys: self.keys,
            config: self.config,
            codec,
            registry: self.registry,
            _marker: PhantomData,
        }
    }

    /// Starts (or joins) the scheduler and consumer for this task name and
    /// returns a handle for offering tasks.
    ///
    /// If another handle already runs this task name in the same registry,
    /// its consumer keeps running and `handler` is dropped unused.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<H: TaskHandler<T>>(self, handler: H) -> DelayedTask<T, C> {
        let codec = Arc::new(self.codec);

        let scheduler = Driver::new(TaskScheduler::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            self.config.clone(),
        ));
        let consumer = Driver::new(TaskConsumer::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            self.config.clone(),
            Arc::clone(&codec),
            Arc::new(handler),
        ));

        let usage = self.registry.schedule(&self.keys.root, scheduler, consumer);
        info!(task = %self.keys.name, usage = usage, "Delayed task started");

        DelayedTask {
            store: self.store,
            keys: self.keys,
            codec,
            registry: Some(self.registry),
            released: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
            _marker: PhantomData,
        }
    }

    /// Returns a handle that can offer and cancel tasks but runs nothing.
    pub fn producer(self) -> DelayedTask<T, C> {
        DelayedTask {
            store: self.store,
            keys: self.keys,
            codec: Arc::new(self.codec),
            registry: None,
            released: AtomicBool::new(true),
            metrics: MetricsCollector::new(),
            _marker: PhantomData,
        }
    }
}

/// Handle to a delayed task engine.
///
/// Dropping a started handle releases its registration; the scheduler and
/// consumer stop when the last handle for the name goes away.
pub struct DelayedTask<T, C = JsonCodec<T>> {
    store: Arc<dyn TaskStore>,
    keys: TaskKeys,
    codec: Arc<C>,
    registry: Option<Arc<TaskRegistry>>,
    released: AtomicBool,
    metrics: MetricsCollector,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DelayedTask<T, JsonCodec<T>>
where
    T: Send + 'static,
    JsonCodec<T>: Codec<T>,
{
    /// Begins configuring the task engine `name` with JSON payloads.
    pub fn builder(store: Arc<dyn TaskStore>, name: &str) -> DelayedTaskBuilder<T, JsonCodec<T>> {
        DelayedTaskBuilder {
            store,
            keys: TaskKeys::new(name),
            config: TaskConfig::default(),
            codec: JsonCodec::new(),
            registry: TaskRegistry::global(),
            _marker: PhantomData,
        }
    }
}

impl<T, C> DelayedTask<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    pub fn name(&self) -> &str {
        &self.keys.name
    }

    pub fn keys(&self) -> &TaskKeys {
        &self.keys
    }

    /// Schedules `payload` under `task_id` at `scheduled_at` (epoch millis).
    ///
    /// Offering an id that is still scheduled moves it to the new time and
    /// replaces its payload.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidSchedule` for a negative timestamp, before
    /// anything is written.
    pub async fn offer(&self, task_id: &str, payload: &T, scheduled_at: i64) -> Result<(), TaskError> {
        if scheduled_at < 0 {
            return Err(TaskError::InvalidSchedule(scheduled_at));
        }

        let bytes = self.codec.encode(payload)?;
        let earliest = self
            .store
            .offer(&self.keys, task_id, &bytes, scheduled_at)
            .await?;

        self.metrics
            .record_task(&self.keys.name, TaskOutcome::Offered, 1);
        debug!(
            task = %self.keys.name,
            id = %task_id,
            scheduled_at = scheduled_at,
            earliest = earliest,
            "Offered task"
        );
        Ok(())
    }

    pub async fn offer_at(
        &self,
        task_id: &str,
        payload: &T,
        at: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.offer(task_id, payload, at.timestamp_millis()).await
    }

    pub async fn offer_in(
        &self,
        task_id: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<(), TaskError> {
        self.offer(task_id, payload, deadline_after(delay)).await
    }

    /// Cancels a task that has not been claimed yet.
    ///
    /// Returns `false` when the task is unknown or already running.
    pub async fn try_cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let cancelled = self.store.cancel(&self.keys, task_id).await?;
        if cancelled {
            self.metrics
                .record_task(&self.keys.name, TaskOutcome::Cancelled, 1);
            debug!(task = %self.keys.name, id = %task_id, "Cancelled task");
        }
        Ok(cancelled)
    }

    pub async fn stats(&self) -> Result<TaskStats, TaskError> {
        Ok(self.store.task_stats(&self.keys).await?)
    }

    pub async fn retry_count(&self, task_id: &str) -> Result<u32, TaskError> {
        Ok(self.store.task_retry_count(&self.keys, task_id).await?)
    }
}

impl<T, C> DelayedTask<T, C> {
    /// Releases this handle's registration. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = &self.registry {
            let remaining = registry.remove(&self.keys.root);
            debug!(task = %self.keys.name, remaining = remaining, "Released delayed task");
        }
    }
}

impl<T, C> Drop for DelayedTask<T, C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T, C> std::fmt::Debug for DelayedTask<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedTask")
            .field("keys", &self.keys)
            .field("started", &self.registry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_negative_schedule_is_rejected() {
        let store = MemoryStore::new();
        let tasks = DelayedTask::<String>::builder(Arc::new(store.clone()), "reject").producer();

        let err = tasks.offer("t", &"x".to_string(), -1).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidSchedule(-1)));
        assert_eq!(tasks.stats().await.unwrap(), TaskStats::default());
    }

    #[tokio::test]
    async fn test_offer_upserts_in_place() {
        let store = MemoryStore::new();
        let tasks = DelayedTask::<u32>::builder(Arc::new(store.clone()), "upsert").producer();

        tasks.offer("t", &1, 5_000).await.unwrap();
        tasks.offer("t", &2, 9_000).await.unwrap();

        assert_eq!(tasks.stats().await.unwrap().scheduled, 1);
        let promotion = store.promote(tasks.keys(), 6_000, 10).await.unwrap();
        assert_eq!(promotion.moved, 0);
        assert_eq!(promotion.next, Some(9_000));
    }

    #[tokio::test]
    async fn test_close_releases_registration_once() {
        let registry = Arc::new(TaskRegistry::new());
        let store = MemoryStore::new();
        let build = || {
            DelayedTask::<String>::builder(Arc::new(store.clone()), "close")
                .with_registry(Arc::clone(&registry))
                .start(|_: &str, _: String| -> anyhow::Result<()> { Ok(()) })
        };

        let first = build();
        let second = build();
        assert_eq!(registry.usage(&first.keys().root), 2);

        first.close();
        first.close();
        assert_eq!(registry.usage(&second.keys().root), 1);

        drop(first);
        assert_eq!(registry.usage(&second.keys().root), 1);
        drop(second);
        assert!(registry.is_empty());
    }
}
