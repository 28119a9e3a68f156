//! Ready-queue consumer.
//!
//! Drains the ready queue one task at a time whenever the scheduler reports
//! promoted tasks, runs the handler and completes or reschedules each task.
//! Its wake timer tracks the in-flight deadlines of claimed tasks; when it
//! fires, tasks whose handler never finished (a crashed process, a hung
//! handler) are put back on the schedule.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::TaskHandler;
use crate::codec::Codec;
use crate::config::TaskConfig;
use crate::driver::{ChannelHandler, WakeTimer, SWEEP_RETRY_DELAY};
use crate::error::StoreError;
use crate::keys::TaskKeys;
use crate::metrics::{MetricsCollector, TaskOutcome};
use crate::store::{ClaimedTask, Subscription, TaskRetry, TaskStore};
use crate::utils::{deadline_after, now_millis};

/// [`ChannelHandler`] that runs ready tasks of one task engine.
pub struct TaskConsumer<T, C, H> {
    store: Arc<dyn TaskStore>,
    keys: TaskKeys,
    config: TaskConfig,
    codec: Arc<C>,
    handler: Arc<H>,
    label: String,
    metrics: MetricsCollector,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C, H> TaskConsumer<T, C, H>
where
    T: Send + 'static,
    C: Codec<T>,
    H: TaskHandler<T>,
{
    pub fn new(
        store: Arc<dyn TaskStore>,
        keys: TaskKeys,
        config: TaskConfig,
        codec: Arc<C>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            label: format!("{}:consumer", keys.name),
            store,
            keys,
            config,
            codec,
            handler,
            metrics: MetricsCollector::new(),
            _marker: PhantomData,
        }
    }

    /// Claims and runs ready tasks until the ready queue is empty.
    ///
    /// Returns the number of tasks claimed.
    pub async fn drain(&self, timer: &mut WakeTimer) -> usize {
        let mut claimed = 0;
        loop {
            let deadline = deadline_after(self.config.visibility_timeout);
            match self.store.claim(&self.keys, deadline).await {
                Ok(Some(task)) => {
                    claimed += 1;
                    timer.arm(deadline);
                    self.run(task).await;
                }
                Ok(None) => break,
                Err(e) => {
                    error!(task = %self.keys.name, error = %e, "Failed to claim task");
                    timer.arm_after(SWEEP_RETRY_DELAY);
                    break;
                }
            }
        }
        if claimed > 0 {
            debug!(task = %self.keys.name, count = claimed, "Drained ready queue");
        }
        claimed
    }

    /// Reschedules in-flight tasks whose deadline passed.
    pub async fn sweep(&self, timer: &mut WakeTimer) {
        let now = now_millis();
        let result = self
            .store
            .sweep_task_timeouts(
                &self.keys,
                now,
                self.config.sweep_batch,
                self.retry_at(now),
                self.config.retry_budget,
            )
            .await;

        match result {
            Ok(Some(next)) => {
                timer.arm(next);
            }
            Ok(None) => {}
            Err(e) => {
                error!(task = %self.keys.name, error = %e, "Task timeout sweep failed");
                timer.arm_after(SWEEP_RETRY_DELAY);
            }
        }
    }

    fn retry_at(&self, now: i64) -> i64 {
        let delay = i64::try_from(self.config.retry_delay.as_millis()).unwrap_or(i64::MAX);
        now.saturating_add(delay)
    }

    async fn run(&self, task: ClaimedTask) {
        let ClaimedTask { id, payload } = task;

        let Some(payload) = payload else {
            warn!(task = %self.keys.name, id = %id, "Claimed task has no payload, discarding");
            if let Err(e) = self.store.complete(&self.keys, &id).await {
                error!(task = %self.keys.name, id = %id, error = %e, "Failed to discard task");
            }
            return;
        };

        let payload = match self.codec.decode(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(task = %self.keys.name, id = %id, error = %e, "Failed to decode task payload");
                self.fail(&id).await;
                return;
            }
        };

        let start_time = Instant::now();
        let result = AssertUnwindSafe(self.handler.execute(&id, payload))
            .catch_unwind()
            .await;
        let duration = start_time.elapsed();
        self.metrics.record_handler_duration("task", duration);

        match result {
            Ok(Ok(())) => self.succeed(&id, duration).await,
            Ok(Err(e)) => {
                warn!(task = %self.keys.name, id = %id, error = %e, "Task handler failed");
                self.fail(&id).await;
            }
            Err(_) => {
                error!(task = %self.keys.name, id = %id, "Task handler panicked");
                self.fail(&id).await;
            }
        }
    }

    async fn succeed(&self, id: &str, duration: Duration) {
        match self.store.complete(&self.keys, id).await {
            Ok(()) => {
                self.metrics
                    .record_task(&self.keys.name, TaskOutcome::Succeeded, 1);
                debug!(
                    task = %self.keys.name,
                    id = %id,
                    duration_ms = duration.as_millis(),
                    "Task completed"
                );
            }
            Err(e) => {
                error!(task = %self.keys.name, id = %id, error = %e, "Failed to complete task");
            }
        }
    }

    async fn fail(&self, id: &str) {
        let now = now_millis();
        let result = self
            .store
            .retry(
                &self.keys,
                id,
                now,
                self.retry_at(now),
                self.config.retry_budget,
            )
            .await;

        match result {
            Ok(TaskRetry::Rescheduled) => {
                self.metrics.record_task(&self.keys.name, TaskOutcome::Failed, 1);
                info!(
                    task = %self.keys.name,
                    id = %id,
                    retry_in = ?self.config.retry_delay,
                    "Task rescheduled"
                );
            }
            Ok(TaskRetry::DeadLettered) => {
                self.metrics
                    .record_task(&self.keys.name, TaskOutcome::DeadLettered, 1);
                warn!(task = %self.keys.name, id = %id, "Task exhausted its retry budget");
            }
            Ok(TaskRetry::Superseded) => {
                debug!(task = %self.keys.name, id = %id, "Task was offered again while running");
            }
            Ok(TaskRetry::NotInFlight) => {
                debug!(task = %self.keys.name, id = %id, "Task already left the in-flight set");
            }
            Err(e) => {
                error!(task = %self.keys.name, id = %id, error = %e, "Failed to reschedule task");
            }
        }
    }
}

#[async_trait]
impl<T, C, H> ChannelHandler for TaskConsumer<T, C, H>
where
    T: Send + 'static,
    C: Codec<T>,
    H: TaskHandler<T>,
{
    fn name(&self) -> &str {
        &self.label
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.store.subscribe(&self.keys.task_channel).await
    }

    async fn on_subscribe(&mut self, timer: &mut WakeTimer) {
        self.drain(timer).await;
        self.sweep(timer).await;
    }

    async fn on_message(&mut self, _payload: &str, timer: &mut WakeTimer) {
        self.drain(timer).await;
    }

    /// Sweeps timed-out tasks, then picks up anything a missed notification
    /// left in the ready queue.
    async fn on_wake(&mut self, timer: &mut WakeTimer) {
        self.sweep(timer).await;
        self.drain(timer).await;
    }
}
