//! Queue channel listener.
//!
//! Reacts to the notifications of one queue: `timeout` events arm the local
//! wake timer, a timer fire sweeps expired in-flight messages, and `message`
//! and `error` events are forwarded to a [`QueueEvents`] implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::driver::{ChannelHandler, WakeTimer, SWEEP_RETRY_DELAY};
use crate::error::StoreError;
use crate::keys::QueueKeys;
use crate::notification::Notification;
use crate::metrics::{MessageOutcome, MetricsCollector};
use crate::store::{QueueStore, Subscription, Sweep};
use crate::task::TaskRegistry;
use crate::utils::now_millis;

/// Callbacks for queue notifications. Both default to logging.
#[async_trait]
pub trait QueueEvents: Send + Sync + 'static {
    /// An id became ready, either freshly pushed or requeued.
    async fn on_message(&self, queue: &str, id: &str) {
        debug!(queue = %queue, id = %id, "Message ready");
    }

    /// An id was moved to the dead-letter set.
    async fn on_error(&self, queue: &str, id: &str) {
        warn!(queue = %queue, id = %id, "Message dead-lettered");
    }
}

/// [`QueueEvents`] that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEvents;

impl QueueEvents for LoggingEvents {}

pub(crate) struct QueueListener {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    config: QueueConfig,
    events: Arc<dyn QueueEvents>,
    metrics: MetricsCollector,
}

/// Counts what a timeout sweep moved.
pub(crate) fn record_sweep(metrics: &MetricsCollector, queue: &str, sweep: &Sweep) {
    metrics.record_messages(queue, MessageOutcome::Requeued, sweep.requeued);
    metrics.record_messages(queue, MessageOutcome::DeadLettered, sweep.dead_lettered);
    if sweep.requeued + sweep.dead_lettered > 0 {
        info!(
            queue = %queue,
            requeued = sweep.requeued,
            dead_lettered = sweep.dead_lettered,
            "Swept expired messages"
        );
    }
}

impl QueueListener {
    pub(crate) fn new(
        store: Arc<dyn QueueStore>,
        keys: QueueKeys,
        config: QueueConfig,
        events: Arc<dyn QueueEvents>,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            events,
            metrics: MetricsCollector::new(),
        }
    }

    async fn sweep(&self, timer: &mut WakeTimer) {
        let result = self
            .store
            .sweep_timeouts(
                &self.keys,
                now_millis(),
                self.config.sweep_batch,
                self.config.retry_budget,
            )
            .await;

        match result {
            Ok(sweep) => {
                record_sweep(&self.metrics, &self.keys.name, &sweep);
                if let Some(next) = sweep.next {
                    timer.arm(next);
                }
            }
            Err(e) => {
                error!(queue = %self.keys.name, error = %e, "Timeout sweep failed");
                timer.arm_after(SWEEP_RETRY_DELAY);
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for QueueListener {
    fn name(&self) -> &str {
        &self.keys.name
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.store.subscribe(&self.keys.channel).await
    }

    async fn on_subscribe(&mut self, timer: &mut WakeTimer) {
        self.sweep(timer).await;
    }

    async fn on_message(&mut self, payload: &str, timer: &mut WakeTimer) {
        match payload.parse::<Notification>() {
            Ok(Notification::Timeout(at)) => {
                timer.arm(at);
            }
            Ok(Notification::Message(id)) => self.events.on_message(&self.keys.name, &id).await,
            Ok(Notification::Error(id)) => self.events.on_error(&self.keys.name, &id).await,
            Err(e) => {
                warn!(queue = %self.keys.name, error = %e, "Ignoring malformed notification");
            }
        }
    }

    async fn on_wake(&mut self, timer: &mut WakeTimer) {
        self.sweep(timer).await;
    }
}

/// Keeps a queue listener registered. Dropping it releases the listener.
#[derive(Debug)]
pub struct ListenerGuard {
    registry: Arc<TaskRegistry>,
    name: String,
    released: AtomicBool,
}

impl ListenerGuard {
    pub(crate) fn new(registry: Arc<TaskRegistry>, name: String) -> Self {
        Self {
            registry,
            name,
            released: AtomicBool::new(false),
        }
    }

    /// Releases the listener now. Further calls and the drop are no-ops.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let remaining = self.registry.remove(&self.name);
        if remaining == 0 {
            info!(queue = %self.name, "Listener stopped");
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.close();
    }
}
