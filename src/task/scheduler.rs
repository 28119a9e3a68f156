//! Promotion of due scheduled tasks.
//!
//! Listens on the schedule channel, where every offer that becomes the
//! earliest entry publishes its timestamp. The wake timer tracks the earliest
//! known timestamp; when it fires, due entries move to the ready queue and
//! consumers are notified on the task channel.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::TaskConfig;
use crate::driver::{ChannelHandler, WakeTimer, SWEEP_RETRY_DELAY};
use crate::error::StoreError;
use crate::keys::TaskKeys;
use crate::metrics::{MetricsCollector, TaskOutcome};
use crate::notification::parse_score;
use crate::store::{Subscription, TaskStore};
use crate::utils::now_millis;

/// [`ChannelHandler`] that promotes due tasks of one task engine.
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    keys: TaskKeys,
    config: TaskConfig,
    label: String,
    metrics: MetricsCollector,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, keys: TaskKeys, config: TaskConfig) -> Self {
        Self {
            label: format!("{}:scheduler", keys.name),
            store,
            keys,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    async fn promote(&self, timer: &mut WakeTimer) {
        let now = now_millis();
        match self.store.promote(&self.keys, now, self.config.sweep_batch).await {
            Ok(promotion) => {
                if promotion.moved > 0 {
                    debug!(task = %self.keys.name, count = promotion.moved, "Promoted tasks");
                    self.metrics
                        .record_task(&self.keys.name, TaskOutcome::Promoted, promotion.moved);
                }
                // A full batch may have left more due entries behind.
                if promotion.moved >= self.config.sweep_batch {
                    timer.arm(now);
                } else if let Some(next) = promotion.next {
                    timer.arm(next);
                }
            }
            Err(e) => {
                error!(task = %self.keys.name, error = %e, "Promotion sweep failed");
                timer.arm_after(SWEEP_RETRY_DELAY);
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for TaskScheduler {
    fn name(&self) -> &str {
        &self.label
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.store.subscribe(&self.keys.schedule_channel).await
    }

    async fn on_subscribe(&mut self, timer: &mut WakeTimer) {
        self.promote(timer).await;
    }

    async fn on_message(&mut self, payload: &str, timer: &mut WakeTimer) {
        match parse_score(payload) {
            Some(at) => {
                timer.arm(at);
            }
            None => {
                warn!(task = %self.keys.name, payload = %payload, "Ignoring malformed schedule notification");
            }
        }
    }

    async fn on_wake(&mut self, timer: &mut WakeTimer) {
        self.promote(timer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn scheduler(store: &MemoryStore, batch: usize) -> TaskScheduler {
        TaskScheduler::new(
            Arc::new(store.clone()),
            TaskKeys::new("sched"),
            TaskConfig::default().with_sweep_batch(batch),
        )
    }

    #[tokio::test]
    async fn test_promote_arms_next_schedule() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("sched");
        let now = now_millis();
        store.offer(&keys, "due", b"1", now - 10).await.unwrap();
        store.offer(&keys, "later", b"2", now + 60_000).await.unwrap();

        let mut scheduler = scheduler(&store, 10);
        let mut timer = WakeTimer::new();
        scheduler.on_wake(&mut timer).await;

        assert_eq!(timer.deadline(), Some(now + 60_000));
        assert_eq!(store.task_stats(&keys).await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_full_batch_rearms_immediately() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("sched");
        let now = now_millis();
        for id in ["a", "b", "c"] {
            store.offer(&keys, id, b"x", now - 10).await.unwrap();
        }

        let mut scheduler = scheduler(&store, 2);
        let mut timer = WakeTimer::new();
        scheduler.on_wake(&mut timer).await;

        let armed = timer.deadline().unwrap();
        assert!(armed <= now_millis());
        assert_eq!(store.task_stats(&keys).await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_schedule_notification_arms_timer() {
        let store = MemoryStore::new();
        let mut scheduler = scheduler(&store, 10);
        let mut timer = WakeTimer::new();

        scheduler.on_message("1700000000000", &mut timer).await;
        assert_eq!(timer.deadline(), Some(1_700_000_000_000));

        scheduler.on_message("not-a-time", &mut timer).await;
        assert_eq!(timer.deadline(), Some(1_700_000_000_000));
    }
}
