//! Recording helpers for queue and task metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus statics with consistent
//! labels. Every method is a no-op until `init_metrics()` has run, so library
//! code can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, HANDLER_DURATION, MESSAGES_TOTAL, QUEUE_DEPTH, TASKS_TOTAL,
};
use crate::store::QueueStats;

/// Outcome label for queue message transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Pushed,
    Popped,
    Acked,
    Requeued,
    DeadLettered,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pushed => "pushed",
            Self::Popped => "popped",
            Self::Acked => "acked",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Outcome label for delayed task transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Offered,
    Promoted,
    Succeeded,
    Failed,
    Cancelled,
    DeadLettered,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offered => "offered",
            Self::Promoted => "promoted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Metrics collector for queue and task operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Counts `count` message transitions for `queue`.
    pub fn record_messages(&self, queue: &str, outcome: MessageOutcome, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(messages) = MESSAGES_TOTAL.get() {
            messages
                .with_label_values(&[queue, outcome.as_str()])
                .inc_by(count as f64);
        }

        tracing::trace!(
            queue = queue,
            outcome = outcome.as_str(),
            count = count,
            "Recorded message metric"
        );
    }

    pub fn record_task(&self, task: &str, outcome: TaskOutcome, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks
                .with_label_values(&[task, outcome.as_str()])
                .inc_by(count as f64);
        }

        tracing::trace!(
            task = task,
            outcome = outcome.as_str(),
            count = count,
            "Recorded task metric"
        );
    }

    /// Records how long a handler ran; `kind` is `message` or `task`.
    pub fn record_handler_duration(&self, kind: &str, duration: Duration) {
        if let Some(histogram) = HANDLER_DURATION.get() {
            histogram
                .with_label_values(&[kind])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn record_queue_depth(&self, queue: &str, stats: &QueueStats) {
        let Some(depth) = QUEUE_DEPTH.get() else {
            return;
        };
        for (state, value) in [
            ("pending", stats.pending),
            ("in_flight", stats.in_flight),
            ("dead_lettered", stats.dead_lettered),
        ] {
            depth.with_label_values(&[queue, state]).set(value as f64);
        }
    }

    pub fn worker_started(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    pub fn worker_finished(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(MessageOutcome::DeadLettered.as_str(), "dead_lettered");
        assert_eq!(TaskOutcome::Promoted.as_str(), "promoted");
    }

    #[test]
    fn test_record_messages() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_messages("collector-test", MessageOutcome::Acked, 3);
        collector.record_messages("collector-test", MessageOutcome::Acked, 0);

        let counter = MESSAGES_TOTAL
            .get()
            .unwrap()
            .with_label_values(&["collector-test", "acked"]);
        assert_eq!(counter.get(), 3.0);
    }

    #[test]
    fn test_record_queue_depth() {
        let _ = init_metrics();
        let stats = QueueStats {
            pending: 4,
            in_flight: 2,
            dead_lettered: 1,
            payloads: 6,
        };
        MetricsCollector::new().record_queue_depth("depth-test", &stats);

        let gauge = QUEUE_DEPTH
            .get()
            .unwrap()
            .with_label_values(&["depth-test", "in_flight"]);
        assert_eq!(gauge.get(), 2.0);
    }
}
