//! Metrics module for Prometheus-based monitoring.
//!
//! Counts queue and task transitions, handler latency and worker activity.
//!
//! # Example
//!
//! ```ignore
//! use ackqueue::metrics::{init_metrics, export_metrics};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Queues, task engines and worker pools record automatically.
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MessageOutcome, MetricsCollector, TaskOutcome};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, HANDLER_DURATION, MESSAGES_TOTAL, QUEUE_DEPTH, REGISTRY, TASKS_TOTAL,
};
