//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by ackqueue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all ackqueue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Queue message transitions, labeled by queue name and outcome
/// (pushed, popped, acked, requeued, dead_lettered).
pub static MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Delayed task transitions, labeled by task name and outcome
/// (offered, promoted, succeeded, failed, cancelled, dead_lettered).
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution time in seconds, labeled by kind (message or task).
pub static HANDLER_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Last observed queue sizes, labeled by queue name and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently running a handler.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry that is
/// discarded, so the function is safe to call repeatedly.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let messages_total = CounterVec::new(
        Opts::new("ackqueue_messages_total", "Queue message transitions"),
        &["queue", "outcome"],
    )?;

    let tasks_total = CounterVec::new(
        Opts::new("ackqueue_tasks_total", "Delayed task transitions"),
        &["task", "outcome"],
    )?;

    let handler_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "ackqueue_handler_duration_seconds",
            "Handler execution time in seconds",
        )
        .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 180.0]),
        &["kind"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("ackqueue_queue_depth", "Last observed queue sizes"),
        &["queue", "state"],
    )?;

    let active_workers = Gauge::new(
        "ackqueue_active_workers",
        "Number of workers currently running a handler",
    )?;

    registry.register(Box::new(messages_total.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(handler_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = MESSAGES_TOTAL.set(messages_total);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = HANDLER_DURATION.set(handler_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(messages) = MESSAGES_TOTAL.get() {
            messages.with_label_values(&["export-test", "pushed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("ackqueue_messages_total"));
    }
}
