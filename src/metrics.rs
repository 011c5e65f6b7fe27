//! Prometheus metrics for the coordination core.
//!
//! Covers the three agents:
//! - Publisher: in-flight records, pending writes, pending state queries,
//!   transaction durations, flush batch sizes, publish failures
//! - Router: routed commands by destination, dead letters by reason
//! - Stream manager: consumer restarts, replay outcomes
//!
//! All metrics register into a custom registry with the `logshard` prefix so
//! embedding applications never collide with them on the default registry.
//! Registration failures fall back to unregistered metrics instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom registry for coordination-core metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("logshard".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Publisher metrics
// =============================================================================

define_gauge_vec!(
    IN_FLIGHT_RECORDS,
    "in_flight_records",
    "Committed state writes not yet confirmed by the projection cursor",
    ["topic", "partition"]
);
define_gauge_vec!(
    PENDING_WRITES,
    "pending_writes",
    "Writes queued for the next flush",
    ["topic", "partition"]
);
define_gauge_vec!(
    PENDING_STATE_QUERIES,
    "pending_state_queries",
    "Outstanding is-state-current queries",
    ["topic", "partition"]
);
define_counter_vec!(
    PUBLISH_FAILURES,
    "publish_failures_total",
    "Flush attempts that failed to publish",
    ["topic", "partition", "kind"]
);
define_counter_vec!(
    STATE_CURRENT_RESULTS,
    "state_current_results_total",
    "Resolutions of is-state-current queries",
    ["result"]
);
define_histogram_vec!(
    TRANSACTION_DURATION,
    "transaction_duration_seconds",
    "Open-to-commit duration of publisher transactions",
    ["topic", "partition"],
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
);
define_histogram_vec!(
    FLUSH_BATCH_SIZE,
    "flush_batch_size",
    "Records published per transaction",
    ["topic", "partition"],
    [1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
);

// =============================================================================
// Router metrics
// =============================================================================

define_counter_vec!(
    ROUTED_COMMANDS,
    "routed_commands_total",
    "Commands routed by destination",
    ["destination"]
);
define_counter_vec!(
    DEAD_LETTERS,
    "dead_letters_total",
    "Messages dead-lettered by the router",
    ["reason"]
);

// =============================================================================
// Stream manager metrics
// =============================================================================

define_counter_vec!(
    CONSUMER_RESTARTS,
    "consumer_restarts_total",
    "Consumer pipeline restarts after failure",
    ["topic"]
);
define_counter_vec!(
    REPLAY_OPERATIONS,
    "replay_operations_total",
    "Replay attempts by outcome",
    ["outcome"]
);

/// Record the resolution of an is-state-current query.
pub fn record_state_current_result(current: bool) {
    let label = if current { "current" } else { "not_current" };
    STATE_CURRENT_RESULTS.with_label_values(&[label]).inc();
}

/// Render every registered metric in Prometheus text format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}
