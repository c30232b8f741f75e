use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

pub static PUBLISH_SUCCESS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_publish_success_total",
        "Total number of events accepted by the broker"
    )
    .expect("Failed to register event_bus_publish_success_total metric")
});

/// Counts failed attempts, not failed publishes
pub static PUBLISH_ATTEMPT_FAILURE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_publish_attempt_failure_total",
        "Total number of failed publish attempts"
    )
    .expect("Failed to register event_bus_publish_attempt_failure_total metric")
});

pub static PUBLISH_EXHAUSTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_publish_exhausted_total",
        "Total number of publishes that failed after every retry"
    )
    .expect("Failed to register event_bus_publish_exhausted_total metric")
});

pub static PUBLISH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "event_bus_publish_latency_seconds",
        "Latency of a single successful publish attempt in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register event_bus_publish_latency_seconds metric")
});

pub static CONSUME_HANDLED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_consume_handled_total",
        "Total number of events handled without error"
    )
    .expect("Failed to register event_bus_consume_handled_total metric")
});

pub static CONSUME_MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_consume_malformed_total",
        "Total number of undecodable events dropped"
    )
    .expect("Failed to register event_bus_consume_malformed_total metric")
});

pub static CONSUME_HANDLER_FAILURE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_consume_handler_failure_total",
        "Total number of events whose handler returned an error"
    )
    .expect("Failed to register event_bus_consume_handler_failure_total metric")
});

pub static CONSUME_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_consume_errors_total",
        "Total number of broker read errors"
    )
    .expect("Failed to register event_bus_consume_errors_total metric")
});

pub static COMMIT_FAILURE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "event_bus_commit_failure_total",
        "Total number of failed offset commits"
    )
    .expect("Failed to register event_bus_commit_failure_total metric")
});
