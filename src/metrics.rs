use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntGauge, TextEncoder, opts, register_int_counter, register_int_gauge,
};

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hub_connections_total",
        "Total number of accepted client connections"
    ))
    .expect("Failed to register hub_connections_total metric")
});

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "hub_active_sessions",
        "Number of users with a registered session"
    ))
    .expect("Failed to register hub_active_sessions metric")
});

pub static SESSIONS_SUPERSEDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hub_sessions_superseded_total",
        "Sessions replaced by a newer connection for the same user"
    ))
    .expect("Failed to register hub_sessions_superseded_total metric")
});

pub static SESSIONS_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hub_sessions_evicted_total",
        "Sessions disconnected because their outbound queue was full"
    ))
    .expect("Failed to register hub_sessions_evicted_total metric")
});

pub static FRAMES_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hub_frames_delivered_total",
        "Frames placed on a session's outbound queue"
    ))
    .expect("Failed to register hub_frames_delivered_total metric")
});

pub static FRAMES_RECIPIENT_OFFLINE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hub_frames_recipient_offline_total",
        "Frames dropped because the recipient had no session"
    ))
    .expect("Failed to register hub_frames_recipient_offline_total metric")
});

pub static SESSION_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hub_session_failures_total",
        "Sessions that ended on a read, write, timeout or protocol error"
    ))
    .expect("Failed to register hub_session_failures_total metric")
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
