//! Process-wide prometheus metrics.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

pub static DELTA_FETCHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pathstore_delta_fetches_total",
        "Delta fetches issued to the parent node"
    )
    .unwrap()
});

pub static DELTA_ROWS_APPLIED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pathstore_delta_rows_applied_total",
        "Row versions received from the parent and stored locally"
    )
    .unwrap()
});

pub static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("pathstore_cache_entries", "Query cache entries on this node").unwrap()
});

pub static ROWS_PUSHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pathstore_rows_pushed_total",
        "Dirty row versions pushed to the parent node"
    )
    .unwrap()
});

pub static FSM_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pathstore_fsm_transitions_total",
        "State machine transitions written by this node",
        &["machine", "status"]
    )
    .unwrap()
});

pub static AUTH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pathstore_auth_failures_total",
        "Rejected RPC calls by endpoint",
        &["endpoint"]
    )
    .unwrap()
});

pub static SESSION_VALIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pathstore_session_validations_total",
        "Session validations by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Render the default registry in the text exposition format.
pub fn encode_to_string() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(?err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
