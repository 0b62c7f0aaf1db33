//! Metrics facade instrumentation.
//!
//! Emits through whatever recorder the application installs; nothing is
//! recorded until [`describe_metrics`] or a recorder is set up.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::codec::FunctionCode;

// Session metrics
const METRIC_ROUND_TRIPS: &str = "thinwire_round_trips_total";
const METRIC_ROUND_TRIP_DURATION: &str = "thinwire_round_trip_seconds";
const METRIC_SESSION_ERRORS: &str = "thinwire_session_errors_total";

// Pool metrics
const METRIC_POOL_WAIT_TIME: &str = "thinwire_pool_wait_seconds";
const METRIC_POOL_DISCARDS: &str = "thinwire_pool_discards_total";
const METRIC_POOL_SIZE: &str = "thinwire_pool_sessions";

/// Register descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(METRIC_ROUND_TRIPS, "Round trips to the server by function");
    describe_histogram!(
        METRIC_ROUND_TRIP_DURATION,
        "Time waiting for a server reply"
    );
    describe_counter!(
        METRIC_SESSION_ERRORS,
        "Sessions moved to the error state"
    );

    describe_histogram!(
        METRIC_POOL_WAIT_TIME,
        "Time waiting for a session from the pool"
    );
    describe_counter!(METRIC_POOL_DISCARDS, "Pooled sessions discarded by reason");
    describe_gauge!(METRIC_POOL_SIZE, "Pool sessions by state");
}

pub(crate) fn record_round_trip(function: FunctionCode, waited: Duration) {
    let function = format!("{function:?}");
    histogram!(METRIC_ROUND_TRIP_DURATION, "function" => function.clone())
        .record(waited.as_secs_f64());
    counter!(METRIC_ROUND_TRIPS, "function" => function).increment(1);
}

pub(crate) fn record_session_error(kind: &'static str) {
    counter!(METRIC_SESSION_ERRORS, "kind" => kind).increment(1);
}

pub(crate) fn record_pool_wait(waited: Duration) {
    histogram!(METRIC_POOL_WAIT_TIME).record(waited.as_secs_f64());
}

pub(crate) fn record_pool_discard(reason: &'static str) {
    counter!(METRIC_POOL_DISCARDS, "reason" => reason).increment(1);
}

pub(crate) fn record_pool_size(idle: usize, in_use: usize) {
    gauge!(METRIC_POOL_SIZE, "state" => "idle").set(idle as f64);
    gauge!(METRIC_POOL_SIZE, "state" => "in_use").set(in_use as f64);
}
