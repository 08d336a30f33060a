//! Channel metrics.
//!
//! Uses the `metrics` crate facade. Nothing is exported unless the host
//! application installs a recorder.

use metrics::counter;

/// Metric names.
pub mod names {
    pub const PUSHES_TOTAL: &str = "tether_pushes_total";
    pub const PUSH_TIMEOUTS_TOTAL: &str = "tether_push_timeouts_total";
    pub const RATE_LIMITED_TOTAL: &str = "tether_rate_limited_total";
    pub const JOIN_ATTEMPTS_TOTAL: &str = "tether_join_attempts_total";
    pub const REJOINS_SCHEDULED_TOTAL: &str = "tether_rejoins_scheduled_total";
    pub const EVENTS_DISPATCHED_TOTAL: &str = "tether_events_dispatched_total";
}

/// Describe all channel metrics to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::PUSHES_TOTAL, "Total number of pushes handed to the socket");
    metrics::describe_counter!(
        names::PUSH_TIMEOUTS_TOTAL,
        "Total number of pushes that timed out waiting for a reply"
    );
    metrics::describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of pushes refused by the socket rate limiter"
    );
    metrics::describe_counter!(names::JOIN_ATTEMPTS_TOTAL, "Total number of join attempts");
    metrics::describe_counter!(
        names::REJOINS_SCHEDULED_TOTAL,
        "Total number of rejoin attempts scheduled after errors or timeouts"
    );
    metrics::describe_counter!(
        names::EVENTS_DISPATCHED_TOTAL,
        "Total number of inbound events delivered to bindings"
    );
}

/// Record a push handed to the socket.
pub fn record_push(event: &str) {
    counter!(names::PUSHES_TOTAL, "event" => event.to_string()).increment(1);
}

/// Record a push timeout.
pub fn record_push_timeout(event: &str) {
    counter!(names::PUSH_TIMEOUTS_TOTAL, "event" => event.to_string()).increment(1);
}

/// Record a rate-limited push.
pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

/// Record a join attempt.
pub fn record_join_attempt() {
    counter!(names::JOIN_ATTEMPTS_TOTAL).increment(1);
}

/// Record a scheduled rejoin.
pub fn record_rejoin_scheduled() {
    counter!(names::REJOINS_SCHEDULED_TOTAL).increment(1);
}

/// Record an event delivered to `bindings` callbacks.
pub fn record_dispatch(event: &str, bindings: usize) {
    counter!(names::EVENTS_DISPATCHED_TOTAL, "event" => event.to_string())
        .increment(u64::try_from(bindings).unwrap_or(u64::MAX));
}
