//! Metrics hooks for the ingestion queue.
//!
//! Thin wrappers over the `metrics` facade. Nothing is exported unless the
//! embedding binary installs a recorder.

use metrics::{counter, gauge};

/// Record the result of a `submit` call.
pub fn record_submission(result: &str) {
    counter!(
        "sluice_submissions_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record the result of a `report_outcome` call.
pub fn record_outcome(result: &str) {
    counter!(
        "sluice_outcomes_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record an item entering the dead-letter store.
pub fn record_dead_letter(reason: &str) {
    counter!(
        "sluice_dead_letters_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a circuit breaker state change.
pub fn record_breaker_transition(to_state: &str) {
    counter!(
        "sluice_breaker_transitions_total",
        "state" => to_state.to_string()
    )
    .increment(1);
}

/// Non-terminal items currently held by the queue.
pub fn set_active_items(count: usize) {
    gauge!("sluice_active_items").set(count as f64);
}

/// Record a snapshot save that failed and was deferred.
pub fn record_persist_failure() {
    counter!("sluice_persist_failures_total").increment(1);
}
