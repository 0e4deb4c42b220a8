//! Status condition helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;
use crate::error::Error;

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";
/// Serving certificate is inside the rotation window or expired
pub const CONDITION_TYPE_TLS_ROTATING: &str = "TLSRotating";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Update or add a condition
///
/// The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Record a converged pass
pub fn mark_converged(
    conditions: &mut Vec<Condition>,
    active_routes: usize,
    generation: Option<i64>,
) {
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_TRUE,
        "RoutesActive",
        &format!("{active_routes} route(s) active"),
        generation,
    );
    set_condition(
        conditions,
        CONDITION_TYPE_PROGRESSING,
        CONDITION_STATUS_FALSE,
        "Converged",
        "Applied routes match the desired set",
        generation,
    );
}

/// Record a failed pass, with the error kind as the reason
pub fn mark_failed(conditions: &mut Vec<Condition>, error: &Error, generation: Option<i64>) {
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_FALSE,
        error.kind(),
        &error.to_string(),
        generation,
    );
    let progressing = if error.is_retriable() {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    set_condition(
        conditions,
        CONDITION_TYPE_PROGRESSING,
        progressing,
        error.kind(),
        "Reconciliation did not converge",
        generation,
    );
}

/// Degraded tracks whether routes were computed from a stale snapshot
pub fn mark_degraded(conditions: &mut Vec<Condition>, degraded: bool, generation: Option<i64>) {
    if degraded {
        set_condition(
            conditions,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_TRUE,
            "StaleTopology",
            "Topology source unavailable; serving last-known-good snapshot",
            generation,
        );
    } else {
        set_condition(
            conditions,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_FALSE,
            "TopologyFresh",
            "Topology snapshot is current",
            generation,
        );
    }
}
