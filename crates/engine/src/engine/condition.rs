//! Condition evaluator.
//!
//! Pure branch decision over a step's condition descriptor and its own
//! execution result. Fail-safe throughout: malformed descriptors and
//! absent data evaluate to `false` with a warning, never an error.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{Condition, ConditionKind};

/// Evaluate a condition against the step's result.
///
/// `external_signal` feeds event-based conditions (defaults to true);
/// `now` anchors time-based checks. Relative `after_previous` timing is
/// converted into a wake delay by the dispatcher, so it always holds
/// here.
pub fn evaluate(
    condition: &Condition,
    step_result: Option<&Value>,
    external_signal: Option<bool>,
    now: DateTime<Utc>,
) -> bool {
    match condition.kind {
        ConditionKind::None => true,
        ConditionKind::EventBased => external_signal.unwrap_or(true),
        ConditionKind::TimeBased => evaluate_time(condition, now),
        ConditionKind::ParameterBased => evaluate_parameter(condition, step_result),
    }
}

fn evaluate_time(condition: &Condition, now: DateTime<Utc>) -> bool {
    match condition.timing.as_ref() {
        Some(timing) => {
            if let Some(at) = timing.specific_time {
                now >= at
            } else if timing.after_previous.is_some() {
                // Already honored as an absolute wake delay at dispatch.
                true
            } else {
                tracing::warn!("Time-based condition carries no timing descriptor");
                false
            }
        }
        None => {
            tracing::warn!("Time-based condition carries no timing descriptor");
            false
        }
    }
}

fn evaluate_parameter(condition: &Condition, step_result: Option<&Value>) -> bool {
    let (Some(parameter), Some(operator), Some(threshold)) = (
        condition.parameter.as_deref(),
        condition.operator,
        condition.threshold,
    ) else {
        tracing::warn!("Parameter-based condition is missing parameter, operator or threshold");
        return false;
    };

    // Absent data must not branch: missing result or parameter is "not met".
    let Some(value) = step_result.and_then(|r| r.get(parameter)) else {
        tracing::debug!(parameter, "Condition parameter absent from step result");
        return false;
    };
    let Some(actual) = value_to_f64(value) else {
        tracing::warn!(parameter, "Condition parameter is not numeric");
        return false;
    };

    operator.apply(actual, threshold)
}

/// Numeric coercion: JSON numbers and numeric strings only.
fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
