//! Workflow execution engine: condition evaluation, recurrence,
//! dispatch, next-step resolution and the workflow lifecycle.

pub mod condition;
pub mod dispatcher;
pub mod lifecycle;
pub mod recurrence;
pub mod resolver;

use std::time::Duration;

pub use dispatcher::Dispatcher;
pub use lifecycle::{
    ConditionDefinition, CreateWorkflowRequest, StepDefinition, WorkflowLifecycle,
};
pub use resolver::NextStepResolver;

/// Parse a relative duration token: `<N>` followed by `d`, `h`, `m` or
/// `s`. Used by `after_previous` condition timing and appointment lead
/// times.
pub fn parse_duration_token(token: &str) -> Option<Duration> {
    let token = token.trim();
    if token.len() < 2 {
        return None;
    }
    let (number, unit) = token.split_at(token.len() - 1);
    let value: u64 = number.parse().ok()?;
    let seconds = match unit {
        "d" => value.checked_mul(86_400)?,
        "h" => value.checked_mul(3_600)?,
        "m" => value.checked_mul(60)?,
        "s" => value,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_token() {
        assert_eq!(parse_duration_token("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration_token("12h"), Some(Duration::from_secs(43_200)));
        assert_eq!(parse_duration_token("30m"), Some(Duration::from_secs(1_800)));
        assert_eq!(parse_duration_token("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration_token(" 1h "), Some(Duration::from_secs(3_600)));
    }

    #[test]
    fn test_parse_duration_token_rejects_malformed() {
        assert_eq!(parse_duration_token(""), None);
        assert_eq!(parse_duration_token("d"), None);
        assert_eq!(parse_duration_token("3w"), None);
        assert_eq!(parse_duration_token("h3"), None);
        assert_eq!(parse_duration_token("-5m"), None);
    }
}
