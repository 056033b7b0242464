//! Ephemeral queue job for a single step execution attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue partition with its own concurrency, retry and priority policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Bulk reminder/task traffic, exponential backoff.
    Normal,
    /// Alert steps: more attempts, short fixed backoff, highest priority.
    Priority,
    /// Schedule-bearing steps with recurring re-submission.
    Scheduled,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Normal, Lane::Priority, Lane::Scheduled];
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Priority => write!(f, "priority"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Unit of work submitted to the broker. Owned by the queue, never
/// persisted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepJob {
    pub step_id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub workflow_id: Uuid,
    /// Unique per attempt chain.
    pub execution_id: Uuid,
}

impl StepJob {
    pub fn new(step_id: Uuid, patient_id: Uuid, doctor_id: Uuid, workflow_id: Uuid) -> Self {
        Self {
            step_id,
            patient_id,
            doctor_id,
            workflow_id,
            execution_id: Uuid::new_v4(),
        }
    }
}

/// Deterministic de-duplication key for scheduling the same step for
/// the same patient. Bucketed to the enqueue minute so retried enqueue
/// calls collapse while later re-dispatches (recurrence, unblocked
/// dependencies) still go through.
pub fn idempotency_key(step_id: Uuid, patient_id: Uuid, enqueued_at: DateTime<Utc>) -> String {
    let bucket = enqueued_at.timestamp() / 60;
    format!("{step_id}:{patient_id}:{bucket}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_idempotency_key_stable_within_bucket() {
        let step = Uuid::new_v4();
        let patient = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 5).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 55).unwrap();
        assert_eq!(
            idempotency_key(step, patient, t0),
            idempotency_key(step, patient, t1)
        );
    }

    #[test]
    fn test_idempotency_key_changes_across_buckets() {
        let step = Uuid::new_v4();
        let patient = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 59).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 31, 0).unwrap();
        assert_ne!(
            idempotency_key(step, patient, t0),
            idempotency_key(step, patient, t1)
        );
    }

    #[test]
    fn test_lane_display() {
        assert_eq!(Lane::Priority.to_string(), "priority");
        assert_eq!(Lane::ALL.len(), 3);
    }
}
