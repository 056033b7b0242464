//! Workflow document and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// High-level workflow status.
///
/// Allowed transitions: inactive → active → {completed, paused, error},
/// paused → active. Completed and error are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but never started.
    Inactive,
    /// Steps are being dispatched and executed.
    Active,
    /// Execution suspended; in-flight jobs become no-ops.
    Paused,
    /// All steps ran to completion.
    Completed,
    /// A step failed permanently with no alternate route.
    Error,
}

impl WorkflowStatus {
    /// Whether `self → to` is a legal transition.
    pub fn can_transition(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Inactive, Active)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Error)
                | (Paused, Active)
        )
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Error)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Creator/modifier bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub created_by: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<Uuid>,
}

/// A multi-step follow-up protocol bound to a doctor and a set of patients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub doctor_id: Uuid,
    pub patient_ids: Vec<Uuid>,
    /// Step ids in `order` sequence.
    pub step_ids: Vec<Uuid>,
    pub status: WorkflowStatus,
    /// Advisory pointer only; the per-step statuses are authoritative.
    pub current_step_index: usize,
    pub metadata: WorkflowMetadata,
    /// Optimistic concurrency counter, bumped on every save.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a new inactive workflow with no steps attached yet.
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        doctor_id: Uuid,
        patient_ids: Vec<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            doctor_id,
            patient_ids,
            step_ids: Vec::new(),
            status: WorkflowStatus::Inactive,
            current_step_index: 0,
            metadata: WorkflowMetadata {
                created_by: doctor_id,
                updated_by: None,
            },
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the given patient is enrolled in this workflow.
    pub fn has_patient(&self, patient_id: Uuid) -> bool {
        self.patient_ids.contains(&patient_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use WorkflowStatus::*;
        assert!(Inactive.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Active.can_transition(Completed));
        assert!(Active.can_transition(Error));
        assert!(Paused.can_transition(Active));

        assert!(!Inactive.can_transition(Completed));
        assert!(!Completed.can_transition(Active));
        assert!(!Error.can_transition(Active));
        assert!(!Paused.can_transition(Completed));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Error.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&WorkflowStatus::Inactive).unwrap();
        assert_eq!(json, "\"inactive\"");
    }

    #[test]
    fn test_has_patient() {
        let patient = Uuid::new_v4();
        let workflow = Workflow::new("post-op", None, Uuid::new_v4(), vec![patient]);
        assert!(workflow.has_patient(patient));
        assert!(!workflow.has_patient(Uuid::new_v4()));
    }
}
