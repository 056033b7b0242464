//! Typed documents the engine operates on.

pub mod job;
pub mod record;
pub mod step;
pub mod workflow;

pub use job::{idempotency_key, Lane, StepJob};
pub use record::{AuditRecord, Doctor, Patient};
pub use step::{
    ActionSpec, AlertSeverity, BranchTargets, Condition, ConditionKind, ConditionTiming,
    ExecutionLogEntry, NotifyTarget, Operator, Schedule, ScheduleType, StepStatus, StepType,
    WorkflowStep,
};
pub use workflow::{Workflow, WorkflowMetadata, WorkflowStatus};
