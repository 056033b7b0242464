//! Workflow step document: type, condition, action, schedule and the
//! step status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Step kind, determining which action handler runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Reminder,
    Task,
    Alert,
    Appointment,
    AnalysisTest,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reminder => write!(f, "reminder"),
            Self::Task => write!(f, "task"),
            Self::Alert => write!(f, "alert"),
            Self::Appointment => write!(f, "appointment"),
            Self::AnalysisTest => write!(f, "analysis_test"),
        }
    }
}

/// Step execution status.
///
/// `pending → queued → completed | failed | skipped`, with
/// `waiting_condition` as a re-entrant side branch reachable from
/// `pending` and returning to `queued` once unblocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Queued,
    WaitingCondition,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::WaitingCondition => write!(f, "waiting_condition"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Comparison operator for parameter-based conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    /// Apply the operator to two numeric values.
    pub fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Operator::Eq => left == right,
            Operator::Ne => left != right,
            Operator::Gt => left > right,
            Operator::Gte => left >= right,
            Operator::Lt => left < right,
            Operator::Lte => left <= right,
        }
    }
}

/// What drives a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    TimeBased,
    ParameterBased,
    /// Externally triggered; evaluation defers to a supplied signal.
    EventBased,
    None,
}

/// Timing descriptor for time-based conditions.
///
/// `after_previous` is a duration token (`<N>d|h|m|s`) converted by the
/// dispatcher into an absolute wake delay at dependency-completion time;
/// it is never re-derived later.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specific_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_previous: Option<String>,
}

/// Condition-driven redirection targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchTargets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Uuid>,
}

impl BranchTargets {
    pub fn is_empty(&self) -> bool {
        self.on_success.is_none() && self.on_failure.is_none()
    }
}

/// Condition descriptor attached to a step, evaluated against the
/// step's own result after it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    /// Parameter name looked up on the step result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub branch: BranchTargets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<ConditionTiming>,
}

impl Condition {
    /// A condition that always holds and never redirects.
    pub fn none() -> Self {
        Self {
            kind: ConditionKind::None,
            parameter: None,
            operator: None,
            threshold: None,
            branch: BranchTargets::default(),
            timing: None,
        }
    }
}

/// Who a notification goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTarget {
    Patient,
    Doctor,
    Both,
}

/// Clinical urgency of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Type-specific action payload, validated at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    Reminder {
        message: String,
        target: NotifyTarget,
    },
    Task {
        description: String,
        /// Outcome values merged into the step result, available to
        /// parameter-based branch conditions.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Alert {
        message: String,
        severity: AlertSeverity,
    },
    Appointment {
        reason: String,
        /// Duration token (`<N>d|h|m|s`) from execution to the
        /// requested appointment slot.
        #[serde(skip_serializing_if = "Option::is_none")]
        lead_time: Option<String>,
    },
    AnalysisTest {
        test_name: String,
        required_fields: Vec<String>,
    },
}

impl ActionSpec {
    /// The step type this action belongs to.
    pub fn step_type(&self) -> StepType {
        match self {
            ActionSpec::Reminder { .. } => StepType::Reminder,
            ActionSpec::Task { .. } => StepType::Task,
            ActionSpec::Alert { .. } => StepType::Alert,
            ActionSpec::Appointment { .. } => StepType::Appointment,
            ActionSpec::AnalysisTest { .. } => StepType::AnalysisTest,
        }
    }
}

/// Append-only execution log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Recurrence kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

/// Schedule descriptor for time-driven and recurring steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Units between occurrences (days/weeks/months); defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Recurring schedules re-arm the step after each occurrence.
    pub fn is_recurring(&self) -> bool {
        self.schedule_type != ScheduleType::Once
    }
}

/// A single step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Position in the workflow, unique and ascending.
    pub order: u32,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub action: ActionSpec,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_logs: Vec<ExecutionLogEntry>,
    /// Step ids that must be completed before this step may run.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    /// Optimistic concurrency counter, bumped on every save.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    pub fn new(
        workflow_id: Uuid,
        name: impl Into<String>,
        order: u32,
        action: ActionSpec,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            name: name.into(),
            description: None,
            order,
            step_type: action.step_type(),
            condition: None,
            action,
            status: StepStatus::Pending,
            result: None,
            execution_logs: Vec::new(),
            dependencies: Vec::new(),
            schedule: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an execution log entry. Logs are never removed.
    pub fn log(
        &mut self,
        status: impl Into<String>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        self.execution_logs.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            status: status.into(),
            message: message.into(),
            details,
        });
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.as_ref().is_some_and(|s| s.is_recurring())
    }
}
