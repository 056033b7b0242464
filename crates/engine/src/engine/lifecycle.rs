//! Workflow lifecycle: creation, start, pause/resume and deletion.
//!
//! Step definitions reference each other by `order` (ids do not exist
//! before persistence); creation resolves orders to step ids for
//! dependencies and branch targets.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditOutbox;
use crate::error::{EngineError, EngineResult};
use crate::model::{
    ActionSpec, AuditRecord, BranchTargets, Condition, ConditionKind, ConditionTiming, Operator,
    Schedule, StepStatus, Workflow, WorkflowStatus, WorkflowStep,
};
use crate::store::{
    update_workflow, DoctorStore, PatientStore, StepStore, WorkflowStore,
};

use super::dispatcher::Dispatcher;

/// Condition attached to a step definition. Branch targets name other
/// steps of the same request by their `order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDefinition {
    pub kind: ConditionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<ConditionTiming>,
}

/// One step of a creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub order: u32,
    pub action: ActionSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionDefinition>,
    /// Orders of steps that must complete first.
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

/// Workflow creation request, consumed by the external CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub doctor_id: Uuid,
    pub patient_ids: Vec<Uuid>,
    pub steps: Vec<StepDefinition>,
}

/// Owns workflow status transitions and the create/start/pause/resume/
/// delete entry points.
pub struct WorkflowLifecycle {
    workflows: Arc<dyn WorkflowStore>,
    steps: Arc<dyn StepStore>,
    patients: Arc<dyn PatientStore>,
    doctors: Arc<dyn DoctorStore>,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<AuditOutbox>,
}

impl WorkflowLifecycle {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        steps: Arc<dyn StepStore>,
        patients: Arc<dyn PatientStore>,
        doctors: Arc<dyn DoctorStore>,
        dispatcher: Arc<Dispatcher>,
        audit: Arc<AuditOutbox>,
    ) -> Self {
        Self {
            workflows,
            steps,
            patients,
            doctors,
            dispatcher,
            audit,
        }
    }

    /// Validate and persist a workflow with its ordered step graph.
    pub async fn create_workflow(&self, request: CreateWorkflowRequest) -> EngineResult<Workflow> {
        if request.steps.is_empty() {
            return Err(EngineError::Validation(
                "a workflow needs at least one step".to_string(),
            ));
        }
        if self
            .doctors
            .find_doctor(request.doctor_id)
            .await?
            .is_none()
        {
            return Err(EngineError::Validation(format!(
                "doctor {} does not exist",
                request.doctor_id
            )));
        }
        for &patient_id in &request.patient_ids {
            if self.patients.find_patient(patient_id).await?.is_none() {
                return Err(EngineError::Validation(format!(
                    "patient {patient_id} does not exist"
                )));
            }
        }

        let mut workflow = Workflow::new(
            request.name,
            request.description,
            request.doctor_id,
            request.patient_ids,
        );

        // First pass assigns ids so order references can resolve.
        let mut order_to_id: HashMap<u32, Uuid> = HashMap::new();
        let mut steps: Vec<WorkflowStep> = Vec::with_capacity(request.steps.len());
        for definition in &request.steps {
            let mut step = WorkflowStep::new(
                workflow.id,
                definition.name.clone(),
                definition.order,
                definition.action.clone(),
            );
            step.description = definition.description.clone();
            step.schedule = definition.schedule.clone();
            if order_to_id.insert(definition.order, step.id).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate step order {}",
                    definition.order
                )));
            }
            steps.push(step);
        }

        let resolve = |order: u32| -> EngineResult<Uuid> {
            order_to_id.get(&order).copied().ok_or_else(|| {
                EngineError::Validation(format!("step order {order} does not exist"))
            })
        };
        for (step, definition) in steps.iter_mut().zip(&request.steps) {
            for &order in &definition.dependencies {
                step.dependencies.push(resolve(order)?);
            }
            if let Some(cond) = &definition.condition {
                step.condition = Some(Condition {
                    kind: cond.kind,
                    parameter: cond.parameter.clone(),
                    operator: cond.operator,
                    threshold: cond.threshold,
                    branch: BranchTargets {
                        on_success: cond.on_success.map(resolve).transpose()?,
                        on_failure: cond.on_failure.map(resolve).transpose()?,
                    },
                    timing: cond.timing.clone(),
                });
            }
        }

        steps.sort_by_key(|s| s.order);
        workflow.step_ids = steps.iter().map(|s| s.id).collect();
        for step in steps {
            self.steps.insert_step(step).await?;
        }
        let workflow = self.workflows.insert_workflow(workflow).await?;

        tracing::info!(
            workflow_id = %workflow.id,
            steps = workflow.step_ids.len(),
            "Workflow created"
        );
        self.audit.submit(AuditRecord::new(
            request.doctor_id,
            "workflow_created",
            format!("Workflow {} created", workflow.name),
            Some(serde_json::json!({"workflow_id": workflow.id})),
        ));
        Ok(workflow)
    }

    /// Activate a workflow and dispatch its first eligible step for the
    /// given patient.
    pub async fn start_workflow(
        &self,
        workflow_id: Uuid,
        patient_id: Uuid,
        doctor_id: Uuid,
    ) -> EngineResult<Workflow> {
        let workflow = self.require_workflow(workflow_id).await?;
        if !workflow.has_patient(patient_id) {
            return Err(EngineError::Validation(format!(
                "patient {patient_id} is not enrolled in workflow {workflow_id}"
            )));
        }
        if workflow.step_ids.is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow {workflow_id} has no steps"
            )));
        }
        if !workflow.status.can_transition(WorkflowStatus::Active) {
            return Err(EngineError::Validation(format!(
                "workflow {workflow_id} cannot start from status {}",
                workflow.status
            )));
        }

        let workflow = update_workflow(self.workflows.as_ref(), workflow_id, |w| {
            w.status = WorkflowStatus::Active;
            w.metadata.updated_by = Some(doctor_id);
        })
        .await?;

        let steps = self.steps.find_by_workflow(workflow_id).await?;
        if let Some(first) = steps.iter().find(|s| s.status == StepStatus::Pending) {
            self.dispatcher
                .schedule(first, &workflow, &[patient_id])
                .await?;
        }

        tracing::info!(workflow_id = %workflow.id, patient_id = %patient_id, "Workflow started");
        self.audit.submit(AuditRecord::new(
            doctor_id,
            "workflow_started",
            format!("Workflow {} started", workflow.name),
            Some(serde_json::json!({
                "workflow_id": workflow.id,
                "patient_id": patient_id,
            })),
        ));
        Ok(workflow)
    }

    /// Suspend dispatching. In-flight jobs become no-ops at the
    /// worker's active check; nothing is purged from the queue.
    pub async fn pause_workflow(&self, workflow_id: Uuid, actor_id: Uuid) -> EngineResult<Workflow> {
        let workflow = self.require_workflow(workflow_id).await?;
        if !workflow.status.can_transition(WorkflowStatus::Paused) {
            return Err(EngineError::Validation(format!(
                "workflow {workflow_id} cannot pause from status {}",
                workflow.status
            )));
        }
        let workflow = update_workflow(self.workflows.as_ref(), workflow_id, |w| {
            w.status = WorkflowStatus::Paused;
            w.metadata.updated_by = Some(actor_id);
        })
        .await?;
        tracing::info!(workflow_id = %workflow.id, "Workflow paused");
        self.audit.submit(AuditRecord::new(
            actor_id,
            "workflow_paused",
            format!("Workflow {} paused", workflow.name),
            Some(serde_json::json!({"workflow_id": workflow.id})),
        ));
        Ok(workflow)
    }

    /// Reactivate a paused workflow and re-dispatch its earliest
    /// non-terminal step (jobs skipped while paused were acked away).
    pub async fn resume_workflow(
        &self,
        workflow_id: Uuid,
        actor_id: Uuid,
    ) -> EngineResult<Workflow> {
        let workflow = self.require_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Paused {
            return Err(EngineError::Validation(format!(
                "workflow {workflow_id} is not paused"
            )));
        }
        let workflow = update_workflow(self.workflows.as_ref(), workflow_id, |w| {
            w.status = WorkflowStatus::Active;
            w.metadata.updated_by = Some(actor_id);
        })
        .await?;

        let steps = self.steps.find_by_workflow(workflow_id).await?;
        if let Some(next) = steps.iter().find(|s| !s.status.is_terminal()) {
            self.dispatcher
                .schedule(next, &workflow, &workflow.patient_ids)
                .await?;
        }

        tracing::info!(workflow_id = %workflow.id, "Workflow resumed");
        self.audit.submit(AuditRecord::new(
            actor_id,
            "workflow_resumed",
            format!("Workflow {} resumed", workflow.name),
            Some(serde_json::json!({"workflow_id": workflow.id})),
        ));
        Ok(workflow)
    }

    /// Read model: the workflow document.
    pub async fn get_workflow(&self, workflow_id: Uuid) -> EngineResult<Workflow> {
        self.require_workflow(workflow_id).await
    }

    /// Read model: all steps of a workflow, ordered.
    pub async fn workflow_steps(&self, workflow_id: Uuid) -> EngineResult<Vec<WorkflowStep>> {
        self.require_workflow(workflow_id).await?;
        self.steps.find_by_workflow(workflow_id).await
    }

    /// Cascade delete: steps first, then the workflow document.
    pub async fn delete_workflow(&self, workflow_id: Uuid, actor_id: Uuid) -> EngineResult<()> {
        let workflow = self.require_workflow(workflow_id).await?;
        self.steps.delete_by_workflow(workflow_id).await?;
        self.workflows.delete_workflow(workflow_id).await?;
        tracing::info!(workflow_id = %workflow_id, "Workflow deleted");
        self.audit.submit(AuditRecord::new(
            actor_id,
            "workflow_deleted",
            format!("Workflow {} deleted", workflow.name),
            Some(serde_json::json!({"workflow_id": workflow_id})),
        ));
        Ok(())
    }

    async fn require_workflow(&self, workflow_id: Uuid) -> EngineResult<Workflow> {
        self.workflows
            .find_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id}")))
    }
}
