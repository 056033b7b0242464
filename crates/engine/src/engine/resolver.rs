//! Next-step resolver: decides what runs after a step finishes.

use std::sync::Arc;

use chrono::Utc;

use crate::audit::AuditOutbox;
use crate::error::EngineResult;
use crate::model::{
    AuditRecord, ConditionKind, Doctor, Patient, StepStatus, Workflow, WorkflowStatus,
    WorkflowStep,
};
use crate::store::{update_workflow, StepStore, WorkflowStore};

use super::condition;
use super::dispatcher::Dispatcher;

/// Applies condition branching, ordinal fallback and dependency checks
/// to route workflow execution after each step completion.
pub struct NextStepResolver {
    steps: Arc<dyn StepStore>,
    workflows: Arc<dyn WorkflowStore>,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<AuditOutbox>,
}

impl NextStepResolver {
    pub fn new(
        steps: Arc<dyn StepStore>,
        workflows: Arc<dyn WorkflowStore>,
        dispatcher: Arc<Dispatcher>,
        audit: Arc<AuditOutbox>,
    ) -> Self {
        Self {
            steps,
            workflows,
            dispatcher,
            audit,
        }
    }

    /// Route execution after `completed` finished successfully.
    ///
    /// Invoked from every step completion, so steps parked in
    /// `waiting_condition` are reconsidered whenever any of their
    /// dependencies clears.
    pub async fn resolve_next(
        &self,
        completed: &WorkflowStep,
        patient: &Patient,
        doctor: &Doctor,
        workflow: &Workflow,
    ) -> EngineResult<()> {
        let all = self.steps.find_by_workflow(workflow.id).await?;

        let is_last = all.iter().all(|s| s.order <= completed.order);
        let has_branch = completed
            .condition
            .as_ref()
            .is_some_and(|c| !c.branch.is_empty());
        if is_last && !has_branch {
            return self.complete_workflow(workflow, doctor).await;
        }

        // Condition branch on the step's own result, then ordinal fallback.
        let mut target = None;
        if let Some(cond) = completed.condition.as_ref() {
            if cond.kind != ConditionKind::None {
                let met = condition::evaluate(cond, completed.result.as_ref(), None, Utc::now());
                let branch_id = if met {
                    cond.branch.on_success
                } else {
                    cond.branch.on_failure
                };
                tracing::debug!(
                    step_id = %completed.id,
                    met,
                    branched = branch_id.is_some(),
                    "Step condition evaluated"
                );
                if let Some(id) = branch_id {
                    target = all.iter().find(|s| s.id == id);
                }
            }
        }
        if target.is_none() {
            target = all.iter().find(|s| {
                s.order > completed.order
                    && matches!(
                        s.status,
                        StepStatus::Pending | StepStatus::WaitingCondition
                    )
            });
        }

        match target {
            Some(next) => {
                tracing::info!(
                    workflow_id = %workflow.id,
                    from_step = %completed.id,
                    to_step = %next.id,
                    "Next step resolved"
                );
                // The dispatcher parks the target if its dependencies
                // are still unmet.
                self.dispatcher
                    .schedule(next, workflow, &[patient.id])
                    .await
            }
            None => {
                let remaining = all.iter().any(|s| {
                    s.id != completed.id && !s.status.is_terminal()
                });
                if remaining {
                    Ok(())
                } else {
                    self.complete_workflow(workflow, doctor).await
                }
            }
        }
    }

    /// Route execution after `failed` exhausted its delivery attempts.
    ///
    /// An `on_failure` branch reroutes the workflow; without one the
    /// workflow transitions to `error` rather than idling forever.
    pub async fn resolve_failure(
        &self,
        failed: &WorkflowStep,
        patient: &Patient,
        doctor: &Doctor,
        workflow: &Workflow,
    ) -> EngineResult<()> {
        let fallback = failed
            .condition
            .as_ref()
            .and_then(|c| c.branch.on_failure);

        if let Some(target_id) = fallback {
            if let Some(target) = self.steps.find_step(target_id).await? {
                tracing::info!(
                    workflow_id = %workflow.id,
                    failed_step = %failed.id,
                    to_step = %target.id,
                    "Failed step rerouted via failure branch"
                );
                return self.dispatcher.schedule(&target, workflow, &[patient.id]).await;
            }
            tracing::warn!(
                step_id = %failed.id,
                target_id = %target_id,
                "Failure branch target does not exist"
            );
        }

        tracing::error!(
            workflow_id = %workflow.id,
            step_id = %failed.id,
            "Step failed permanently with no alternate route, workflow errored"
        );
        if workflow.status.can_transition(WorkflowStatus::Error) {
            update_workflow(self.workflows.as_ref(), workflow.id, |w| {
                if w.status.can_transition(WorkflowStatus::Error) {
                    w.status = WorkflowStatus::Error;
                }
            })
            .await?;
        }
        self.audit.submit(AuditRecord::new(
            doctor.id,
            "workflow_errored",
            format!("Workflow {} errored: step {} failed", workflow.name, failed.name),
            Some(serde_json::json!({
                "workflow_id": workflow.id,
                "step_id": failed.id,
            })),
        ));
        Ok(())
    }

    async fn complete_workflow(&self, workflow: &Workflow, doctor: &Doctor) -> EngineResult<()> {
        // Duplicate deliveries resolve twice; completing an already
        // completed workflow is a no-op.
        if !workflow.status.can_transition(WorkflowStatus::Completed) {
            return Ok(());
        }
        update_workflow(self.workflows.as_ref(), workflow.id, |w| {
            if w.status.can_transition(WorkflowStatus::Completed) {
                w.status = WorkflowStatus::Completed;
            }
        })
        .await?;
        tracing::info!(workflow_id = %workflow.id, "Workflow completed");
        self.audit.submit(AuditRecord::new(
            doctor.id,
            "workflow_completed",
            format!("Workflow {} completed", workflow.name),
            Some(serde_json::json!({"workflow_id": workflow.id})),
        ));
        Ok(())
    }
}
