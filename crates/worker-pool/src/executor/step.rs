//! Step executor.

use std::sync::Arc;

use serde_json::json;

use carepath_engine::audit::AuditOutbox;
use carepath_engine::engine::{Dispatcher, NextStepResolver};
use carepath_engine::error::{EngineError, EngineResult};
use carepath_engine::model::{
    AuditRecord, Doctor, Patient, StepJob, StepStatus, Workflow, WorkflowStatus, WorkflowStep,
};
use carepath_engine::notify::NotificationSender;
use carepath_engine::store::{
    update_step, DoctorStore, PatientStore, StepStore, WorkflowStore,
};

use super::handlers;

/// What a delivery amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler ran and the step completed.
    Completed,
    /// Workflow not active; the job is a no-op (pause/cancel point).
    SkippedInactive,
    /// Step already terminal; duplicate delivery absorbed.
    DuplicateDelivery,
}

/// Executes a single step job: loads the surrounding documents, runs
/// the action handler, persists status/result/logs and drives the
/// next-step resolver.
pub struct StepExecutor {
    steps: Arc<dyn StepStore>,
    workflows: Arc<dyn WorkflowStore>,
    patients: Arc<dyn PatientStore>,
    doctors: Arc<dyn DoctorStore>,
    notifier: Arc<dyn NotificationSender>,
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<NextStepResolver>,
    audit: Arc<AuditOutbox>,
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        steps: Arc<dyn StepStore>,
        workflows: Arc<dyn WorkflowStore>,
        patients: Arc<dyn PatientStore>,
        doctors: Arc<dyn DoctorStore>,
        notifier: Arc<dyn NotificationSender>,
        dispatcher: Arc<Dispatcher>,
        resolver: Arc<NextStepResolver>,
        audit: Arc<AuditOutbox>,
    ) -> Self {
        Self {
            steps,
            workflows,
            patients,
            doctors,
            notifier,
            dispatcher,
            resolver,
            audit,
        }
    }

    /// Execute one delivery.
    ///
    /// Missing entities are fatal and non-retryable; handler failures
    /// propagate so the lane's retry policy applies, with the step left
    /// `failed` and the failure logged.
    pub async fn execute(&self, job: &StepJob) -> EngineResult<ExecutionOutcome> {
        let (step, patient, doctor, workflow) = self.load(job).await?;

        if workflow.status != WorkflowStatus::Active {
            tracing::info!(
                step_id = %step.id,
                workflow_id = %workflow.id,
                status = %workflow.status,
                "Workflow not active, job skipped"
            );
            return Ok(ExecutionOutcome::SkippedInactive);
        }
        // Failed is terminal for the state machine but redeliveries of a
        // failed job are the retry path, so only completed/skipped steps
        // absorb duplicates (recurring steps re-arm after completion).
        if matches!(step.status, StepStatus::Completed | StepStatus::Skipped)
            && !step.is_recurring()
        {
            tracing::debug!(
                step_id = %step.id,
                status = %step.status,
                "Step already terminal, duplicate delivery absorbed"
            );
            return Ok(ExecutionOutcome::DuplicateDelivery);
        }

        match handlers::run(&step, &patient, &doctor, self.notifier.as_ref()).await {
            Ok(result) => {
                let completed = update_step(self.steps.as_ref(), step.id, |s| {
                    s.status = StepStatus::Completed;
                    s.result = Some(result.clone());
                    s.log("completed", "Step executed successfully", None);
                })
                .await?;
                tracing::info!(
                    step_id = %completed.id,
                    workflow_id = %workflow.id,
                    step_type = %completed.step_type,
                    "Step completed"
                );
                // Duplicate deliveries are absorbed before the handler
                // runs, so one record lands per actual execution.
                self.audit.submit(AuditRecord::new(
                    job.doctor_id,
                    "workflow_step_execution",
                    format!(
                        "Step '{}' executed for patient {}",
                        completed.name, job.patient_id
                    ),
                    Some(json!({
                        "step_id": completed.id,
                        "workflow_id": workflow.id,
                        "patient_id": job.patient_id,
                        "execution_id": job.execution_id,
                    })),
                ));

                if completed.is_recurring() {
                    // Re-arm the next occurrence. The resolver only runs
                    // once the schedule is exhausted and the recurrence
                    // stops carrying the workflow forward.
                    self.dispatcher
                        .schedule(&completed, &workflow, &[job.patient_id])
                        .await?;
                    let rearmed = self.require_step(step.id).await?;
                    if rearmed.status == StepStatus::Queued {
                        return Ok(ExecutionOutcome::Completed);
                    }
                    self.resolver
                        .resolve_next(&rearmed, &patient, &doctor, &workflow)
                        .await?;
                    return Ok(ExecutionOutcome::Completed);
                }

                self.resolver
                    .resolve_next(&completed, &patient, &doctor, &workflow)
                    .await?;
                Ok(ExecutionOutcome::Completed)
            }
            Err(err) => {
                // Status and log are persisted even when the side effect
                // failed; the error then rides back to the queue.
                update_step(self.steps.as_ref(), step.id, |s| {
                    s.status = StepStatus::Failed;
                    s.log(
                        "failed",
                        "Step execution failed",
                        Some(json!({"error": err.to_string()})),
                    );
                })
                .await?;
                tracing::warn!(
                    step_id = %step.id,
                    workflow_id = %workflow.id,
                    error = %err,
                    "Step execution failed"
                );
                Err(err)
            }
        }
    }

    /// Invoked after a job exhausted its attempts and was dead-lettered:
    /// route through the failure branch or error the workflow.
    pub async fn handle_permanent_failure(&self, job: &StepJob) -> EngineResult<()> {
        let (step, patient, doctor, workflow) = self.load(job).await?;
        self.resolver
            .resolve_failure(&step, &patient, &doctor, &workflow)
            .await
    }

    async fn load(
        &self,
        job: &StepJob,
    ) -> EngineResult<(WorkflowStep, Patient, Doctor, Workflow)> {
        let step = self.require_step(job.step_id).await?;
        let patient = self
            .patients
            .find_patient(job.patient_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("patient {}", job.patient_id)))?;
        let doctor = self
            .doctors
            .find_doctor(job.doctor_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("doctor {}", job.doctor_id)))?;
        let workflow = self
            .workflows
            .find_workflow(job.workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", job.workflow_id)))?;
        Ok((step, patient, doctor, workflow))
    }

    async fn require_step(&self, step_id: uuid::Uuid) -> EngineResult<WorkflowStep> {
        self.steps
            .find_step(step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carepath_engine::audit::{AuditSink, InMemoryAuditSink};
    use carepath_engine::config::EngineConfig;
    use carepath_engine::model::{ActionSpec, NotifyTarget};
    use carepath_engine::notify::InMemoryNotifier;
    use carepath_engine::queue::{InMemoryBroker, QueueBroker};
    use carepath_engine::store::{InMemoryDirectory, InMemoryStepStore, InMemoryWorkflowStore};
    use uuid::Uuid;

    struct Fixture {
        executor: StepExecutor,
        steps: Arc<InMemoryStepStore>,
        workflows: Arc<InMemoryWorkflowStore>,
        audit_sink: Arc<InMemoryAuditSink>,
        audit: Arc<AuditOutbox>,
        patient: Patient,
        doctor: Doctor,
    }

    async fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        let patient = Patient {
            id: Uuid::new_v4(),
            first_name: "Ada".to_string(),
            last_name: "Martin".to_string(),
            email: "ada@example.org".to_string(),
        };
        let doctor = Doctor {
            id: Uuid::new_v4(),
            first_name: "Grace".to_string(),
            last_name: "Okafor".to_string(),
            email: "grace@example.org".to_string(),
            speciality: None,
        };
        directory.add_patient(patient.clone()).await;
        directory.add_doctor(doctor.clone()).await;

        let steps = Arc::new(InMemoryStepStore::new());
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = Arc::new(Dispatcher::new(
            steps.clone() as Arc<dyn StepStore>,
            broker as Arc<dyn QueueBroker>,
            EngineConfig::default(),
        ));
        let audit_sink = Arc::new(InMemoryAuditSink::new());
        let audit = Arc::new(AuditOutbox::spawn(
            audit_sink.clone() as Arc<dyn AuditSink>,
            64,
        ));
        let resolver = Arc::new(NextStepResolver::new(
            steps.clone() as Arc<dyn StepStore>,
            workflows.clone() as Arc<dyn WorkflowStore>,
            dispatcher.clone(),
            audit.clone(),
        ));
        let executor = StepExecutor::new(
            steps.clone() as Arc<dyn StepStore>,
            workflows.clone() as Arc<dyn WorkflowStore>,
            directory.clone() as Arc<dyn PatientStore>,
            directory as Arc<dyn DoctorStore>,
            Arc::new(InMemoryNotifier::new()),
            dispatcher,
            resolver,
            audit.clone(),
        );
        Fixture {
            executor,
            steps,
            workflows,
            audit_sink,
            audit,
            patient,
            doctor,
        }
    }

    async fn active_workflow(fx: &Fixture) -> Workflow {
        let mut workflow = Workflow::new("post-op", None, fx.doctor.id, vec![fx.patient.id]);
        workflow.status = WorkflowStatus::Active;
        fx.workflows.insert_workflow(workflow).await.unwrap()
    }

    fn reminder(workflow_id: Uuid) -> WorkflowStep {
        let mut step = WorkflowStep::new(
            workflow_id,
            "remind",
            1,
            ActionSpec::Reminder {
                message: "take your medication".to_string(),
                target: NotifyTarget::Patient,
            },
        );
        step.status = StepStatus::Queued;
        step
    }

    fn job(fx: &Fixture, step: &WorkflowStep) -> StepJob {
        StepJob::new(step.id, fx.patient.id, fx.doctor.id, step.workflow_id)
    }

    #[tokio::test]
    async fn test_execute_completes_and_logs() {
        let fx = fixture().await;
        let workflow = active_workflow(&fx).await;
        let step = fx.steps.insert_step(reminder(workflow.id)).await.unwrap();

        let outcome = fx.executor.execute(&job(&fx, &step)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert_eq!(saved.status, StepStatus::Completed);
        assert!(saved.result.is_some());
        assert_eq!(saved.execution_logs.last().unwrap().status, "completed");
    }

    #[tokio::test]
    async fn test_execution_recorded_once_in_audit_trail() {
        let fx = fixture().await;
        let workflow = active_workflow(&fx).await;
        let step = fx.steps.insert_step(reminder(workflow.id)).await.unwrap();
        let job = job(&fx, &step);

        let outcome = fx.executor.execute(&job).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        // Redelivery of the completed step must not add a second record.
        let outcome = fx.executor.execute(&job).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::DuplicateDelivery);

        fx.audit.shutdown().await;
        let records = fx.audit_sink.records().await;
        let executions: Vec<_> = records
            .iter()
            .filter(|r| r.action_type == "workflow_step_execution")
            .collect();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].actor_id, fx.doctor.id);
        let metadata = executions[0].metadata.as_ref().unwrap();
        assert_eq!(metadata["step_id"], json!(step.id));
        assert_eq!(metadata["workflow_id"], json!(workflow.id));
        assert_eq!(metadata["patient_id"], json!(fx.patient.id));
    }

    #[tokio::test]
    async fn test_inactive_workflow_skips_job() {
        let fx = fixture().await;
        let workflow = fx
            .workflows
            .insert_workflow(Workflow::new(
                "post-op",
                None,
                fx.doctor.id,
                vec![fx.patient.id],
            ))
            .await
            .unwrap();
        let step = fx.steps.insert_step(reminder(workflow.id)).await.unwrap();

        let outcome = fx.executor.execute(&job(&fx, &step)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::SkippedInactive);
        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert_eq!(saved.status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let fx = fixture().await;
        let workflow = active_workflow(&fx).await;
        let mut step = reminder(workflow.id);
        step.status = StepStatus::Completed;
        let step = fx.steps.insert_step(step).await.unwrap();

        let outcome = fx.executor.execute(&job(&fx, &step)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::DuplicateDelivery);
        // Version untouched: nothing was saved.
        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert_eq!(saved.version, step.version);
    }

    #[tokio::test]
    async fn test_missing_entity_is_fatal() {
        let fx = fixture().await;
        let workflow = active_workflow(&fx).await;
        let step = fx.steps.insert_step(reminder(workflow.id)).await.unwrap();

        let mut orphan = job(&fx, &step);
        orphan.patient_id = Uuid::new_v4();
        let err = fx.executor.execute(&orphan).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_handler_failure_marks_failed_and_propagates() {
        let fx = fixture().await;
        let workflow = active_workflow(&fx).await;
        let mut step = WorkflowStep::new(
            workflow.id,
            "renal panel",
            1,
            ActionSpec::AnalysisTest {
                test_name: "renal panel".to_string(),
                required_fields: vec!["creatinine".to_string()],
            },
        );
        step.status = StepStatus::Queued;
        let step = fx.steps.insert_step(step).await.unwrap();

        let err = fx.executor.execute(&job(&fx, &step)).await.unwrap_err();
        assert!(err.is_retryable());

        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert_eq!(saved.status, StepStatus::Failed);
        assert_eq!(saved.execution_logs.last().unwrap().status, "failed");
    }
}
