//! Persistence seams.
//!
//! The engine reads and writes workflows, steps, patients and doctors
//! through these traits. Writes to workflows and steps are optimistic:
//! `save` compares the document's version against the stored one and
//! fails with [`EngineError::Conflict`] on a lost race, so callers do a
//! read-modify-write retry instead of holding locks across await points.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{Doctor, Patient, Workflow, WorkflowStep};

pub use memory::{InMemoryDirectory, InMemoryStepStore, InMemoryWorkflowStore};

/// Patient read access.
#[async_trait]
pub trait PatientStore: Send + Sync {
    async fn find_patient(&self, id: Uuid) -> EngineResult<Option<Patient>>;
}

/// Doctor read access.
#[async_trait]
pub trait DoctorStore: Send + Sync {
    async fn find_doctor(&self, id: Uuid) -> EngineResult<Option<Doctor>>;
}

/// Workflow document storage.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find_workflow(&self, id: Uuid) -> EngineResult<Option<Workflow>>;

    async fn insert_workflow(&self, workflow: Workflow) -> EngineResult<Workflow>;

    /// Versioned save. Fails with [`EngineError::Conflict`] when the
    /// stored document moved past `workflow.version`.
    async fn save_workflow(&self, workflow: Workflow) -> EngineResult<Workflow>;

    async fn delete_workflow(&self, id: Uuid) -> EngineResult<()>;
}

/// Step document storage.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn find_step(&self, id: Uuid) -> EngineResult<Option<WorkflowStep>>;

    async fn insert_step(&self, step: WorkflowStep) -> EngineResult<WorkflowStep>;

    /// Versioned save, same contract as [`WorkflowStore::save_workflow`].
    async fn save_step(&self, step: WorkflowStep) -> EngineResult<WorkflowStep>;

    /// All steps of a workflow, ascending by `order`.
    async fn find_by_workflow(&self, workflow_id: Uuid) -> EngineResult<Vec<WorkflowStep>>;

    /// Whether every listed dependency step is completed.
    async fn dependencies_completed(&self, dependency_ids: &[Uuid]) -> EngineResult<bool>;

    async fn delete_by_workflow(&self, workflow_id: Uuid) -> EngineResult<()>;
}

/// Load a step, apply a mutation and save it, retrying the
/// read-modify-write on version conflicts.
pub async fn update_step<S, F>(store: &S, step_id: Uuid, mut apply: F) -> EngineResult<WorkflowStep>
where
    S: StepStore + ?Sized,
    F: FnMut(&mut WorkflowStep),
{
    const MAX_RACES: u32 = 5;
    for _ in 0..MAX_RACES {
        let mut step = store
            .find_step(step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?;
        apply(&mut step);
        match store.save_step(step).await {
            Ok(saved) => return Ok(saved),
            Err(EngineError::Conflict(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(EngineError::Conflict(format!(
        "step {step_id} kept changing under concurrent writers"
    )))
}

/// Load a workflow, apply a mutation and save it, retrying on version
/// conflicts.
pub async fn update_workflow<S, F>(
    store: &S,
    workflow_id: Uuid,
    mut apply: F,
) -> EngineResult<Workflow>
where
    S: WorkflowStore + ?Sized,
    F: FnMut(&mut Workflow),
{
    const MAX_RACES: u32 = 5;
    for _ in 0..MAX_RACES {
        let mut workflow = store
            .find_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id}")))?;
        apply(&mut workflow);
        match store.save_workflow(workflow).await {
            Ok(saved) => return Ok(saved),
            Err(EngineError::Conflict(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(EngineError::Conflict(format!(
        "workflow {workflow_id} kept changing under concurrent writers"
    )))
}
