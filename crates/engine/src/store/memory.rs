//! In-memory store implementations for embedding and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{Doctor, Patient, StepStatus, Workflow, WorkflowStep};

use super::{DoctorStore, PatientStore, StepStore, WorkflowStore};

/// In-memory patient and doctor directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    patients: RwLock<HashMap<Uuid, Patient>>,
    doctors: RwLock<HashMap<Uuid, Doctor>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_patient(&self, patient: Patient) {
        self.patients.write().await.insert(patient.id, patient);
    }

    pub async fn add_doctor(&self, doctor: Doctor) {
        self.doctors.write().await.insert(doctor.id, doctor);
    }
}

#[async_trait]
impl PatientStore for InMemoryDirectory {
    async fn find_patient(&self, id: Uuid) -> EngineResult<Option<Patient>> {
        Ok(self.patients.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl DoctorStore for InMemoryDirectory {
    async fn find_doctor(&self, id: Uuid) -> EngineResult<Option<Doctor>> {
        Ok(self.doctors.read().await.get(&id).cloned())
    }
}

/// In-memory workflow store with versioned saves.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn find_workflow(&self, id: Uuid) -> EngineResult<Option<Workflow>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn insert_workflow(&self, workflow: Workflow) -> EngineResult<Workflow> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(EngineError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn save_workflow(&self, mut workflow: Workflow) -> EngineResult<Workflow> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows
            .get(&workflow.id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow.id)))?;
        if stored.version != workflow.version {
            return Err(EngineError::Conflict(format!(
                "workflow {} version {} is stale (stored {})",
                workflow.id, workflow.version, stored.version
            )));
        }
        workflow.version += 1;
        workflow.updated_at = Utc::now();
        workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn delete_workflow(&self, id: Uuid) -> EngineResult<()> {
        self.workflows.write().await.remove(&id);
        Ok(())
    }
}

/// In-memory step store with versioned saves.
#[derive(Default)]
pub struct InMemoryStepStore {
    steps: RwLock<HashMap<Uuid, WorkflowStep>>,
}

impl InMemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn find_step(&self, id: Uuid) -> EngineResult<Option<WorkflowStep>> {
        Ok(self.steps.read().await.get(&id).cloned())
    }

    async fn insert_step(&self, step: WorkflowStep) -> EngineResult<WorkflowStep> {
        let mut steps = self.steps.write().await;
        if steps.contains_key(&step.id) {
            return Err(EngineError::Conflict(format!(
                "step {} already exists",
                step.id
            )));
        }
        steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn save_step(&self, mut step: WorkflowStep) -> EngineResult<WorkflowStep> {
        let mut steps = self.steps.write().await;
        let stored = steps
            .get(&step.id)
            .ok_or_else(|| EngineError::NotFound(format!("step {}", step.id)))?;
        if stored.version != step.version {
            return Err(EngineError::Conflict(format!(
                "step {} version {} is stale (stored {})",
                step.id, step.version, stored.version
            )));
        }
        step.version += 1;
        step.updated_at = Utc::now();
        steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn find_by_workflow(&self, workflow_id: Uuid) -> EngineResult<Vec<WorkflowStep>> {
        let steps = self.steps.read().await;
        let mut found: Vec<WorkflowStep> = steps
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.order);
        Ok(found)
    }

    async fn dependencies_completed(&self, dependency_ids: &[Uuid]) -> EngineResult<bool> {
        let steps = self.steps.read().await;
        for id in dependency_ids {
            match steps.get(id) {
                Some(dep) if dep.status == StepStatus::Completed => {}
                // Missing or not yet completed both block the dependent.
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn delete_by_workflow(&self, workflow_id: Uuid) -> EngineResult<()> {
        self.steps
            .write()
            .await
            .retain(|_, s| s.workflow_id != workflow_id);
        Ok(())
    }
}
