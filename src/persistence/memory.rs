//! In-memory [`PersistenceStore`] for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::{is_recoverable, PersistenceStore, StoreError};
use crate::ids::{JobId, TaskId, WiId, WorkunitId};
use crate::model::{Job, Task, WorkflowInstance, Workunit};

/// In-memory store. Provides the same semantics as a real database-backed
/// implementation minus durability across process restarts.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    wis: RwLock<HashMap<WiId, WorkflowInstance>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    workunits: RwLock<HashMap<WorkunitId, Workunit>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn save_wi(&self, wi: &WorkflowInstance) -> Result<(), StoreError> {
        self.wis.write().insert(wi.id, wi.clone());
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn save_workunit(&self, workunit: &Workunit) -> Result<(), StoreError> {
        self.workunits.write().insert(workunit.id.clone(), workunit.clone());
        Ok(())
    }

    async fn load_recoverable_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|j| is_recoverable(j.state))
            .cloned()
            .collect())
    }

    async fn load_wis_for_job(&self, job_id: JobId) -> Result<Vec<WorkflowInstance>, StoreError> {
        Ok(self
            .wis
            .read()
            .values()
            .filter(|wi| wi.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn load_tasks_for_job(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.id.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn load_workunits_for_task(&self, task_id: &TaskId) -> Result<Vec<Workunit>, StoreError> {
        Ok(self
            .workunits
            .read()
            .values()
            .filter(|w| &w.id.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn delete_job_tree(&self, job_id: JobId) -> Result<(), StoreError> {
        self.jobs.write().remove(&job_id);
        self.wis.write().retain(|_, wi| wi.job_id != job_id);
        self.tasks.write().retain(|tid, _| tid.job_id != job_id);
        self.workunits.write().retain(|wid, _| wid.task_id.job_id != job_id);
        Ok(())
    }
}
