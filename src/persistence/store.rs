//! Persistence trait definition (§4.11, §4.2 "durable store").

use async_trait::async_trait;

use crate::ids::{JobId, TaskId, WorkunitId};
use crate::model::{Job, JobState, Task, WorkflowInstance, Workunit};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("workflow instance not found: {0}")]
    WiNotFound(uuid::Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable store for the job/WI/task/workunit tree.
///
/// Every mutation the scheduler and protocol layers make to an entity is
/// expected to be mirrored here before (or alongside) the in-memory
/// registry update, so that [`crate::recovery::recover`] can rehydrate a
/// consistent tree on restart. Implementations must be thread-safe.
#[async_trait]
pub trait PersistenceStore: Send + Sync + 'static {
    /// Upsert a job record.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Upsert a workflow instance record.
    async fn save_wi(&self, wi: &WorkflowInstance) -> Result<(), StoreError>;

    /// Upsert a task record.
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Upsert a workunit record.
    async fn save_workunit(&self, workunit: &Workunit) -> Result<(), StoreError>;

    /// Jobs in any of the recoverable states (queuing, queued, in-progress,
    /// suspended), queried on startup (§4.11).
    async fn load_recoverable_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// All workflow instances belonging to a job's tree.
    async fn load_wis_for_job(&self, job_id: JobId) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// All tasks belonging to a job's tree.
    async fn load_tasks_for_job(&self, job_id: JobId) -> Result<Vec<Task>, StoreError>;

    /// All workunits belonging to one task.
    async fn load_workunits_for_task(&self, task_id: &TaskId) -> Result<Vec<Workunit>, StoreError>;

    /// Delete every record belonging to a job's tree (job delete, §4.6).
    async fn delete_job_tree(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Jobs that reached `expires_at()` and should be purged (§B), default
    /// no-op since not every store implements expiration sweeping.
    async fn list_expired_jobs(&self, _as_of: chrono::DateTime<chrono::Utc>) -> Result<Vec<JobId>, StoreError> {
        Ok(Vec::new())
    }
}

/// Whether a job state is one `recover()` rehydrates on startup (§4.11).
pub fn is_recoverable(state: JobState) -> bool {
    matches!(
        state,
        JobState::Queuing | JobState::Queued | JobState::InProgress | JobState::Suspended
    )
}
