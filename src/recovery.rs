//! Startup Recovery (C11, §4.11): rehydrate in-flight jobs from the
//! persistent store into the live registries and work queue.

use tracing::{info, instrument, warn};

use crate::error::RecoveryError;
use crate::ids::TaskId;
use crate::model::{JobState, TaskState};
use crate::persistence::PersistenceStore;
use crate::queue::WorkQueue;
use crate::resolver::Registries;

/// The task states a restart resets back to `pending` so the scheduler
/// re-derives their workunits from scratch, since whatever worker or
/// in-flight checkout owned them is gone (§4.11).
fn is_resettable(state: TaskState) -> bool {
    matches!(state, TaskState::Queued | TaskState::InProgress)
}

/// Query the store for jobs in `{queuing, queued, in-progress, suspended}`,
/// rehydrate each job's WI/task tree into `registries`, reset resettable
/// tasks to pending with their workunits cleared, and restore the live
/// queue's state for everything else. Suspended jobs are loaded but left
/// untouched — they re-enter scheduling only when resumed to `queuing`.
#[instrument(skip(store, registries, queue))]
pub async fn recover(
    store: &dyn PersistenceStore,
    registries: &Registries,
    queue: &WorkQueue,
) -> Result<usize, RecoveryError> {
    let jobs = store
        .load_recoverable_jobs()
        .await
        .map_err(|e| RecoveryError::Persistence(e.to_string()))?;

    let mut recovered = 0;
    for job in jobs {
        let job_id = job.id;
        let job_suspended = job.state == JobState::Suspended;
        registries.jobs.upsert(job_id, job);

        let wis = store
            .load_wis_for_job(job_id)
            .await
            .map_err(|e| RecoveryError::Persistence(e.to_string()))?;
        for wi in wis {
            registries.wis.upsert(wi.id, wi);
        }

        let tasks = store
            .load_tasks_for_job(job_id)
            .await
            .map_err(|e| RecoveryError::Persistence(e.to_string()))?;
        for mut task in tasks {
            let task_id = task.id.clone();
            if !job_suspended && is_resettable(task.state) {
                reset_task(&mut task);
            } else if !task.state.is_terminal() {
                restore_workunits(store, queue, &task_id).await?;
            }
            registries.tasks.upsert(task_id, task);
        }

        recovered += 1;
        if job_suspended {
            info!(job = %job_id, "recovered suspended job, left unscheduled");
        } else {
            info!(job = %job_id, "recovered in-flight job");
        }
    }

    Ok(recovered)
}

/// AWE's zombie check (§B supplemented feature): jobs the store reports as
/// active but which `recover()` did not end up placing in `registries` —
/// useful as a post-recovery completeness assertion.
pub fn find_zombies(persisted_ids: &[crate::ids::JobId], registries: &Registries) -> Vec<crate::ids::JobId> {
    persisted_ids
        .iter()
        .copied()
        .filter(|id| registries.jobs.get(id).is_none())
        .collect()
}

fn reset_task(task: &mut crate::model::Task) {
    task.state = TaskState::Pending;
    task.total_work = 0;
    task.remaining_work = 0;
}

async fn restore_workunits(
    store: &dyn PersistenceStore,
    queue: &WorkQueue,
    task_id: &TaskId,
) -> Result<(), RecoveryError> {
    let workunits = store
        .load_workunits_for_task(task_id)
        .await
        .map_err(|e| RecoveryError::Persistence(e.to_string()))?;
    for wu in workunits {
        if queue.get(&wu.id).is_none() {
            queue.add(wu);
        } else {
            warn!(workunit = %task_id, "workunit already present in live queue during recovery");
        }
    }
    Ok(())
}
