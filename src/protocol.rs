//! Checkout / Notice Protocol (C9, §4.9): the worker-facing surface modeled
//! as two request/response verbs over the shared queue and registries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::completion::{project_scatter_output, project_step_output, task_completed, CompletionRegistries};
use crate::config::ProtocolConfig;
use crate::error::{IllegalTransition, ProtocolError, SuspensionRecord};
use crate::ids::{JobId, Registry, TaskId, WiId, WorkunitId};
use crate::model::{Job, JobState, Task, TaskState, Workunit, WorkunitState, WorkflowInstance};
use crate::queue::WorkQueue;
use crate::resolver::ResolveCtx;

/// Worker-reported disposition for a notice (§4.9).
#[derive(Debug, Clone)]
pub enum Disposition {
    Done {
        results: serde_json::Map<String, serde_json::Value>,
        compute_time: f64,
    },
    Error {
        notes: Option<String>,
        stderr: Option<String>,
    },
    FailedPermanent {
        notes: Option<String>,
        stderr: Option<String>,
    },
    Suspend {
        notes: Option<String>,
    },
}

/// Per-worker bookkeeping: consecutive failure count and assigned work.
#[derive(Debug, Default)]
struct WorkerState {
    consecutive_failures: u32,
    assigned: HashSet<WorkunitId>,
    suspended: bool,
}

/// The checkout/notice surface. Owns no registries; borrows the scheduler's
/// shared ones so it composes with [`crate::scheduler::Scheduler`].
pub struct Protocol {
    pub queue: Arc<WorkQueue>,
    pub config: ProtocolConfig,
    queue_suspended: AtomicBool,
    workers: DashMap<String, WorkerState>,
}

impl Protocol {
    pub fn new(queue: Arc<WorkQueue>, config: ProtocolConfig) -> Self {
        Self {
            queue,
            config,
            queue_suspended: AtomicBool::new(false),
            workers: DashMap::new(),
        }
    }

    pub fn suspend_queue(&self) {
        self.queue_suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume_queue(&self) {
        self.queue_suspended.store(false, Ordering::SeqCst);
    }

    /// Checkout request (§4.9): select eligible queued workunits, checking
    /// them out to `worker_id`. `available_bytes` of `None` means unbounded.
    pub fn checkout(&self, worker_id: &str, available_bytes: Option<i64>) -> Result<Vec<Workunit>, ProtocolError> {
        self.checkout_filtered(worker_id, available_bytes, None)
    }

    /// Checkout restricted to a client group and/or pipeline tag (§B
    /// supplemented feature): an opaque pre-filter applied before the
    /// priority/FCFS sort, defaulting to "no filter" so the documented
    /// selection semantics are unchanged when the caller omits it.
    pub fn checkout_filtered(
        &self,
        worker_id: &str,
        available_bytes: Option<i64>,
        jobs: Option<(&Registry<JobId, Job>, Option<&str>, Option<&str>)>,
    ) -> Result<Vec<Workunit>, ProtocolError> {
        if self.queue_suspended.load(Ordering::SeqCst) {
            return Err(ProtocolError::QueueSuspended);
        }

        let max_size = available_bytes.unwrap_or(0);
        let mut eligible = self.queue.select_eligible(max_size);
        if let Some((jobs, client_group, pipeline)) = jobs {
            eligible.retain(|handle| {
                let job_id = handle.read().id.task_id.job_id;
                let Some(job_handle) = jobs.get(&job_id) else {
                    return false;
                };
                let job = job_handle.read();
                let group_ok = match client_group {
                    Some(g) => job.client_group.as_deref() == Some(g),
                    None => true,
                };
                let pipeline_ok = match pipeline {
                    Some(p) => job.pipeline.as_deref() == Some(p),
                    None => true,
                };
                group_ok && pipeline_ok
            });
        }
        if eligible.is_empty() {
            return Err(ProtocolError::NoEligibleWorkunit);
        }

        // FCFS: take the single highest-priority/earliest eligible unit per
        // checkout (a worker may poll repeatedly for more).
        let handle = &eligible[0];
        let id = handle.read().id.clone();
        self.queue
            .status_change(&id, WorkunitState::CheckedOut)
            .map_err(|_| ProtocolError::WorkunitNotFound(id.clone()))?;

        {
            let mut guard = handle.write();
            guard.assigned_worker = Some(worker_id.to_string());
        }

        self.workers
            .entry(worker_id.to_string())
            .or_default()
            .assigned
            .insert(id.clone());

        Ok(vec![handle.read().clone()])
    }

    /// Notice (§4.9): apply a worker's disposition for one workunit.
    pub fn notice(
        &self,
        tasks: &Registry<TaskId, Task>,
        jobs: &Registry<JobId, Job>,
        wis: &Registry<WiId, WorkflowInstance>,
        ctx: &ResolveCtx<'_>,
        worker_id: &str,
        workunit_id: &WorkunitId,
        disposition: Disposition,
    ) -> Result<(), ProtocolError> {
        let handle = self
            .queue
            .get(workunit_id)
            .ok_or_else(|| ProtocolError::WorkunitNotFound(workunit_id.clone()))?;

        {
            let guard = handle.read();
            if guard.assigned_worker.as_deref() != Some(worker_id) {
                return Err(ProtocolError::NotCheckedOutByWorker(
                    workunit_id.clone(),
                    worker_id.to_string(),
                ));
            }
        }

        self.remove_assignment(worker_id, workunit_id);

        let task_id = workunit_id.task_id.clone();
        let regs = CompletionRegistries { jobs, wis, tasks };

        match disposition {
            Disposition::Done { results, compute_time } => {
                self.queue.status_change(workunit_id, WorkunitState::Done).map_err(|_| {
                    ProtocolError::WorkunitNotFound(workunit_id.clone())
                })?;
                let task_handle = tasks.get(&task_id).ok_or_else(|| {
                    ProtocolError::WorkunitNotFound(workunit_id.clone())
                })?;
                let rank = workunit_id.rank;
                // Decrement and observe zero inside the same critical section
                // so exactly one notice sees `remaining_work == 0` even when
                // the other scatter ranks complete concurrently (S1).
                let (job_id, is_final) = {
                    let mut task = task_handle.write();
                    task.compute_time += compute_time;
                    if task.is_scatter {
                        if task.scatter_outputs.len() < task.total_work as usize {
                            task.scatter_outputs.resize(task.total_work as usize, None);
                        }
                        if let Some(slot) = task.scatter_outputs.get_mut(rank as usize) {
                            *slot = Some(results);
                        }
                    } else {
                        task.process_output.extend(results);
                    }
                    if task.remaining_work > 0 {
                        task.remaining_work -= 1;
                    }
                    (task.id.job_id, task.remaining_work == 0)
                };
                if is_final {
                    self.finish_task_outputs(wis, ctx, &task_handle)?;
                    let mut task = task_handle.write();
                    task.transition(TaskState::InProgress).ok();
                    task.transition(TaskState::Completed)?;
                    drop(task);
                    task_completed(&regs, ctx, job_id, &task_id)?;
                }
                Ok(())
            }
            Disposition::FailedPermanent { notes, stderr } => {
                self.queue
                    .status_change(workunit_id, WorkunitState::FailedPermanent)
                    .map_err(|_| ProtocolError::WorkunitNotFound(workunit_id.clone()))?;
                let task_handle = tasks.get(&task_id);
                let job_id = if let Some(task_handle) = &task_handle {
                    let mut task = task_handle.write();
                    task.transition(TaskState::FailedPermanent)?;
                    task.id.job_id
                } else {
                    workunit_id.task_id.job_id
                };
                self.suspend_job(
                    jobs,
                    job_id,
                    SuspensionRecord {
                        worker: Some(worker_id.to_string()),
                        workunit: Some(workunit_id.clone()),
                        task: Some(task_id),
                        server_notes: "task failed permanently".to_string(),
                        work_notes: notes,
                        app_error: stderr,
                        status: "failed_permanent".to_string(),
                    },
                )?;
                Ok(())
            }
            Disposition::Error { notes, stderr } => {
                self.handle_error_notice(tasks, jobs, &task_id, workunit_id, worker_id, notes, stderr)
            }
            Disposition::Suspend { notes } => {
                self.queue
                    .status_change(workunit_id, WorkunitState::Suspended)
                    .map_err(|_| ProtocolError::WorkunitNotFound(workunit_id.clone()))?;
                let job_id = workunit_id.task_id.job_id;
                self.suspend_job(
                    jobs,
                    job_id,
                    SuspensionRecord {
                        worker: Some(worker_id.to_string()),
                        workunit: Some(workunit_id.clone()),
                        task: Some(task_id),
                        server_notes: "worker requested suspend".to_string(),
                        work_notes: notes,
                        app_error: None,
                        status: "suspended".to_string(),
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Project a just-completed task's results into `step_output` (§4.10):
    /// a plain array assembly for a scatter task's per-rank results, or a
    /// direct name match against `process_output` otherwise.
    fn finish_task_outputs(
        &self,
        wis: &Registry<WiId, WorkflowInstance>,
        ctx: &ResolveCtx<'_>,
        task_handle: &std::sync::Arc<parking_lot::RwLock<Task>>,
    ) -> Result<(), ProtocolError> {
        let (owner_wi, step_name, is_scatter) = {
            let task = task_handle.read();
            (task.owner_wi, task.step_name.clone(), task.is_scatter)
        };
        let Some(wi_handle) = wis.get(&owner_wi) else {
            return Ok(());
        };
        let workflow_ref = wi_handle.read().workflow_ref.clone();
        let Ok(workflow) = ctx.context.get_workflow(&workflow_ref) else {
            return Ok(());
        };
        let Ok(step) = ctx.context.get_step(workflow, &step_name) else {
            return Ok(());
        };

        let mut task = task_handle.write();
        if is_scatter {
            project_scatter_output(&mut task, &step.outputs);
            Ok(())
        } else {
            project_step_output(&mut task, &step.outputs, |_| false).map_err(ProtocolError::from)
        }
    }

    fn handle_error_notice(
        &self,
        tasks: &Registry<TaskId, Task>,
        jobs: &Registry<JobId, Job>,
        task_id: &TaskId,
        workunit_id: &WorkunitId,
        worker_id: &str,
        notes: Option<String>,
        stderr: Option<String>,
    ) -> Result<(), ProtocolError> {
        let no_retry = tasks.get(task_id).map(|h| h.read().no_retry).unwrap_or(false);
        let budget = self.config.effective_max_work_failure(no_retry);

        let handle = self
            .queue
            .get(workunit_id)
            .ok_or_else(|| ProtocolError::WorkunitNotFound(workunit_id.clone()))?;
        let failures = {
            let mut w = handle.write();
            w.failures += 1;
            w.failures
        };

        if failures < budget {
            self.queue
                .status_change(workunit_id, WorkunitState::Queued)
                .map_err(|_| ProtocolError::WorkunitNotFound(workunit_id.clone()))?;
        } else {
            self.queue
                .status_change(workunit_id, WorkunitState::Suspended)
                .map_err(|_| ProtocolError::WorkunitNotFound(workunit_id.clone()))?;
            if let Some(task_handle) = tasks.get(task_id) {
                task_handle.write().transition(TaskState::Suspended)?;
            }
            self.suspend_job(
                jobs,
                task_id.job_id,
                SuspensionRecord {
                    worker: Some(worker_id.to_string()),
                    workunit: Some(workunit_id.clone()),
                    task: Some(task_id.clone()),
                    server_notes: format!("workunit exceeded retry budget ({budget})"),
                    work_notes: notes,
                    app_error: stderr,
                    status: "suspended".to_string(),
                },
            )?;
        }

        self.record_client_failure(worker_id);
        Ok(())
    }

    fn record_client_failure(&self, worker_id: &str) {
        let mut entry = self.workers.entry(worker_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.config.max_client_failure {
            entry.suspended = true;
        }
    }

    pub fn is_worker_suspended(&self, worker_id: &str) -> bool {
        self.workers.get(worker_id).map(|e| e.suspended).unwrap_or(false)
    }

    fn remove_assignment(&self, worker_id: &str, workunit_id: &WorkunitId) {
        if let Some(mut entry) = self.workers.get_mut(worker_id) {
            entry.assigned.remove(workunit_id);
        }
    }

    fn suspend_job(&self, jobs: &Registry<JobId, Job>, job_id: JobId, record: SuspensionRecord) -> Result<(), IllegalTransition> {
        if let Some(job_handle) = jobs.get(&job_id) {
            let mut job = job_handle.write();
            if job.state != JobState::Suspended {
                job.suspend(record)?;
            }
        }
        Ok(())
    }
}
