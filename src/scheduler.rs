//! Scheduler Loop (C8, §4.8): the periodic tick that advances pending WIs
//! and materializes/enqueues tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Map;
use tracing::{instrument, warn};

use crate::completion::{complete_sub_workflow, task_completed, CompletionRegistries};
use crate::config::SchedulerConfig;
use crate::context::{ProcessType as StepProcessType, WorkflowContext};
use crate::error::{IllegalTransition, SchedulerError, SuspensionRecord};
use crate::expression::ExpressionEvaluator;
use crate::ids::{JobId, TaskId, WiId};
use crate::model::{Job, JobState, ProcessType as WiProcessType, Task, TaskState, WiState, WorkflowInstance};
use crate::queue::WorkQueue;
use crate::readiness::{are_source_generators_ready, is_wi_ready};
use crate::resolver::{ResolveCtx, Registries};
use crate::scatter::{expand_scatter, ScatterPlan};

/// Owns the shared registries, queue, and context; the periodic driver for
/// §4.8's `update_wi_map` / `update_task_map` pair.
pub struct Scheduler {
    pub registries: Registries,
    pub queue: Arc<WorkQueue>,
    pub context: Arc<WorkflowContext>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        context: Arc<WorkflowContext>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        queue: Arc<WorkQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registries: Registries::default(),
            queue,
            context,
            evaluator,
            config,
        }
    }

    fn resolve_ctx(&self) -> ResolveCtx<'_> {
        ResolveCtx {
            registries: &self.registries,
            context: &self.context,
            evaluator: self.evaluator.as_ref(),
        }
    }

    /// Run the `for ever { update_wi_map(); update_task_map(); sleep }` loop
    /// (§4.8) until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            let started = Instant::now();
            self.update_wi_map();
            self.update_task_map().await;
            let elapsed = started.elapsed();
            let sleep_for = self.config.clamp_tick(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    /// `update_wi_map` (§4.8): advance pending, non-scatter WIs whose inputs
    /// are ready by materializing each step of their workflow.
    #[instrument(skip(self))]
    pub fn update_wi_map(&self) {
        let ctx = self.resolve_ctx();
        for wi_id in self.registries.wis.keys() {
            let Some(handle) = self.registries.wis.get(&wi_id) else {
                continue;
            };
            let Some(mut wi) = handle.try_write() else {
                continue;
            };
            if wi.state != WiState::Pending || wi.process_type == WiProcessType::Scatter {
                continue;
            }

            let Ok(workflow) = self.context.get_workflow(&wi.workflow_ref) else {
                continue;
            };
            let job_id = wi.job_id;
            let Some(job_handle) = self.registries.jobs.get(&job_id) else {
                continue;
            };
            let job = job_handle.read();

            let (readiness, pinned) = match is_wi_ready(&ctx, &job, &wi, workflow, &wi.inputs.clone()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, wi = %wi_id, "wi readiness check failed");
                    continue;
                }
            };
            if !readiness.ready {
                continue;
            }
            wi.inputs = pinned;

            if workflow.steps.is_empty() {
                wi.transition(WiState::Ready).ok();
                wi.transition(WiState::Queued).ok();
                drop(job);
                drop(wi);
                let regs = CompletionRegistries {
                    jobs: &self.registries.jobs,
                    wis: &self.registries.wis,
                    tasks: &self.registries.tasks,
                };
                if let Err(e) = complete_sub_workflow(&regs, &ctx, job_id, wi_id) {
                    warn!(error = %e, wi = %wi_id, "zero-step wi completion failed");
                }
                continue;
            }

            wi.remaining_steps = workflow.steps.len() as u32;
            for step in &workflow.steps {
                match self.context.get_process_type(step) {
                    StepProcessType::Workflow => {
                        let child = wi.child(&step.name, step.run.clone());
                        wi.child_wis.push(child.id);
                        self.registries.wis.upsert(child.id, child);
                    }
                    StepProcessType::CommandLineTool | StepProcessType::ExpressionTool => {
                        let path = format!("{}/{}", wi.local_name, step.name);
                        let task_id = TaskId::new(job_id, path);
                        wi.child_tasks.push(task_id.clone());
                        let task = Task::new(task_id.clone(), wi.id, step.name.clone());
                        self.registries.tasks.upsert(task_id, task);
                    }
                }
            }

            wi.transition(WiState::Ready).ok();
            wi.transition(WiState::Queued).ok();
        }
    }

    /// `update_task_map` (§4.8): a bounded worker pool consumes
    /// init/pending tasks, trylocking each to avoid blocking completion
    /// propagation.
    #[instrument(skip(self))]
    pub async fn update_task_map(&self) {
        use futures::stream::{self, StreamExt};

        let ids = self.registries.tasks.keys();
        stream::iter(ids)
            .for_each_concurrent(self.config.worker_pool_size, |task_id| async move {
                self.try_enqueue_task(&task_id);
            })
            .await;
    }

    fn try_enqueue_task(&self, task_id: &TaskId) {
        let Some(handle) = self.registries.tasks.get(task_id) else {
            return;
        };
        let Some(mut task) = handle.try_write() else {
            return; // contended; revisit next tick
        };
        if !matches!(task.state, TaskState::Init | TaskState::Pending) {
            return;
        }
        if task.state == TaskState::Init {
            task.transition(TaskState::Pending).ok();
        }

        let ctx = self.resolve_ctx();
        let wi_handle = self.registries.wis.get(&task.owner_wi);
        let Some(wi_handle) = wi_handle else { return };
        let wi = wi_handle.read();
        let Ok(workflow) = self.context.get_workflow(&wi.workflow_ref) else {
            return;
        };
        let Ok(step) = self.context.get_step(workflow, &task.step_name) else {
            return;
        };
        let Some(job_handle) = self.registries.jobs.get(&wi.job_id) else {
            return;
        };
        let job = job_handle.read();

        let ready = match are_source_generators_ready(&ctx, &job, &wi, &wi.inputs, step) {
            Ok(r) => r,
            Err(e) => {
                self.suspend_task_and_job(&mut task, &job_handle, &format!("readiness error: {e}"));
                return;
            }
        };
        if !ready {
            return;
        }

        if !step.scatter.is_empty() {
            match expand_scatter(&ctx, &job, &wi, step) {
                Ok(ScatterPlan::EmptyScatter) => {
                    self.finish_empty_scatter(&mut task, step);
                    let job_id = task.id.job_id;
                    let completed_task_id = task.id.clone();
                    drop(task);
                    drop(job);
                    drop(wi);
                    let regs = CompletionRegistries {
                        jobs: &self.registries.jobs,
                        wis: &self.registries.wis,
                        tasks: &self.registries.tasks,
                    };
                    if let Err(e) = task_completed(&regs, &ctx, job_id, &completed_task_id) {
                        warn!(error = %e, task = %completed_task_id, "empty scatter completion propagation failed");
                    }
                }
                Ok(ScatterPlan::Children(children)) => {
                    task.is_scatter = true;
                    task.total_work = children.len() as u32;
                    task.remaining_work = children.len() as u32;
                    for (i, _child) in children.into_iter().enumerate() {
                        self.queue.add(crate::model::Workunit::new(
                            crate::ids::WorkunitId::new(task.id.clone(), i as u32),
                            job.priority,
                            chrono::Utc::now(),
                        ));
                    }
                    task.transition(TaskState::Ready).ok();
                    task.transition(TaskState::Queued).ok();
                }
                Err(e) => {
                    self.suspend_task_and_job(&mut task, &job_handle, &format!("scatter error: {e}"));
                }
            }
            return;
        }

        task.total_work = 1;
        task.remaining_work = 1;
        self.queue.add(crate::model::Workunit::new(
            crate::ids::WorkunitId::new(task.id.clone(), 0),
            job.priority,
            chrono::Utc::now(),
        ));
        task.transition(TaskState::Ready).ok();
        task.transition(TaskState::Queued).ok();
    }

    fn finish_empty_scatter(&self, task: &mut Task, step: &crate::context::Step) {
        task.is_scatter = true;
        for name in &step.outputs {
            task.step_output.insert(name.clone(), serde_json::Value::Array(Vec::new()));
        }
        task.remaining_work = 0;
        task.transition(TaskState::Ready).ok();
        task.transition(TaskState::Queued).ok();
        task.transition(TaskState::InProgress).ok();
        task.transition(TaskState::Completed).ok();
    }

    fn suspend_task_and_job(&self, task: &mut Task, job_handle: &Arc<parking_lot::RwLock<Job>>, reason: &str) {
        task.transition(TaskState::Suspended).ok();
        let mut job = job_handle.write();
        if job.state != crate::model::JobState::Suspended {
            job.suspend(SuspensionRecord::new("suspended", reason.to_string())).ok();
        }
    }

    /// Drive `task_completed` for a finished task (used by the protocol
    /// layer's notice handler, kept here so completion propagation always
    /// goes through the scheduler's registries).
    pub fn complete(&self, job_id: JobId, task_id: &TaskId) -> Result<(), SchedulerError> {
        let ctx = self.resolve_ctx();
        let regs = CompletionRegistries {
            jobs: &self.registries.jobs,
            wis: &self.registries.wis,
            tasks: &self.registries.tasks,
        };
        task_completed(&regs, &ctx, job_id, task_id).map_err(SchedulerError::from)
    }

    /// Resume a suspended job (§4.6, §8 scenario 6): transition it back to
    /// `queuing`, reset every task still in {queued, in-progress, suspended}
    /// to `pending` and discard their live workunits, mirroring the reset
    /// `recovery::recover` applies to a cold-started job.
    pub fn resume_job(&self, job_id: JobId) -> Result<usize, SchedulerError> {
        let job_handle = self.registries.jobs.get(&job_id).ok_or_else(|| {
            SchedulerError::Transition(IllegalTransition {
                entity: format!("job {job_id}"),
                from: "missing".into(),
                to: "Queuing".into(),
            })
        })?;
        job_handle.write().transition(JobState::Queuing)?;

        let mut reset = 0;
        for task_id in self.registries.tasks.keys() {
            if task_id.job_id != job_id {
                continue;
            }
            let Some(task_handle) = self.registries.tasks.get(&task_id) else {
                continue;
            };
            let mut task = task_handle.write();
            if matches!(task.state, TaskState::Queued | TaskState::InProgress | TaskState::Suspended) {
                for wu_id in self.queue.workunit_ids_for_task(&task_id) {
                    self.queue.delete(&wu_id);
                }
                task.state = TaskState::Pending;
                task.total_work = 0;
                task.remaining_work = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{OutputBinding, ParameterDecl, ProcessType, ScatterMethod, Step, WorkflowDef};
    use crate::expression::RhaiEvaluator;
    use crate::ids::JobId;
    use serde_json::json;
    use std::collections::HashMap;

    fn scheduler_with(workflow: WorkflowDef) -> (Scheduler, JobId, WiId) {
        let mut context = WorkflowContext::new();
        context.register_workflow(workflow.clone());
        let scheduler = Scheduler::new(
            Arc::new(context),
            Arc::new(RhaiEvaluator::new()),
            Arc::new(WorkQueue::new()),
            SchedulerConfig::default(),
        );
        let mut job = Job::new(JobId::new(), 0);
        job.transition(crate::model::JobState::Queuing).ok();
        job.transition(crate::model::JobState::Queued).ok();
        job.transition(crate::model::JobState::InProgress).ok();
        let job_id = job.id;

        let mut root = WorkflowInstance::root(job_id, workflow.name.clone(), Map::new());
        root.inputs.insert("x".into(), json!(1));
        let wi_id = root.id;
        job.root_wi = Some(wi_id);
        scheduler.registries.jobs.add(job_id, job).unwrap();
        scheduler.registries.wis.add(wi_id, root).unwrap();
        (scheduler, job_id, wi_id)
    }

    fn single_step_workflow() -> WorkflowDef {
        WorkflowDef {
            name: "main".into(),
            inputs: vec![ParameterDecl {
                name: "x".into(),
                types: vec!["int".into()],
                default: None,
            }],
            outputs: vec![OutputBinding {
                name: "final".into(),
                sources: vec!["A/out".into()],
                is_array: false,
                types: vec!["int".into()],
            }],
            steps: vec![Step {
                name: "A".into(),
                process_type: ProcessType::CommandLineTool,
                run: "a_tool".into(),
                inputs: HashMap::new(),
                outputs: vec!["out".into()],
                scatter: vec![],
                scatter_method: ScatterMethod::default(),
                no_retry: false,
            }],
        }
    }

    #[test]
    fn update_wi_map_materializes_a_task_for_a_ready_wi() {
        let (scheduler, job_id, wi_id) = scheduler_with(single_step_workflow());
        scheduler.update_wi_map();
        let wi = scheduler.registries.wis.get(&wi_id).unwrap();
        assert_eq!(wi.read().state, WiState::Queued);
        assert_eq!(wi.read().child_tasks.len(), 1);
        let task_id = TaskId::new(job_id, "/A".to_string());
        assert!(scheduler.registries.tasks.contains(&task_id));
    }

    #[tokio::test]
    async fn update_task_map_enqueues_a_workunit_for_a_ready_task() {
        let (scheduler, _job_id, _wi_id) = scheduler_with(single_step_workflow());
        scheduler.update_wi_map();
        scheduler.update_task_map().await;
        assert_eq!(scheduler.queue.queued_len(), 1);
    }

    #[test]
    fn empty_workflow_completes_wi_immediately() {
        let workflow = WorkflowDef {
            name: "empty".into(),
            inputs: vec![ParameterDecl {
                name: "x".into(),
                types: vec!["int".into()],
                default: None,
            }],
            outputs: vec![OutputBinding {
                name: "final".into(),
                sources: vec!["x".into()],
                is_array: false,
                types: vec!["int".into()],
            }],
            steps: vec![],
        };
        let (scheduler, job_id, wi_id) = scheduler_with(workflow);
        scheduler.update_wi_map();

        // A zero-step WI must route through `complete_sub_workflow` just
        // like any other completion, not just flip its own state: its
        // declared outputs get projected (I2), and since this is the job's
        // root WI, the job itself is finalized (P7).
        let wi = scheduler.registries.wis.get(&wi_id).unwrap();
        assert_eq!(wi.read().state, WiState::Completed);
        assert_eq!(wi.read().outputs.get("final"), Some(&json!(1)));
        let job = scheduler.registries.jobs.get(&job_id).unwrap();
        assert_eq!(job.read().state, crate::model::JobState::Completed);
    }

    #[test]
    fn zero_step_subworkflow_propagates_completion_to_parent() {
        let root_workflow = WorkflowDef {
            name: "has_subworkflow".into(),
            inputs: vec![ParameterDecl {
                name: "x".into(),
                types: vec!["int".into()],
                default: None,
            }],
            outputs: vec![],
            steps: vec![Step {
                name: "Child".into(),
                process_type: ProcessType::Workflow,
                run: "empty_sub".into(),
                inputs: HashMap::new(),
                outputs: vec![],
                scatter: vec![],
                scatter_method: ScatterMethod::default(),
                no_retry: false,
            }],
        };
        let empty_sub = WorkflowDef {
            name: "empty_sub".into(),
            inputs: vec![],
            outputs: vec![],
            steps: vec![],
        };

        let mut context = WorkflowContext::new();
        context.register_workflow(root_workflow.clone());
        context.register_workflow(empty_sub);
        let scheduler = Scheduler::new(
            Arc::new(context),
            Arc::new(RhaiEvaluator::new()),
            Arc::new(WorkQueue::new()),
            SchedulerConfig::default(),
        );
        let mut job = Job::new(JobId::new(), 0);
        job.transition(crate::model::JobState::Queuing).ok();
        job.transition(crate::model::JobState::Queued).ok();
        job.transition(crate::model::JobState::InProgress).ok();
        let job_id = job.id;
        let mut root = WorkflowInstance::root(job_id, root_workflow.name.clone(), Map::new());
        root.inputs.insert("x".into(), json!(1));
        let root_wi_id = root.id;
        job.root_wi = Some(root_wi_id);
        scheduler.registries.jobs.add(job_id, job).unwrap();
        scheduler.registries.wis.add(root_wi_id, root).unwrap();

        // Tick 1: materializes the child WI for the `Workflow`-typed step.
        scheduler.update_wi_map();
        let root_wi = scheduler.registries.wis.get(&root_wi_id).unwrap();
        assert_eq!(root_wi.read().state, WiState::Queued);
        assert_eq!(root_wi.read().remaining_steps, 1);
        let child_wi_id = root_wi.read().child_wis[0];
        drop(root_wi);

        // Tick 2: the zero-step child completes, decrements the parent's
        // `remaining_steps`, and that in turn finalizes the root WI and job
        // instead of deadlocking with `remaining_steps` stuck at 1 (P2).
        scheduler.update_wi_map();

        let root_wi = scheduler.registries.wis.get(&root_wi_id).unwrap();
        assert_eq!(root_wi.read().state, WiState::Completed);
        assert_eq!(root_wi.read().remaining_steps, 0);

        let job = scheduler.registries.jobs.get(&job_id).unwrap();
        assert_eq!(job.read().state, crate::model::JobState::Completed);

        // Job finalization sweeps every non-root WI (§4.10 step 5).
        assert!(scheduler.registries.wis.get(&child_wi_id).is_none());
    }
}
