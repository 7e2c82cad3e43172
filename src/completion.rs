//! Completion Propagator (C10, §4.10): last-workunit output projection and
//! recursive WI/job completion.

use serde_json::{Map, Value};

use crate::context::WorkflowDef;
use crate::error::CompletionError;
use crate::ids::{JobId, TaskId, WiId};
use crate::model::{Job, JobState, Task, TaskState, WiState, WorkflowInstance};
use crate::resolver::{resolve, ResolveCtx};
use crate::scatter::FinalizeFlag;
use tracing::info;

/// Project a worker's delivered results into a task's `step_output` by
/// matching each declared output name against `process_output` (§4.10
/// "last workunit"). Missing entries are filled with `null` only when the
/// caller has already established the output is optional.
pub fn project_step_output(task: &mut Task, declared_outputs: &[String], optional: impl Fn(&str) -> bool) -> Result<(), CompletionError> {
    for name in declared_outputs {
        match task.process_output.get(name) {
            Some(value) => {
                task.step_output.insert(name.clone(), value.clone());
            }
            None if optional(name) => {
                task.step_output.insert(name.clone(), Value::Null);
            }
            None => return Err(CompletionError::MissingOutput(task.id.clone(), name.clone())),
        }
    }
    Ok(())
}

/// Aggregate a scattering task's per-rank results into `step_output` arrays,
/// one array per declared output, in rank order (§4.5/§4.10 "scatter
/// child"). Called once `remaining_work` reaches zero.
pub fn project_scatter_output(task: &mut Task, declared_outputs: &[String]) {
    for name in declared_outputs {
        let values: Vec<Value> = task
            .scatter_outputs
            .iter()
            .map(|slot| slot.as_ref().and_then(|m| m.get(name)).cloned().unwrap_or(Value::Null))
            .collect();
        task.step_output.insert(name.clone(), Value::Array(values));
    }
}

/// Registries bundle needed to walk up the WI tree and touch jobs/tasks.
pub struct CompletionRegistries<'a> {
    pub jobs: &'a crate::ids::Registry<JobId, Job>,
    pub wis: &'a crate::ids::Registry<WiId, WorkflowInstance>,
    pub tasks: &'a crate::ids::Registry<TaskId, Task>,
}

/// `task_completed(task)` (§4.10): decrement the owning WI's
/// `remaining_steps`; at zero, recurse into `complete_sub_workflow`.
pub fn task_completed(
    regs: &CompletionRegistries<'_>,
    ctx: &ResolveCtx<'_>,
    job_id: JobId,
    task_id: &TaskId,
) -> Result<(), CompletionError> {
    let owner_wi = {
        let handle = regs.tasks.get(task_id).expect("task must exist to complete");
        handle.read().owner_wi
    };
    let should_finalize = {
        let wi_handle = regs.wis.get(&owner_wi).expect("owner wi must exist");
        let mut wi = wi_handle.write();
        if wi.remaining_steps > 0 {
            wi.remaining_steps -= 1;
        }
        wi.remaining_steps == 0
    };
    if should_finalize {
        complete_sub_workflow(regs, ctx, job_id, owner_wi)?;
    }
    Ok(())
}

/// `complete_sub_workflow(wi)` (§4.10): idempotent, recurses up to job
/// finalization.
pub fn complete_sub_workflow(
    regs: &CompletionRegistries<'_>,
    ctx: &ResolveCtx<'_>,
    job_id: JobId,
    wi_id: WiId,
) -> Result<(), CompletionError> {
    let wi_handle = regs.wis.get(&wi_id).expect("wi must exist");

    // Step 1: idempotency guard.
    {
        let wi = wi_handle.read();
        if wi.state == WiState::Completed {
            return Ok(());
        }
    }

    let (workflow_ref, local_name) = {
        let wi = wi_handle.read();
        (wi.workflow_ref.clone(), wi.local_name.clone())
    };
    let workflow = ctx
        .context
        .get_workflow(&workflow_ref)
        .map_err(|_| CompletionError::OutputTypeMismatch(wi_id, format!("missing workflow {workflow_ref}")))?;

    let outputs = project_workflow_outputs(ctx, regs, job_id, &wi_handle, &local_name, workflow)?;

    let (parent, job_root) = {
        let mut wi = wi_handle.write();
        wi.outputs = outputs;
        wi.transition(WiState::Completed)?;
        (wi.parent, wi.parent.is_none())
    };

    if job_root {
        finalize_job(regs, job_id)?;
    } else if let Some(parent_id) = parent {
        let should_recurse = {
            let parent_handle = regs.wis.get(&parent_id).expect("parent wi must exist");
            let mut parent_wi = parent_handle.write();
            if parent_wi.remaining_steps > 0 {
                parent_wi.remaining_steps -= 1;
            }
            parent_wi.remaining_steps == 0
        };
        if should_recurse {
            complete_sub_workflow(regs, ctx, job_id, parent_id)?;
        }
    }

    Ok(())
}

fn project_workflow_outputs(
    ctx: &ResolveCtx<'_>,
    regs: &CompletionRegistries<'_>,
    job_id: JobId,
    wi_handle: &std::sync::Arc<parking_lot::RwLock<WorkflowInstance>>,
    local_name: &str,
    workflow: &WorkflowDef,
) -> Result<Map<String, Value>, CompletionError> {
    let job_handle = regs.jobs.get(&job_id).expect("job must exist");
    let job = job_handle.read();
    let wi = wi_handle.read();
    let mut outputs = Map::new();

    for output in &workflow.outputs {
        let value = if output.is_array {
            let mut values = Vec::with_capacity(output.sources.len());
            for src in &output.sources {
                let resolved = resolve(ctx, &job, &wi, &wi.inputs, src, true)?;
                values.push(resolved.value);
            }
            Value::Array(values)
        } else {
            let src = output
                .sources
                .first()
                .ok_or_else(|| CompletionError::OutputTypeMismatch(wi.id, output.name.clone()))?;
            resolve(ctx, &job, &wi, &wi.inputs, src, true)?.value
        };

        if !output.types.is_empty() && !type_matches_any(&output.types, &value) {
            return Err(CompletionError::OutputTypeMismatch(wi.id, output.name.clone()));
        }

        let _ = local_name;
        outputs.insert(output.name.clone(), value);
    }
    Ok(outputs)
}

fn type_matches_any(types: &[String], value: &Value) -> bool {
    if value.is_null() {
        return types.iter().any(|t| t == "null");
    }
    types.iter().any(|t| match t.as_str() {
        "null" => false,
        "array" => value.is_array(),
        "int" | "long" => value.is_i64() || value.is_u64(),
        "float" | "double" => value.is_number(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        _ => true,
    })
}

/// §4.10 step 5: transition to completed, stamp `complete_time`, delete the
/// job's task-map entries, and apply the job expiration policy. Idempotent:
/// a job already `Completed` short-circuits before the sweep runs again.
fn finalize_job(regs: &CompletionRegistries<'_>, job_id: JobId) -> Result<(), CompletionError> {
    let job_handle = regs.jobs.get(&job_id).expect("job must exist");
    let already_completed = {
        let mut job = job_handle.write();
        let was_completed = job.state == JobState::Completed;
        if !was_completed {
            job.transition(JobState::Completed)?;
        }
        was_completed
    };
    if already_completed {
        return Ok(());
    }

    let (root_wi, expires_at) = {
        let job = job_handle.read();
        (job.root_wi, job.expires_at())
    };

    for task_id in regs.tasks.keys() {
        if task_id.job_id == job_id {
            regs.tasks.delete(&task_id);
        }
    }

    // Every sub-workflow instance is dropped once finalized except the
    // root, whose `outputs` remains the job's visible result.
    for wi_id in regs.wis.keys() {
        if Some(wi_id) == root_wi {
            continue;
        }
        let belongs_to_job = regs.wis.get(&wi_id).map(|h| h.read().job_id == job_id).unwrap_or(false);
        if belongs_to_job {
            regs.wis.delete(&wi_id);
        }
    }

    if let Some(expires_at) = expires_at {
        info!(job = %job_id, %expires_at, "job finalized, expiration policy applied");
    }

    Ok(())
}

/// A scatter-parent task's "last child" check (§4.10): delegates the actual
/// winner decision to the parent's [`FinalizeFlag`].
pub fn is_last_scatter_child(flag: &FinalizeFlag, all_children_done: bool) -> bool {
    all_children_done && flag.try_finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{OutputBinding, ParameterDecl, ProcessType, ScatterMethod, Step, WorkflowContext};
    use crate::expression::RhaiEvaluator;
    use crate::ids::{JobId as Jid, Registry, TaskId as Tid};
    use crate::model::Task as M;
    use serde_json::json;
    use std::collections::HashMap;

    fn workflow() -> WorkflowDef {
        WorkflowDef {
            name: "main".into(),
            inputs: vec![ParameterDecl {
                name: "x".into(),
                types: vec!["int".into()],
                default: None,
            }],
            outputs: vec![OutputBinding {
                name: "final".into(),
                sources: vec!["B/out".into()],
                is_array: false,
                types: vec!["int".into()],
            }],
            steps: vec![Step {
                name: "B".into(),
                process_type: ProcessType::CommandLineTool,
                run: "b".into(),
                inputs: HashMap::new(),
                outputs: vec!["out".into()],
                scatter: vec![],
                scatter_method: ScatterMethod::default(),
                no_retry: false,
            }],
        }
    }

    #[test]
    fn project_step_output_fills_optional_missing() {
        let mut task = M::new(Tid::new(Jid::new(), "/B".to_string()), uuid::Uuid::now_v7(), "B");
        task.process_output.insert("out".into(), json!(5));
        project_step_output(&mut task, &["out".to_string(), "log".to_string()], |n| n == "log").unwrap();
        assert_eq!(task.step_output.get("out"), Some(&json!(5)));
        assert_eq!(task.step_output.get("log"), Some(&Value::Null));
    }

    #[test]
    fn project_step_output_errors_on_missing_required() {
        let mut task = M::new(Tid::new(Jid::new(), "/B".to_string()), uuid::Uuid::now_v7(), "B");
        let err = project_step_output(&mut task, &["out".to_string()], |_| false).unwrap_err();
        assert!(matches!(err, CompletionError::MissingOutput(_, _)));
    }

    #[test]
    fn project_scatter_output_preserves_rank_order() {
        let mut task = M::new(Tid::new(Jid::new(), "/S".to_string()), uuid::Uuid::now_v7(), "S");
        task.scatter_outputs = (0..3)
            .map(|i| {
                let mut m = Map::new();
                m.insert("out".into(), json!(i));
                Some(m)
            })
            .collect();
        project_scatter_output(&mut task, &["out".to_string()]);
        assert_eq!(task.step_output.get("out"), Some(&json!([0, 1, 2])));
    }

    #[test]
    fn project_scatter_output_fills_missing_rank_with_null() {
        let mut task = M::new(Tid::new(Jid::new(), "/S".to_string()), uuid::Uuid::now_v7(), "S");
        task.scatter_outputs = vec![None];
        project_scatter_output(&mut task, &["out".to_string()]);
        assert_eq!(task.step_output.get("out"), Some(&json!([Value::Null])));
    }

    #[test]
    fn complete_sub_workflow_is_idempotent() {
        let mut context = WorkflowContext::new();
        context.register_workflow(workflow());
        let jobs: Registry<Jid, Job> = Registry::new();
        let wis: Registry<uuid::Uuid, WorkflowInstance> = Registry::new();
        let tasks: Registry<Tid, Task> = Registry::new();

        let job = Job::new(Jid::new(), 0);
        let job_id = job.id;
        jobs.add(job_id, job).unwrap();

        let mut root = WorkflowInstance::root(job_id, "main", serde_json::Map::new());
        root.remaining_steps = 0;
        let wi_id = root.id;
        wis.add(wi_id, root).unwrap();

        let task_id = Tid::new(job_id, "/B".to_string());
        let mut task = M::new(task_id.clone(), wi_id, "B");
        task.state = TaskState::Completed;
        task.step_output.insert("out".into(), json!(42));
        tasks.add(task_id, task).unwrap();

        let registries = crate::resolver::Registries { jobs, wis, tasks };
        let regs = CompletionRegistries {
            jobs: &registries.jobs,
            wis: &registries.wis,
            tasks: &registries.tasks,
        };
        let evaluator = RhaiEvaluator::new();
        let resolve_ctx = ResolveCtx {
            registries: &registries,
            context: &context,
            evaluator: &evaluator,
        };

        complete_sub_workflow(&regs, &resolve_ctx, job_id, wi_id).unwrap();
        complete_sub_workflow(&regs, &resolve_ctx, job_id, wi_id).unwrap();

        let wi = registries.wis.get(&wi_id).unwrap();
        assert_eq!(wi.read().state, WiState::Completed);
        assert_eq!(
            wi.read().outputs.get("final"),
            Some(&json!(42))
        );
        assert_eq!(registries.jobs.get(&job_id).unwrap().read().state, JobState::Completed);
    }
}
