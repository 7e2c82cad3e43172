//! Readiness Oracle (C4, §4.4): is a task or workflow instance ready to run?

use serde_json::{Map, Value};

use crate::context::{InputBinding, Step, WorkflowDef};
use crate::error::ReadinessError;
use crate::model::{Job, WorkflowInstance};
use crate::resolver::{resolve, resolve_binding, ResolveCtx};

/// Outcome of a readiness test: not ready carries the reason the scheduler
/// should surface (e.g. in a suspension record) without treating it as an
/// error — a missing generator is ordinary, not exceptional, until final
/// output projection (§4.10).
#[derive(Debug, Clone)]
pub struct Readiness {
    pub ready: bool,
    pub reason: Option<String>,
}

impl Readiness {
    fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

/// Full readiness test for a step's inputs (§4.4): every input either
/// resolves (non-strict), or admits a default, or admits null.
pub fn is_step_ready(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    workflow_inputs: &Map<String, Value>,
    step: &Step,
) -> Result<Readiness, ReadinessError> {
    for (input_name, binding) in &step.inputs {
        let resolved = resolve_binding(ctx, job, wi, workflow_inputs, binding, &Value::Null, false)?;
        if !resolved.ok && binding.default.is_none() {
            return Ok(Readiness::not_ready(format!(
                "step {} input {input_name} not ready",
                step.name
            )));
        }
    }
    Ok(Readiness::ready())
}

/// Fast hot-path check invoked from the scheduler loop: only look at the
/// generator identities (producing step name or workflow input name), not
/// the full resolved value, and short-circuit on the first not-ready one.
pub fn are_source_generators_ready(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    workflow_inputs: &Map<String, Value>,
    step: &Step,
) -> Result<bool, ReadinessError> {
    for binding in step.inputs.values() {
        if !generator_ready(ctx, job, wi, workflow_inputs, binding)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn generator_ready(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    workflow_inputs: &Map<String, Value>,
    binding: &InputBinding,
) -> Result<bool, ReadinessError> {
    if binding.sources.is_empty() {
        return Ok(true);
    }
    for src in &binding.sources {
        let resolved = resolve(ctx, job, wi, workflow_inputs, src, false)?;
        if !resolved.ok && binding.default.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Readiness test for a sub-workflow instance's bound inputs at
/// instantiation time; on success pins the resolved input document onto
/// the returned value for the caller to store on the WI.
pub fn is_wi_ready(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    workflow: &WorkflowDef,
    raw_inputs: &Map<String, Value>,
) -> Result<(Readiness, Map<String, Value>), ReadinessError> {
    let mut pinned = Map::new();
    for param in &workflow.inputs {
        match raw_inputs.get(&param.name) {
            Some(v) => {
                pinned.insert(param.name.clone(), v.clone());
            }
            None if param.admits_null() => {
                pinned.insert(param.name.clone(), Value::Null);
            }
            None => {
                return Ok((
                    Readiness::not_ready(format!("workflow input {} not bound", param.name)),
                    pinned,
                ));
            }
        }
    }
    let _ = (ctx, job, wi);
    Ok((Readiness::ready(), pinned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{OutputBinding, ParameterDecl, ProcessType, ScatterMethod};
    use crate::expression::RhaiEvaluator;
    use crate::ids::{JobId, TaskId};
    use crate::model::{Task, TaskState};
    use crate::resolver::Registries;
    use crate::context::WorkflowContext;
    use serde_json::json;
    use std::collections::HashMap;

    fn workflow_with_step(step: Step) -> WorkflowDef {
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
            steps: vec![step],
        }
    }

    #[test]
    fn step_not_ready_when_generator_incomplete() {
        let mut inputs = HashMap::new();
        inputs.insert(
            "in".to_string(),
            InputBinding {
                sources: vec!["A/out".into()],
                link_merge: None,
                source_index: 0,
                default: None,
                value_from: None,
            },
        );
        let step = Step {
            name: "B".into(),
            process_type: ProcessType::CommandLineTool,
            run: "b".into(),
            inputs,
            outputs: vec!["out".into()],
            scatter: vec![],
            scatter_method: ScatterMethod::default(),
            no_retry: false,
        };
        let workflow = workflow_with_step(step.clone());
        let mut context = WorkflowContext::new();
        context.register_workflow(workflow);
        let registries = Registries::default();
        let evaluator = RhaiEvaluator::new();
        let resolve_ctx = ResolveCtx {
            registries: &registries,
            context: &context,
            evaluator: &evaluator,
        };
        let job = Job::new(JobId::new(), 0);
        let wi = WorkflowInstance::root(job.id, "main", Map::new());
        let readiness = is_step_ready(&resolve_ctx, &job, &wi, &Map::new(), &step).unwrap();
        assert!(!readiness.ready);
    }

    #[test]
    fn step_ready_once_generator_completes() {
        let mut inputs = HashMap::new();
        inputs.insert(
            "in".to_string(),
            InputBinding {
                sources: vec!["A/out".into()],
                link_merge: None,
                source_index: 0,
                default: None,
                value_from: None,
            },
        );
        let step = Step {
            name: "B".into(),
            process_type: ProcessType::CommandLineTool,
            run: "b".into(),
            inputs,
            outputs: vec!["out".into()],
            scatter: vec![],
            scatter_method: ScatterMethod::default(),
            no_retry: false,
        };
        let workflow = workflow_with_step(step.clone());
        let mut context = WorkflowContext::new();
        context.register_workflow(workflow);
        let registries = Registries::default();
        let job = Job::new(JobId::new(), 0);
        let wi = WorkflowInstance::root(job.id, "main", Map::new());

        let task_id = TaskId::new(job.id, "/A".to_string());
        let mut task = Task::new(task_id.clone(), wi.id, "A");
        task.state = TaskState::Completed;
        task.step_output.insert("out".into(), json!(1));
        registries.tasks.add(task_id, task).unwrap();

        let evaluator = RhaiEvaluator::new();
        let resolve_ctx = ResolveCtx {
            registries: &registries,
            context: &context,
            evaluator: &evaluator,
        };
        let readiness = is_step_ready(&resolve_ctx, &job, &wi, &Map::new(), &step).unwrap();
        assert!(readiness.ready);
    }

    #[test]
    fn wi_ready_pins_resolved_inputs() {
        let workflow = WorkflowDef {
            name: "main".into(),
            inputs: vec![
                ParameterDecl {
                    name: "x".into(),
                    types: vec!["int".into()],
                    default: None,
                },
                ParameterDecl {
                    name: "y".into(),
                    types: vec!["null".into()],
                    default: None,
                },
            ],
            outputs: vec![],
            steps: vec![],
        };
        let mut context = WorkflowContext::new();
        context.register_workflow(workflow.clone());
        let registries = Registries::default();
        let evaluator = RhaiEvaluator::new();
        let resolve_ctx = ResolveCtx {
            registries: &registries,
            context: &context,
            evaluator: &evaluator,
        };
        let job = Job::new(JobId::new(), 0);
        let wi = WorkflowInstance::root(job.id, "main", Map::new());
        let mut raw = Map::new();
        raw.insert("x".into(), json!(9));
        let (readiness, pinned) = is_wi_ready(&resolve_ctx, &job, &wi, &workflow, &raw).unwrap();
        assert!(readiness.ready);
        assert_eq!(pinned.get("x"), Some(&json!(9)));
        assert_eq!(pinned.get("y"), Some(&Value::Null));
    }

    #[test]
    fn wi_not_ready_when_required_input_missing() {
        let workflow = WorkflowDef {
            name: "main".into(),
            inputs: vec![ParameterDecl {
                name: "x".into(),
                types: vec!["int".into()],
                default: None,
            }],
            outputs: vec![],
            steps: vec![],
        };
        let mut context = WorkflowContext::new();
        context.register_workflow(workflow.clone());
        let registries = Registries::default();
        let evaluator = RhaiEvaluator::new();
        let resolve_ctx = ResolveCtx {
            registries: &registries,
            context: &context,
            evaluator: &evaluator,
        };
        let job = Job::new(JobId::new(), 0);
        let wi = WorkflowInstance::root(job.id, "main", Map::new());
        let (readiness, _) = is_wi_ready(&resolve_ctx, &job, &wi, &workflow, &Map::new()).unwrap();
        assert!(!readiness.ready);
    }
}
