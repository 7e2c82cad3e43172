//! Source Resolver (C3, §4.3): turns a step input's `source` reference(s)
//! into a bound value, applying link-merge, `source_index` selection,
//! `value_from`, and default synthesis.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::{InputBinding, LinkMerge, ProcessType, Step, WorkflowContext};
use crate::error::ResolverError;
use crate::expression::ExpressionEvaluator;
use crate::ids::{JobId, Registry, TaskId, WiId};
use crate::model::{Job, Task, TaskState, WiState, WorkflowInstance};

/// The registries a resolve pass needs read access to. Each field is the
/// same per-entry-locked registry the scheduler and protocol layers share.
pub struct Registries {
    pub jobs: Registry<JobId, Job>,
    pub wis: Registry<WiId, WorkflowInstance>,
    pub tasks: Registry<TaskId, Task>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            jobs: Registry::new(),
            wis: Registry::new(),
            tasks: Registry::new(),
        }
    }
}

/// Outcome of a single resolve, matching the `(value, ok, reason, err)`
/// contract: `Ok(Resolved)` on success (possibly with a non-fatal reason
/// for an absent-but-optional value), `Err` only when `strict=true` and the
/// producer genuinely isn't ready or the reference is malformed.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub value: Value,
    pub ok: bool,
    pub reason: Option<String>,
}

impl Resolved {
    fn ready(value: Value) -> Self {
        Self {
            value,
            ok: true,
            reason: None,
        }
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Strip an embedded-UUID job id segment, if `path` starts with one, and
/// normalize to a plain `/`-separated reference.
fn normalize(src: &str) -> String {
    let stripped = src.trim_start_matches('#');
    if let Some(rest) = stripped.strip_prefix(|c: char| c == '/') {
        return rest.to_string();
    }
    stripped.to_string()
}

pub struct ResolveCtx<'a> {
    pub registries: &'a Registries,
    pub context: &'a WorkflowContext,
    pub evaluator: &'a dyn ExpressionEvaluator,
}

/// Resolve a single `source` reference string to a value (§4.3 steps 1-2).
pub fn resolve(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    workflow_inputs: &Map<String, Value>,
    src: &str,
    strict: bool,
) -> Result<Resolved, ResolverError> {
    let normalized = normalize(src);
    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();

    match segments.len() {
        1 => resolve_workflow_input(ctx, wi, workflow_inputs, segments[0]),
        2 => resolve_step_output(ctx, job, wi, segments[0], segments[1], strict),
        _ => Err(ResolverError::NotFound(src.to_string())),
    }
}

fn resolve_workflow_input(
    ctx: &ResolveCtx<'_>,
    wi: &WorkflowInstance,
    workflow_inputs: &Map<String, Value>,
    name: &str,
) -> Result<Resolved, ResolverError> {
    if let Some(value) = workflow_inputs.get(name) {
        return Ok(Resolved::ready(value.clone()));
    }
    let workflow = ctx.context.get_workflow(&wi.workflow_ref)?;
    let decl = workflow
        .input(name)
        .ok_or_else(|| ResolverError::NotFound(name.to_string()))?;
    if decl.admits_null() {
        return Ok(Resolved {
            value: Value::Null,
            ok: true,
            reason: Some("optional".to_string()),
        });
    }
    Err(ResolverError::InputMissing(name.to_string()))
}

fn resolve_step_output(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    step_name: &str,
    output_name: &str,
    strict: bool,
) -> Result<Resolved, ResolverError> {
    let workflow = ctx.context.get_workflow(&wi.workflow_ref)?;
    let step = ctx.context.get_step(workflow, step_name)?;
    let child_path = format!("{}/{}", wi.local_name, step_name);

    match ctx.context.get_process_type(step) {
        ProcessType::Workflow => {
            let child_wi = find_wi_by_local_name(ctx, job.id, &child_path);
            match child_wi {
                Some(child) if child.state == WiState::Completed => {
                    let value = child
                        .outputs
                        .get(output_name)
                        .cloned()
                        .ok_or_else(|| ResolverError::NotFound(output_name.to_string()))?;
                    Ok(Resolved::ready(value))
                }
                _ if strict => Err(ResolverError::GeneratorNotReady(child_path)),
                _ => Ok(Resolved::not_ready(format!("{child_path} not completed"))),
            }
        }
        ProcessType::CommandLineTool | ProcessType::ExpressionTool => {
            let task_id = TaskId::new(job.id, child_path.clone());
            let handle = ctx.registries.tasks.get(&task_id);
            match handle {
                Some(lock) => {
                    let task = lock.read();
                    if task.state == TaskState::Completed {
                        let value = task
                            .step_output
                            .get(output_name)
                            .cloned()
                            .ok_or_else(|| ResolverError::NotFound(output_name.to_string()))?;
                        Ok(Resolved::ready(value))
                    } else if strict {
                        Err(ResolverError::GeneratorNotReady(child_path))
                    } else {
                        Ok(Resolved::not_ready(format!("{child_path} not completed")))
                    }
                }
                None if strict => Err(ResolverError::GeneratorNotReady(child_path)),
                None => Ok(Resolved::not_ready(format!("{child_path} not materialized"))),
            }
        }
    }
}

fn find_wi_by_local_name(ctx: &ResolveCtx<'_>, _job_id: JobId, local_name: &str) -> Option<Arc<parking_lot::RwLock<WorkflowInstance>>> {
    ctx.registries
        .wis
        .keys()
        .into_iter()
        .find(|id| {
            ctx.registries
                .wis
                .get(id)
                .map(|lock| lock.read().local_name == local_name)
                .unwrap_or(false)
        })
        .and_then(|id| ctx.registries.wis.get(&id))
}

/// Resolve a full step `InputBinding`: link-merge across sources,
/// `source_index` selection, `value_from`, and default synthesis (§4.3).
pub fn resolve_binding(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    workflow_inputs: &Map<String, Value>,
    binding: &InputBinding,
    full_inputs: &Value,
    strict: bool,
) -> Result<Resolved, ResolverError> {
    if binding.sources.is_empty() {
        return default_or_null(binding);
    }

    if binding.sources.len() == 1 && binding.link_merge.is_none() {
        let mut resolved = resolve(ctx, job, wi, workflow_inputs, &binding.sources[0], strict)?;
        if binding.source_index != 0 {
            resolved = select_index(resolved, binding.source_index)?;
        }
        if !resolved.ok {
            if let Some(with_default) = apply_default(binding, &resolved)? {
                resolved = with_default;
            }
        }
        return apply_value_from(ctx, binding, resolved, full_inputs);
    }

    let mut parts = Vec::with_capacity(binding.sources.len());
    for src in &binding.sources {
        let r = resolve(ctx, job, wi, workflow_inputs, src, strict)?;
        if !r.ok {
            return Ok(r);
        }
        parts.push(r.value);
    }

    let merged = match binding.link_merge {
        Some(LinkMerge::MergeNested) | None => Value::Array(parts),
        Some(LinkMerge::MergeFlattened) => {
            let mut flat = Vec::new();
            for p in parts {
                match p {
                    Value::Array(items) => flat.extend(items),
                    _ => return Err(ResolverError::FlattenedMergeOnScalar),
                }
            }
            Value::Array(flat)
        }
    };

    apply_value_from(ctx, binding, Resolved::ready(merged), full_inputs)
}

fn select_index(resolved: Resolved, source_index: usize) -> Result<Resolved, ResolverError> {
    if !resolved.ok {
        return Ok(resolved);
    }
    match resolved.value {
        Value::Array(items) => {
            let idx = source_index - 1;
            let value = items
                .get(idx)
                .cloned()
                .ok_or_else(|| ResolverError::NotFound(format!("source_index {source_index}")))?;
            Ok(Resolved::ready(value))
        }
        other => Ok(Resolved::ready(other)),
    }
}

fn default_or_null(binding: &InputBinding) -> Result<Resolved, ResolverError> {
    if let Some(default) = &binding.default {
        return Ok(Resolved::ready(default.clone()));
    }
    Ok(Resolved {
        value: Value::Null,
        ok: true,
        reason: Some("no source and no default".to_string()),
    })
}

fn apply_default(binding: &InputBinding, resolved: &Resolved) -> Result<Option<Resolved>, ResolverError> {
    if let Some(default) = &binding.default {
        return Ok(Some(Resolved::ready(default.clone())));
    }
    let _ = resolved;
    Ok(None)
}

fn apply_value_from(
    ctx: &ResolveCtx<'_>,
    binding: &InputBinding,
    resolved: Resolved,
    full_inputs: &Value,
) -> Result<Resolved, ResolverError> {
    let Some(expr) = &binding.value_from else {
        return Ok(resolved);
    };
    if !resolved.ok {
        return Ok(resolved);
    }
    let value = ctx.evaluator.evaluate(expr, &resolved.value, full_inputs)?;
    Ok(Resolved::ready(value))
}
