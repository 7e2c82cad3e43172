//! Scatter Expander (C5, §4.5): index-vector enumeration over dotproduct /
//! flat-crossproduct scatter methods, and the zero-length synthetic
//! completion path.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::context::{InputBinding, ScatterMethod, Step};
use crate::error::ScatterError;
use crate::ids::TaskId;
use crate::model::{Job, WorkflowInstance};
use crate::resolver::{resolve, ResolveCtx};

/// One enumerated scatter child: the rewritten step plus its index vector.
#[derive(Debug, Clone)]
pub struct ScatterChild {
    pub index_vector: Vec<usize>,
    pub step: Step,
}

/// Result of expanding a scattering step.
pub enum ScatterPlan {
    /// At least one scattered input had length zero: no children are
    /// created and the caller should synthesize an empty-array completion
    /// notice for every declared output (§4.5 step 3).
    EmptyScatter,
    Children(Vec<ScatterChild>),
}

/// Atomic finalize flag shared by all siblings of one scatter parent (S1):
/// exactly one `try_finalize` call returns `true`.
#[derive(Debug, Default)]
pub struct FinalizeFlag(AtomicBool);

impl FinalizeFlag {
    pub fn try_finalize(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Resolve each scattered input to an array and return its length, erroring
/// if the source does not resolve to an array.
fn scattered_lengths(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    step: &Step,
) -> Result<Vec<(String, usize)>, ScatterError> {
    let mut lengths = Vec::with_capacity(step.scatter.len());
    for name in &step.scatter {
        let binding = step
            .inputs
            .get(name)
            .expect("scatter name must reference a declared step input");
        let source = binding
            .sources
            .first()
            .ok_or_else(|| ScatterError::Resolver(crate::error::ResolverError::NotFound(name.clone())))?;
        let resolved = resolve(ctx, job, wi, &wi.inputs, source, true)?;
        let len = match &resolved.value {
            Value::Array(items) => items.len(),
            _ => 0,
        };
        lengths.push((name.clone(), len));
    }
    Ok(lengths)
}

/// Enumerate the index-vector space for a scatter step and build the
/// per-child rewritten steps (§4.5).
pub fn expand_scatter(
    ctx: &ResolveCtx<'_>,
    job: &Job,
    wi: &WorkflowInstance,
    step: &Step,
) -> Result<ScatterPlan, ScatterError> {
    let lengths = scattered_lengths(ctx, job, wi, step)?;

    if lengths.iter().any(|(_, l)| *l == 0) {
        return Ok(ScatterPlan::EmptyScatter);
    }

    let index_vectors = match step.scatter_method {
        ScatterMethod::Dotproduct => {
            let first = lengths[0].1;
            if lengths.iter().any(|(_, l)| *l != first) {
                return Err(ScatterError::UnequalLengths(
                    lengths.iter().map(|(_, l)| *l).collect(),
                ));
            }
            (0..first).map(|t| vec![t; lengths.len()]).collect::<Vec<_>>()
        }
        ScatterMethod::FlatCrossproduct => cross_product(&lengths.iter().map(|(_, l)| *l).collect::<Vec<_>>()),
        ScatterMethod::NestedCrossproduct => return Err(ScatterError::Unsupported),
    };

    let children = index_vectors
        .into_iter()
        .map(|idx| ScatterChild {
            step: rewrite_step_for_index(step, &lengths, &idx),
            index_vector: idx,
        })
        .collect();

    Ok(ScatterPlan::Children(children))
}

fn cross_product(lengths: &[usize]) -> Vec<Vec<usize>> {
    let mut result = vec![Vec::new()];
    for &len in lengths {
        let mut next = Vec::with_capacity(result.len() * len.max(1));
        for prefix in &result {
            for i in 0..len {
                let mut v = prefix.clone();
                v.push(i);
                next.push(v);
            }
        }
        result = next;
    }
    result
}

/// Clone `step` with `scatter` cleared and each scattered input rewritten
/// to a `source_index`-selecting binding over the parent source (§4.5
/// step 4).
fn rewrite_step_for_index(step: &Step, lengths: &[(String, usize)], index_vector: &[usize]) -> Step {
    let mut rewritten = step.clone();
    rewritten.scatter.clear();
    for (pos, (name, _)) in lengths.iter().enumerate() {
        if let Some(binding) = rewritten.inputs.get_mut(name) {
            let rewritten_binding = InputBinding {
                sources: binding.sources.clone(),
                link_merge: None,
                source_index: index_vector[pos] + 1,
                default: binding.default.clone(),
                value_from: binding.value_from.clone(),
            };
            *binding = rewritten_binding;
        }
    }
    rewritten
}

/// Derive a scatter child's task path from its parent and index vector,
/// e.g. `.../step` + `[2,0]` → `.../step[2,0]`.
pub fn child_task_id(parent: &TaskId, index_vector: &[usize]) -> TaskId {
    let indices = index_vector
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    TaskId::new(parent.job_id, format!("{}[{indices}]", parent.path))
}
