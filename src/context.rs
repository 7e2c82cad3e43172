//! Workflow Context (C2, §4.2): the catalog of declarative workflow objects
//! loaded from a submission.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which kind of process a step wraps (§9 "Dynamic dispatch on step process type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    CommandLineTool,
    ExpressionTool,
    Workflow,
}

/// Link-merge policy for a step input with multiple sources (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMerge {
    MergeNested,
    MergeFlattened,
}

/// One or more source references for a step input, plus merge/default/valueFrom.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputBinding {
    pub sources: Vec<String>,
    pub link_merge: Option<LinkMerge>,
    /// `source_index` != 0 selects the (index-1)-th element of the sole
    /// source — used by scatter children (§4.3).
    pub source_index: usize,
    pub default: Option<Value>,
    pub value_from: Option<String>,
}

/// A declared parameter (workflow input or step/workflow output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDecl {
    pub name: String,
    /// CWL-style type union, e.g. `["null", "File"]`.
    pub types: Vec<String>,
    pub default: Option<Value>,
}

impl ParameterDecl {
    pub fn admits_null(&self) -> bool {
        self.types.iter().any(|t| t == "null")
    }

    /// At least one declared type must match; `null` is only acceptable if
    /// the union admits it (§4.10 step 3).
    pub fn type_matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return self.admits_null();
        }
        self.types.iter().any(|t| match t.as_str() {
            "null" => false,
            "string" => value.is_string(),
            "int" | "long" => value.is_i64() || value.is_u64(),
            "float" | "double" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "record" => value.is_object(),
            _ => true, // File/Directory/custom schema: accept (schema checking is out of scope)
        })
    }
}

/// One output of a step or workflow: either a single source or an array of
/// sources (§4.3, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBinding {
    pub name: String,
    pub sources: Vec<String>,
    pub is_array: bool,
    pub types: Vec<String>,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub process_type: ProcessType,
    /// If `process_type == Workflow`, names the sub-workflow in the context.
    pub run: String,
    pub inputs: HashMap<String, InputBinding>,
    /// Declared output names for this step (order matters for scatter collection).
    pub outputs: Vec<String>,
    /// Scatter input names, if this step scatters (§4.5). Empty = no scatter.
    pub scatter: Vec<String>,
    pub scatter_method: ScatterMethod,
    pub no_retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterMethod {
    #[default]
    Dotproduct,
    FlatCrossproduct,
    NestedCrossproduct,
}

/// A declarative workflow: its input/output parameters and steps, in
/// declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    pub inputs: Vec<ParameterDecl>,
    pub outputs: Vec<OutputBinding>,
    pub steps: Vec<Step>,
}

impl WorkflowDef {
    pub fn input(&self, name: &str) -> Option<&ParameterDecl> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("not found: {0}")]
    NotFound(String),
}

/// The catalog of declarative workflow objects loaded from a submission (C2).
///
/// Immutable after submission except for `add_schemata`; concurrent readers
/// need no locking since workflows/schemata are append-only maps built once
/// at load time and never mutated in place afterward.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    workflows: HashMap<String, WorkflowDef>,
    schemata: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(&mut self, def: WorkflowDef) {
        self.workflows.insert(def.name.clone(), def);
    }

    /// Resolve a `#`-prefixed absolute reference to a workflow or schema.
    pub fn get(&self, reference: &str) -> Result<&Value, ContextError> {
        let key = reference.trim_start_matches('#');
        self.schemata
            .get(key)
            .ok_or_else(|| ContextError::NotFound(reference.to_string()))
    }

    pub fn get_workflow(&self, reference: &str) -> Result<&WorkflowDef, ContextError> {
        let key = reference.trim_start_matches('#');
        self.workflows
            .get(key)
            .ok_or_else(|| ContextError::NotFound(reference.to_string()))
    }

    pub fn get_step<'a>(&'a self, workflow: &'a WorkflowDef, step_name: &str) -> Result<&'a Step, ContextError> {
        workflow
            .step(step_name)
            .ok_or_else(|| ContextError::NotFound(step_name.to_string()))
    }

    pub fn get_process_type(&self, step: &Step) -> ProcessType {
        step.process_type
    }

    /// Add (or, with `replace`, overwrite) type schemata. The only mutation
    /// allowed to the context after initial load (§4.2).
    pub fn add_schemata(&mut self, list: Vec<(String, Value)>, replace: bool) {
        for (name, schema) in list {
            if replace || !self.schemata.contains_key(&name) {
                self.schemata.insert(name, schema);
            }
        }
    }
}
