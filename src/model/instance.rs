//! WorkflowInstance: a runtime instantiation of a (sub-)workflow (§3).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::IllegalTransition;
use crate::ids::{JobId, TaskId, WiId};

/// WI lifecycle states (§4.6): pending -> ready -> queued -> completed;
/// any non-terminal -> suspended; suspended -> pending (resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WiState {
    Pending,
    Ready,
    Queued,
    Completed,
    Suspended,
}

impl WiState {
    pub fn can_transition_to(self, to: WiState) -> bool {
        use WiState::*;
        match (self, to) {
            (Pending, Ready) | (Ready, Queued) | (Queued, Completed) => true,
            (Suspended, Pending) => true,
            (from, Suspended) if from != Completed => true,
            _ => false,
        }
    }
}

/// Whether a WI is an ordinary sub-workflow instantiation or a materialized
/// scatter child (§3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    Normal,
    Scatter,
}

/// A runtime instantiation of a (sub-)workflow (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WiId,
    /// The job that owns this WI (shared by the whole tree it belongs to).
    pub job_id: JobId,
    /// `/`-separated hierarchical local name; root is the entrypoint (I3).
    pub local_name: String,
    /// `None` only for the root (I4).
    pub parent: Option<WiId>,
    /// Reference to the workflow definition in the context (by name).
    pub workflow_ref: String,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub state: WiState,
    /// I1: count of direct children whose state != completed.
    pub remaining_steps: u32,
    pub process_type: ProcessType,
    pub scatter_parent: Option<WiId>,
    pub child_tasks: Vec<TaskId>,
    pub child_wis: Vec<WiId>,
}

impl WorkflowInstance {
    pub fn root(job_id: JobId, workflow_ref: impl Into<String>, inputs: Map<String, Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            local_name: String::new(),
            parent: None,
            workflow_ref: workflow_ref.into(),
            inputs,
            outputs: Map::new(),
            state: WiState::Pending,
            remaining_steps: 0,
            process_type: ProcessType::Normal,
            scatter_parent: None,
            child_tasks: Vec::new(),
            child_wis: Vec::new(),
        }
    }

    /// Build a child WI (I3: local name is `parent.local_name + "/" + step_name`).
    pub fn child(&self, step_name: &str, workflow_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: self.job_id,
            local_name: format!("{}/{}", self.local_name, step_name),
            parent: Some(self.id),
            workflow_ref: workflow_ref.into(),
            inputs: Map::new(),
            outputs: Map::new(),
            state: WiState::Pending,
            remaining_steps: 0,
            process_type: ProcessType::Normal,
            scatter_parent: None,
            child_tasks: Vec::new(),
            child_wis: Vec::new(),
        }
    }

    pub fn transition(&mut self, to: WiState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition {
                entity: format!("wi {}", self.id),
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Number of direct children total (tasks + sub-WIs), used to validate I1/I2.
    pub fn direct_child_count(&self) -> usize {
        self.child_tasks.len() + self.child_wis.len()
    }
}
