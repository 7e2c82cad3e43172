//! Task: a schedulable unit corresponding to a single tool (§3).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IllegalTransition;
use crate::ids::{TaskId, WiId};

/// Task lifecycle states (§4.6): init -> pending -> ready -> queued ->
/// in-progress -> completed; any non-terminal -> suspended / failed-permanent
/// / fail-skip; suspended -> pending (resume/recover/resubmit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Init,
    Pending,
    Ready,
    Queued,
    InProgress,
    Completed,
    Suspended,
    FailedPermanent,
    FailSkip,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::FailedPermanent | TaskState::FailSkip
        )
    }

    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Init, Pending)
            | (Pending, Ready)
            | (Ready, Queued)
            | (Queued, InProgress)
            | (InProgress, Completed) => true,
            (Suspended, Pending) => true,
            (from, Suspended) | (from, FailedPermanent) | (from, FailSkip)
                if !from.is_terminal() =>
            {
                true
            }
            _ => false,
        }
    }
}

/// A schedulable unit corresponding to one tool invocation (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    pub owner_wi: WiId,
    /// Name of the declarative step this task realizes.
    pub step_name: String,
    /// Resolved positional input array (§3).
    pub resolved_inputs: Vec<Value>,
    pub step_output: Map<String, Value>,
    pub process_output: Map<String, Value>,
    /// Per-rank results for a scattering task, indexed by workunit rank;
    /// empty for an ordinary single-workunit task (§4.5/§4.10).
    pub scatter_outputs: Vec<Option<Map<String, Value>>>,
    pub total_work: u32,
    /// T1: count of workunits not yet in state `done`.
    pub remaining_work: u32,
    /// Set when this task was materialized from a scattering step, even if
    /// the enumerated index space happens to contain exactly one child
    /// (§4.5): outputs still project as a one-element array.
    pub is_scatter: bool,
    pub scatter_parent: Option<TaskId>,
    pub scatter_children: Vec<TaskId>,
    pub compute_time: f64,
    pub dependencies_legacy: Vec<TaskId>,
    /// No-retry flag: caps `MAX_WORK_FAILURE` at 1 for this task (§4.9).
    pub no_retry: bool,
    /// Atomic finalize flag for scatter parents (S1, §4.5/§4.10).
    pub scatter_finalized: bool,
}

impl Task {
    pub fn new(id: TaskId, owner_wi: WiId, step_name: impl Into<String>) -> Self {
        Self {
            id,
            state: TaskState::Init,
            owner_wi,
            step_name: step_name.into(),
            resolved_inputs: Vec::new(),
            step_output: Map::new(),
            process_output: Map::new(),
            scatter_outputs: Vec::new(),
            total_work: 1,
            remaining_work: 0,
            is_scatter: false,
            scatter_parent: None,
            scatter_children: Vec::new(),
            compute_time: 0.0,
            dependencies_legacy: Vec::new(),
            no_retry: false,
            scatter_finalized: false,
        }
    }

    pub fn transition(&mut self, to: TaskState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition {
                entity: format!("task {}", self.id),
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            });
        }
        self.state = to;
        Ok(())
    }

    /// T2: a task is completed iff remaining_work == 0 AND step outputs
    /// have been projected.
    pub fn is_ready_to_complete(&self) -> bool {
        self.remaining_work == 0
    }

    pub fn is_scatter_parent(&self) -> bool {
        !self.scatter_children.is_empty()
    }

    /// Read-only performance snapshot, analogous to AWE's `JobPerf` document.
    pub fn perf(&self) -> TaskPerf {
        TaskPerf {
            compute_time: self.compute_time,
            total_work: self.total_work,
            remaining_work: self.remaining_work,
        }
    }
}

/// Compute-time accounting snapshot for one task (§B supplemented feature).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskPerf {
    pub compute_time: f64,
    pub total_work: u32,
    pub remaining_work: u32,
}
