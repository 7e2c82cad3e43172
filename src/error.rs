//! Error kinds (§7)
//!
//! One `thiserror` enum per component boundary, mirroring the teacher's
//! per-module granularity (`StoreError`, `ExecutorError`, `RegistryError`,
//! ...) rather than a single flat error type.

use crate::ids::{RegistryError, TaskId, WiId, WorkunitId};

/// A state-machine transition that the caller attempted was not legal (§4.6).
#[derive(Debug, thiserror::Error)]
#[error("illegal transition for {entity}: {from} -> {to}")]
pub struct IllegalTransition {
    pub entity: String,
    pub from: String,
    pub to: String,
}

/// Errors from the source resolver (§4.3).
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("input missing for reference {0}")]
    InputMissing(String),
    #[error("reference not found: {0}")]
    NotFound(String),
    #[error("generator for {0} has not completed")]
    GeneratorNotReady(String),
    #[error("unsupported link merge method: {0}")]
    UnsupportedLinkMerge(String),
    #[error("link_merge=merge_flattened requires array-valued sources")]
    FlattenedMergeOnScalar,
    #[error("expression evaluation failed: {0}")]
    Expression(String),
}

/// Errors from the readiness oracle (§4.4).
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

/// Errors from the scatter expander (§4.5).
#[derive(Debug, thiserror::Error)]
pub enum ScatterError {
    #[error("dotproduct scatter requires equal-length arrays, got lengths {0:?}")]
    UnequalLengths(Vec<usize>),
    #[error("nested_crossproduct collection policy is not implemented")]
    Unsupported,
    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

/// Errors from the work queue (§4.7).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("workunit {0} not found")]
    NotFound(WorkunitId),
    #[error("workunit {0} has a nil body and was cleaned")]
    InvariantViolation(WorkunitId),
}

/// Errors surfaced by the scheduler loop (§4.8).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
    #[error(transparent)]
    Scatter(#[from] ScatterError),
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// Errors from the checkout/notice protocol (§4.9/§7).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("no eligible workunit for this worker")]
    NoEligibleWorkunit,
    #[error("global work queue is suspended")]
    QueueSuspended,
    #[error("checkout request queue is full")]
    QueueFull,
    #[error("workunit {0} not found")]
    WorkunitNotFound(WorkunitId),
    #[error("workunit {0} is not checked out by worker {1}")]
    NotCheckedOutByWorker(WorkunitId, String),
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// Errors from completion propagation (§4.10).
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("task {0} output {1:?} missing and not optional")]
    MissingOutput(TaskId, String),
    #[error("workflow instance {0} output type mismatch for {1:?}")]
    OutputTypeMismatch(WiId, String),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

/// Errors from startup recovery (§4.11).
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("persistence error during recovery: {0}")]
    Persistence(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The structured suspension record attached to a job on any suspend (§7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SuspensionRecord {
    pub worker: Option<String>,
    pub workunit: Option<WorkunitId>,
    pub task: Option<TaskId>,
    /// Scheduler-internal commentary (not shown to the submitting worker).
    pub server_notes: String,
    /// Free-text notes reported by the worker in its notice, if any.
    pub work_notes: Option<String>,
    /// Stderr or application-level error text, if the worker reported one.
    pub app_error: Option<String>,
    pub status: String,
}

impl SuspensionRecord {
    pub fn new(status: impl Into<String>, server_notes: impl Into<String>) -> Self {
        Self {
            worker: None,
            workunit: None,
            task: None,
            server_notes: server_notes.into(),
            work_notes: None,
            app_error: None,
            status: status.into(),
        }
    }
}
