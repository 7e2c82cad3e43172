//! # wfengine
//!
//! A distributed scheduler for declarative scientific workflows: dependency
//! resolution over a workflow graph, scatter/gather expansion, a
//! checkout/notice protocol for pulling workers, and recursive completion
//! propagation up the workflow-instance tree.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Scheduler                             │
//! │  (tick loop: materializes ready WIs into tasks/workunits)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkQueue                              │
//! │  (queued / checked-out / suspended sub-queues)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Protocol (checkout/notice)                 │
//! │  (pull workers claim workunits, report disposition)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Completion of a workunit feeds back through [`completion::task_completed`]
//! into the owning workflow instance, recursing up to [`completion::complete_sub_workflow`]
//! and finally job completion. [`recovery::recover`] rehydrates this whole
//! tree from a [`persistence::PersistenceStore`] on startup.

pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod expression;
pub mod ids;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod queue;
pub mod readiness;
pub mod recovery;
pub mod resolver;
pub mod scatter;
pub mod scheduler;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::completion::{task_completed, CompletionRegistries};
    pub use crate::config::{ProtocolConfig, SchedulerConfig};
    pub use crate::context::{ProcessType, Step, WorkflowContext, WorkflowDef};
    pub use crate::error::{
        CompletionError, ProtocolError, ReadinessError, RecoveryError, ResolverError,
        SchedulerError,
    };
    pub use crate::expression::{ExpressionEvaluator, RhaiEvaluator};
    pub use crate::ids::{JobId, Registry, TaskId, WiId, WorkunitId};
    pub use crate::model::{Job, JobExpirationSweeper, JobState, Task, TaskPerf, TaskState, WiState, WorkflowInstance, Workunit};
    pub use crate::persistence::{InMemoryStore, PersistenceStore, StoreError};
    pub use crate::protocol::{Disposition, Protocol};
    pub use crate::queue::WorkQueue;
    pub use crate::recovery::{find_zombies, recover};
    pub use crate::resolver::{resolve, resolve_binding, Registries, ResolveCtx};
    pub use crate::scheduler::Scheduler;
}

// Re-export key types at crate root.
pub use completion::{task_completed, CompletionRegistries};
pub use config::{ProtocolConfig, SchedulerConfig};
pub use context::{ProcessType, WorkflowContext, WorkflowDef};
pub use error::{ProtocolError, RecoveryError, SchedulerError};
pub use ids::{JobId, TaskId, WiId, WorkunitId};
pub use model::{Job, JobExpirationSweeper, JobState, Task, TaskPerf, TaskState, WiState, WorkflowInstance, Workunit};
pub use persistence::{InMemoryStore, PersistenceStore, StoreError};
pub use protocol::{Disposition, Protocol};
pub use queue::WorkQueue;
pub use recovery::{find_zombies, recover};
pub use resolver::Registries;
pub use scheduler::Scheduler;
