//! Workunit: one parallel piece of a task (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IllegalTransition;
use crate::ids::WorkunitId;

/// Workunit lifecycle states (§4.6): queued <-> checked-out; checked-out ->
/// done | error | failed-permanent; error -> queued (retry) or suspended;
/// any -> discarded (job delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkunitState {
    Queued,
    Reserved,
    CheckedOut,
    Done,
    Error,
    FailedPermanent,
    Suspended,
    Discarded,
}

impl WorkunitState {
    pub fn can_transition_to(self, to: WorkunitState) -> bool {
        use WorkunitState::*;
        match (self, to) {
            (Queued, CheckedOut) | (CheckedOut, Queued) => true,
            (CheckedOut, Done) | (CheckedOut, Error) | (CheckedOut, FailedPermanent) => true,
            (Error, Queued) | (Error, Suspended) => true,
            (_, Discarded) if self != Discarded => true,
            _ => false,
        }
    }

    /// W1: which of the three disjoint sub-queues this state belongs to, if any.
    pub fn sub_queue(self) -> Option<SubQueue> {
        match self {
            WorkunitState::Queued => Some(SubQueue::Queued),
            WorkunitState::CheckedOut | WorkunitState::Reserved => Some(SubQueue::CheckedOut),
            WorkunitState::Suspended => Some(SubQueue::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueue {
    Queued,
    CheckedOut,
    Suspended,
}

/// One parallel piece of a task (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workunit {
    pub id: WorkunitId,
    pub state: WorkunitState,
    pub failures: u32,
    pub assigned_worker: Option<String>,
    pub priority: i32,
    pub submit_time: DateTime<Utc>,
    pub input_size: i64,
    /// When this workunit last entered `checked_out` — used to reclaim
    /// abandoned checkouts after a worker goes silent (§8 scenario 5).
    pub checked_out_at: Option<DateTime<Utc>>,
}

impl Workunit {
    pub fn new(id: WorkunitId, priority: i32, submit_time: DateTime<Utc>) -> Self {
        Self {
            id,
            state: WorkunitState::Queued,
            failures: 0,
            assigned_worker: None,
            priority,
            submit_time,
            input_size: 0,
            checked_out_at: None,
        }
    }

    pub fn transition(&mut self, to: WorkunitState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition {
                entity: format!("workunit {}", self.id),
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            });
        }
        self.state = to;
        // W2: assigned_worker is empty iff state in {queued, suspended}.
        if matches!(to, WorkunitState::Queued | WorkunitState::Suspended) {
            self.assigned_worker = None;
            self.checked_out_at = None;
        }
        if matches!(to, WorkunitState::CheckedOut | WorkunitState::Reserved) {
            self.checked_out_at = Some(Utc::now());
        }
        Ok(())
    }
}
