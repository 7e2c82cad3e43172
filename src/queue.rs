//! Work Queue (C7, §4.7): the global FCFS work queue over workunits.
//!
//! Grounded directly on the `WorkQueue`/`StatusChange`/`selectWorkunits`
//! trio found in the scheduler this crate's protocol is modeled after:
//! disjoint sub-maps for queued / checked-out / suspended, with `all`
//! holding every live workunit until it's explicitly deleted.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::QueueError;
use crate::ids::WorkunitId;
use crate::model::{Workunit, WorkunitState};

/// The global work queue: one `all` map plus three disjoint sub-maps
/// mirroring each workunit's current `sub_queue()` (§4.7, W1).
#[derive(Default)]
pub struct WorkQueue {
    all: RwLock<std::collections::HashMap<WorkunitId, Arc<RwLock<Workunit>>>>,
    queued: RwLock<HashSet<WorkunitId>>,
    checked_out: RwLock<HashSet<WorkunitId>>,
    suspended: RwLock<HashSet<WorkunitId>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly queued workunit to `all` and the `queued` sub-map.
    pub fn add(&self, workunit: Workunit) {
        let id = workunit.id.clone();
        let sub_queue = workunit.state.sub_queue();
        self.all.write().insert(id.clone(), Arc::new(RwLock::new(workunit)));
        if let Some(crate::model::SubQueue::Queued) = sub_queue {
            self.queued.write().insert(id);
        }
    }

    pub fn get(&self, id: &WorkunitId) -> Option<Arc<RwLock<Workunit>>> {
        self.all.read().get(id).cloned()
    }

    /// The sole mutator for workunit state (§4.7): atomically moves `id`
    /// from its current sub-map to the one matching `new_state`.
    pub fn status_change(&self, id: &WorkunitId, new_state: WorkunitState) -> Result<(), QueueError> {
        let handle = self.get(id).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let old_sub_queue = {
            let guard = handle.read();
            guard.state.sub_queue()
        };

        {
            let mut guard = handle.write();
            guard
                .transition(new_state)
                .map_err(|_| QueueError::InvariantViolation(id.clone()))?;
        }

        self.remove_from_sub_queue(id, old_sub_queue);
        let new_sub_queue = new_state.sub_queue();
        self.insert_into_sub_queue(id.clone(), new_sub_queue);
        Ok(())
    }

    fn remove_from_sub_queue(&self, id: &WorkunitId, sub_queue: Option<crate::model::SubQueue>) {
        use crate::model::SubQueue::*;
        match sub_queue {
            Some(Queued) => {
                self.queued.write().remove(id);
            }
            Some(CheckedOut) => {
                self.checked_out.write().remove(id);
            }
            Some(Suspended) => {
                self.suspended.write().remove(id);
            }
            None => {}
        }
    }

    fn insert_into_sub_queue(&self, id: WorkunitId, sub_queue: Option<crate::model::SubQueue>) {
        use crate::model::SubQueue::*;
        match sub_queue {
            Some(Queued) => {
                self.queued.write().insert(id);
            }
            Some(CheckedOut) => {
                self.checked_out.write().insert(id);
            }
            Some(Suspended) => {
                self.suspended.write().insert(id);
            }
            None => {}
        }
    }

    /// Remove a workunit from `all` entirely (job deletion).
    pub fn delete(&self, id: &WorkunitId) -> Option<Arc<RwLock<Workunit>>> {
        let sub_queue = self.get(id).and_then(|h| h.read().state.sub_queue());
        self.remove_from_sub_queue(id, sub_queue);
        self.all.write().remove(id)
    }

    /// §4.7 `clean()`: find workunits in `all` that no sub-map references
    /// and are not in a terminal state — a nil-body invariant violation —
    /// and return them for escalation. In this in-memory model that means
    /// any workunit whose `sub_queue()` is `Some` but isn't actually present
    /// in the matching sub-map.
    pub fn clean(&self) -> Vec<WorkunitId> {
        let mut escalate = Vec::new();
        let all = self.all.read();
        for (id, handle) in all.iter() {
            let state = handle.read().state;
            if let Some(sub_queue) = state.sub_queue() {
                let present = match sub_queue {
                    crate::model::SubQueue::Queued => self.queued.read().contains(id),
                    crate::model::SubQueue::CheckedOut => self.checked_out.read().contains(id),
                    crate::model::SubQueue::Suspended => self.suspended.read().contains(id),
                };
                if !present {
                    escalate.push(id.clone());
                }
            }
        }
        escalate
    }

    /// FCFS selection (§4.9): eligible queued workunits ordered by
    /// priority descending, then submit time ascending, filtered to those
    /// whose `input_size` fits within `max_input_size` (0 = unbounded).
    pub fn select_eligible(&self, max_input_size: i64) -> Vec<Arc<RwLock<Workunit>>> {
        let ids = self.queued.read().iter().cloned().collect::<Vec<_>>();
        let mut candidates: Vec<Arc<RwLock<Workunit>>> = ids
            .into_iter()
            .filter_map(|id| self.get(&id))
            .filter(|h| {
                let guard = h.read();
                max_input_size == 0 || guard.input_size <= max_input_size
            })
            .collect();
        candidates.sort_by(|a, b| {
            let a = a.read();
            let b = b.read();
            b.priority
                .cmp(&a.priority)
                .then(a.submit_time.cmp(&b.submit_time))
        });
        candidates
    }

    /// Reclaim checkouts whose `checked_out_at` is older than `timeout`
    /// (§8 scenario 5): transitions them back to `queued`, returning the
    /// reclaimed ids. A worker that already discarded the work (server-uuid
    /// mismatch) simply never reports on it, so the server's own timeout is
    /// the sole recovery mechanism here.
    pub fn reclaim_stale_checkouts(&self, timeout: chrono::Duration, now: chrono::DateTime<chrono::Utc>) -> Vec<WorkunitId> {
        let stale: Vec<WorkunitId> = self
            .checked_out
            .read()
            .iter()
            .filter(|id| {
                self.get(id)
                    .and_then(|h| h.read().checked_out_at)
                    .map(|at| now - at >= timeout)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in &stale {
            let _ = self.status_change(id, WorkunitState::Queued);
        }
        stale
    }

    pub fn queued_len(&self) -> usize {
        self.queued.read().len()
    }

    pub fn checked_out_len(&self) -> usize {
        self.checked_out.read().len()
    }

    /// All live workunit ids for `task_id`, regardless of sub-queue (job
    /// resume and job delete need to discard a task's workunits wholesale).
    pub fn workunit_ids_for_task(&self, task_id: &crate::ids::TaskId) -> Vec<WorkunitId> {
        self.all
            .read()
            .keys()
            .filter(|id| &id.task_id == task_id)
            .cloned()
            .collect()
    }
}
