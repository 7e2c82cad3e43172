//! Identifiers and the concurrent registries that back them (§4.1)
//!
//! Jobs, workflow instances, tasks, and workunits are addressed by
//! structured string/UUID identifiers rather than owning pointers. Every
//! registry entry sits behind its own lock so that two components can hold
//! locks on different entries without blocking each other; the entry lock is
//! always acquired before any lock on the registry's own bookkeeping.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identifier (an opaque token in the source system; a UUID here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow-instance identifier: a stable UUID (§3).
pub type WiId = Uuid;

/// A task ID is job ID + slash-separated WI-local task path (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub job_id: JobId,
    /// WI-local path, e.g. `"/align/scatter_0"`.
    pub path: String,
}

impl TaskId {
    pub fn new(job_id: JobId, path: impl Into<String>) -> Self {
        Self {
            job_id,
            path: path.into(),
        }
    }

    /// The task ID of the parent step if `path` names a scatter child
    /// (`.../step[2]` → `.../step`). Returns `None` for a non-indexed path.
    pub fn scatter_base(&self) -> Option<TaskId> {
        let (base, _) = self.path.rsplit_once('[')?;
        Some(TaskId::new(self.job_id, base.to_string()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.job_id, self.path)
    }
}

/// A workunit ID is task ID + integer rank (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkunitId {
    pub task_id: TaskId,
    pub rank: u32,
}

impl WorkunitId {
    pub fn new(task_id: TaskId, rank: u32) -> Self {
        Self { task_id, rank }
    }
}

impl fmt::Display for WorkunitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.task_id, self.rank)
    }
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// A concurrent map keyed by identifier, with one lock per entry (§4.1).
///
/// `add`/`get`/`delete`/`keys` are atomic with respect to each other on a
/// given key; the per-entry `RwLock` is acquired before any bookkeeping the
/// caller layers on top, so lock order is always entry-then-registry.
pub struct Registry<K, V> {
    entries: DashMap<K, Arc<RwLock<V>>>,
}

impl<K, V> Default for Registry<K, V>
where
    K: std::hash::Hash + Eq + Clone + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Registry<K, V>
where
    K: std::hash::Hash + Eq + Clone + fmt::Display,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a new entry. Fails with `DuplicateId` if the key is already
    /// present — callers that want upsert semantics should `delete` first.
    pub fn add(&self, key: K, value: V) -> Result<(), RegistryError> {
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateId(key.to_string()));
        }
        self.entries.insert(key, Arc::new(RwLock::new(value)));
        Ok(())
    }

    /// Insert or replace an entry unconditionally (used by recovery).
    pub fn upsert(&self, key: K, value: V) {
        self.entries.insert(key, Arc::new(RwLock::new(value)));
    }

    /// Get a handle to the entry's lock, if present.
    pub fn get(&self, key: &K) -> Option<Arc<RwLock<V>>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn delete(&self, key: &K) -> Option<Arc<RwLock<V>>> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
