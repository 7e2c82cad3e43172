//! Job: a top-level submission (§3).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IllegalTransition, SuspensionRecord};
use crate::ids::{JobId, WiId};

/// Job lifecycle states (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Init,
    Queuing,
    Queued,
    InProgress,
    Suspended,
    Completed,
    FailedPermanent,
    Deleted,
}

impl JobState {
    /// Legal transitions for a job (§4.6):
    /// init -> queuing -> queued -> in-progress -> completed;
    /// any non-terminal -> suspended; suspended -> queuing (resume);
    /// queued -> deleted.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (Init, Queuing)
            | (Queuing, Queued)
            | (Queued, InProgress)
            | (InProgress, Completed) => true,
            (Suspended, Queuing) => true,
            (Queued, Deleted) => true,
            (from, Suspended) if !matches!(from, Completed | FailedPermanent | Deleted) => true,
            (from, FailedPermanent) if !matches!(from, Completed | Deleted) => true,
            _ => false,
        }
    }
}

/// A top-level workflow submission (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub acl: Vec<String>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub client_group: Option<String>,
    /// Optional pipeline tag (AWE's `pipeline` mutate flag, §6/B).
    pub pipeline: Option<String>,
    pub state: JobState,
    pub root_wi: Option<WiId>,
    /// Legacy-mode remaining-task counter (§3, Open Question b).
    pub remaining_tasks_legacy: Option<u32>,
    pub expiration: Option<Duration>,
    pub suspension: Option<SuspensionRecord>,
}

impl Job {
    pub fn new(id: JobId, priority: i32) -> Self {
        Self {
            id,
            acl: Vec::new(),
            submit_time: Utc::now(),
            start_time: None,
            complete_time: None,
            priority,
            client_group: None,
            pipeline: None,
            state: JobState::Init,
            root_wi: None,
            remaining_tasks_legacy: None,
            expiration: None,
            suspension: None,
        }
    }

    pub fn transition(&mut self, to: JobState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition {
                entity: format!("job {}", self.id),
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            });
        }
        if to == JobState::InProgress && self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        if to == JobState::Completed {
            self.complete_time = Some(Utc::now());
        }
        self.state = to;
        Ok(())
    }

    pub fn suspend(&mut self, record: SuspensionRecord) -> Result<(), IllegalTransition> {
        self.transition(JobState::Suspended)?;
        self.suspension = Some(record);
        Ok(())
    }

    /// AWE-style job expiration (§B): when the job should be purged, if ever.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let complete = self.complete_time?;
        let expiration = self.expiration?;
        Some(complete + expiration)
    }

    pub fn is_expired_as_of(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

/// Collaborator seam for purging expired jobs (§B supplemented feature):
/// the scheduler core only knows how to recognize expiry via
/// [`Job::expires_at`]; actual deletion is a document/blob-store concern
/// left to the embedder, mirroring AWE's separate janitor process.
pub trait JobExpirationSweeper: Send + Sync {
    /// Called periodically by the embedder with the jobs currently known to
    /// be completed; returns the subset that should be purged.
    fn sweep(&self, jobs: &[Job], now: DateTime<Utc>) -> Vec<JobId> {
        jobs.iter()
            .filter(|j| j.is_expired_as_of(now))
            .map(|j| j.id)
            .collect()
    }
}
