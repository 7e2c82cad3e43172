//! Configuration (§A.3 ambient stack): scheduler and protocol tuning knobs,
//! builder-style like the teacher's config types.

use std::time::Duration;

/// Tuning for the scheduler loop (§4.8) and task-update worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_pool_size: usize,
    pub min_tick_interval: Duration,
    pub max_tick_interval: Duration,
    pub task_trylock_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 20,
            min_tick_interval: Duration::from_secs(1),
            max_tick_interval: Duration::from_secs(30),
            task_trylock_timeout: Duration::from_millis(50),
        }
    }
}

impl SchedulerConfig {
    pub fn with_worker_pool_size(mut self, n: usize) -> Self {
        self.worker_pool_size = n;
        self
    }

    pub fn clamp_tick(&self, elapsed: Duration) -> Duration {
        elapsed.clamp(self.min_tick_interval, self.max_tick_interval)
    }
}

/// Tuning for the checkout/notice protocol (§4.9, §5).
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub checkout_timeout: Duration,
    pub coreq_length: usize,
    pub max_work_failure: u32,
    pub max_client_failure: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            checkout_timeout: Duration::from_secs(20),
            coreq_length: 64,
            max_work_failure: 3,
            max_client_failure: 5,
        }
    }
}

impl ProtocolConfig {
    pub fn with_max_work_failure(mut self, n: u32) -> Self {
        self.max_work_failure = n;
        self
    }

    pub fn with_max_client_failure(mut self, n: u32) -> Self {
        self.max_client_failure = n;
        self
    }

    /// The effective retry budget for a task, honoring its `no_retry` flag
    /// (§4.9: "1 if the task is flagged no-retry, else configured value").
    pub fn effective_max_work_failure(&self, no_retry: bool) -> u32 {
        if no_retry {
            1
        } else {
            self.max_work_failure
        }
    }
}
