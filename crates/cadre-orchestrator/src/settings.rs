use cadre_agent::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Workers started per organization on its first submission.
    #[serde(default = "default_workers_per_org")]
    pub workers_per_org: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Upper bound for a single attempt; a timed-out attempt counts as a
    /// retryable `CapabilityUnavailable`.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

fn default_workers_per_org() -> usize {
    2
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers_per_org: default_workers_per_org(),
            retry: RetryPolicy::default(),
            task_timeout_ms: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn with_workers(mut self, workers_per_org: usize) -> Self {
        self.workers_per_org = workers_per_org;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }
}
