use cadre_core::AgentKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    /// The last task this agent finished failed.
    Error,
}

/// Cumulative counters for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// Automatic retries after a retryable failure.
    pub retries: u64,
    pub duration_ms: u64,
}

impl AgentMetrics {
    fn add(&mut self, other: &AgentMetrics) {
        self.tasks_started += other.tasks_started;
        self.tasks_succeeded += other.tasks_succeeded;
        self.tasks_failed += other.tasks_failed;
        self.retries += other.retries;
        self.duration_ms += other.duration_ms;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent: AgentKey,
    pub active_tasks: u32,
    pub status: WorkerStatus,
    pub metrics: AgentMetrics,
}

impl AgentState {
    fn new(agent: AgentKey) -> Self {
        Self {
            agent,
            active_tasks: 0,
            status: WorkerStatus::Idle,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Tracks activity and metrics for every agent that has run a task.
#[derive(Default)]
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<AgentKey, AgentState>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An agent picked up a task.
    pub async fn start_task(&self, agent: &AgentKey) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.clone())
            .or_insert_with(|| AgentState::new(agent.clone()));
        state.active_tasks += 1;
        state.status = WorkerStatus::Working;
        state.metrics.tasks_started += 1;
    }

    /// An agent finished a task, successfully or not.
    pub async fn finish_task(&self, agent: &AgentKey, succeeded: bool, duration_ms: u64) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.clone())
            .or_insert_with(|| AgentState::new(agent.clone()));
        state.active_tasks = state.active_tasks.saturating_sub(1);
        state.metrics.duration_ms += duration_ms;
        if succeeded {
            state.metrics.tasks_succeeded += 1;
        } else {
            state.metrics.tasks_failed += 1;
        }
        state.status = match (state.active_tasks, succeeded) {
            (0, true) => WorkerStatus::Idle,
            (0, false) => WorkerStatus::Error,
            _ => WorkerStatus::Working,
        };
    }

    pub async fn record_retry(&self, agent: &AgentKey) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.metrics.retries += 1;
        }
    }

    /// All agent states, ordered by agent key.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        let mut all: Vec<AgentState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.agent.cmp(&b.agent));
        all
    }

    pub async fn get_state(&self, agent: &AgentKey) -> Option<AgentState> {
        let states = self.states.read().await;
        states.get(agent).cloned()
    }

    /// Sum of all agents' metrics.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.add(&state.metrics);
        }
        total
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let monitor = AgentMonitor::new();
        assert!(monitor.snapshot().await.is_empty());
        assert!(monitor.get_state(&AgentKey::new("acme", "cfo")).await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_finish_task() {
        let monitor = AgentMonitor::new();
        let cfo = AgentKey::new("acme", "cfo");

        monitor.start_task(&cfo).await;
        monitor.start_task(&cfo).await;
        let state = monitor.get_state(&cfo).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.active_tasks, 2);

        monitor.finish_task(&cfo, true, 40).await;
        assert_eq!(
            monitor.get_state(&cfo).await.unwrap().status,
            WorkerStatus::Working
        );
        monitor.finish_task(&cfo, true, 60).await;
        let state = monitor.get_state(&cfo).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert_eq!(state.metrics.tasks_succeeded, 2);
        assert_eq!(state.metrics.duration_ms, 100);
    }

    #[tokio::test]
    async fn test_failure_and_retry() {
        let monitor = AgentMonitor::new();
        let cto = AgentKey::new("acme", "cto");
        monitor.start_task(&cto).await;
        monitor.record_retry(&cto).await;
        monitor.finish_task(&cto, false, 10).await;

        let state = monitor.get_state(&cto).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Error);
        assert_eq!(state.metrics.retries, 1);
        assert_eq!(state.metrics.tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_aggregate_metrics() {
        let monitor = AgentMonitor::new();
        let a = AgentKey::new("acme", "cfo");
        let b = AgentKey::new("globex", "cfo");
        for key in [&a, &b] {
            monitor.start_task(key).await;
            monitor.finish_task(key, true, 5).await;
        }

        let total = monitor.aggregate_metrics().await;
        assert_eq!(total.tasks_started, 2);
        assert_eq!(total.duration_ms, 10);

        let json = monitor.to_json().await;
        assert_eq!(json["agents"].as_array().unwrap().len(), 2);
        assert_eq!(json["aggregate"]["tasks_succeeded"], 2);
    }
}
