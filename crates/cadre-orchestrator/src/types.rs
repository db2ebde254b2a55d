use cadre_core::{CadreError, OrganizationId, TaskId, TemplateId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Lifecycle of a task. Transitions only move forward; a terminal task changes
/// again only through an operator retry, which starts a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Assigned => write!(f, "assigned"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a task (or one of its attempts) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    InvalidTask,
    CapabilityUnavailable,
    ExecutionError,
    Cancelled,
    /// A prerequisite task failed, so this one can never run.
    DependencyFailed,
}

/// Terminal error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "workflow cancelled")
    }

    pub fn dependency_failed(dependency: TaskId) -> Self {
        Self::new(
            FailureKind::DependencyFailed,
            format!("prerequisite task {dependency} failed"),
        )
    }

    /// Classify an orchestration error.
    pub fn from_error(err: &CadreError) -> Self {
        let kind = match err {
            CadreError::NotFound(_) => FailureKind::NotFound,
            CadreError::InvalidTask(_) => FailureKind::InvalidTask,
            CadreError::CapabilityUnavailable(_) => FailureKind::CapabilityUnavailable,
            CadreError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::ExecutionError,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Which agent a task goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum AgentSelector {
    /// The organization's agent configured for this template.
    Agent { template_id: TemplateId },
    /// The first registered agent whose template offers the capability.
    Capability { capability: String },
}

impl AgentSelector {
    pub fn agent(template_id: impl Into<TemplateId>) -> Self {
        AgentSelector::Agent {
            template_id: template_id.into(),
        }
    }

    pub fn capability(capability: impl Into<String>) -> Self {
        AgentSelector::Capability {
            capability: capability.into(),
        }
    }
}

impl fmt::Display for AgentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSelector::Agent { template_id } => write!(f, "agent:{template_id}"),
            AgentSelector::Capability { capability } => write!(f, "capability:{capability}"),
        }
    }
}

/// A finished attempt archived by an automatic or operator retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

/// A unit of work owned by exactly one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub selector: AgentSelector,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Earlier tasks of the same workflow that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        workflow_id: WorkflowId,
        organization_id: OrganizationId,
        selector: AgentSelector,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: TaskId::new(),
            workflow_id,
            organization_id,
            selector,
            payload,
            state: TaskState::Pending,
            result: None,
            error: None,
            attempt: 1,
            depends_on: Vec::new(),
            history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move the current attempt into `history` as a failed attempt.
    pub(crate) fn archive_attempt(&mut self, state: TaskState, error: Option<TaskFailure>) {
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            state,
            result: self.result.take(),
            error,
            started_at: self.started_at,
            finished_at: Utc::now(),
        });
        self.attempt += 1;
    }
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// Aggregate state of a workflow, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyFailed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::PartiallyFailed
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Pending => write!(f, "pending"),
            WorkflowState::Running => write!(f, "running"),
            WorkflowState::Completed => write!(f, "completed"),
            WorkflowState::Failed => write!(f, "failed"),
            WorkflowState::PartiallyFailed => write!(f, "partially_failed"),
        }
    }
}

/// How task failures roll up into the workflow state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any failed task fails the workflow once every task is terminal.
    #[default]
    FailFastAll,
    /// A mix of successes and failures ends as `PartiallyFailed`.
    BestEffort,
}

/// One task of a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub selector: AgentSelector,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Indices of earlier tasks in the same spec that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// A workflow submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl WorkflowSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Append an independent task.
    pub fn task(self, selector: AgentSelector, payload: serde_json::Value) -> Self {
        self.task_after(selector, payload, Vec::new())
    }

    /// Append a task that waits for the tasks at the given indices.
    pub fn task_after(
        mut self,
        selector: AgentSelector,
        payload: serde_json::Value,
        depends_on: Vec<usize>,
    ) -> Self {
        self.tasks.push(TaskSpec {
            selector,
            payload,
            depends_on,
        });
        self
    }
}

/// Task id and state pair carried in workflow updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTaskState {
    pub task_id: TaskId,
    pub state: TaskState,
}

/// Point-in-time copy of a workflow and its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: WorkflowId,
    pub organization_id: OrganizationId,
    pub state: WorkflowState,
    pub failure_policy: FailurePolicy,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { result: serde_json::Value },
    Failed { error: TaskFailure },
}

/// Payload of the task-completion callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

impl TaskCompletion {
    /// Build the completion for a terminal task; `None` if it is still open.
    pub fn from_task(task: &Task) -> Option<Self> {
        let outcome = match task.state {
            TaskState::Succeeded => TaskOutcome::Succeeded {
                result: task.result.clone().unwrap_or(serde_json::Value::Null),
            },
            TaskState::Failed => TaskOutcome::Failed {
                error: task
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskFailure::new(FailureKind::ExecutionError, "unknown")),
            },
            _ => return None,
        };
        Some(Self {
            task_id: task.id,
            workflow_id: task.workflow_id,
            organization_id: task.organization_id.clone(),
            attempt: task.attempt,
            outcome,
        })
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Succeeded { .. })
    }
}

/// Payload of the workflow-update callback: the latest state, not a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub state: WorkflowState,
    /// Increases with every update of the same workflow.
    pub sequence: u64,
    pub member_task_states: Vec<MemberTaskState>,
}

/// Everything the orchestrator reports outward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskCompleted(TaskCompletion),
    WorkflowUpdated(WorkflowUpdate),
}
