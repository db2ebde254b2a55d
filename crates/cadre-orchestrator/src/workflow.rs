use crate::types::{
    AgentSelector, FailurePolicy, MemberTaskState, Task, TaskFailure, TaskState, WorkflowSnapshot,
    WorkflowSpec, WorkflowState, WorkflowUpdate,
};
use cadre_core::{CadreError, CadreResult, OrganizationId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Tasks that reached a terminal state in one step, and what it did to the
/// workflow.
#[derive(Debug, Clone)]
pub struct Settled {
    /// The finished task first, then any dependents failed along with it.
    pub finished: Vec<Task>,
    pub previous: WorkflowState,
    pub current: WorkflowState,
}

impl Settled {
    pub fn state_changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Derive the aggregate state from member task states.
///
/// `started` is true once any task has left `Pending`/`Assigned` in any
/// attempt, so a workflow never falls back to `Pending` after a retry.
pub fn derive_state(policy: FailurePolicy, started: bool, states: &[TaskState]) -> WorkflowState {
    if !states.is_empty() && states.iter().all(|s| s.is_terminal()) {
        let failed = states.iter().filter(|s| **s == TaskState::Failed).count();
        return match (failed, policy) {
            (0, _) => WorkflowState::Completed,
            (n, FailurePolicy::BestEffort) if n < states.len() => WorkflowState::PartiallyFailed,
            _ => WorkflowState::Failed,
        };
    }
    let progressed = states
        .iter()
        .any(|s| matches!(s, TaskState::Running | TaskState::Succeeded | TaskState::Failed));
    if started || progressed {
        WorkflowState::Running
    } else {
        WorkflowState::Pending
    }
}

/// Owns a workflow's tasks and keeps its aggregate state in step with them.
///
/// Every mutation recomputes the state from the task set. Once the state is
/// terminal the tracker rejects further changes with
/// [`CadreError::WorkflowClosed`].
pub struct WorkflowTracker {
    id: WorkflowId,
    organization_id: OrganizationId,
    policy: FailurePolicy,
    state: WorkflowState,
    created_at: DateTime<Utc>,
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Task>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    sequence: u64,
}

impl WorkflowTracker {
    /// Build the task set for a submission.
    ///
    /// Rejects empty workflows, blank selectors and dependencies that do not
    /// point at an earlier task.
    pub fn new(organization_id: OrganizationId, spec: &WorkflowSpec) -> CadreResult<Self> {
        if spec.tasks.is_empty() {
            return Err(CadreError::InvalidTask("workflow has no tasks".into()));
        }

        let id = WorkflowId::new();
        let mut order: Vec<TaskId> = Vec::with_capacity(spec.tasks.len());
        let mut tasks = HashMap::with_capacity(spec.tasks.len());
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

        for (index, task_spec) in spec.tasks.iter().enumerate() {
            validate_selector(index, &task_spec.selector)?;
            let mut deps = Vec::with_capacity(task_spec.depends_on.len());
            for &dep in &task_spec.depends_on {
                let dep_id = order.get(dep).copied().ok_or_else(|| {
                    CadreError::InvalidTask(format!(
                        "task {index} depends on {dep}, which is not an earlier task"
                    ))
                })?;
                if !deps.contains(&dep_id) {
                    deps.push(dep_id);
                }
            }

            let task = Task::new(
                id,
                organization_id.clone(),
                task_spec.selector.clone(),
                task_spec.payload.clone(),
            )
            .with_dependencies(deps);
            for dep in &task.depends_on {
                dependents.entry(*dep).or_default().push(task.id);
            }
            order.push(task.id);
            tasks.insert(task.id, task);
        }

        Ok(Self {
            id,
            organization_id,
            policy: spec.failure_policy,
            state: WorkflowState::Pending,
            created_at: Utc::now(),
            order,
            tasks,
            dependents,
            sequence: 0,
        })
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    /// Tasks in submission order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    /// `Pending` → `Assigned`. Returns `false` if the task is not pending.
    pub fn mark_assigned(&mut self, task_id: TaskId) -> CadreResult<bool> {
        self.ensure_open()?;
        let task = self.task_mut(task_id)?;
        if task.state != TaskState::Pending {
            return Ok(false);
        }
        task.state = TaskState::Assigned;
        Ok(true)
    }

    /// `Assigned` → `Running`. Returns `Ok(None)` if the task was not
    /// assigned, otherwise whether the workflow state changed.
    pub fn mark_running(&mut self, task_id: TaskId) -> CadreResult<Option<bool>> {
        self.ensure_open()?;
        let task = self.task_mut(task_id)?;
        if task.state != TaskState::Assigned {
            return Ok(None);
        }
        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        let previous = self.state;
        Ok(Some(self.recompute() != previous))
    }

    /// Archive a failed attempt of a running task before an automatic retry.
    /// Returns the new attempt number.
    pub fn record_failed_attempt(
        &mut self,
        task_id: TaskId,
        failure: TaskFailure,
    ) -> CadreResult<u32> {
        self.ensure_open()?;
        let task = self.task_mut(task_id)?;
        if task.state != TaskState::Running {
            return Err(CadreError::InvalidTask(format!(
                "task {task_id} is {}, not running",
                task.state
            )));
        }
        task.archive_attempt(TaskState::Failed, Some(failure));
        task.started_at = Some(Utc::now());
        Ok(task.attempt)
    }

    /// Settle a task with its final outcome.
    ///
    /// A failure also fails every open task that transitively depends on it.
    /// Returns `Ok(None)` if the task was already terminal.
    pub fn finish(
        &mut self,
        task_id: TaskId,
        outcome: Result<serde_json::Value, TaskFailure>,
    ) -> CadreResult<Option<Settled>> {
        self.ensure_open()?;
        let previous = self.state;
        let task = self.task_mut(task_id)?;
        if task.is_terminal() {
            return Ok(None);
        }

        let now = Utc::now();
        let failed = outcome.is_err();
        match outcome {
            Ok(value) => {
                task.state = TaskState::Succeeded;
                task.result = Some(value);
                task.error = None;
            }
            Err(failure) => {
                task.state = TaskState::Failed;
                task.result = None;
                task.error = Some(failure);
            }
        }
        task.finished_at = Some(now);

        let mut finished = vec![task.clone()];
        if failed {
            finished.extend(self.cascade_failure(task_id));
        }
        let current = self.recompute();
        Ok(Some(Settled {
            finished,
            previous,
            current,
        }))
    }

    /// Fail every open task with `Cancelled`.
    pub fn cancel(&mut self) -> CadreResult<Settled> {
        self.ensure_open()?;
        let previous = self.state;
        let now = Utc::now();
        let mut finished = Vec::new();
        for id in &self.order {
            if let Some(task) = self.tasks.get_mut(id) {
                if !task.is_terminal() {
                    task.state = TaskState::Failed;
                    task.error = Some(TaskFailure::cancelled());
                    task.finished_at = Some(now);
                    finished.push(task.clone());
                }
            }
        }
        let current = self.recompute();
        Ok(Settled {
            finished,
            previous,
            current,
        })
    }

    /// Put a failed task back to `Pending` as a new attempt.
    pub fn retry(&mut self, task_id: TaskId) -> CadreResult<Task> {
        self.ensure_open()?;
        let blocked_by = self.task(task_id).and_then(|task| {
            task.depends_on.iter().copied().find(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.state == TaskState::Failed)
            })
        });
        if let Some(dep) = blocked_by {
            return Err(CadreError::InvalidTask(format!(
                "task {task_id} waits on failed task {dep}; retry that first"
            )));
        }
        let task = self.task_mut(task_id)?;
        if task.state != TaskState::Failed {
            return Err(CadreError::InvalidTask(format!(
                "only failed tasks can be retried; task {task_id} is {}",
                task.state
            )));
        }
        let error = task.error.take();
        task.archive_attempt(TaskState::Failed, error);
        task.state = TaskState::Pending;
        task.started_at = None;
        task.finished_at = None;
        let task = task.clone();
        self.recompute();
        Ok(task)
    }

    /// Re-derive the aggregate state. Idempotent.
    pub fn recompute(&mut self) -> WorkflowState {
        let states: Vec<TaskState> = self.tasks().map(|t| t.state).collect();
        let started = self.tasks.values().any(|t| !t.history.is_empty());
        self.state = derive_state(self.policy, started, &states);
        self.state
    }

    /// Next workflow-update payload; each call advances the sequence.
    pub fn next_update(&mut self) -> WorkflowUpdate {
        self.sequence += 1;
        WorkflowUpdate {
            workflow_id: self.id,
            organization_id: self.organization_id.clone(),
            state: self.state,
            sequence: self.sequence,
            member_task_states: self
                .tasks()
                .map(|t| MemberTaskState {
                    task_id: t.id,
                    state: t.state,
                })
                .collect(),
        }
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id,
            organization_id: self.organization_id.clone(),
            state: self.state,
            failure_policy: self.policy,
            created_at: self.created_at,
            tasks: self.tasks().cloned().collect(),
        }
    }

    fn ensure_open(&self) -> CadreResult<()> {
        if self.is_closed() {
            Err(CadreError::WorkflowClosed(self.id))
        } else {
            Ok(())
        }
    }

    fn task_mut(&mut self, task_id: TaskId) -> CadreResult<&mut Task> {
        let workflow_id = self.id;
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| CadreError::NotFound(format!("task {task_id} in workflow {workflow_id}")))
    }

    fn cascade_failure(&mut self, root: TaskId) -> Vec<Task> {
        let now = Utc::now();
        let mut failed = Vec::new();
        let mut stack = vec![root];
        while let Some(parent) = stack.pop() {
            let Some(children) = self.dependents.get(&parent).cloned() else {
                continue;
            };
            for child in children {
                if let Some(task) = self.tasks.get_mut(&child) {
                    if task.is_terminal() {
                        continue;
                    }
                    task.state = TaskState::Failed;
                    task.error = Some(TaskFailure::dependency_failed(parent));
                    task.finished_at = Some(now);
                    failed.push(task.clone());
                    stack.push(child);
                }
            }
        }
        failed
    }
}

fn validate_selector(index: usize, selector: &AgentSelector) -> CadreResult<()> {
    let blank = match selector {
        AgentSelector::Agent { template_id } => template_id.as_str().trim().is_empty(),
        AgentSelector::Capability { capability } => capability.trim().is_empty(),
    };
    if blank {
        return Err(CadreError::InvalidTask(format!(
            "task {index} has an empty selector"
        )));
    }
    Ok(())
}
