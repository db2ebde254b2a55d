use crate::types::Task;
use cadre_core::{OrganizationId, TaskId, WorkflowId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// A backlog entry: the task to run and what it waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    pub depends_on: Vec<TaskId>,
}

impl QueuedTask {
    /// Whether every dependency is in `satisfied`.
    pub fn is_ready(&self, satisfied: &HashSet<TaskId>) -> bool {
        self.depends_on.iter().all(|dep| satisfied.contains(dep))
    }
}

impl From<&Task> for QueuedTask {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            workflow_id: task.workflow_id,
            depends_on: task.depends_on.clone(),
        }
    }
}

#[derive(Default)]
struct Backlog {
    entries: VecDeque<QueuedTask>,
    satisfied: HashSet<TaskId>,
}

/// Per-organization FIFO backlogs with dependency gating.
///
/// `dequeue_ready` pops under the lock, so an entry is handed to at most one
/// worker. Organizations never share a backlog.
#[derive(Default)]
pub struct TaskQueue {
    backlogs: Mutex<HashMap<OrganizationId, Backlog>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to its organization's backlog.
    pub fn enqueue(&self, organization_id: &OrganizationId, task: QueuedTask) {
        let mut backlogs = self.backlogs.lock();
        backlogs
            .entry(organization_id.clone())
            .or_default()
            .entries
            .push_back(task);
    }

    /// Remove and return the oldest entry whose dependencies have all succeeded.
    pub fn dequeue_ready(&self, organization_id: &OrganizationId) -> Option<QueuedTask> {
        let mut backlogs = self.backlogs.lock();
        let backlog = backlogs.get_mut(organization_id)?;
        let pos = backlog
            .entries
            .iter()
            .position(|entry| entry.is_ready(&backlog.satisfied))?;
        backlog.entries.remove(pos)
    }

    /// Record a successful task so its dependents become ready.
    pub fn resolve(&self, organization_id: &OrganizationId, task_id: TaskId) {
        let mut backlogs = self.backlogs.lock();
        backlogs
            .entry(organization_id.clone())
            .or_default()
            .satisfied
            .insert(task_id);
    }

    /// Drop queued entries for the given tasks. Returns how many were removed.
    pub fn remove(&self, organization_id: &OrganizationId, task_ids: &[TaskId]) -> usize {
        let mut backlogs = self.backlogs.lock();
        let Some(backlog) = backlogs.get_mut(organization_id) else {
            return 0;
        };
        let before = backlog.entries.len();
        backlog
            .entries
            .retain(|entry| !task_ids.contains(&entry.task_id));
        before - backlog.entries.len()
    }

    /// Forget everything about the given tasks once their workflow is closed.
    pub fn forget(&self, organization_id: &OrganizationId, task_ids: &[TaskId]) {
        let mut backlogs = self.backlogs.lock();
        let Some(backlog) = backlogs.get_mut(organization_id) else {
            return;
        };
        backlog
            .entries
            .retain(|entry| !task_ids.contains(&entry.task_id));
        for id in task_ids {
            backlog.satisfied.remove(id);
        }
        if backlog.entries.is_empty() && backlog.satisfied.is_empty() {
            backlogs.remove(organization_id);
        }
    }

    /// Entries still waiting in an organization's backlog.
    pub fn pending_count(&self, organization_id: &OrganizationId) -> usize {
        self.backlogs
            .lock()
            .get(organization_id)
            .map_or(0, |b| b.entries.len())
    }

    /// Entries that could be dequeued right now.
    pub fn ready_count(&self, organization_id: &OrganizationId) -> usize {
        self.backlogs.lock().get(organization_id).map_or(0, |b| {
            b.entries.iter().filter(|e| e.is_ready(&b.satisfied)).count()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.backlogs.lock().values().all(|b| b.entries.is_empty())
    }
}
