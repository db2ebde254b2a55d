use crate::directory::AgentDirectory;
use crate::monitor::AgentMonitor;
use crate::settings::OrchestratorSettings;
use crate::sink::{spawn_notifier, EventSink};
use crate::task_queue::{QueuedTask, TaskQueue};
use crate::types::{
    AgentSelector, OrchestratorEvent, Task, TaskCompletion, TaskFailure, TaskState, WorkflowSnapshot,
    WorkflowSpec,
};
use crate::workflow::{Settled, WorkflowTracker};
use cadre_agent::{AgentHandle, AgentRuntime, ConfigStore, TaskRequest};
use cadre_core::{CadreError, CadreResult, OrganizationId, TaskId, WorkflowId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

struct WorkflowEntry {
    tracker: Mutex<WorkflowTracker>,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct OrgWorkers {
    wake: Arc<Notify>,
    workers: Vec<JoinHandle<()>>,
}

/// Aborts the spawned capability call when the attempt is abandoned.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Inner {
    settings: OrchestratorSettings,
    directory: AgentDirectory,
    queue: TaskQueue,
    monitor: AgentMonitor,
    workflows: RwLock<HashMap<WorkflowId, Arc<WorkflowEntry>>>,
    orgs: Mutex<HashMap<OrganizationId, OrgWorkers>>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    shutdown: watch::Sender<bool>,
}

/// The orchestration facade.
///
/// Accepts workflows, queues their tasks per organization and drives them to a
/// terminal state on a pool of workers, reporting every outcome to the
/// [`EventSink`]. Cloning is cheap and every clone drives the same engine.
///
/// Must be created inside a Tokio runtime. Workers keep running until
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        runtime: AgentRuntime,
        sink: Arc<dyn EventSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        spawn_notifier(sink, rx);
        let (shutdown, _) = watch::channel(false);

        info!(
            workers_per_org = settings.workers_per_org,
            max_attempts = settings.retry.max_attempts,
            task_timeout_ms = ?settings.task_timeout_ms,
            "Orchestrator started"
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                directory: AgentDirectory::new(store, runtime),
                queue: TaskQueue::new(),
                monitor: AgentMonitor::new(),
                workflows: RwLock::new(HashMap::new()),
                orgs: Mutex::new(HashMap::new()),
                events,
                shutdown,
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.inner.directory
    }

    pub fn monitor(&self) -> &AgentMonitor {
        &self.inner.monitor
    }

    /// Accept a workflow and queue its tasks. Returns as soon as the tasks
    /// are queued; execution happens on the organization's workers.
    ///
    /// Fails with [`CadreError::InvalidTask`] for an empty workflow, a blank
    /// selector or a dependency on a later task, and with
    /// [`CadreError::Cancelled`] after shutdown.
    pub fn submit(
        &self,
        organization_id: impl Into<OrganizationId>,
        spec: WorkflowSpec,
    ) -> CadreResult<WorkflowId> {
        let organization_id = organization_id.into();
        if *self.inner.shutdown.borrow() {
            return Err(CadreError::Cancelled);
        }
        if organization_id.as_str().trim().is_empty() {
            return Err(CadreError::InvalidTask("organization id is empty".into()));
        }

        let tracker = WorkflowTracker::new(organization_id.clone(), &spec)?;
        let workflow_id = tracker.id();
        let queued: Vec<QueuedTask> = tracker.tasks().map(QueuedTask::from).collect();
        let (cancel, _) = watch::channel(false);
        self.inner.workflows.write().insert(
            workflow_id,
            Arc::new(WorkflowEntry {
                tracker: Mutex::new(tracker),
                cancel,
            }),
        );

        let tasks = queued.len();
        for task in queued {
            self.inner.queue.enqueue(&organization_id, task);
        }
        info!(
            organization_id = %organization_id,
            workflow_id = %workflow_id,
            tasks,
            policy = ?spec.failure_policy,
            "Workflow submitted"
        );

        self.ensure_workers(&organization_id);
        self.inner.wake(&organization_id);
        Ok(workflow_id)
    }

    /// Cancel a workflow: every open task fails with `Cancelled` and running
    /// attempts are abandoned.
    ///
    /// Fails with [`CadreError::WorkflowClosed`] if the workflow already
    /// finished.
    pub fn cancel(&self, workflow_id: WorkflowId) -> CadreResult<WorkflowSnapshot> {
        let entry = self.inner.entry(workflow_id)?;
        let mut tracker = entry.tracker.lock();
        let settled = tracker.cancel()?;
        entry.cancel.send_replace(true);
        info!(
            workflow_id = %workflow_id,
            cancelled_tasks = settled.finished.len(),
            "Workflow cancelled"
        );
        self.inner.publish(&mut tracker, settled);
        Ok(tracker.snapshot())
    }

    /// Re-queue a failed task of an open workflow as a new attempt.
    ///
    /// Fails with [`CadreError::Cancelled`] after shutdown.
    pub fn retry_task(&self, workflow_id: WorkflowId, task_id: TaskId) -> CadreResult<Task> {
        if *self.inner.shutdown.borrow() {
            return Err(CadreError::Cancelled);
        }
        let entry = self.inner.entry(workflow_id)?;
        let task = {
            let mut tracker = entry.tracker.lock();
            let task = tracker.retry(task_id)?;
            self.inner
                .queue
                .enqueue(tracker.organization_id(), QueuedTask::from(&task));
            task
        };
        info!(
            workflow_id = %workflow_id,
            task_id = %task_id,
            attempt = task.attempt,
            "Task re-queued"
        );
        self.ensure_workers(&task.organization_id);
        self.inner.wake(&task.organization_id);
        Ok(task)
    }

    pub fn workflow(&self, workflow_id: WorkflowId) -> CadreResult<WorkflowSnapshot> {
        let entry = self.inner.entry(workflow_id)?;
        let snapshot = entry.tracker.lock().snapshot();
        Ok(snapshot)
    }

    pub fn task(&self, workflow_id: WorkflowId, task_id: TaskId) -> CadreResult<Task> {
        let entry = self.inner.entry(workflow_id)?;
        let tracker = entry.tracker.lock();
        tracker
            .task(task_id)
            .cloned()
            .ok_or_else(|| CadreError::NotFound(format!("task {task_id} in workflow {workflow_id}")))
    }

    /// Every known workflow of an organization, oldest first.
    pub fn workflows(&self, organization_id: &OrganizationId) -> Vec<WorkflowSnapshot> {
        let entries: Vec<Arc<WorkflowEntry>> =
            self.inner.workflows.read().values().cloned().collect();
        let mut snapshots: Vec<WorkflowSnapshot> = entries
            .iter()
            .filter_map(|entry| {
                let tracker = entry.tracker.lock();
                (tracker.organization_id() == organization_id).then(|| tracker.snapshot())
            })
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Forget finished workflows. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let mut workflows = self.inner.workflows.write();
        let before = workflows.len();
        workflows.retain(|_, entry| !entry.tracker.lock().is_closed());
        let pruned = before - workflows.len();
        if pruned > 0 {
            debug!(pruned, "Finished workflows pruned");
        }
        pruned
    }

    /// Tasks of an organization still waiting in its backlog.
    pub fn pending_tasks(&self, organization_id: &OrganizationId) -> usize {
        self.inner.queue.pending_count(organization_id)
    }

    /// Add one worker to an organization's pool. Returns the new pool size.
    pub fn spawn_worker(&self, organization_id: &OrganizationId) -> usize {
        let mut orgs = self.inner.orgs.lock();
        let pool = orgs.entry(organization_id.clone()).or_default();
        self.inner.spawn_into(organization_id, pool);
        pool.workers.len()
    }

    pub fn worker_count(&self, organization_id: &OrganizationId) -> usize {
        self.inner
            .orgs
            .lock()
            .get(organization_id)
            .map_or(0, |pool| pool.workers.len())
    }

    /// Stop every worker. Tasks already launched run to their outcome first;
    /// every workflow still open afterwards is cancelled, so its remaining
    /// tasks end `Cancelled` instead of waiting in the backlog.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let workers: Vec<JoinHandle<()>> = {
            let mut orgs = self.inner.orgs.lock();
            orgs.values_mut()
                .flat_map(|pool| pool.workers.drain(..))
                .collect()
        };
        let stopped = workers.len();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker ended abnormally");
            }
        }

        let open: Vec<WorkflowId> = self
            .inner
            .workflows
            .read()
            .iter()
            .filter(|(_, entry)| !entry.tracker.lock().is_closed())
            .map(|(id, _)| *id)
            .collect();
        let mut cancelled = 0;
        for workflow_id in open {
            match self.cancel(workflow_id) {
                Ok(_) => cancelled += 1,
                Err(CadreError::WorkflowClosed(_)) => {}
                Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Could not cancel workflow"),
            }
        }
        info!(workers = stopped, cancelled, "Orchestrator shut down");
    }

    fn ensure_workers(&self, organization_id: &OrganizationId) {
        let mut orgs = self.inner.orgs.lock();
        let pool = orgs.entry(organization_id.clone()).or_default();
        while pool.workers.len() < self.inner.settings.workers_per_org {
            self.inner.spawn_into(organization_id, pool);
        }
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Task runner ended abnormally");
    }
}

impl Inner {
    fn entry(&self, workflow_id: WorkflowId) -> CadreResult<Arc<WorkflowEntry>> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| CadreError::NotFound(format!("workflow {workflow_id}")))
    }

    fn wake(&self, organization_id: &OrganizationId) {
        if let Some(pool) = self.orgs.lock().get(organization_id) {
            pool.wake.notify_waiters();
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        if self.events.send(event).is_err() {
            debug!("Event notifier is gone, event dropped");
        }
    }

    fn spawn_into(self: &Arc<Self>, organization_id: &OrganizationId, pool: &mut OrgWorkers) {
        let worker = pool.workers.len();
        let wake = Arc::clone(&pool.wake);
        let inner = Arc::clone(self);
        pool.workers.push(tokio::spawn(inner.worker_loop(
            organization_id.clone(),
            wake,
            worker,
        )));
    }

    /// Launch every ready task without waiting on any of them, then sleep
    /// until woken. On shutdown the worker waits for its in-flight tasks.
    async fn worker_loop(
        self: Arc<Self>,
        organization_id: OrganizationId,
        wake: Arc<Notify>,
        worker: usize,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut running = JoinSet::new();
        debug!(organization_id = %organization_id, worker, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            // register before scanning so an enqueue during the scan is not lost
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while let Some(queued) = self.queue.dequeue_ready(&organization_id) {
                let inner = Arc::clone(&self);
                running.spawn(async move { inner.run_task(queued).await });
            }
            while let Some(joined) = running.try_join_next() {
                reap(joined);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.changed() => {}
                Some(joined) = running.join_next(), if !running.is_empty() => reap(joined),
            }
        }
        while let Some(joined) = running.join_next().await {
            reap(joined);
        }
        debug!(organization_id = %organization_id, worker, "Worker stopped");
    }

    async fn run_task(&self, queued: QueuedTask) {
        let task_id = queued.task_id;
        let Ok(entry) = self.entry(queued.workflow_id) else {
            debug!(task_id = %task_id, "Workflow gone, dropping queued task");
            return;
        };

        let (organization_id, selector, payload, attempt) = {
            let mut tracker = entry.tracker.lock();
            match tracker.mark_assigned(task_id) {
                Ok(true) => {}
                Ok(false) | Err(CadreError::WorkflowClosed(_)) => return,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Could not assign task");
                    return;
                }
            }
            let Some(task) = tracker.task(task_id) else {
                return;
            };
            (
                task.organization_id.clone(),
                task.selector.clone(),
                task.payload.clone(),
                task.attempt,
            )
        };

        let handle = match self
            .resolve_agent(&entry, task_id, &organization_id, &selector)
            .await
        {
            Some(Ok(handle)) => handle,
            Some(Err(e)) => {
                warn!(task_id = %task_id, selector = %selector, error = %e, "Agent resolution failed");
                self.settle(&entry, task_id, Err(TaskFailure::from_error(&e)));
                return;
            }
            None => {
                debug!(task_id = %task_id, "Resolution abandoned, workflow cancelled");
                return;
            }
        };

        {
            let mut tracker = entry.tracker.lock();
            match tracker.mark_running(task_id) {
                Ok(Some(true)) => {
                    let update = tracker.next_update();
                    self.emit(OrchestratorEvent::WorkflowUpdated(update));
                }
                Ok(Some(false)) => {}
                Ok(None) | Err(_) => return,
            }
        }

        let agent = handle.key();
        info!(
            task_id = %task_id,
            workflow_id = %queued.workflow_id,
            agent = %agent,
            attempt,
            "Executing task"
        );
        self.monitor.start_task(&agent).await;
        let started = Instant::now();
        let outcome = self
            .attempt_until_settled(&entry, &handle, &queued, payload, attempt)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.monitor
            .finish_task(&agent, matches!(outcome, Some(Ok(_))), elapsed_ms)
            .await;

        match outcome {
            Some(Ok(value)) => {
                info!(task_id = %task_id, agent = %agent, elapsed_ms, "Task succeeded");
                self.settle(&entry, task_id, Ok(value));
            }
            Some(Err(failure)) => {
                error!(task_id = %task_id, agent = %agent, error = %failure, "Task failed");
                self.settle(&entry, task_id, Err(failure));
            }
            None => debug!(task_id = %task_id, "Attempt abandoned, workflow cancelled"),
        }
    }

    /// Resolve the task's agent, backing off on transient failures such as an
    /// unreadable store. `None` if the workflow is cancelled meanwhile.
    async fn resolve_agent(
        &self,
        entry: &WorkflowEntry,
        task_id: TaskId,
        organization_id: &OrganizationId,
        selector: &AgentSelector,
    ) -> Option<CadreResult<AgentHandle>> {
        let retry = &self.settings.retry;
        let mut cancelled = entry.cancel.subscribe();
        let mut tries = 1;

        loop {
            if *cancelled.borrow() {
                return None;
            }
            let err = match self.directory.resolve(organization_id, selector).await {
                Ok(handle) => return Some(Ok(handle)),
                Err(e) => e,
            };
            if !err.is_retryable() || !retry.allows_another(tries) {
                return Some(Err(err));
            }

            let delay = retry.backoff(tries);
            warn!(
                task_id = %task_id,
                selector = %selector,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Agent resolution failed, backing off"
            );
            tries += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled.changed() => return None,
            }
        }
    }

    /// Run attempts until one succeeds, fails for good or the workflow is
    /// cancelled (`None`).
    async fn attempt_until_settled(
        &self,
        entry: &WorkflowEntry,
        handle: &AgentHandle,
        queued: &QueuedTask,
        payload: serde_json::Value,
        first_attempt: u32,
    ) -> Option<Result<serde_json::Value, TaskFailure>> {
        let retry = &self.settings.retry;
        let mut cancelled = entry.cancel.subscribe();
        let mut attempt = first_attempt;
        // attempts in this generation; an operator retry starts a fresh budget
        let mut tries = 1;

        loop {
            if *cancelled.borrow() {
                return None;
            }
            let request = TaskRequest {
                task_id: queued.task_id,
                workflow_id: queued.workflow_id,
                attempt,
                payload: payload.clone(),
            };
            let result = tokio::select! {
                result = self.execute_attempt(handle, request) => result,
                _ = cancelled.changed() => return None,
            };
            let err = match result {
                Ok(value) => return Some(Ok(value)),
                Err(e) => e,
            };
            if !err.is_retryable() || !retry.allows_another(tries) {
                return Some(Err(TaskFailure::from_error(&err)));
            }

            let delay = retry.backoff(tries);
            warn!(
                task_id = %queued.task_id,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Retryable failure, backing off"
            );
            let recorded = entry
                .tracker
                .lock()
                .record_failed_attempt(queued.task_id, TaskFailure::from_error(&err));
            attempt = match recorded {
                Ok(next) => next,
                Err(_) => return None,
            };
            tries += 1;
            self.monitor.record_retry(&handle.key()).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled.changed() => return None,
            }
        }
    }

    /// One capability call, isolated on its own task so a panicking agent
    /// surfaces as an execution error.
    async fn execute_attempt(
        &self,
        handle: &AgentHandle,
        request: TaskRequest,
    ) -> CadreResult<serde_json::Value> {
        let runtime = self.directory.runtime().clone();
        let agent = handle.clone();
        let mut call = AbortOnDrop(tokio::spawn(async move {
            runtime.execute(&agent, &request).await
        }));

        let joined = match self.settings.task_timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut call.0).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(CadreError::CapabilityUnavailable(format!(
                        "attempt timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => (&mut call.0).await,
        };
        joined.unwrap_or_else(|e| Err(CadreError::Execution(format!("agent task aborted: {e}"))))
    }

    fn settle(
        &self,
        entry: &WorkflowEntry,
        task_id: TaskId,
        outcome: Result<serde_json::Value, TaskFailure>,
    ) {
        let mut tracker = entry.tracker.lock();
        match tracker.finish(task_id, outcome) {
            Ok(Some(settled)) => self.publish(&mut tracker, settled),
            Ok(None) => debug!(task_id = %task_id, "Task already settled"),
            Err(CadreError::WorkflowClosed(workflow_id)) => {
                debug!(task_id = %task_id, workflow_id = %workflow_id, "Outcome discarded, workflow closed");
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "Could not settle task"),
        }
    }

    /// Report settled tasks and any workflow state change, then release or
    /// drop queued dependents. Runs under the workflow lock so events leave
    /// in the order they happened.
    fn publish(&self, tracker: &mut WorkflowTracker, settled: Settled) {
        let organization_id = tracker.organization_id().clone();
        let mut unblocked = false;
        let mut dropped = Vec::new();

        for task in &settled.finished {
            if task.state == TaskState::Succeeded {
                self.queue.resolve(&organization_id, task.id);
                unblocked = true;
            } else {
                dropped.push(task.id);
            }
            if let Some(completion) = TaskCompletion::from_task(task) {
                self.emit(OrchestratorEvent::TaskCompleted(completion));
            }
        }
        if !dropped.is_empty() {
            self.queue.remove(&organization_id, &dropped);
        }

        if settled.state_changed() {
            let update = tracker.next_update();
            info!(
                workflow_id = %update.workflow_id,
                from = %settled.previous,
                to = %update.state,
                "Workflow state changed"
            );
            self.emit(OrchestratorEvent::WorkflowUpdated(update));
        }

        if tracker.is_closed() {
            self.queue.forget(&organization_id, tracker.task_ids());
        } else if unblocked {
            self.wake(&organization_id);
        }
    }
}
