use crate::types::{OrchestratorEvent, TaskCompletion, WorkflowUpdate};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Receives orchestration outcomes.
///
/// Callbacks run on a single notifier task, in the order the events happened.
/// They must return quickly; a panicking sink is logged and never disturbs
/// orchestration.
pub trait EventSink: Send + Sync {
    /// Called at most once per task attempt generation, when the task is terminal.
    fn on_task_complete(&self, completion: &TaskCompletion);

    /// Called when a workflow's aggregate state changes.
    fn on_workflow_update(&self, update: &WorkflowUpdate);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_task_complete(&self, _completion: &TaskCompletion) {}
    fn on_workflow_update(&self, _update: &WorkflowUpdate) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_task_complete(&self, completion: &TaskCompletion) {
        let _ = self
            .tx
            .send(OrchestratorEvent::TaskCompleted(completion.clone()));
    }

    fn on_workflow_update(&self, update: &WorkflowUpdate) {
        let _ = self
            .tx
            .send(OrchestratorEvent::WorkflowUpdated(update.clone()));
    }
}

/// Adapts a pair of closures.
pub struct FnSink<T, W> {
    on_task: T,
    on_workflow: W,
}

impl<T, W> FnSink<T, W>
where
    T: Fn(&TaskCompletion) + Send + Sync,
    W: Fn(&WorkflowUpdate) + Send + Sync,
{
    pub fn new(on_task: T, on_workflow: W) -> Self {
        Self {
            on_task,
            on_workflow,
        }
    }
}

impl<T, W> EventSink for FnSink<T, W>
where
    T: Fn(&TaskCompletion) + Send + Sync,
    W: Fn(&WorkflowUpdate) + Send + Sync,
{
    fn on_task_complete(&self, completion: &TaskCompletion) {
        (self.on_task)(completion);
    }

    fn on_workflow_update(&self, update: &WorkflowUpdate) {
        (self.on_workflow)(update);
    }
}

/// Hand one event to the sink, containing any panic.
pub(crate) fn deliver(sink: &dyn EventSink, event: &OrchestratorEvent) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match event {
        OrchestratorEvent::TaskCompleted(completion) => sink.on_task_complete(completion),
        OrchestratorEvent::WorkflowUpdated(update) => sink.on_workflow_update(update),
    }));
    if outcome.is_err() {
        match event {
            OrchestratorEvent::TaskCompleted(c) => {
                error!(task_id = %c.task_id, workflow_id = %c.workflow_id, "Event sink panicked on task completion");
            }
            OrchestratorEvent::WorkflowUpdated(u) => {
                error!(workflow_id = %u.workflow_id, state = %u.state, "Event sink panicked on workflow update");
            }
        }
    }
}

/// Drop non-terminal workflow updates superseded by a later update for the
/// same workflow in the same batch.
pub(crate) fn coalesce(batch: Vec<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut keep = vec![true; batch.len()];
    for (i, event) in batch.iter().enumerate() {
        let OrchestratorEvent::WorkflowUpdated(update) = event else {
            continue;
        };
        if update.state.is_terminal() {
            continue;
        }
        let superseded = batch[i + 1..].iter().any(|later| {
            matches!(later, OrchestratorEvent::WorkflowUpdated(u) if u.workflow_id == update.workflow_id)
        });
        keep[i] = !superseded;
    }
    batch
        .into_iter()
        .zip(keep)
        .filter_map(|(event, keep)| keep.then_some(event))
        .collect()
}

/// Run the notifier: drain events in order and deliver them to the sink.
/// Ends when every sender is dropped.
pub(crate) fn spawn_notifier(
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = rx.try_recv() {
                batch.push(next);
            }
            for event in coalesce(batch) {
                deliver(sink.as_ref(), &event);
            }
        }
        debug!("Event notifier stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{TaskOutcome, WorkflowState};
    use cadre_core::{OrganizationId, TaskId, WorkflowId};
    use parking_lot::Mutex;
    use serde_json::json;

    fn completion(workflow_id: WorkflowId) -> OrchestratorEvent {
        OrchestratorEvent::TaskCompleted(TaskCompletion {
            task_id: TaskId::new(),
            workflow_id,
            organization_id: OrganizationId::new("acme"),
            attempt: 1,
            outcome: TaskOutcome::Succeeded { result: json!({}) },
        })
    }

    fn update(workflow_id: WorkflowId, state: WorkflowState, sequence: u64) -> OrchestratorEvent {
        OrchestratorEvent::WorkflowUpdated(WorkflowUpdate {
            workflow_id,
            organization_id: OrganizationId::new("acme"),
            state,
            sequence,
            member_task_states: Vec::new(),
        })
    }

    fn sequences(events: &[OrchestratorEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::WorkflowUpdated(u) => Some(u.sequence),
                OrchestratorEvent::TaskCompleted(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_coalesce_keeps_latest_and_terminal() {
        let wf = WorkflowId::new();
        let other = WorkflowId::new();
        let batch = vec![
            update(wf, WorkflowState::Running, 1),
            update(other, WorkflowState::Running, 1),
            completion(wf),
            update(wf, WorkflowState::Completed, 2),
        ];
        let kept = coalesce(batch);
        assert_eq!(kept.len(), 3);
        assert_eq!(sequences(&kept), vec![1, 2]);
        assert!(matches!(kept[1], OrchestratorEvent::TaskCompleted(_)));
    }

    #[test]
    fn test_deliver_contains_panics() {
        let sink = FnSink::new(|_: &TaskCompletion| panic!("sink bug"), |_: &WorkflowUpdate| {});
        deliver(&sink, &completion(WorkflowId::new()));
        deliver(&sink, &update(WorkflowId::new(), WorkflowState::Running, 1));
    }

    #[tokio::test]
    async fn test_notifier_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let sink = FnSink::new(
            move |c: &TaskCompletion| recorder.lock().push(format!("task:{}", c.attempt)),
            |_: &WorkflowUpdate| {},
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = spawn_notifier(Arc::new(sink), rx);

        for attempt in 1..=5 {
            let mut event = completion(WorkflowId::new());
            if let OrchestratorEvent::TaskCompleted(c) = &mut event {
                c.attempt = attempt;
            }
            tx.send(event).unwrap();
        }
        drop(tx);
        notifier.await.unwrap();

        let expected: Vec<String> = (1..=5).map(|n| format!("task:{n}")).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_workflow_update(&WorkflowUpdate {
            workflow_id: WorkflowId::new(),
            organization_id: OrganizationId::new("acme"),
            state: WorkflowState::Failed,
            sequence: 3,
            member_task_states: Vec::new(),
        });
        match rx.recv().await.unwrap() {
            OrchestratorEvent::WorkflowUpdated(u) => assert_eq!(u.sequence, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
