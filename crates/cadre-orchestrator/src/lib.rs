//! Workflow orchestration for configured agents.
//!
//! Callers submit a [`WorkflowSpec`] for an organization. Its tasks enter the
//! organization's backlog, a pool of workers executes them on the selected
//! agents with bounded retries, and every terminal task and workflow state
//! change is reported to an [`EventSink`].
//!
//! # Main types
//!
//! - [`Orchestrator`]: Facade: submit, cancel, retry, query.
//! - [`WorkflowTracker`]: A workflow's tasks and their derived aggregate state.
//! - [`TaskQueue`]: Per-organization FIFO backlog with dependency gating.
//! - [`AgentDirectory`]: Selector resolution and the agent handle cache.
//! - [`AgentMonitor`]: Per-agent activity and metrics.

/// Selector resolution and handle caching.
pub mod directory;
/// The orchestration engine.
pub mod engine;
/// Agent activity and metrics.
pub mod monitor;
/// Engine settings.
pub mod settings;
/// Event sinks and ordered delivery.
pub mod sink;
/// Per-organization backlog.
pub mod task_queue;
/// Tasks, workflows and events.
pub mod types;
/// Workflow state tracking.
pub mod workflow;

pub use directory::AgentDirectory;
pub use engine::Orchestrator;
pub use monitor::{AgentMetrics, AgentMonitor, AgentState, WorkerStatus};
pub use settings::OrchestratorSettings;
pub use sink::{ChannelSink, EventSink, FnSink, NoopSink};
pub use task_queue::{QueuedTask, TaskQueue};
pub use types::{
    AgentSelector, AttemptRecord, FailureKind, FailurePolicy, MemberTaskState, OrchestratorEvent,
    Task, TaskCompletion, TaskFailure, TaskOutcome, TaskSpec, TaskState, WorkflowSnapshot,
    WorkflowSpec, WorkflowState, WorkflowUpdate,
};
pub use workflow::{derive_state, Settled, WorkflowTracker};
