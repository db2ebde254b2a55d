//! Core identifiers and error definitions for the Cadre orchestrator.
//!
//! This crate provides the foundational types shared across all Cadre crates:
//! the tenant/agent/task/workflow identifiers and the error taxonomy used by
//! the agent runtime and the orchestration engine.
//!
//! # Main types
//!
//! - [`CadreError`]: Unified error enum for all Cadre subsystems.
//! - [`CadreResult`]: Convenience alias for `Result<T, CadreError>`.
//! - [`OrganizationId`], [`TemplateId`], [`AgentKey`]: agent addressing.
//! - [`TaskId`], [`WorkflowId`]: work item identifiers.

/// Strongly typed identifiers.
pub mod ids;

pub use ids::{AgentKey, OrganizationId, TaskId, TemplateId, WorkflowId};

// --- Error types ---

/// Top-level error type for the Cadre orchestrator.
///
/// The first six variants form the orchestration taxonomy; the remaining ones
/// cover configuration and I/O plumbing.
#[derive(Debug, thiserror::Error)]
pub enum CadreError {
    /// A config, task or workflow lookup found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The task payload or selector cannot be processed. Never retried.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// The agent or its backing capability could not be reached. Retryable.
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The capability ran but produced an error result. Retryable up to the
    /// attempt budget.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A mutation was attempted on a workflow that already reached a terminal state.
    #[error("Workflow {0} is closed")]
    WorkflowClosed(WorkflowId),

    /// The work was cancelled by an operator.
    #[error("Cancelled")]
    Cancelled,

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadreError {
    /// Whether the failure is transient and the attempt may be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CadreError::CapabilityUnavailable(_) | CadreError::Execution(_)
        )
    }
}

/// A convenience `Result` alias using [`CadreError`].
pub type CadreResult<T> = Result<T, CadreError>;
