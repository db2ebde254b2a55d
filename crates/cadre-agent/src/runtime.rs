use crate::capability::AgentCapability;
use crate::config::AgentConfig;
use crate::templates::{AgentTemplate, TemplateRegistry};
use cadre_core::{AgentKey, CadreError, CadreResult, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Input for one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub payload: serde_json::Value,
}

struct HandleInner {
    id: Uuid,
    config: Arc<AgentConfig>,
    template: Arc<AgentTemplate>,
}

/// A live agent: a config bound to its template, ready to execute tasks.
///
/// Handles are cheap to clone and immutable; a reconfigured agent gets a new
/// handle.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<HandleInner>,
}

impl AgentHandle {
    /// Unique id of this instantiation.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn key(&self) -> AgentKey {
        self.inner.config.key()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn template(&self) -> &AgentTemplate {
        &self.inner.template
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.inner.id)
            .field("agent", &self.key().to_string())
            .field("revision", &self.inner.config.revision)
            .finish()
    }
}

/// Turns configs into handles and runs tasks against the external capability.
///
/// The runtime keeps no task or workflow state: `execute` only reports the
/// outcome and leaves bookkeeping to the caller.
#[derive(Clone)]
pub struct AgentRuntime {
    templates: Arc<TemplateRegistry>,
    capability: Arc<dyn AgentCapability>,
}

impl AgentRuntime {
    pub fn new(templates: TemplateRegistry, capability: Arc<dyn AgentCapability>) -> Self {
        Self {
            templates: Arc::new(templates),
            capability,
        }
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Bind a config to its template.
    ///
    /// Fails with [`CadreError::NotFound`] when the template is unknown.
    pub fn instantiate(&self, config: Arc<AgentConfig>) -> CadreResult<AgentHandle> {
        let template = self.templates.get(&config.template_id).ok_or_else(|| {
            CadreError::NotFound(format!(
                "template '{}' for agent {}",
                config.template_id,
                config.key()
            ))
        })?;
        let handle = AgentHandle {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                config,
                template,
            }),
        };
        debug!(agent = %handle.key(), handle = %handle.id(), "Agent instantiated");
        Ok(handle)
    }

    /// Run one attempt of a task.
    ///
    /// The payload is checked against the template first; a mismatch is an
    /// [`CadreError::InvalidTask`] and the capability is never called.
    /// Capability errors outside the task taxonomy are reported as
    /// [`CadreError::Execution`].
    pub async fn execute(
        &self,
        handle: &AgentHandle,
        request: &TaskRequest,
    ) -> CadreResult<serde_json::Value> {
        validate_payload(handle.template(), &request.payload)?;

        let start = Instant::now();
        let outcome = self.capability.invoke(handle, request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                debug!(
                    agent = %handle.key(),
                    task_id = %request.task_id,
                    attempt = request.attempt,
                    elapsed_ms,
                    "Capability returned"
                );
                Ok(value)
            }
            Err(
                e @ (CadreError::CapabilityUnavailable(_)
                | CadreError::Execution(_)
                | CadreError::InvalidTask(_)),
            ) => Err(e),
            Err(other) => {
                warn!(
                    agent = %handle.key(),
                    task_id = %request.task_id,
                    error = %other,
                    "Capability failed outside the task taxonomy"
                );
                Err(CadreError::Execution(other.to_string()))
            }
        }
    }
}

/// The `kind` field of a payload, if present.
pub fn payload_kind(payload: &serde_json::Value) -> Option<&str> {
    payload.get("kind").and_then(serde_json::Value::as_str)
}

fn validate_payload(template: &AgentTemplate, payload: &serde_json::Value) -> CadreResult<()> {
    if !payload.is_object() {
        return Err(CadreError::InvalidTask(format!(
            "payload for template '{}' must be a JSON object",
            template.id
        )));
    }
    if template.accepted_kinds.is_empty() {
        return Ok(());
    }
    match payload_kind(payload) {
        Some(kind) if template.accepts(kind) => Ok(()),
        Some(kind) => Err(CadreError::InvalidTask(format!(
            "template '{}' cannot process '{}' (accepts: {})",
            template.id,
            kind,
            template.accepted_kinds.join(", ")
        ))),
        None => Err(CadreError::InvalidTask(format!(
            "payload for template '{}' is missing a string 'kind'",
            template.id
        ))),
    }
}
