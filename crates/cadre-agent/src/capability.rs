use crate::runtime::{payload_kind, AgentHandle, TaskRequest};
use async_trait::async_trait;
use cadre_core::CadreResult;
use serde_json::json;

/// The opaque reasoning step an agent delegates to.
///
/// Implementations may be slow and fallible. They should report transient
/// outages as `CapabilityUnavailable`, bad answers as `Execution` and payloads
/// they cannot handle as `InvalidTask`.
///
/// To plug in a model provider:
/// 1. Implement `AgentCapability` for a client type
/// 2. Read the agent's briefing and personality from `agent`
/// 3. Hand it to `AgentRuntime::new`
#[async_trait]
pub trait AgentCapability: Send + Sync {
    /// Produce a result for one attempt of a task.
    async fn invoke(
        &self,
        agent: &AgentHandle,
        request: &TaskRequest,
    ) -> CadreResult<serde_json::Value>;
}

/// Deterministic offline capability.
///
/// Answers with a structured acknowledgement built from the agent's identity,
/// tone and goals plus the task payload. Useful for local runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCapability;

#[async_trait]
impl AgentCapability for EchoCapability {
    async fn invoke(
        &self,
        agent: &AgentHandle,
        request: &TaskRequest,
    ) -> CadreResult<serde_json::Value> {
        let config = agent.config();
        let template = agent.template();
        let kind = payload_kind(&request.payload).unwrap_or("task");
        let tone = config.trait_str("tone").unwrap_or("neutral");

        Ok(json!({
            "agent": config.name,
            "title": template.title,
            "tone": tone,
            "kind": kind,
            "summary": format!("{} ({}) handled {} in a {} voice", config.name, template.title, kind, tone),
            "goals": config.goals,
            "input": request.payload,
            "attempt": request.attempt,
        }))
    }
}
