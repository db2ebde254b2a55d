//! Agent configuration, templates and the agent runtime.
//!
//! An agent is a configured "AI executive": an [`AgentConfig`] (identity,
//! personality, goals) stored per organization and template, bound by the
//! [`AgentRuntime`] to its [`AgentTemplate`] and executed against an opaque
//! [`AgentCapability`].
//!
//! # Main types
//!
//! - [`ConfigStore`]: Key-value store of agent configs with upsert semantics.
//! - [`AgentRuntime`]: Instantiates handles and executes task attempts.
//! - [`TemplateRegistry`]: Built-in and custom agent archetypes.
//! - [`RetryPolicy`]: Bounded attempts with exponential backoff.

/// Capability boundary and the offline echo capability.
pub mod capability;
/// Agent configuration records.
pub mod config;
/// Retry budget and backoff.
pub mod retry;
/// Handle instantiation and task execution.
pub mod runtime;
/// Config store trait and implementations.
pub mod store;
/// Executive templates.
pub mod templates;

pub use capability::{AgentCapability, EchoCapability};
pub use config::{AgentConfig, TraitMap};
pub use retry::RetryPolicy;
pub use runtime::{payload_kind, AgentHandle, AgentRuntime, TaskRequest};
pub use store::{ConfigStore, FileConfigStore, InMemoryConfigStore};
pub use templates::{default_templates, AgentTemplate, TemplateRegistry};
