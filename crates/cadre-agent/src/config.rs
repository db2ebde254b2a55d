use cadre_core::{AgentKey, CadreError, CadreResult, OrganizationId, TemplateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Open mapping of trait or goal keys to arbitrary JSON values.
///
/// Templates are extensible, so no fixed fields are assumed; consumers read
/// the keys they understand and ignore the rest.
pub type TraitMap = BTreeMap<String, serde_json::Value>;

/// Configuration of one agent slot: identity, personality and goals.
///
/// `revision` and `registered_at` are owned by the config store; values
/// supplied by callers are ignored on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub organization_id: OrganizationId,
    pub template_id: TemplateId,
    pub name: String,
    #[serde(default)]
    pub personality: TraitMap,
    #[serde(default)]
    pub goals: TraitMap,
    /// Bumped by the store each time the content changes.
    #[serde(default)]
    pub revision: u64,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl AgentConfig {
    pub fn new(
        organization_id: impl Into<OrganizationId>,
        template_id: impl Into<TemplateId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            template_id: template_id.into(),
            name: name.into(),
            personality: TraitMap::new(),
            goals: TraitMap::new(),
            revision: 0,
            registered_at: Utc::now(),
        }
    }

    pub fn with_personality(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.personality.insert(key.into(), value.into());
        self
    }

    pub fn with_goal(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.goals.insert(key.into(), value.into());
        self
    }

    /// The slot this config occupies.
    pub fn key(&self) -> AgentKey {
        AgentKey::new(self.organization_id.clone(), self.template_id.clone())
    }

    /// Compares the caller-owned fields, ignoring store bookkeeping.
    pub fn same_content(&self, other: &AgentConfig) -> bool {
        self.organization_id == other.organization_id
            && self.template_id == other.template_id
            && self.name == other.name
            && self.personality == other.personality
            && self.goals == other.goals
    }

    /// Checks the required identity fields. Personality and goal contents are
    /// the caller's responsibility.
    pub fn validate(&self) -> CadreResult<()> {
        if self.organization_id.as_str().trim().is_empty() {
            return Err(CadreError::Config("organization_id must not be empty".into()));
        }
        if self.template_id.as_str().trim().is_empty() {
            return Err(CadreError::Config("template_id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(CadreError::Config(format!(
                "agent {} must have a name",
                self.key()
            )));
        }
        Ok(())
    }

    /// Looks up a personality trait that holds a string.
    pub fn trait_str(&self, key: &str) -> Option<&str> {
        self.personality.get(key).and_then(serde_json::Value::as_str)
    }
}
