//! `cadre.toml` loading and agent seeding.

use cadre_agent::{AgentConfig, ConfigStore};
use cadre_core::{AgentKey, CadreError, CadreResult};
use cadre_orchestrator::OrchestratorSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The full CLI configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CadreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// Agents upserted into the store at startup and on every reload.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl CadreConfig {
    /// Directory of the file-backed agent store.
    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Parse a config document. `origin` names the source in error messages.
pub fn parse_str(content: &str, origin: &str) -> CadreResult<CadreConfig> {
    let config: CadreConfig = toml::from_str(content)
        .map_err(|e| CadreError::Config(format!("Failed to parse config '{origin}': {e}")))?;
    for agent in &config.agents {
        agent.validate()?;
    }
    Ok(config)
}

/// Read and parse a config file (blocking; used by the watcher thread).
pub fn parse_config(path: &Path) -> CadreResult<CadreConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CadreError::Config(format!(
            "Failed to read config '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_str(&content, &path.display().to_string())
}

pub async fn load(path: &Path) -> CadreResult<CadreConfig> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        CadreError::Config(format!(
            "Failed to read config '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_str(&content, &path.display().to_string())
}

/// Upsert every configured agent. Returns the agents whose stored revision
/// changed, so their cached handles can be dropped.
pub async fn seed_agents(
    store: &dyn ConfigStore,
    agents: &[AgentConfig],
) -> CadreResult<Vec<AgentKey>> {
    let mut changed = Vec::new();
    for agent in agents {
        let before = match store.get(&agent.organization_id, &agent.template_id).await {
            Ok(existing) => Some(existing.revision),
            Err(CadreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let stored = store.upsert(agent.clone()).await?;
        if before != Some(stored.revision) {
            debug!(agent = %stored.key(), revision = stored.revision, "Agent config stored");
            changed.push(stored.key());
        }
    }
    Ok(changed)
}
