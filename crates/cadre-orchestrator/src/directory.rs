use crate::types::AgentSelector;
use cadre_agent::{AgentHandle, AgentRuntime, ConfigStore};
use cadre_core::{AgentKey, CadreError, CadreResult, OrganizationId, TemplateId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Resolves selectors to live agent handles, instantiating each agent once.
///
/// Handles are cached per `(organization, template)`. After a config
/// changes, [`invalidate`](Self::invalidate) makes the next resolution pick
/// up the new revision.
pub struct AgentDirectory {
    store: Arc<dyn ConfigStore>,
    runtime: AgentRuntime,
    handles: Mutex<HashMap<AgentKey, Arc<OnceCell<AgentHandle>>>>,
}

impl AgentDirectory {
    pub fn new(store: Arc<dyn ConfigStore>, runtime: AgentRuntime) -> Self {
        Self {
            store,
            runtime,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    /// Find the handle a task should run on.
    pub async fn resolve(
        &self,
        organization_id: &OrganizationId,
        selector: &AgentSelector,
    ) -> CadreResult<AgentHandle> {
        let template_id = match selector {
            AgentSelector::Agent { template_id } => template_id.clone(),
            AgentSelector::Capability { capability } => {
                self.select_by_capability(organization_id, capability).await?
            }
        };
        self.handle_for(AgentKey::new(organization_id.clone(), template_id))
            .await
    }

    /// The cached handle for an agent, instantiating it on first use.
    pub async fn handle_for(&self, key: AgentKey) -> CadreResult<AgentHandle> {
        let cell = {
            let mut handles = self.handles.lock();
            Arc::clone(handles.entry(key.clone()).or_default())
        };
        let result = cell
            .get_or_try_init(|| async {
                let config = self
                    .store
                    .get(&key.organization_id, &key.template_id)
                    .await
                    .map_err(store_unavailable)?;
                self.runtime.instantiate(config)
            })
            .await
            .cloned();
        if result.is_err() {
            let mut handles = self.handles.lock();
            let stale = handles
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell) && !current.initialized());
            if stale {
                handles.remove(&key);
            }
        }
        result
    }

    /// Drop the cached handle for an agent. Returns whether one was cached.
    pub fn invalidate(&self, key: &AgentKey) -> bool {
        let removed = self.handles.lock().remove(key);
        let was_live = removed.is_some_and(|cell| cell.initialized());
        if was_live {
            info!(agent = %key, "Agent handle invalidated");
        }
        was_live
    }

    /// Number of instantiated handles.
    pub fn cached(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// First agent of the organization, in registration order, whose
    /// template offers the capability.
    async fn select_by_capability(
        &self,
        organization_id: &OrganizationId,
        capability: &str,
    ) -> CadreResult<TemplateId> {
        let configs = self
            .store
            .list(organization_id)
            .await
            .map_err(store_unavailable)?;
        let templates = self.runtime.templates();
        let chosen = configs.iter().find(|config| {
            templates
                .get(&config.template_id)
                .is_some_and(|t| t.offers(capability))
        });
        match chosen {
            Some(config) => {
                debug!(
                    organization_id = %organization_id,
                    capability,
                    agent = %config.key(),
                    "Capability resolved"
                );
                Ok(config.template_id.clone())
            }
            None => Err(CadreError::NotFound(format!(
                "no agent in organization '{organization_id}' offers capability '{capability}'"
            ))),
        }
    }
}

/// Store I/O failures surface as a retryable unavailability.
fn store_unavailable(err: CadreError) -> CadreError {
    match err {
        CadreError::Io(e) => CadreError::CapabilityUnavailable(format!("agent store unavailable: {e}")),
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadre_agent::{AgentConfig, EchoCapability, InMemoryConfigStore, TemplateRegistry};

    async fn directory_with(configs: Vec<AgentConfig>) -> AgentDirectory {
        let store = Arc::new(InMemoryConfigStore::new());
        for config in configs {
            store.upsert(config).await.unwrap();
        }
        let runtime = AgentRuntime::new(TemplateRegistry::with_defaults(), Arc::new(EchoCapability));
        AgentDirectory::new(store, runtime)
    }

    #[tokio::test]
    async fn test_resolve_by_template() {
        let dir = directory_with(vec![AgentConfig::new("acme", "cfo", "Morgan")]).await;
        let org = OrganizationId::new("acme");
        let handle = dir.resolve(&org, &AgentSelector::agent("cfo")).await.unwrap();
        assert_eq!(handle.config().name, "Morgan");
    }

    #[tokio::test]
    async fn test_handle_is_cached_until_invalidated() {
        let dir = directory_with(vec![AgentConfig::new("acme", "cfo", "Morgan")]).await;
        let org = OrganizationId::new("acme");
        let a = dir.resolve(&org, &AgentSelector::agent("cfo")).await.unwrap();
        let b = dir.resolve(&org, &AgentSelector::agent("cfo")).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(dir.cached(), 1);

        dir.store()
            .upsert(AgentConfig::new("acme", "cfo", "Morgan").with_goal("runway_months", 24))
            .await
            .unwrap();
        assert!(dir.invalidate(&AgentKey::new("acme", "cfo")));
        let c = dir.resolve(&org, &AgentSelector::agent("cfo")).await.unwrap();
        assert_ne!(a.id(), c.id());
        assert_eq!(c.config().revision, 2);
    }

    #[tokio::test]
    async fn test_capability_picks_first_registered() {
        let dir = directory_with(vec![
            AgentConfig::new("acme", "coo", "Sam"),
            AgentConfig::new("acme", "ceo", "Avery"),
            AgentConfig::new("acme", "cmo", "Jo"),
        ])
        .await;
        let org = OrganizationId::new("acme");
        // coo, ceo and cmo all offer planning
        let handle = dir
            .resolve(&org, &AgentSelector::capability("planning"))
            .await
            .unwrap();
        assert_eq!(handle.config().name, "Sam");

        let handle = dir
            .resolve(&org, &AgentSelector::capability("branding"))
            .await
            .unwrap();
        assert_eq!(handle.config().name, "Jo");
    }

    #[tokio::test]
    async fn test_missing_agent_and_capability() {
        let dir = directory_with(vec![AgentConfig::new("acme", "cfo", "Morgan")]).await;
        let org = OrganizationId::new("acme");
        assert!(matches!(
            dir.resolve(&org, &AgentSelector::agent("cto")).await,
            Err(CadreError::NotFound(_))
        ));
        assert!(matches!(
            dir.resolve(&org, &AgentSelector::capability("security")).await,
            Err(CadreError::NotFound(_))
        ));
        assert!(matches!(
            dir.resolve(&OrganizationId::new("globex"), &AgentSelector::agent("cfo"))
                .await,
            Err(CadreError::NotFound(_))
        ));
        // failed lookups are not cached
        assert_eq!(dir.cached(), 0);
    }

    #[test]
    fn test_store_io_errors_are_transient() {
        let err = store_unavailable(CadreError::Io(std::io::Error::other("disk gone")));
        assert!(matches!(err, CadreError::CapabilityUnavailable(_)));
        assert!(err.is_retryable());
        assert!(matches!(
            store_unavailable(CadreError::NotFound("cfo".into())),
            CadreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_lookups_leave_no_entries() {
        let dir = directory_with(vec![AgentConfig::new("acme", "cfo", "Morgan")]).await;
        for org in ["globex", "initech", "umbrella"] {
            let missing = AgentKey::new(org, "cto");
            assert!(dir.handle_for(missing).await.is_err());
        }
        assert!(dir.handles.lock().is_empty());

        dir.handle_for(AgentKey::new("acme", "cfo")).await.unwrap();
        assert_eq!(dir.handles.lock().len(), 1);
    }
}
