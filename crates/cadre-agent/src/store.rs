use crate::config::AgentConfig;
use async_trait::async_trait;
use cadre_core::{AgentKey, CadreError, CadreResult, OrganizationId, TemplateId};
use chrono::Utc;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Key-value store holding one [`AgentConfig`] per (organization, template).
///
/// Upserts are idempotent: submitting content identical to what is stored
/// returns the stored config untouched. Changed personality or goals replace
/// the stored mappings wholesale.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch the config for a slot, or [`CadreError::NotFound`].
    async fn get(
        &self,
        organization_id: &OrganizationId,
        template_id: &TemplateId,
    ) -> CadreResult<Arc<AgentConfig>>;

    /// Insert or replace the config for the slot named by `config`.
    async fn upsert(&self, config: AgentConfig) -> CadreResult<Arc<AgentConfig>>;

    /// All configs of an organization, oldest registration first.
    async fn list(&self, organization_id: &OrganizationId) -> CadreResult<Vec<Arc<AgentConfig>>>;
}

/// Merge an incoming config with the stored one, if any.
///
/// Returns `None` when nothing changed.
fn next_version(existing: Option<&AgentConfig>, incoming: AgentConfig) -> Option<AgentConfig> {
    match existing {
        Some(current) if current.same_content(&incoming) => None,
        Some(current) => Some(AgentConfig {
            revision: current.revision + 1,
            registered_at: current.registered_at,
            ..incoming
        }),
        None => Some(AgentConfig {
            revision: 1,
            registered_at: Utc::now(),
            ..incoming
        }),
    }
}

fn not_found(organization_id: &OrganizationId, template_id: &TemplateId) -> CadreError {
    CadreError::NotFound(format!("agent config {organization_id}/{template_id}"))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct Entry {
    seq: u64,
    config: Arc<AgentConfig>,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<AgentKey, Entry>,
    next_seq: u64,
}

/// Process-local config store.
///
/// Readers take a shared lock just long enough to clone an `Arc`. Writers go
/// through an upgradable read, so concurrent upserts are serialized while
/// readers keep going until the final swap.
#[derive(Default)]
pub struct InMemoryConfigStore {
    slots: RwLock<Slots>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of configured agents across all organizations.
    pub fn len(&self) -> usize {
        self.slots.read().entries.len()
    }

    /// Whether no agent is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get(
        &self,
        organization_id: &OrganizationId,
        template_id: &TemplateId,
    ) -> CadreResult<Arc<AgentConfig>> {
        let key = AgentKey::new(organization_id.clone(), template_id.clone());
        self.slots
            .read()
            .entries
            .get(&key)
            .map(|entry| Arc::clone(&entry.config))
            .ok_or_else(|| not_found(organization_id, template_id))
    }

    async fn upsert(&self, config: AgentConfig) -> CadreResult<Arc<AgentConfig>> {
        config.validate()?;
        let key = config.key();

        let slots = self.slots.upgradable_read();
        let existing = slots.entries.get(&key);
        let Some(next) = next_version(existing.map(|e| e.config.as_ref()), config) else {
            debug!(agent = %key, "Config unchanged, skipping upsert");
            // `existing` is Some here: next_version only returns None for a match.
            return existing
                .map(|e| Arc::clone(&e.config))
                .ok_or_else(|| CadreError::NotFound(key.to_string()));
        };
        let next = Arc::new(next);

        let mut slots = RwLockUpgradableReadGuard::upgrade(slots);
        let seq = match slots.entries.get(&key) {
            Some(entry) => entry.seq,
            None => {
                slots.next_seq += 1;
                slots.next_seq
            }
        };
        slots.entries.insert(
            key.clone(),
            Entry {
                seq,
                config: Arc::clone(&next),
            },
        );
        info!(agent = %key, revision = next.revision, "Agent config stored");
        Ok(next)
    }

    async fn list(&self, organization_id: &OrganizationId) -> CadreResult<Vec<Arc<AgentConfig>>> {
        let slots = self.slots.read();
        let mut found: Vec<&Entry> = slots
            .entries
            .iter()
            .filter(|(key, _)| &key.organization_id == organization_id)
            .map(|(_, entry)| entry)
            .collect();
        found.sort_by_key(|entry| entry.seq);
        Ok(found.into_iter().map(|e| Arc::clone(&e.config)).collect())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// File-based config store: one JSON document per `<org>/<template>.json`.
///
/// Writes are serialized by an async mutex and land through a rename, so a
/// reader either sees the previous document or the new one.
pub struct FileConfigStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub async fn new(dir: PathBuf) -> CadreResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn org_dir(&self, organization_id: &OrganizationId) -> CadreResult<PathBuf> {
        check_component(organization_id.as_str())?;
        Ok(self.dir.join(organization_id.as_str()))
    }

    fn config_path(
        &self,
        organization_id: &OrganizationId,
        template_id: &TemplateId,
    ) -> CadreResult<PathBuf> {
        check_component(template_id.as_str())?;
        Ok(self
            .org_dir(organization_id)?
            .join(format!("{}.json", template_id.as_str())))
    }

    async fn read_config(path: &Path) -> CadreResult<Option<AgentConfig>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => {
                let config: AgentConfig = serde_json::from_str(&data).map_err(|e| {
                    CadreError::Config(format!(
                        "Failed to parse agent config '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Ids become path components, so separators and parent references are refused.
fn check_component(part: &str) -> CadreResult<()> {
    if part.is_empty()
        || part == "."
        || part == ".."
        || part.contains(['/', '\\'])
        || part.starts_with('.')
    {
        return Err(CadreError::Config(format!(
            "'{part}' cannot be used as a store key"
        )));
    }
    Ok(())
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(
        &self,
        organization_id: &OrganizationId,
        template_id: &TemplateId,
    ) -> CadreResult<Arc<AgentConfig>> {
        let path = self.config_path(organization_id, template_id)?;
        Self::read_config(&path)
            .await?
            .map(Arc::new)
            .ok_or_else(|| not_found(organization_id, template_id))
    }

    async fn upsert(&self, config: AgentConfig) -> CadreResult<Arc<AgentConfig>> {
        config.validate()?;
        let org_dir = self.org_dir(&config.organization_id)?;
        let path = self.config_path(&config.organization_id, &config.template_id)?;

        let _guard = self.write_lock.lock().await;
        let existing = Self::read_config(&path).await?;
        let Some(next) = next_version(existing.as_ref(), config) else {
            debug!(path = %path.display(), "Config unchanged, skipping write");
            return existing
                .map(Arc::new)
                .ok_or_else(|| CadreError::NotFound(path.display().to_string()));
        };

        tokio::fs::create_dir_all(&org_dir).await?;
        let tmp = org_dir.join(format!(".{}.{}.tmp", next.template_id, Uuid::new_v4()));
        let json = serde_json::to_string_pretty(&next)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(agent = %next.key(), revision = next.revision, "Agent config written");
        Ok(Arc::new(next))
    }

    async fn list(&self, organization_id: &OrganizationId) -> CadreResult<Vec<Arc<AgentConfig>>> {
        let org_dir = self.org_dir(organization_id)?;
        let mut entries = match tokio::fs::read_dir(&org_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut configs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            if let Some(config) = Self::read_config(&entry.path()).await? {
                configs.push(config);
            }
        }
        configs.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.template_id.cmp(&b.template_id))
        });
        Ok(configs.into_iter().map(Arc::new).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cfo() -> AgentConfig {
        AgentConfig::new("acme", "cfo", "Morgan")
            .with_personality("tone", "analytical")
            .with_goal("runway_months", 18)
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryConfigStore::new();
        let err = store
            .get(&OrganizationId::new("acme"), &TemplateId::new("cfo"))
            .await
            .unwrap_err();
        assert!(matches!(err, CadreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upsert_assigns_first_revision() {
        let store = InMemoryConfigStore::new();
        let stored = store.upsert(cfo()).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_identical_upsert_is_noop() {
        let store = InMemoryConfigStore::new();
        let first = store.upsert(cfo()).await.unwrap();
        let second = store.upsert(cfo()).await.unwrap();
        assert_eq!(*first, *second);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_changed_upsert_replaces_mappings() {
        let store = InMemoryConfigStore::new();
        let first = store.upsert(cfo()).await.unwrap();

        let replacement = AgentConfig::new("acme", "cfo", "Morgan").with_goal("margin", 0.25);
        let second = store.upsert(replacement).await.unwrap();

        assert_eq!(second.revision, 2);
        assert_eq!(second.registered_at, first.registered_at);
        assert!(second.personality.is_empty());
        assert!(!second.goals.contains_key("runway_months"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_missing_identity() {
        let store = InMemoryConfigStore::new();
        let err = store
            .upsert(AgentConfig::new("acme", "", "Nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, CadreError::Config(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_in_registration_order() {
        let store = InMemoryConfigStore::new();
        store.upsert(AgentConfig::new("acme", "cto", "Riley")).await.unwrap();
        store.upsert(AgentConfig::new("acme", "ceo", "Avery")).await.unwrap();
        store.upsert(AgentConfig::new("other", "ceo", "Sam")).await.unwrap();
        // Updating keeps the original position.
        store
            .upsert(AgentConfig::new("acme", "cto", "Riley").with_goal("uptime", 99.9))
            .await
            .unwrap();

        let listed = store.list(&OrganizationId::new("acme")).await.unwrap();
        let templates: Vec<&str> = listed.iter().map(|c| c.template_id.as_str()).collect();
        assert_eq!(templates, vec!["cto", "ceo"]);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(tmp.path().join("agents")).await.unwrap();

        let stored = store.upsert(cfo()).await.unwrap();
        assert_eq!(stored.revision, 1);

        let loaded = store
            .get(&OrganizationId::new("acme"), &TemplateId::new("cfo"))
            .await
            .unwrap();
        assert_eq!(*loaded, *stored);

        let again = store.upsert(cfo()).await.unwrap();
        assert_eq!(again.revision, 1);
    }

    #[tokio::test]
    async fn test_file_store_list_skips_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(tmp.path().to_path_buf()).await.unwrap();
        store.upsert(AgentConfig::new("acme", "ceo", "Avery")).await.unwrap();
        tokio::fs::write(tmp.path().join("acme").join(".ceo.partial.tmp"), "{")
            .await
            .unwrap();

        let listed = store.list(&OrganizationId::new("acme")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store
            .list(&OrganizationId::new("nobody"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(tmp.path().to_path_buf()).await.unwrap();
        let err = store
            .upsert(AgentConfig::new("..", "ceo", "Evil"))
            .await
            .unwrap_err();
        assert!(matches!(err, CadreError::Config(_)));
    }
}
