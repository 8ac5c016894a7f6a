// ABOUTME: Workspace -> active session mapping and the cached message list
// ABOUTME: Records session ownership once and migrates legacy unscoped keys

use crate::error::{Result, StoreError};
use crate::keys;
use crate::kv::{migrate_once, KeyValueStore, Migration, TieredStore};
use async_trait::async_trait;
use parley_core::{Message, Topic};
use std::sync::Arc;

/// Moves the unscoped keys into the first workspace that runs it
pub struct LegacyKeys {
    workspace: String,
}

impl LegacyKeys {
    pub const ID: &'static str = "legacy-unscoped-keys";

    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Migration for LegacyKeys {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, store: &dyn KeyValueStore) -> Result<()> {
        for legacy in keys::LEGACY_KEYS {
            let Some(value) = store.get(legacy).await? else {
                continue;
            };
            let scoped = keys::scoped(&self.workspace, legacy);
            if store.get(&scoped).await?.is_none() {
                store.set(&scoped, &value).await?;
            }
            store.remove(legacy).await?;
            tracing::info!(key = legacy, workspace = %self.workspace, "migrated legacy key");
        }
        Ok(())
    }
}

/// Per-workspace session state that survives a restart
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<TieredStore>,
}

impl SessionStore {
    pub fn new(store: Arc<TieredStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    /// Run the legacy-key migration; returns whether it ran now
    pub async fn migrate_legacy(&self, workspace: &str) -> Result<bool> {
        migrate_once(self.store.as_ref(), &LegacyKeys::new(workspace)).await
    }

    pub async fn current_session(&self, workspace: &str) -> Result<Option<String>> {
        self.store.get(&keys::current_session(workspace)).await
    }

    pub async fn set_current_session(&self, workspace: &str, session: Option<&str>) -> Result<()> {
        let key = keys::current_session(workspace);
        match session {
            Some(id) => self.store.set(&key, id).await,
            None => self.store.remove(&key).await,
        }
    }

    /// Cached messages of the workspace's current session (durable tier)
    pub async fn load_messages(&self, workspace: &str) -> Result<Vec<Message>> {
        match self.store.durable().get(&keys::messages(workspace)).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn save_messages(&self, workspace: &str, messages: &[Message]) -> Result<()> {
        let json = serde_json::to_string(messages)?;
        self.store
            .durable()
            .set(&keys::messages(workspace), &json)
            .await
    }

    pub async fn clear_messages(&self, workspace: &str) -> Result<()> {
        self.store.durable().remove(&keys::messages(workspace)).await
    }

    /// Workspace that owns `session`, if recorded
    pub async fn owner(&self, session: &str) -> Result<Option<String>> {
        self.store.durable().get(&keys::session_owner(session)).await
    }

    /// Record that `session` belongs to `workspace`.
    ///
    /// A claim is written once; claiming a session owned by another
    /// workspace is an error and leaves the original claim in place.
    pub async fn claim(&self, session: &str, workspace: &str) -> Result<()> {
        match self.owner(session).await? {
            Some(owner) if owner == workspace => Ok(()),
            Some(owner) => Err(StoreError::WorkspaceConflict {
                session_id: session.to_string(),
                owner,
                requested: workspace.to_string(),
            }),
            None => {
                self.store
                    .durable()
                    .set(&keys::session_owner(session), workspace)
                    .await
            }
        }
    }

    /// Forget the claim of a deleted session
    pub async fn release(&self, session: &str) -> Result<()> {
        self.store.durable().remove(&keys::session_owner(session)).await
    }

    /// Most recent topic among `topics` claimed by `workspace`
    pub async fn find_claimed_session(
        &self,
        workspace: &str,
        topics: &[Topic],
    ) -> Result<Option<String>> {
        let mut ordered: Vec<&Topic> = topics.iter().collect();
        ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for topic in ordered {
            if self.owner(&topic.id).await?.as_deref() == Some(workspace) {
                return Ok(Some(topic.id.clone()));
            }
        }
        Ok(None)
    }
}
