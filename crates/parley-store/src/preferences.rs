// ABOUTME: Provider/model and execution strategy preferences per workspace and per topic
// ABOUTME: A topic's recorded preference wins over the workspace default

use crate::error::Result;
use crate::keys;
use crate::kv::KeyValueStore;
use parley_core::ExecutionStrategy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Provider and model choice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPreference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ModelPreference {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            model: Some(model.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.model.is_none()
    }
}

#[derive(Clone)]
pub struct PreferenceStore {
    store: Arc<dyn KeyValueStore>,
}

impl PreferenceStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn workspace_preference(&self, workspace: &str) -> Result<ModelPreference> {
        Ok(ModelPreference {
            provider: self.store.get(&keys::provider(workspace)).await?,
            model: self.store.get(&keys::model(workspace)).await?,
        })
    }

    pub async fn set_workspace_preference(
        &self,
        workspace: &str,
        preference: &ModelPreference,
    ) -> Result<()> {
        self.put(&keys::provider(workspace), preference.provider.as_deref())
            .await?;
        self.put(&keys::model(workspace), preference.model.as_deref())
            .await
    }

    pub async fn topic_preference(
        &self,
        workspace: &str,
        topic: &str,
    ) -> Result<Option<ModelPreference>> {
        match self.store.get(&keys::topic_preference(workspace, topic)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set_topic_preference(
        &self,
        workspace: &str,
        topic: &str,
        preference: &ModelPreference,
    ) -> Result<()> {
        let json = serde_json::to_string(preference)?;
        self.store
            .set(&keys::topic_preference(workspace, topic), &json)
            .await
    }

    pub async fn remove_topic_preference(&self, workspace: &str, topic: &str) -> Result<()> {
        self.store
            .remove(&keys::topic_preference(workspace, topic))
            .await
    }

    /// Preference to use for `topic`: its own if recorded, else the workspace's
    pub async fn resolve_for_topic(
        &self,
        workspace: &str,
        topic: Option<&str>,
    ) -> Result<ModelPreference> {
        if let Some(topic) = topic {
            if let Some(preference) = self.topic_preference(workspace, topic).await? {
                return Ok(preference);
            }
        }
        self.workspace_preference(workspace).await
    }

    pub async fn execution_strategy(&self, workspace: &str) -> Result<Option<ExecutionStrategy>> {
        let stored = self.store.get(&keys::execution_strategy(workspace)).await?;
        Ok(stored.and_then(|value| match value.parse::<ExecutionStrategy>() {
            Ok(strategy) => Some(strategy),
            Err(e) => {
                tracing::warn!(workspace, error = %e, "ignoring stored execution strategy");
                None
            }
        }))
    }

    pub async fn set_execution_strategy(
        &self,
        workspace: &str,
        strategy: ExecutionStrategy,
    ) -> Result<()> {
        self.store
            .set(&keys::execution_strategy(workspace), strategy.as_str())
            .await
    }

    async fn put(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.store.set(key, value).await,
            None => self.store.remove(key).await,
        }
    }
}
