// ABOUTME: Key/value persistence interface with in-memory and SQLite tiers
// ABOUTME: TieredStore reads the transient tier first and writes through to both

use crate::error::Result;
use crate::keys;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// String key/value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// A named, idempotent data migration
#[async_trait]
pub trait Migration: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, store: &dyn KeyValueStore) -> Result<()>;
}

/// Run `migration` unless its marker key says it already ran.
/// Returns whether it ran this time.
pub async fn migrate_once(store: &dyn KeyValueStore, migration: &dyn Migration) -> Result<bool> {
    let marker = keys::migration_marker(migration.id());
    if store.get(&marker).await?.is_some() {
        tracing::debug!(migration = migration.id(), "migration already applied");
        return Ok(false);
    }
    migration.run(store).await?;
    store.set(&marker, &Utc::now().to_rfc3339()).await?;
    tracing::info!(migration = migration.id(), "migration applied");
    Ok(true)
}

/// Process-lifetime storage
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Durable storage in a SQLite file
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().display());
        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM kv WHERE substr(key, 1, ?) = ? ORDER BY key ASC",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }
}

/// Transient tier in front of a durable one.
///
/// Reads try the transient tier first and promote durable hits into it.
/// Writes and removals go to both tiers. Values that must only live on disk
/// go through [`TieredStore::durable`].
pub struct TieredStore {
    transient: Arc<dyn KeyValueStore>,
    durable: Arc<dyn KeyValueStore>,
}

impl TieredStore {
    pub fn new(transient: Arc<dyn KeyValueStore>, durable: Arc<dyn KeyValueStore>) -> Self {
        Self { transient, durable }
    }

    /// Both tiers in memory; nothing survives the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    /// Memory in front of a SQLite file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let durable = SqliteStore::open(path).await?;
        Ok(Self::new(Arc::new(MemoryStore::new()), Arc::new(durable)))
    }

    pub fn transient(&self) -> &dyn KeyValueStore {
        self.transient.as_ref()
    }

    pub fn durable(&self) -> &dyn KeyValueStore {
        self.durable.as_ref()
    }
}

#[async_trait]
impl KeyValueStore for TieredStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.transient.get(key).await? {
            return Ok(Some(value));
        }
        let value = self.durable.get(key).await?;
        if let Some(value) = &value {
            self.transient.set(key, value).await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.transient.set(key, value).await?;
        self.durable.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.transient.remove(key).await?;
        self.durable.remove(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = self.transient.keys_with_prefix(prefix).await?;
        keys.extend(self.durable.keys_with_prefix(prefix).await?);
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
