//! Durable key/value storage for everything the scanner keeps across restarts.
//!
//! Values are JSON blobs wrapped in a `{version, payload}` envelope. A blob
//! written before the envelope existed is read as version 0 and rewritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;

/// Current envelope version for persisted blobs.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local store unavailable: {0}")]
    Init(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("blob `{key}` has unsupported version {version}")]
    UnsupportedVersion { key: String, version: u32 },
    #[error("write rejected for `{0}`")]
    WriteRejected(String),
}

/// Async string key/value store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Versioned<T> {
    version: u32,
    payload: T,
}

/// Read a typed blob, migrating a bare (version 0) payload in place.
pub async fn read_versioned<T>(store: &dyn LocalStore, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned + Serialize + Send + Sync,
{
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };

    let value: Value = serde_json::from_str(&raw)?;
    if let Some(version) = envelope_version(&value) {
        if version > STORE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                key: key.to_string(),
                version,
            });
        }
        let envelope: Versioned<T> = serde_json::from_value(value)?;
        return Ok(Some(envelope.payload));
    }

    let payload: T = serde_json::from_value(value)?;
    write_versioned(store, key, &payload).await?;
    tracing::info!(key, "migrated unversioned blob");
    Ok(Some(payload))
}

/// Write a typed blob inside the current envelope.
pub async fn write_versioned<T>(store: &dyn LocalStore, key: &str, payload: &T) -> Result<(), StoreError>
where
    T: Serialize + Sync,
{
    let envelope = Versioned {
        version: STORE_VERSION,
        payload,
    };
    let raw = serde_json::to_string(&envelope)?;
    store.set(key, &raw).await
}

fn envelope_version(value: &Value) -> Option<u32> {
    let object = value.as_object()?;
    if object.len() != 2 || !object.contains_key("payload") {
        return None;
    }
    object
        .get("version")?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
}

/// SQLite-backed store.
///
/// The pool is opened on first use; clones share it.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// `<data dir>/cylinder/scanner.db`, when the platform has a data dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("cylinder").join("scanner.db"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> anyhow::Result<SqlitePool> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory at {:?}", parent))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite store at {:?}", self.path))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create kv_store table")?;

        Ok(pool)
    }

    async fn pool(&self) -> Result<SqlitePool, StoreError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = self
            .connect()
            .await
            .map_err(|err| StoreError::Init(format!("{err:#}")))?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Close the pool. The next call reopens it.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT key FROM kv_store ORDER BY key")
            .fetch_all(&pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("key").map_err(StoreError::from))
            .collect()
    }
}

/// In-process store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: std::sync::Mutex<BTreeMap<String, String>>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail, as a full disk would.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected(key.to_string()));
        }
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries().keys().cloned().collect())
    }
}
