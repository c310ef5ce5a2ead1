use std::path::PathBuf;

use sqlx::{Row, SqlitePool};

use super::index::IndexError;

const KEY_LOCAL_ROOT: &str = "local_root";
const KEY_CURSOR: &str = "cursor";
const KEY_INITIAL_SYNC_DONE: &str = "initial_sync_done";
const KEY_FIRST_RUN: &str = "first_run";

/// Key/value pairs in the `settings` table. Expects the schema to be migrated already.
#[derive(Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn local_root(&self) -> Result<Option<PathBuf>, IndexError> {
        Ok(self.get(KEY_LOCAL_ROOT).await?.map(PathBuf::from))
    }

    pub async fn set_local_root(&self, root: &std::path::Path) -> Result<(), IndexError> {
        self.set(KEY_LOCAL_ROOT, &root.to_string_lossy()).await
    }

    /// A fresh database counts as a first run until [`Self::mark_first_run_complete`].
    pub async fn is_first_run(&self) -> Result<bool, IndexError> {
        Ok(self.get(KEY_FIRST_RUN).await?.as_deref() != Some("false"))
    }

    pub async fn mark_first_run_complete(&self) -> Result<(), IndexError> {
        self.set(KEY_FIRST_RUN, "false").await
    }
}

/// Durable position in the remote change stream.
#[derive(Clone)]
pub struct CursorStore {
    settings: SettingsStore,
}

impl CursorStore {
    pub fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self::new(SettingsStore::from_pool(pool))
    }

    pub async fn read_cursor(&self) -> Result<Option<String>, IndexError> {
        self.settings.get(KEY_CURSOR).await
    }

    pub async fn write_cursor(&self, cursor: &str) -> Result<(), IndexError> {
        self.settings.set(KEY_CURSOR, cursor).await
    }

    pub async fn is_initial_sync_done(&self) -> Result<bool, IndexError> {
        Ok(self.settings.get(KEY_INITIAL_SYNC_DONE).await?.as_deref() == Some("true"))
    }

    pub async fn mark_initial_sync_done(&self) -> Result<(), IndexError> {
        self.settings.set(KEY_INITIAL_SYNC_DONE, "true").await
    }

    /// Drops the cursor and the initial-sync flag so the next start lists everything again.
    pub async fn reset(&self) -> Result<(), IndexError> {
        self.settings.remove(KEY_CURSOR).await?;
        self.settings.remove(KEY_INITIAL_SYNC_DONE).await
    }
}
