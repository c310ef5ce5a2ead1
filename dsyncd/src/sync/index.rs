use std::path::Path;

use sqlx::{
    Row, Sqlite, SqlitePool, Transaction, migrate::Migrator, sqlite::SqliteConnectOptions,
    sqlite::SqliteRow,
};
use thiserror::Error;
use tokio::sync::Mutex;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RECORD_COLUMNS: &str =
    "id, path, path_lower, loaded, revision, size, server_modified, client_modified";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One known remote file or folder. Folders carry neither revision nor size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub path_display: String,
    pub path_lower: String,
    pub loaded: bool,
    pub revision: Option<String>,
    pub size: Option<i64>,
    pub server_modified: Option<i64>,
    pub client_modified: Option<i64>,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.revision.is_none()
    }
}

/// Which side a recorded delete still has to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteTarget {
    Local,
    Remote,
}

impl DeleteTarget {
    fn as_str(self) -> &'static str {
        match self {
            DeleteTarget::Local => "local",
            DeleteTarget::Remote => "remote",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(DeleteTarget::Local),
            "remote" => Some(DeleteTarget::Remote),
            _ => None,
        }
    }
}

/// A delete whose metadata is already gone but whose side effect has not been confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub path_display: String,
    pub path_lower: String,
    pub target: DeleteTarget,
}

/// Persistent cache of remote metadata.
///
/// Reads go straight to the pool. Every mutation takes the store-wide write
/// lock for the duration of its read-modify-write, so concurrent callers
/// never interleave inside one logical update.
pub struct MetadataStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Shared with the settings store; both tables live in one database.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn read(&self, id: &str) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM metadata WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn read_by_lower_path(
        &self,
        path_lower: &str,
    ) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM metadata WHERE path_lower = ?1"
        ))
        .bind(path_lower)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn upsert(&self, record: &FileRecord) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        upsert_in(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// All-or-nothing: either every record lands or none does.
    pub async fn batch_upsert(&self, records: &[FileRecord]) -> Result<(), IndexError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for record in records {
            upsert_in(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_loaded(&self, id: &str, loaded: bool) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE metadata SET loaded = ?1 WHERE id = ?2")
            .bind(if loaded { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_lower_path(&self, path_lower: &str) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM metadata WHERE path_lower = ?1")
            .bind(path_lower)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the record at `pending.path_lower` and everything beneath it, and
    /// records the delete it implies in the same transaction so that the delete
    /// is replayed after a restart until [`Self::finish_delete`] runs. Returns the
    /// number of metadata rows removed.
    pub async fn delete_subtree_pending(&self, pending: &PendingDelete) -> Result<u64, IndexError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let removed = delete_subtree_in(&mut tx, &pending.path_lower).await?;
        sqlx::query(
            "INSERT INTO pending_deletes (path_lower, path, target) VALUES (?1, ?2, ?3)
             ON CONFLICT(path_lower, target) DO UPDATE SET path = excluded.path",
        )
        .bind(&pending.path_lower)
        .bind(&pending.path_display)
        .bind(pending.target.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Deletes not yet confirmed, oldest first.
    pub async fn list_pending_deletes(&self) -> Result<Vec<PendingDelete>, IndexError> {
        let rows = sqlx::query("SELECT path_lower, path, target FROM pending_deletes ORDER BY rowid ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let target: String = row.try_get("target")?;
            let Some(target) = DeleteTarget::parse(&target) else {
                continue;
            };
            out.push(PendingDelete {
                path_display: row.try_get("path")?,
                path_lower: row.try_get("path_lower")?,
                target,
            });
        }
        Ok(out)
    }

    pub async fn finish_delete(&self, path_lower: &str, target: DeleteTarget) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM pending_deletes WHERE path_lower = ?1 AND target = ?2")
            .bind(path_lower)
            .bind(target.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records whose content is not on disk yet, parents before children.
    pub async fn list_not_loaded(&self) -> Result<Vec<FileRecord>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM metadata WHERE loaded = 0 ORDER BY path_lower ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    /// Forgets every record and pending delete; used when the local folder is set up from scratch.
    pub async fn clear(&self) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM metadata").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM pending_deletes").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn delete_subtree_in(
    tx: &mut Transaction<'_, Sqlite>,
    path_lower: &str,
) -> Result<u64, IndexError> {
    let result = sqlx::query(
        "DELETE FROM metadata WHERE path_lower = ?1 OR path_lower LIKE ?2 ESCAPE '\\'",
    )
    .bind(path_lower)
    .bind(subtree_pattern(path_lower))
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_in(
    tx: &mut Transaction<'_, Sqlite>,
    record: &FileRecord,
) -> Result<(), IndexError> {
    // A different id may still hold the path, e.g. a file deleted and re-created remotely.
    sqlx::query("DELETE FROM metadata WHERE path_lower = ?1 AND id <> ?2")
        .bind(&record.path_lower)
        .bind(&record.id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "
            INSERT INTO metadata (
                id,
                path,
                path_lower,
                loaded,
                revision,
                size,
                server_modified,
                client_modified
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                path_lower = excluded.path_lower,
                revision = excluded.revision,
                size = excluded.size,
                server_modified = excluded.server_modified,
                client_modified = excluded.client_modified;
            ",
    )
    .bind(&record.id)
    .bind(&record.path_display)
    .bind(&record.path_lower)
    .bind(if record.loaded { 1 } else { 0 })
    .bind(&record.revision)
    .bind(record.size)
    .bind(record.server_modified)
    .bind(record.client_modified)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, IndexError> {
    let loaded: i64 = row.try_get("loaded")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        path_display: row.try_get("path")?,
        path_lower: row.try_get("path_lower")?,
        loaded: loaded != 0,
        revision: row.try_get("revision")?,
        size: row.try_get("size")?,
        server_modified: row.try_get("server_modified")?,
        client_modified: row.try_get("client_modified")?,
    })
}

fn subtree_pattern(path_lower: &str) -> String {
    let mut escaped = String::with_capacity(path_lower.len() + 2);
    for ch in path_lower.trim_end_matches('/').chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push_str("/%");
    escaped
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
