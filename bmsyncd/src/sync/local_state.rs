use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use bmsync_core::{SerializedSyncError, SyncError};
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

impl From<StateError> for SyncError {
    fn from(err: StateError) -> Self {
        SyncError::unexpected(format!("local state: {err}"))
    }
}

/// SQLite database holding the local sync state of every account.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StateError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StateError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn for_account(&self, account_id: i64) -> LocalState {
        LocalState {
            pool: self.pool.clone(),
            account_id,
        }
    }
}

pub fn default_db_path() -> Result<PathBuf, StateError> {
    let mut path = dirs::data_dir().ok_or(StateError::MissingDataDir)?;
    path.push("bmsync");
    path.push("state.db");
    Ok(path)
}

/// Per-account view of the state store: checksum cache, changed-files set,
/// directory state token, staleness flag and the last recorded error.
///
/// Every mutation is committed before the call returns.
#[derive(Clone)]
pub struct LocalState {
    pool: SqlitePool,
    account_id: i64,
}

impl LocalState {
    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub async fn changed_files(&self) -> Result<BTreeSet<PathBuf>, StateError> {
        let rows = sqlx::query("SELECT path FROM changed_files WHERE account_id = ?1")
            .bind(self.account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("path")
                    .map(PathBuf::from)
                    .map_err(StateError::from)
            })
            .collect()
    }

    /// Changed files with the revision of their latest mark.
    pub async fn changed_revisions(&self) -> Result<BTreeMap<PathBuf, i64>, StateError> {
        let rows = sqlx::query("SELECT path, revision FROM changed_files WHERE account_id = ?1")
            .bind(self.account_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let path: String = row.try_get("path")?;
            out.insert(PathBuf::from(path), row.try_get("revision")?);
        }
        Ok(out)
    }

    pub async fn mark_changed(&self, path: &Path) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO changed_files (account_id, path, revision) VALUES (?1, ?2, 0)
             ON CONFLICT(account_id, path) DO UPDATE SET revision = changed_files.revision + 1",
        )
        .bind(self.account_id)
        .bind(path_key(path))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clears the mark only if nobody marked the file again after `revision`
    /// was read. Returns whether the mark was cleared.
    pub async fn unmark_changed(&self, path: &Path, revision: i64) -> Result<bool, StateError> {
        let result = sqlx::query(
            "DELETE FROM changed_files WHERE account_id = ?1 AND path = ?2 AND revision = ?3",
        )
        .bind(self.account_id)
        .bind(path_key(path))
        .bind(revision)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cached_checksum(&self, path: &Path) -> Result<Option<String>, StateError> {
        let row = sqlx::query("SELECT checksum FROM checksums WHERE account_id = ?1 AND path = ?2")
            .bind(self.account_id)
            .bind(path_key(path))
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("checksum")?),
            None => None,
        })
    }

    pub async fn set_cached_checksum(&self, path: &Path, checksum: &str) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO checksums (account_id, path, checksum) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id, path) DO UPDATE SET checksum = excluded.checksum",
        )
        .bind(self.account_id)
        .bind(path_key(path))
        .bind(checksum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn erase_cached_checksum(&self, path: &Path) -> Result<(), StateError> {
        sqlx::query("DELETE FROM checksums WHERE account_id = ?1 AND path = ?2")
            .bind(self.account_id)
            .bind(path_key(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cached_checksums(&self) -> Result<BTreeMap<PathBuf, String>, StateError> {
        let rows = sqlx::query("SELECT path, checksum FROM checksums WHERE account_id = ?1")
            .bind(self.account_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let path: String = row.try_get("path")?;
            out.insert(PathBuf::from(path), row.try_get("checksum")?);
        }
        Ok(out)
    }

    pub async fn dir_state(&self) -> Result<Option<String>, StateError> {
        let row = sqlx::query("SELECT dir_state FROM sync_meta WHERE account_id = ?1")
            .bind(self.account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("dir_state")?,
            None => None,
        })
    }

    pub async fn set_dir_state(&self, dir_state: Option<&str>) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO sync_meta (account_id, dir_state, stale) VALUES (?1, ?2, 1)
             ON CONFLICT(account_id) DO UPDATE SET dir_state = excluded.dir_state",
        )
        .bind(self.account_id)
        .bind(dir_state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// An account without any stored state is stale: nothing has been tracked yet.
    pub async fn is_stale(&self) -> Result<bool, StateError> {
        let row = sqlx::query("SELECT stale FROM sync_meta WHERE account_id = ?1")
            .bind(self.account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get::<i64, _>("stale")? != 0,
            None => true,
        })
    }

    pub async fn set_stale(&self, stale: bool) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO sync_meta (account_id, dir_state, stale) VALUES (?1, NULL, ?2)
             ON CONFLICT(account_id) DO UPDATE SET stale = excluded.stale",
        )
        .bind(self.account_id)
        .bind(if stale { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forgets everything known about the cloud; the change set must be rebuilt.
    pub async fn reset(&self) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checksums WHERE account_id = ?1")
            .bind(self.account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM changed_files WHERE account_id = ?1")
            .bind(self.account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO sync_meta (account_id, dir_state, stale) VALUES (?1, NULL, 1)
             ON CONFLICT(account_id) DO UPDATE SET dir_state = NULL, stale = 1",
        )
        .bind(self.account_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Adds rebuilt entries to the change set and clears staleness atomically.
    pub async fn finish_rebuild(&self, changed: &BTreeSet<PathBuf>) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await?;
        for path in changed {
            sqlx::query("INSERT OR IGNORE INTO changed_files (account_id, path) VALUES (?1, ?2)")
                .bind(self.account_id)
                .bind(path_key(path))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO sync_meta (account_id, dir_state, stale) VALUES (?1, NULL, 0)
             ON CONFLICT(account_id) DO UPDATE SET stale = 0",
        )
        .bind(self.account_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Records the end of a successful pass: new directory token, not stale, no error.
    pub async fn commit_pass(&self, dir_state: Option<&str>) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO sync_meta (account_id, dir_state, stale) VALUES (?1, ?2, 0)
             ON CONFLICT(account_id) DO UPDATE SET dir_state = excluded.dir_state, stale = 0",
        )
        .bind(self.account_id)
        .bind(dir_state)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sync_errors WHERE account_id = ?1")
            .bind(self.account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_error(&self, error: &SerializedSyncError) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO sync_errors (account_id, kind, timestamp, message) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id) DO UPDATE SET
                kind = excluded.kind,
                timestamp = excluded.timestamp,
                message = excluded.message",
        )
        .bind(self.account_id)
        .bind(error.kind)
        .bind(error.timestamp)
        .bind(&error.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_error(&self) -> Result<Option<SerializedSyncError>, StateError> {
        let row = sqlx::query(
            "SELECT kind, timestamp, message FROM sync_errors WHERE account_id = ?1",
        )
        .bind(self.account_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SerializedSyncError {
            kind: row.try_get("kind")?,
            timestamp: row.try_get("timestamp")?,
            message: row.try_get("message")?,
        }))
    }

    /// Drops every row owned by this account.
    pub async fn discard(&self) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await?;
        for table in ["checksums", "changed_files", "sync_meta", "sync_errors"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE account_id = ?1"))
                .bind(self.account_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
