use std::sync::Arc;

use bmsync_core::{Account, Backend, BackendType, FolderBackend};
use sqlx::Row;
use thiserror::Error;
use time::OffsetDateTime;

use crate::sync::local_state::{StateError, StateStore};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("local state error: {0}")]
    State(#[from] StateError),
    #[error("unknown backend type: {0}")]
    UnknownBackend(String),
    #[error("account {0} not found")]
    NotFound(i64),
}

/// Linked accounts, persisted next to their local sync state.
#[derive(Clone)]
pub struct AccountRegistry {
    store: StateStore,
}

impl AccountRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub async fn link(
        &self,
        backend_type: BackendType,
        auth_state: &str,
    ) -> Result<Account, RegistryError> {
        let result = sqlx::query(
            "INSERT INTO accounts (backend_type, auth_state, created) VALUES (?1, ?2, ?3)",
        )
        .bind(backend_type.as_str())
        .bind(auth_state)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(self.store.pool())
        .await?;
        Ok(Account {
            id: result.last_insert_rowid(),
            backend_type,
            auth_state: auth_state.to_string(),
        })
    }

    /// Removes the account together with its local sync state.
    pub async fn unlink(&self, id: i64) -> Result<(), RegistryError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        self.store.for_account(id).discard().await?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Account, RegistryError> {
        let row = sqlx::query("SELECT id, backend_type, auth_state FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(RegistryError::NotFound(id))?;
        account_from_row(&row)
    }

    pub async fn list(&self) -> Result<Vec<Account>, RegistryError> {
        let rows = sqlx::query("SELECT id, backend_type, auth_state FROM accounts ORDER BY id ASC")
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(account_from_row).collect()
    }
}

fn account_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Account, RegistryError> {
    let backend: String = row.try_get("backend_type")?;
    Ok(Account {
        id: row.try_get("id")?,
        backend_type: BackendType::parse(&backend)
            .ok_or(RegistryError::UnknownBackend(backend))?,
        auth_state: row.try_get("auth_state")?,
    })
}

/// Builds the backend client for an account.
pub fn backend_for(account: &Account) -> Arc<dyn Backend> {
    match account.backend_type {
        BackendType::Folder => Arc::new(FolderBackend::new(&account.auth_state)),
    }
}
