use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bmsync_core::{Account, BackendType, SerializedSyncError, SyncError};
use serde::Serialize;
use tracing::{info, warn};

use crate::account::{AccountRegistry, backend_for};
use crate::sync::backoff::Backoff;
use crate::sync::local_state::StateStore;
use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::scheduler::{Mode, Scheduler, SchedulerCommand, SchedulerConfig, SchedulerHandle};
use crate::sync::storage::FsBookmarkStorage;
use crate::sync::syncer::{SyncOutcome, Syncer, SyncerConfig};

const APP_DIR_NAME: &str = "bmsync";
const DEFAULT_FOREGROUND_SECS: u64 = 300;
const DEFAULT_BACKGROUND_SECS: u64 = 86_400;
const DEFAULT_MIN_INTERVAL_SECS: u64 = 60;
const DEFAULT_TICK_MS: u64 = 1000;
const DEFAULT_RERUN_GRACE_SECS: u64 = 5;
const FAILURE_BACKOFF_BASE: Duration = Duration::from_secs(60);
const FAILURE_BACKOFF_MAX: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub bookmarks_dir: PathBuf,
    pub state_db: PathBuf,
    pub temp_dir: PathBuf,
    pub foreground_interval: Duration,
    pub background_interval: Duration,
    pub min_interval: Duration,
    pub tick: Duration,
    pub rerun_grace: Duration,
    pub enable_watcher: bool,
    pub start_foreground: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_root = default_data_root(&home);
        let path_env = |name: &str, default: PathBuf| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(|value| expand_with_home(&value, &home))
                .unwrap_or(default)
        };

        Ok(Self {
            bookmarks_dir: path_env("BMSYNC_BOOKMARKS_DIR", data_root.join("bookmarks")),
            state_db: path_env("BMSYNC_STATE_DB", data_root.join("state.db")),
            temp_dir: path_env("BMSYNC_TEMP_DIR", default_temp_root()),
            foreground_interval: Duration::from_secs(read_u64_env(
                "BMSYNC_FOREGROUND_SECS",
                DEFAULT_FOREGROUND_SECS,
            )),
            background_interval: Duration::from_secs(read_u64_env(
                "BMSYNC_BACKGROUND_SECS",
                DEFAULT_BACKGROUND_SECS,
            )),
            min_interval: Duration::from_secs(read_u64_env(
                "BMSYNC_MIN_INTERVAL_SECS",
                DEFAULT_MIN_INTERVAL_SECS,
            )),
            tick: Duration::from_millis(read_u64_env("BMSYNC_TICK_MS", DEFAULT_TICK_MS)),
            rerun_grace: Duration::from_secs(read_u64_env(
                "BMSYNC_RERUN_GRACE_SECS",
                DEFAULT_RERUN_GRACE_SECS,
            )),
            enable_watcher: read_bool_env("BMSYNC_ENABLE_WATCHER", true),
            start_foreground: read_bool_env("BMSYNC_FOREGROUND", false),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            foreground_interval: self.foreground_interval,
            background_interval: self.background_interval,
            min_interval: self.min_interval,
            tick: self.tick,
            failure_backoff: Backoff::new(FAILURE_BACKOFF_BASE, FAILURE_BACKOFF_MAX, true),
        }
    }

    pub fn syncer_config(&self) -> SyncerConfig {
        SyncerConfig {
            temp_dir: self.temp_dir.clone(),
            rerun_grace: self.rerun_grace,
        }
    }

    fn start_mode(&self) -> Mode {
        if self.start_foreground {
            Mode::Foreground
        } else {
            Mode::Background
        }
    }
}

/// What `--status` reports for one account.
#[derive(Debug, Serialize)]
pub struct AccountStatus {
    pub id: i64,
    pub backend: &'static str,
    pub location: String,
    pub stale: bool,
    pub dir_state: Option<String>,
    pub pending_changes: usize,
    pub last_error: Option<SerializedSyncError>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    registry: AccountRegistry,
    storage: Arc<FsBookmarkStorage>,
}

impl DaemonRuntime {
    pub async fn bootstrap(mut config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.bookmarks_dir)
            .await
            .with_context(|| {
                format!("failed to create bookmarks dir at {:?}", config.bookmarks_dir)
            })?;
        tokio::fs::create_dir_all(&config.temp_dir)
            .await
            .with_context(|| format!("failed to create temp dir at {:?}", config.temp_dir))?;
        // Watcher events carry resolved paths; the storage must hand out the same ones.
        config.bookmarks_dir = tokio::fs::canonicalize(&config.bookmarks_dir)
            .await
            .with_context(|| format!("failed to resolve {:?}", config.bookmarks_dir))?;

        let store = StateStore::open(&config.state_db)
            .await
            .with_context(|| format!("failed to open state store at {:?}", config.state_db))?;
        let registry = AccountRegistry::new(store);
        let storage = Arc::new(FsBookmarkStorage::new(config.bookmarks_dir.clone()));

        Ok(Self {
            config,
            registry,
            storage,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    fn syncer_for(&self, account: Account) -> Syncer {
        let backend = backend_for(&account);
        let state = self.registry.store().for_account(account.id);
        Syncer::new(
            account,
            backend,
            self.storage.clone(),
            state,
            self.config.syncer_config(),
        )
    }

    async fn syncers(&self) -> anyhow::Result<Vec<Arc<Syncer>>> {
        let accounts = self
            .registry
            .list()
            .await
            .context("failed to list accounts")?;
        Ok(accounts
            .into_iter()
            .map(|account| Arc::new(self.syncer_for(account)))
            .collect())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let syncers = self.syncers().await?;
        info!(
            bookmarks = %self.config.bookmarks_dir.display(),
            accounts = syncers.len(),
            watcher = self.config.enable_watcher,
            "daemon started"
        );

        let (scheduler, handle) = Scheduler::new(
            self.config.scheduler_config(),
            syncers,
            self.config.start_mode(),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        let _watcher = if self.config.enable_watcher {
            match start_notify_watcher(&self.config.bookmarks_dir) {
                Ok((watcher, mut changes)) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        while let Some(paths) = changes.recv().await {
                            if !handle.send(SchedulerCommand::LocalChanges(paths)) {
                                break;
                            }
                        }
                    });
                    Some(watcher)
                }
                Err(err) => {
                    warn!(error = %err, "bookmarks watcher unavailable, relying on rebuilds");
                    None
                }
            }
        } else {
            None
        };

        let signals = forward_signals(&handle).await;
        handle.send(SchedulerCommand::Shutdown);
        scheduler_task.await.context("scheduler task failed")?;
        info!("daemon stopped");
        signals
    }

    /// Runs one sync for every linked account, sequentially.
    pub async fn sync_once(&self) -> anyhow::Result<Vec<(i64, Result<SyncOutcome, SyncError>)>> {
        let mut results = Vec::new();
        for syncer in self.syncers().await? {
            let account = syncer.account().id;
            let result = syncer.perform_sync().await;
            if let Err(err) = &result {
                warn!(account, error = %err, "sync failed");
                if let Err(record_err) = syncer.state().record_error(&err.to_serialized()).await {
                    warn!(account, error = %record_err, "failed to record sync error");
                }
            }
            results.push((account, result));
        }
        Ok(results)
    }

    pub async fn status(&self) -> anyhow::Result<Vec<AccountStatus>> {
        let mut statuses = Vec::new();
        for account in self.registry.list().await? {
            let state = self.registry.store().for_account(account.id);
            statuses.push(AccountStatus {
                id: account.id,
                backend: account.backend_type.as_str(),
                location: account.auth_state.clone(),
                stale: state.is_stale().await?,
                dir_state: state.dir_state().await?,
                pending_changes: state.changed_files().await?.len(),
                last_error: state.last_error().await?,
            });
        }
        Ok(statuses)
    }

    /// Links a directory as a folder-backed cloud account.
    pub async fn link_folder(&self, dir: &Path) -> anyhow::Result<Account> {
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()
                .context("current directory is unavailable")?
                .join(dir)
        };
        let account = self
            .registry
            .link(BackendType::Folder, &dir.to_string_lossy())
            .await
            .context("failed to link account")?;
        info!(account = account.id, folder = %dir.display(), "account linked");
        Ok(account)
    }

    pub async fn unlink(&self, id: i64) -> anyhow::Result<()> {
        self.registry
            .unlink(id)
            .await
            .with_context(|| format!("failed to unlink account {id}"))?;
        info!(account = id, "account unlinked");
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
