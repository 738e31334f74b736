use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bmsync_core::{
    Account, Backend, OpenSessionError, RemoteFilesState, ScopedSession, SyncError,
};
use tracing::{debug, info, warn};

use super::conflict::{RemoteFile, Resolution, resolve};
use super::local_state::LocalState;
use super::paths::{cloud_name_for, local_path_for};
use super::storage::{BookmarkStorage, is_kml_path};

const DEFAULT_RERUN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Downloads land here before being moved into the bookmarks directory.
    pub temp_dir: PathBuf,
    /// Pause before the follow-up pass that picks up renames and imports.
    pub rerun_grace: Duration,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("bmsync"),
            rerun_grace: DEFAULT_RERUN_GRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub forked: usize,
    pub imported: usize,
    pub passes: usize,
}

impl SyncReport {
    fn remote_writes(&self) -> usize {
        self.uploaded + self.deleted_remote + self.imported
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing changed on either side.
    UpToDate,
    /// Another writer holds the cloud directory lock.
    Deferred { retry_after: Duration },
    Synced(SyncReport),
}

enum PassEnd {
    Done { async_changes: bool },
    LockHeld(Duration),
}

/// Keeps one account's bookmark files in step with its cloud directory.
pub struct Syncer {
    account: Account,
    backend: Arc<dyn Backend>,
    storage: Arc<dyn BookmarkStorage>,
    state: LocalState,
    config: SyncerConfig,
}

impl Syncer {
    pub fn new(
        account: Account,
        backend: Arc<dyn Backend>,
        storage: Arc<dyn BookmarkStorage>,
        state: LocalState,
        config: SyncerConfig,
    ) -> Self {
        Self {
            account,
            backend,
            storage,
            state,
            config,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Pausing change tracking invalidates the changed-files set.
    pub async fn set_tracking(&self, enabled: bool) -> Result<(), SyncError> {
        if !enabled {
            self.state.set_stale(true).await?;
        }
        Ok(())
    }

    pub async fn perform_sync(&self) -> Result<SyncOutcome, SyncError> {
        let account = self.account.id;
        if self.state.is_stale().await? {
            self.rebuild_changed_files().await?;
        }

        let dir_state = self.backend.fetch_dir_state().await?;
        let mut stored = self.state.dir_state().await?;
        if dir_state.is_none() && stored.is_some() {
            info!(account, "cloud directory disappeared, forgetting synced state");
            self.state.reset().await?;
            self.rebuild_changed_files().await?;
            stored = None;
        }

        if dir_state == stored && self.state.changed_files().await?.is_empty() {
            debug!(account, "bookmarks up to date");
            return Ok(SyncOutcome::UpToDate);
        }

        let bidirectional = dir_state != stored;
        info!(account, bidirectional, "starting sync pass");
        let mut report = SyncReport::default();
        let async_changes = match self.run_pass(dir_state, bidirectional, &mut report).await? {
            PassEnd::Done { async_changes } => async_changes,
            PassEnd::LockHeld(remaining) => {
                return Ok(SyncOutcome::Deferred {
                    retry_after: remaining,
                });
            }
        };

        if async_changes {
            tokio::time::sleep(self.config.rerun_grace).await;
            let dir_state = self.backend.fetch_dir_state().await?;
            debug!(account, "rerunning after renames or imports");
            if let PassEnd::LockHeld(remaining) =
                self.run_pass(dir_state, true, &mut report).await?
            {
                info!(account, ?remaining, "follow-up pass deferred, cloud directory locked");
            }
        }

        info!(account, ?report, "sync pass finished");
        Ok(SyncOutcome::Synced(report))
    }

    /// One pass inside one edit session; commits the directory token on success.
    async fn run_pass(
        &self,
        dir_state: Option<String>,
        bidirectional: bool,
        report: &mut SyncReport,
    ) -> Result<PassEnd, SyncError> {
        self.state.set_stale(true).await?;
        let mut session = match ScopedSession::open(self.backend.as_ref()).await {
            Ok(session) => session,
            Err(OpenSessionError::LockHeld { remaining }) => {
                info!(account = self.account.id, ?remaining, "cloud directory locked by another writer");
                // Nothing was applied, the changed-files set is still accurate.
                self.state.set_stale(false).await?;
                return Ok(PassEnd::LockHeld(remaining));
            }
            Err(OpenSessionError::Sync(err)) => return Err(err),
        };

        let writes_before = report.remote_writes();
        let result: Result<(Option<String>, bool), SyncError> = async {
            // Listing first: anything landing after it moves the token fetched next.
            let snapshot = self.backend.fetch_files_state().await?;
            // Another writer may have finished between the first fetch and the lock.
            let locked_state = self.backend.fetch_dir_state().await?;
            let bidirectional = bidirectional || locked_state != dir_state;
            let (snapshot, async_changes) = if bidirectional {
                self.sync_bidirectional(&mut session, snapshot, report).await?
            } else {
                let snapshot = self.sync_local_changes(&mut session, snapshot, report).await?;
                (snapshot, false)
            };
            let wrote = report.remote_writes() > writes_before;
            let token = self.closing_dir_state(locked_state, wrote, &snapshot).await?;
            Ok((token, async_changes))
        }
        .await;
        let (token, async_changes) = session.finish(result).await?;

        self.state.commit_pass(token.as_deref()).await?;
        report.passes += 1;
        Ok(PassEnd::Done { async_changes })
    }

    /// The token to commit for a finished pass.
    ///
    /// Without writes the token fetched under the lock is exact. After writes
    /// the token is refetched and kept only if the cloud listing is exactly the
    /// pass's listing plus its own writes. Anything else (an upload through the
    /// provider's own interface, say) keeps the earlier token, so the next pass
    /// is bidirectional.
    async fn closing_dir_state(
        &self,
        before: Option<String>,
        wrote: bool,
        expected: &RemoteFilesState,
    ) -> Result<Option<String>, SyncError> {
        if !wrote {
            return Ok(before);
        }
        let after = self.backend.fetch_dir_state().await?;
        let actual = self.backend.fetch_files_state().await?;
        if &actual != expected {
            debug!(account = self.account.id, "cloud changed during pass");
            return Ok(before);
        }
        Ok(after)
    }

    /// Diffs every local file against the checksum cache.
    async fn rebuild_changed_files(&self) -> Result<(), SyncError> {
        let cache = self.state.cached_checksums().await?;
        let mut changed = BTreeSet::new();
        let mut present = BTreeSet::new();
        for path in self.storage.list_bookmark_files().await? {
            let Some(bytes) = self.storage.read_file(&path).await? else {
                continue;
            };
            let checksum = self.backend.compute_checksum(&bytes);
            if cache.get(&path) != Some(&checksum) {
                changed.insert(path.clone());
            }
            present.insert(path);
        }
        for path in cache.keys() {
            if !present.contains(path) {
                changed.insert(path.clone());
            }
        }
        debug!(account = self.account.id, changed = changed.len(), "rebuilt changed files");
        self.state.finish_rebuild(&changed).await?;
        Ok(())
    }

    /// Cloud unchanged since the last pass: push local changes only.
    async fn sync_local_changes(
        &self,
        session: &mut ScopedSession,
        mut remote: RemoteFilesState,
        report: &mut SyncReport,
    ) -> Result<RemoteFilesState, SyncError> {
        for (path, revision) in self.state.changed_revisions().await? {
            let name = cloud_name_for(&path)?;
            let cached = self.state.cached_checksum(&path).await?;
            match self.storage.read_file(&path).await? {
                Some(bytes) => {
                    let checksum = self.backend.compute_checksum(&bytes);
                    if cached.as_deref() != Some(checksum.as_str()) {
                        debug!(account = self.account.id, %name, "uploading");
                        session.put(&name, &bytes, &checksum).await?;
                        remote.record_put(&name, &checksum);
                        self.state.set_cached_checksum(&path, &checksum).await?;
                        report.uploaded += 1;
                    }
                }
                None if cached.is_some() => {
                    debug!(account = self.account.id, %name, "deleting from cloud");
                    session.delete(&name).await?;
                    remote.record_delete(&name);
                    self.state.erase_cached_checksum(&path).await?;
                    report.deleted_remote += 1;
                }
                None => {}
            }
            self.state.unmark_changed(&path, revision).await?;
        }
        Ok(remote)
    }

    /// Returns the snapshot as updated by the pass and whether renames or
    /// imports happened that need a follow-up pass.
    async fn sync_bidirectional(
        &self,
        session: &mut ScopedSession,
        mut remote: RemoteFilesState,
        report: &mut SyncReport,
    ) -> Result<(RemoteFilesState, bool), SyncError> {
        let mut async_changes = false;

        for (path, revision) in self.state.changed_revisions().await? {
            let name = cloud_name_for(&path)?;
            let bytes = self.storage.read_file(&path).await?;
            let local = bytes.as_deref().map(|bytes| self.backend.compute_checksum(bytes));
            let cached = self.state.cached_checksum(&path).await?;
            let resolution = resolve(local.as_deref(), remote_file(&remote, &name), cached.as_deref());
            debug!(account = self.account.id, %name, ?resolution, "resolved changed file");

            match (resolution, bytes, local) {
                (Resolution::Fork, _, _) => {
                    self.fork(&path, report).await?;
                    async_changes = true;
                }
                (Resolution::Upload, Some(bytes), Some(checksum)) => {
                    session.put(&name, &bytes, &checksum).await?;
                    remote.record_put(&name, &checksum);
                    self.state.set_cached_checksum(&path, &checksum).await?;
                    report.uploaded += 1;
                }
                (Resolution::AdoptChecksum, _, Some(checksum)) => {
                    self.state.set_cached_checksum(&path, &checksum).await?;
                }
                (Resolution::DeleteLocal, _, _) => {
                    self.storage.delete_category(&path).await?;
                    self.state.erase_cached_checksum(&path).await?;
                    report.deleted_local += 1;
                }
                (Resolution::DeleteRemote, _, _) => {
                    session.delete(&name).await?;
                    remote.record_delete(&name);
                    self.state.erase_cached_checksum(&path).await?;
                    report.deleted_remote += 1;
                }
                (Resolution::ForgetCache, _, _) => {
                    self.state.erase_cached_checksum(&path).await?;
                }
                (Resolution::NoOp | Resolution::AwaitDownload, _, _) => {}
                (resolution, _, _) => {
                    return Err(SyncError::unexpected(format!(
                        "{resolution:?} for {name} without local content"
                    )));
                }
            }
            self.state.unmark_changed(&path, revision).await?;
        }

        self.sweep_deleted_remote(session, &mut remote, report).await?;
        async_changes |= self.download_remote_changes(session, &remote, report).await?;
        async_changes |= self.import_foreign_files(session, &mut remote, report).await?;
        Ok((remote, async_changes))
    }

    /// Cached files whose cloud copy is no longer engine-owned were deleted by
    /// another device; unchanged local copies follow, edited ones are uploaded
    /// unless a foreign file took the name, which the import step handles.
    async fn sweep_deleted_remote(
        &self,
        session: &mut ScopedSession,
        remote: &mut RemoteFilesState,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        for (path, cached) in self.state.cached_checksums().await? {
            let name = cloud_name_for(&path)?;
            if remote.engine_owned.contains_key(&name) {
                continue;
            }
            let bytes = self.storage.read_file(&path).await?;
            let local = bytes.as_deref().map(|bytes| self.backend.compute_checksum(bytes));
            match (resolve(local.as_deref(), RemoteFile::Missing, Some(cached.as_str())), bytes, local) {
                (Resolution::DeleteLocal, _, _) => {
                    info!(account = self.account.id, %name, "removed from cloud, deleting local copy");
                    self.storage.delete_category(&path).await?;
                    self.state.erase_cached_checksum(&path).await?;
                    report.deleted_local += 1;
                }
                (Resolution::Upload, _, _) if remote.foreign.contains(&name) => {
                    debug!(account = self.account.id, %name, "cloud name taken by a foreign file");
                }
                (Resolution::Upload, Some(bytes), Some(checksum)) => {
                    session.put(&name, &bytes, &checksum).await?;
                    remote.record_put(&name, &checksum);
                    self.state.set_cached_checksum(&path, &checksum).await?;
                    report.uploaded += 1;
                }
                _ => {
                    self.state.erase_cached_checksum(&path).await?;
                }
            }
        }
        Ok(())
    }

    async fn download_remote_changes(
        &self,
        session: &mut ScopedSession,
        remote: &RemoteFilesState,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        let mut async_changes = false;
        for (name, checksum) in &remote.engine_owned {
            let path = match local_path_for(self.storage.bookmarks_dir(), name) {
                Ok(path) if is_kml_path(&path) => path,
                Ok(_) => continue,
                Err(err) => {
                    warn!(account = self.account.id, %name, error = %err, "skipping cloud file");
                    continue;
                }
            };
            let cached = self.state.cached_checksum(&path).await?;
            if cached.as_deref() == Some(checksum.as_str()) {
                continue;
            }
            if let Some(bytes) = self.storage.read_file(&path).await?
                && &self.backend.compute_checksum(&bytes) == checksum
            {
                self.state.set_cached_checksum(&path, checksum).await?;
                continue;
            }

            session.keep_alive().await?;
            let temp = self.temp_path(name).await?;
            let result = self.download_one(name, &path, &temp, cached.as_deref(), report).await;
            if result.is_err() {
                let _ = tokio::fs::remove_file(&temp).await;
            }
            async_changes |= result?;
        }
        Ok(async_changes)
    }

    async fn download_one(
        &self,
        name: &str,
        path: &Path,
        temp: &Path,
        cached: Option<&str>,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        debug!(account = self.account.id, %name, "downloading");
        self.backend.download(name, temp).await?;
        let bytes = tokio::fs::read(temp).await?;
        let checksum = self.backend.compute_checksum(&bytes);

        let mut async_changes = false;
        let mut existed = false;
        if let Some(local) = self.storage.read_file(path).await? {
            if cached == Some(self.backend.compute_checksum(&local).as_str()) {
                existed = true;
            } else {
                // Edited locally while the cloud copy changed too.
                self.fork(path, report).await?;
                async_changes = true;
            }
        }

        self.storage.move_file(temp, path).await?;
        self.state.set_cached_checksum(path, &checksum).await?;
        if existed {
            self.storage.reload_bookmark_file(path).await?;
        } else {
            self.storage.load_bookmarks_file(path, false).await?;
        }
        report.downloaded += 1;
        Ok(async_changes)
    }

    /// Foreign files are imported once and removed from the cloud; the
    /// importing device uploads them again as engine-owned files.
    async fn import_foreign_files(
        &self,
        session: &mut ScopedSession,
        remote: &mut RemoteFilesState,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        let mut async_changes = false;
        let foreign: Vec<String> = remote.foreign.iter().cloned().collect();
        for name in foreign {
            if !is_kml_path(Path::new(&name)) {
                debug!(account = self.account.id, %name, "leaving foreign file in place");
                continue;
            }
            session.keep_alive().await?;
            let temp = self.temp_path(&name).await?;
            let result: Result<Option<PathBuf>, SyncError> = async {
                self.backend.download(&name, &temp).await?;
                self.storage.load_bookmarks_file(&temp, true).await
            }
            .await;
            let _ = tokio::fs::remove_file(&temp).await;
            let Some(imported) = result? else {
                continue;
            };

            info!(account = self.account.id, %name, path = %imported.display(), "imported foreign file");
            session.delete(&name).await?;
            remote.record_delete(&name);
            self.state.mark_changed(&imported).await?;
            report.imported += 1;
            async_changes = true;
        }
        Ok(async_changes)
    }

    /// Moves a locally edited file out of the way of its cloud counterpart.
    async fn fork(&self, path: &Path, report: &mut SyncReport) -> Result<(), SyncError> {
        let renamed = self.storage.add_suffix_to_category(path).await?;
        info!(
            account = self.account.id,
            from = %path.display(),
            to = %renamed.display(),
            "conflicting edits, keeping local copy under a new name"
        );
        self.state.erase_cached_checksum(path).await?;
        self.state.mark_changed(&renamed).await?;
        report.forked += 1;
        Ok(())
    }

    async fn temp_path(&self, name: &str) -> Result<PathBuf, SyncError> {
        let dir = self.config.temp_dir.join(self.account.id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir.join(name))
    }
}

fn remote_file<'a>(remote: &'a RemoteFilesState, name: &str) -> RemoteFile<'a> {
    if let Some(checksum) = remote.engine_owned.get(name) {
        RemoteFile::EngineOwned { checksum }
    } else if remote.foreign.contains(name) {
        RemoteFile::Foreign
    } else {
        RemoteFile::Missing
    }
}

#[cfg(test)]
#[path = "syncer_tests.rs"]
mod tests;
