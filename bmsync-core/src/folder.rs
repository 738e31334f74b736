use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::backend::{
    Backend, BackendType, EditSession, OpenSessionError, RemoteFilesState, is_bookmark_file_name,
};
use crate::error::{SyncError, now_millis};

const META_DIR: &str = ".bmsync";
const MANIFEST_FILE: &str = "manifest.json";
const LOCK_FILE: &str = "lock.json";
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestEntry {
    checksum: String,
    size: u64,
    modified: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    expires_at: i64,
}

#[derive(Debug)]
struct ListedFile {
    name: String,
    size: u64,
    modified: i64,
}

/// A plain directory acting as the cloud directory, e.g. a mounted share.
///
/// Engine-owned files are tracked in `.bmsync/manifest.json`; any other
/// bookmark file in the directory (or one changed behind the manifest's back)
/// is foreign. Writers serialize on `.bmsync/lock.json`.
#[derive(Debug, Clone)]
pub struct FolderBackend {
    root: PathBuf,
    lock_ttl: Duration,
}

impl FolderBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    async fn list_files(&self) -> Result<Option<Vec<ListedFile>>, SyncError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(err)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_bookmark_file_name(&name) {
                continue;
            }
            let meta = entry.metadata().await.map_err(io_error)?;
            if !meta.is_file() {
                continue;
            }
            out.push(ListedFile {
                name,
                size: meta.len(),
                modified: modified_nanos(&meta),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(out))
    }
}

#[async_trait]
impl Backend for FolderBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Folder
    }

    async fn fetch_dir_state(&self) -> Result<Option<String>, SyncError> {
        let Some(files) = self.list_files().await? else {
            return Ok(None);
        };
        let mut ctx = md5::Context::new();
        for file in &files {
            ctx.consume(format!("{}\t{}\t{}\n", file.name, file.size, file.modified).as_bytes());
        }
        match tokio::fs::read(self.meta_dir().join(MANIFEST_FILE)).await {
            Ok(bytes) => ctx.consume(&bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(err)),
        }
        Ok(Some(format!("{:x}", ctx.compute())))
    }

    async fn fetch_files_state(&self) -> Result<RemoteFilesState, SyncError> {
        let Some(files) = self.list_files().await? else {
            return Ok(RemoteFilesState::default());
        };
        let manifest = read_manifest(&self.meta_dir()).await?;
        let mut state = RemoteFilesState::default();
        for file in files {
            match manifest.files.get(&file.name) {
                Some(entry) if entry.size == file.size && entry.modified == file.modified => {
                    state
                        .engine_owned
                        .insert(file.name, entry.checksum.clone());
                }
                _ => {
                    state.foreign.insert(file.name);
                }
            }
        }
        Ok(state)
    }

    async fn download(&self, name: &str, destination: &Path) -> Result<(), SyncError> {
        let source = self.root.join(checked_name(name)?);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::copy(&source, destination)
            .await
            .map_err(io_error)?;
        Ok(())
    }

    async fn open_edit_session(&self) -> Result<Box<dyn EditSession>, OpenSessionError> {
        let meta_dir = self.meta_dir();
        tokio::fs::create_dir_all(&meta_dir)
            .await
            .map_err(io_error)?;
        let lock_path = meta_dir.join(LOCK_FILE);
        let owner = format!("{:016x}", rand::random::<u64>());

        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let record = LockRecord {
                        owner: owner.clone(),
                        expires_at: lock_expiry(self.lock_ttl),
                    };
                    file.write_all(&serde_json::to_vec(&record).map_err(SyncError::from)?)
                        .await
                        .map_err(io_error)?;
                    file.sync_all().await.map_err(io_error)?;
                    let manifest = read_manifest(&meta_dir).await?;
                    debug!(root = %self.root.display(), "edit session opened");
                    return Ok(Box::new(FolderSession {
                        root: self.root.clone(),
                        lock_path,
                        lock_ttl: self.lock_ttl,
                        owner,
                        manifest,
                        closed: false,
                    }));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match lock_remaining(&lock_path, self.lock_ttl).await? {
                        Some(remaining) => return Err(OpenSessionError::LockHeld { remaining }),
                        None => {
                            warn!(lock = %lock_path.display(), "breaking expired edit lock");
                            match tokio::fs::remove_file(&lock_path).await {
                                Ok(()) => {}
                                Err(err) if err.kind() == ErrorKind::NotFound => {}
                                Err(err) => return Err(io_error(err).into()),
                            }
                        }
                    }
                }
                Err(err) => return Err(io_error(err).into()),
            }
        }

        Err(OpenSessionError::LockHeld {
            remaining: self.lock_ttl,
        })
    }
}

struct FolderSession {
    root: PathBuf,
    lock_path: PathBuf,
    lock_ttl: Duration,
    owner: String,
    manifest: Manifest,
    closed: bool,
}

impl FolderSession {
    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::unexpected("edit session already closed"));
        }
        Ok(())
    }

    /// Pushes the lock expiry a full TTL out. Every write goes through here,
    /// so a writer that lost its lock to an expiry break stops writing.
    async fn refresh_lock(&self) -> Result<(), SyncError> {
        match read_lock(&self.lock_path).await? {
            Some(record) if record.owner == self.owner => {}
            _ => {
                return Err(SyncError::unexpected(
                    "edit lock expired and was taken by another writer",
                ));
            }
        }
        let record = LockRecord {
            owner: self.owner.clone(),
            expires_at: lock_expiry(self.lock_ttl),
        };
        let partial = self
            .root
            .join(META_DIR)
            .join(format!("{LOCK_FILE}.{}.part", self.owner));
        tokio::fs::write(&partial, serde_json::to_vec(&record)?)
            .await
            .map_err(io_error)?;
        tokio::fs::rename(&partial, &self.lock_path)
            .await
            .map_err(io_error)?;
        Ok(())
    }

    async fn write_manifest(&self) -> Result<(), SyncError> {
        let meta_dir = self.root.join(META_DIR);
        let bytes = serde_json::to_vec_pretty(&self.manifest)?;
        let partial = meta_dir.join(format!("{MANIFEST_FILE}.{}.part", self.owner));
        tokio::fs::write(&partial, bytes).await.map_err(io_error)?;
        tokio::fs::rename(&partial, meta_dir.join(MANIFEST_FILE))
            .await
            .map_err(io_error)?;
        Ok(())
    }
}

#[async_trait]
impl EditSession for FolderSession {
    async fn put(&mut self, name: &str, bytes: &[u8], checksum: &str) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.refresh_lock().await?;
        let target = self.root.join(checked_name(name)?);
        let partial = self
            .root
            .join(META_DIR)
            .join(format!("{name}.{}.part", self.owner));
        let mut file = tokio::fs::File::create(&partial).await.map_err(io_error)?;
        file.write_all(bytes).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        drop(file);
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(io_error)?;

        let meta = tokio::fs::metadata(&target).await.map_err(io_error)?;
        self.manifest.files.insert(
            name.to_string(),
            ManifestEntry {
                checksum: checksum.to_string(),
                size: meta.len(),
                modified: modified_nanos(&meta),
            },
        );
        self.write_manifest().await
    }

    async fn delete(&mut self, name: &str) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.refresh_lock().await?;
        let target = self.root.join(checked_name(name)?);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(err)),
        }
        if self.manifest.files.remove(name).is_some() {
            self.write_manifest().await?;
        }
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.refresh_lock().await
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match read_lock(&self.lock_path).await {
            Ok(Some(record)) if record.owner != self.owner => {
                warn!(lock = %self.lock_path.display(), "edit lock was taken over by another writer");
                return Ok(());
            }
            _ => {}
        }
        match tokio::fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(err)),
        }
    }
}

impl Drop for FolderSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Only release a lock that is still ours.
        let owned = std::fs::read(&self.lock_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok())
            .is_some_and(|record| record.owner == self.owner);
        if owned {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

async fn read_manifest(meta_dir: &Path) -> Result<Manifest, SyncError> {
    match tokio::fs::read(meta_dir.join(MANIFEST_FILE)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Manifest::default()),
        Err(err) => Err(io_error(err)),
    }
}

async fn read_lock(lock_path: &Path) -> Result<Option<LockRecord>, SyncError> {
    match tokio::fs::read(lock_path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(err)),
    }
}

/// How long the current lock holder keeps the lock, `None` once it expired.
async fn lock_remaining(lock_path: &Path, ttl: Duration) -> Result<Option<Duration>, SyncError> {
    if let Some(record) = read_lock(lock_path).await? {
        let left = record.expires_at.saturating_sub(now_millis());
        return Ok((left > 0).then(|| Duration::from_millis(left as u64)));
    }
    // Unreadable record: the holder may still be writing it, judge by age.
    let meta = match tokio::fs::metadata(lock_path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(err)),
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default();
    Ok(ttl.checked_sub(age).filter(|left| !left.is_zero()))
}

fn lock_expiry(ttl: Duration) -> i64 {
    now_millis().saturating_add(ttl.as_millis() as i64)
}

fn checked_name(name: &str) -> Result<&str, SyncError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(SyncError::unexpected(format!(
            "invalid cloud file name: {name:?}"
        )));
    }
    Ok(name)
}

fn modified_nanos(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or_default()
}

/// A share that went away mid-pass looks like a network failure.
fn io_error(err: std::io::Error) -> SyncError {
    match err.kind() {
        ErrorKind::NotConnected
        | ErrorKind::TimedOut
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::BrokenPipe => SyncError::network(err.to_string()),
        _ => SyncError::from(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_with_separators() {
        assert!(checked_name("a.kml").is_ok());
        assert!(checked_name("../a.kml").is_err());
        assert!(checked_name("dir/a.kml").is_err());
        assert!(checked_name(".bmsync").is_err());
        assert!(checked_name("").is_err());
    }

    #[test]
    fn timeouts_map_to_network_errors() {
        let err = io_error(std::io::Error::from(ErrorKind::TimedOut));
        assert!(matches!(err, SyncError::Network { .. }));
        let err = io_error(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(matches!(err, SyncError::Unexpected { .. }));
    }
}
