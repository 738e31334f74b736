use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::SyncError;

/// Bookmark file formats a cloud directory may hold.
pub const BOOKMARK_EXTENSIONS: [&str; 4] = ["kml", "kmz", "kmb", "gpx"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    Folder,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Folder => "folder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "folder" => Some(BackendType::Folder),
            _ => None,
        }
    }
}

/// One linked cloud destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub backend_type: BackendType,
    pub auth_state: String,
}

/// Remote directory contents as seen at the start of a bidirectional pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFilesState {
    /// Files uploaded by the engine (from any device), with their checksums.
    pub engine_owned: BTreeMap<String, String>,
    /// Files placed in the directory by something else.
    pub foreign: BTreeSet<String>,
}

impl RemoteFilesState {
    pub fn contains(&self, name: &str) -> bool {
        self.engine_owned.contains_key(name) || self.foreign.contains(name)
    }

    pub fn record_put(&mut self, name: &str, checksum: &str) {
        self.foreign.remove(name);
        self.engine_owned
            .insert(name.to_string(), checksum.to_string());
    }

    pub fn record_delete(&mut self, name: &str) {
        self.foreign.remove(name);
        self.engine_owned.remove(name);
    }
}

#[derive(Debug, Error)]
pub enum OpenSessionError {
    #[error("remote directory is locked by another writer for about {remaining:?}")]
    LockHeld { remaining: Duration },
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Exclusive write access to the account's cloud directory.
///
/// Implementations release the remote lock in `close`; dropping an unclosed
/// session must release it as well.
#[async_trait]
pub trait EditSession: Send {
    async fn put(&mut self, name: &str, bytes: &[u8], checksum: &str) -> Result<(), SyncError>;

    async fn delete(&mut self, name: &str) -> Result<(), SyncError>;

    /// Extends the remote lock before long work that is neither a put nor a
    /// delete. Fails once another writer owns the lock.
    async fn keep_alive(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SyncError>;
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// `None` means the cloud directory does not exist (yet).
    async fn fetch_dir_state(&self) -> Result<Option<String>, SyncError>;

    async fn fetch_files_state(&self) -> Result<RemoteFilesState, SyncError>;

    /// Overwrites `destination` with the content of the cloud file `name`.
    async fn download(&self, name: &str, destination: &Path) -> Result<(), SyncError>;

    async fn open_edit_session(&self) -> Result<Box<dyn EditSession>, OpenSessionError>;

    fn compute_checksum(&self, bytes: &[u8]) -> String {
        md5_checksum(bytes)
    }
}

pub fn md5_checksum(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn is_bookmark_file_name(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => BOOKMARK_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known)),
        _ => false,
    }
}
