/// Where a changed file currently exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistenceState {
    Both,
    LocalOnly,
    RemoteOnly,
    Neither,
}

impl ExistenceState {
    pub fn of(local: bool, remote: bool) -> Self {
        match (local, remote) {
            (true, true) => ExistenceState::Both,
            (true, false) => ExistenceState::LocalOnly,
            (false, true) => ExistenceState::RemoteOnly,
            (false, false) => ExistenceState::Neither,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFile<'a> {
    Missing,
    EngineOwned { checksum: &'a str },
    Foreign,
}

impl RemoteFile<'_> {
    pub fn exists(&self) -> bool {
        !matches!(self, RemoteFile::Missing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing to do, cache already matches both sides.
    NoOp,
    /// Both sides already hold the same content; remember its checksum.
    AdoptChecksum,
    /// Put the local content to the cloud and cache its checksum.
    Upload,
    /// Keep both copies: suffix the local category and let the cloud copy be
    /// downloaded under the original name.
    Fork,
    /// The cloud deletion is authoritative.
    DeleteLocal,
    /// The local deletion is authoritative.
    DeleteRemote,
    /// Only the cloud copy changed; the download phase brings it over.
    AwaitDownload,
    /// Gone on both sides; drop the cache entry.
    ForgetCache,
}

/// Decides what to do with one changed file.
///
/// `local` is the checksum of the live local file, `cached` the checksum
/// recorded at the last successful sync of that file.
pub fn resolve(local: Option<&str>, remote: RemoteFile<'_>, cached: Option<&str>) -> Resolution {
    match ExistenceState::of(local.is_some(), remote.exists()) {
        ExistenceState::Both => match (local, remote) {
            (Some(local), RemoteFile::EngineOwned { checksum }) if local == checksum => {
                if cached == Some(local) {
                    Resolution::NoOp
                } else {
                    Resolution::AdoptChecksum
                }
            }
            (Some(_), RemoteFile::EngineOwned { checksum }) if cached == Some(checksum) => {
                Resolution::Upload
            }
            (Some(local), RemoteFile::EngineOwned { .. }) if cached == Some(local) => {
                Resolution::AwaitDownload
            }
            _ => Resolution::Fork,
        },
        ExistenceState::LocalOnly => {
            if local == cached {
                Resolution::DeleteLocal
            } else {
                Resolution::Upload
            }
        }
        ExistenceState::RemoteOnly => match remote {
            RemoteFile::EngineOwned { checksum } if cached == Some(checksum) => {
                Resolution::DeleteRemote
            }
            _ => Resolution::AwaitDownload,
        },
        ExistenceState::Neither => Resolution::ForgetCache,
    }
}
