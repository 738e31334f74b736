mod backend;
mod error;
mod folder;
mod session;

pub use backend::{
    Account, BOOKMARK_EXTENSIONS, Backend, BackendType, EditSession, OpenSessionError,
    RemoteFilesState, is_bookmark_file_name, md5_checksum,
};
pub use error::{SerializedSyncError, SyncError, SyncErrorKind, now_millis};
pub use folder::FolderBackend;
pub use session::ScopedSession;
