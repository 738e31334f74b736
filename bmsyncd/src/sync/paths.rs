use std::path::{Component, Path, PathBuf};

use bmsync_core::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path has no file name: {0}")]
    NoFileName(String),
    #[error("cloud file name contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

impl From<PathError> for SyncError {
    fn from(err: PathError) -> Self {
        SyncError::unexpected(err.to_string())
    }
}

/// Cloud name of a local bookmark file: the local path without its directory.
pub fn cloud_name_for(local: &Path) -> Result<String, PathError> {
    local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| PathError::NoFileName(local.display().to_string()))
}

pub fn local_path_for(bookmarks_dir: &Path, name: &str) -> Result<PathBuf, PathError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if !name.starts_with('.') => {
            Ok(bookmarks_dir.join(part))
        }
        _ => Err(PathError::UnsupportedComponent(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_directory_prefix() {
        assert_eq!(
            cloud_name_for(Path::new("/data/bookmarks/Trip.kml")).unwrap(),
            "Trip.kml"
        );
        assert!(cloud_name_for(Path::new("/")).is_err());
    }

    #[test]
    fn maps_cloud_name_under_bookmarks_dir() {
        let dir = PathBuf::from("/data/bookmarks");
        assert_eq!(
            local_path_for(&dir, "Trip.kml").unwrap(),
            PathBuf::from("/data/bookmarks/Trip.kml")
        );
    }

    #[test]
    fn rejects_nested_or_hidden_names() {
        let dir = PathBuf::from("/data/bookmarks");
        assert!(matches!(
            local_path_for(&dir, "../secret.kml"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(local_path_for(&dir, "a/b.kml").is_err());
        assert!(local_path_for(&dir, "/abs.kml").is_err());
        assert!(local_path_for(&dir, ".hidden.kml").is_err());
        assert!(local_path_for(&dir, "").is_err());
    }
}
