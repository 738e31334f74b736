use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bmsync_core::SyncError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const KML_EXTENSION: &str = "kml";

/// Bookmark storage owned by the host application (files plus the map
/// engine's loaded categories).
///
/// All calls block until done and may be made from the sync worker. Category
/// calls (`reload_bookmark_file`, `delete_category`, `add_suffix_to_category`,
/// `load_bookmarks_file`) are the ones a host must route to its UI-affine
/// context; [`FsBookmarkStorage`] does that by emitting [`CategoryEvent`]s on
/// a channel the host drains wherever it needs to.
#[async_trait]
pub trait BookmarkStorage: Send + Sync {
    fn bookmarks_dir(&self) -> &Path;

    async fn list_bookmark_files(&self) -> Result<Vec<PathBuf>, SyncError>;

    /// `None` when the file does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, SyncError>;

    async fn move_file(&self, from: &Path, to: &Path) -> Result<(), SyncError>;

    /// Returns whether a file was removed.
    async fn delete_file(&self, path: &Path) -> Result<bool, SyncError>;

    /// The file at `path` changed on disk underneath a loaded category.
    async fn reload_bookmark_file(&self, path: &Path) -> Result<(), SyncError>;

    /// Removes a category and its file without raising a change notification.
    async fn delete_category(&self, path: &Path) -> Result<(), SyncError>;

    /// Renames a category's file to a free suffixed name and returns it.
    async fn add_suffix_to_category(&self, path: &Path) -> Result<PathBuf, SyncError>;

    /// Attaches a file as a category. Imports copy the file into the
    /// bookmarks directory first; the returned path is the attached file.
    async fn load_bookmarks_file(
        &self,
        path: &Path,
        is_import: bool,
    ) -> Result<Option<PathBuf>, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryEvent {
    Reloaded(PathBuf),
    Loaded { path: PathBuf, imported: bool },
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// A flat directory of `.kml` files.
pub struct FsBookmarkStorage {
    dir: PathBuf,
    events: Option<mpsc::UnboundedSender<CategoryEvent>>,
}

impl FsBookmarkStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<CategoryEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: CategoryEvent) {
        debug!(?event, "category event");
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl BookmarkStorage for FsBookmarkStorage {
    fn bookmarks_dir(&self) -> &Path {
        &self.dir
    }

    async fn list_bookmark_files(&self) -> Result<Vec<PathBuf>, SyncError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_kml_path(&path) && entry.file_type().await?.is_file() {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, SyncError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SyncError::unexpected(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    async fn move_file(&self, from: &Path, to: &Path) -> Result<(), SyncError> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(from, to).await.is_ok() {
            return Ok(());
        }
        // Different filesystems: copy, then drop the source.
        tokio::fs::copy(from, to).await.map_err(|err| {
            SyncError::unexpected(format!(
                "failed to move {} to {}: {err}",
                from.display(),
                to.display()
            ))
        })?;
        tokio::fs::remove_file(from).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<bool, SyncError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn reload_bookmark_file(&self, path: &Path) -> Result<(), SyncError> {
        self.emit(CategoryEvent::Reloaded(path.to_path_buf()));
        Ok(())
    }

    async fn delete_category(&self, path: &Path) -> Result<(), SyncError> {
        self.delete_file(path).await?;
        self.emit(CategoryEvent::Deleted(path.to_path_buf()));
        Ok(())
    }

    async fn add_suffix_to_category(&self, path: &Path) -> Result<PathBuf, SyncError> {
        let dir = path.parent().unwrap_or(self.dir.as_path());
        let (stem, ext) = split_name(path)?;
        let (base, counter) = split_suffix(&stem);
        let target = free_path(dir, base, &ext, counter.map_or(1, |n| n + 1)).await?;
        tokio::fs::rename(path, &target).await.map_err(|err| {
            SyncError::unexpected(format!("failed to rename {}: {err}", path.display()))
        })?;
        self.emit(CategoryEvent::Renamed {
            from: path.to_path_buf(),
            to: target.clone(),
        });
        Ok(target)
    }

    async fn load_bookmarks_file(
        &self,
        path: &Path,
        is_import: bool,
    ) -> Result<Option<PathBuf>, SyncError> {
        if !is_import {
            self.emit(CategoryEvent::Loaded {
                path: path.to_path_buf(),
                imported: false,
            });
            return Ok(Some(path.to_path_buf()));
        }
        if !is_kml_path(path) {
            warn!(path = %path.display(), "skipping import of unsupported bookmark format");
            return Ok(None);
        }
        let (stem, ext) = split_name(path)?;
        let target = if tokio::fs::try_exists(self.dir.join(format!("{stem}.{ext}"))).await? {
            free_path(&self.dir, &stem, &ext, 1).await?
        } else {
            self.dir.join(format!("{stem}.{ext}"))
        };
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::copy(path, &target).await.map_err(|err| {
            SyncError::unexpected(format!("failed to import {}: {err}", path.display()))
        })?;
        self.emit(CategoryEvent::Loaded {
            path: target.clone(),
            imported: true,
        });
        Ok(Some(target))
    }
}

pub fn is_kml_path(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'));
    !hidden
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(KML_EXTENSION))
}

fn split_name(path: &Path) -> Result<(String, String), SyncError> {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    let ext = path.extension().map(|s| s.to_string_lossy().into_owned());
    match (stem, ext) {
        (Some(stem), Some(ext)) if !stem.is_empty() => Ok((stem, ext)),
        _ => Err(SyncError::unexpected(format!(
            "not a bookmark file: {}",
            path.display()
        ))),
    }
}

/// Splits `"Trip (2)"` into `("Trip", Some(2))`.
fn split_suffix(stem: &str) -> (&str, Option<u32>) {
    if let Some(open) = stem.rfind(" (")
        && let Some(inner) = stem[open + 2..].strip_suffix(')')
        && let Ok(counter) = inner.parse::<u32>()
        && open > 0
    {
        return (&stem[..open], Some(counter));
    }
    (stem, None)
}

async fn free_path(dir: &Path, base: &str, ext: &str, start: u32) -> Result<PathBuf, SyncError> {
    let mut counter = start.max(1);
    loop {
        let candidate = dir.join(format!("{base} ({counter}).{ext}"));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        counter = counter.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn splits_numeric_suffix() {
        assert_eq!(split_suffix("Trip (2)"), ("Trip", Some(2)));
        assert_eq!(split_suffix("Trip"), ("Trip", None));
        assert_eq!(split_suffix("Trip (x)"), ("Trip (x)", None));
        assert_eq!(split_suffix(" (3)"), (" (3)", None));
    }

    #[test]
    fn recognizes_kml_paths() {
        assert!(is_kml_path(Path::new("/bm/a.kml")));
        assert!(is_kml_path(Path::new("/bm/a.KML")));
        assert!(!is_kml_path(Path::new("/bm/a.kmz")));
        assert!(!is_kml_path(Path::new("/bm/.a.kml")));
    }

    #[tokio::test]
    async fn lists_only_kml_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.kml"), b"b").unwrap();
        std::fs::write(dir.path().join("a.kml"), b"a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        std::fs::create_dir(dir.path().join("sub.kml")).unwrap();

        let storage = FsBookmarkStorage::new(dir.path());
        let files = storage.list_bookmark_files().await.unwrap();

        assert_eq!(files, vec![dir.path().join("a.kml"), dir.path().join("b.kml")]);
    }

    #[tokio::test]
    async fn missing_files_read_as_none() {
        let dir = tempdir().unwrap();
        let storage = FsBookmarkStorage::new(dir.path());
        assert_eq!(storage.read_file(&dir.path().join("x.kml")).await.unwrap(), None);
        assert!(!storage.delete_file(&dir.path().join("x.kml")).await.unwrap());
    }

    #[tokio::test]
    async fn suffixing_picks_first_free_name() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let storage = FsBookmarkStorage::new(dir.path()).with_events(tx);
        std::fs::write(dir.path().join("a.kml"), b"mine").unwrap();
        std::fs::write(dir.path().join("a (1).kml"), b"taken").unwrap();

        let renamed = storage
            .add_suffix_to_category(&dir.path().join("a.kml"))
            .await
            .unwrap();

        assert_eq!(renamed, dir.path().join("a (2).kml"));
        assert!(!dir.path().join("a.kml").exists());
        assert_eq!(std::fs::read(&renamed).unwrap(), b"mine");
        assert_eq!(
            rx.try_recv().unwrap(),
            CategoryEvent::Renamed {
                from: dir.path().join("a.kml"),
                to: renamed
            }
        );
    }

    #[tokio::test]
    async fn suffixing_a_suffixed_file_bumps_the_counter() {
        let dir = tempdir().unwrap();
        let storage = FsBookmarkStorage::new(dir.path());
        std::fs::write(dir.path().join("a (1).kml"), b"x").unwrap();

        let renamed = storage
            .add_suffix_to_category(&dir.path().join("a (1).kml"))
            .await
            .unwrap();

        assert_eq!(renamed, dir.path().join("a (2).kml"));
    }

    #[tokio::test]
    async fn import_copies_under_unique_name() {
        let dir = tempdir().unwrap();
        let bookmarks = dir.path().join("bookmarks");
        std::fs::create_dir_all(&bookmarks).unwrap();
        std::fs::write(bookmarks.join("Shared.kml"), b"local").unwrap();
        let incoming = dir.path().join("tmp/Shared.kml");
        std::fs::create_dir_all(incoming.parent().unwrap()).unwrap();
        std::fs::write(&incoming, b"remote").unwrap();

        let storage = FsBookmarkStorage::new(&bookmarks);
        let imported = storage
            .load_bookmarks_file(&incoming, true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(imported, bookmarks.join("Shared (1).kml"));
        assert_eq!(std::fs::read(&imported).unwrap(), b"remote");
        assert_eq!(std::fs::read(bookmarks.join("Shared.kml")).unwrap(), b"local");
    }

    #[tokio::test]
    async fn import_skips_other_formats() {
        let dir = tempdir().unwrap();
        let incoming = dir.path().join("track.gpx");
        std::fs::write(&incoming, b"gpx").unwrap();

        let storage = FsBookmarkStorage::new(dir.path().join("bookmarks"));
        assert_eq!(storage.load_bookmarks_file(&incoming, true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn move_replaces_target() {
        let dir = tempdir().unwrap();
        let storage = FsBookmarkStorage::new(dir.path());
        let from = dir.path().join("incoming.tmp");
        let to = dir.path().join("a.kml");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"old").unwrap();

        storage.move_file(&from, &to).await.unwrap();

        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert!(!from.exists());
    }
}
