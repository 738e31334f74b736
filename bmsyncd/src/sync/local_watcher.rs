use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::storage::is_kml_path;

/// Watches the flat bookmarks directory. Each message is the set of bookmark
/// files touched by one filesystem event.
pub fn start_notify_watcher(
    bookmarks_dir: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<Vec<PathBuf>>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let paths = changed_bookmarks(event);
            if !paths.is_empty() {
                let _ = tx.send(paths);
            }
        }
    })?;
    watcher.watch(bookmarks_dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

fn changed_bookmarks(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_)
        | EventKind::Remove(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Any) => {
            let mut paths: Vec<PathBuf> = event
                .paths
                .into_iter()
                .filter(|path| is_kml_path(path))
                .collect();
            paths.sort();
            paths.dedup();
            paths
        }
        _ => Vec::new(),
    }
}
