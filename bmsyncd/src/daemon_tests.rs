use super::*;
use tempfile::tempdir;

fn test_config(root: &Path) -> DaemonConfig {
    DaemonConfig {
        bookmarks_dir: root.join("bookmarks"),
        state_db: root.join("state").join("state.db"),
        temp_dir: root.join("tmp"),
        foreground_interval: Duration::from_secs(300),
        background_interval: Duration::from_secs(86_400),
        min_interval: Duration::from_secs(60),
        tick: Duration::from_millis(1000),
        rerun_grace: Duration::ZERO,
        enable_watcher: false,
        start_foreground: false,
    }
}

#[test]
fn expands_tilde_to_home_bookmarks_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Bookmarks", &home),
        PathBuf::from("/tmp/home-user/Bookmarks")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(
        expand_with_home("/srv/bookmarks", &home),
        PathBuf::from("/srv/bookmarks")
    );
}

#[test]
fn reads_intervals_from_env_or_default() {
    assert_eq!(read_u64_env("BMSYNC_NO_SUCH_ENV_FOR_TEST", 42), 42);
}

#[test]
fn watcher_is_enabled_by_default() {
    assert!(read_bool_env("BMSYNC_NO_SUCH_BOOL_ENV_FOR_TEST", true));
    assert!(!read_bool_env("BMSYNC_NO_SUCH_BOOL_ENV_FOR_TEST", false));
}

#[test]
fn temp_root_lives_under_app_dir() {
    let temp = default_temp_root();
    assert!(temp.ends_with(Path::new(APP_DIR_NAME).join("tmp")));
}

#[test]
fn start_mode_follows_foreground_flag() {
    let root = PathBuf::from("/tmp/bmsync-test");
    let mut config = test_config(&root);
    assert_eq!(config.start_mode(), Mode::Background);
    config.start_foreground = true;
    assert_eq!(config.start_mode(), Mode::Foreground);
}

#[test]
fn scheduler_config_carries_intervals() {
    let config = test_config(Path::new("/tmp/bmsync-test"));
    let scheduler = config.scheduler_config();
    assert_eq!(scheduler.foreground_interval, Duration::from_secs(300));
    assert_eq!(scheduler.min_interval, Duration::from_secs(60));
    assert_eq!(config.syncer_config().rerun_grace, Duration::ZERO);
}

#[tokio::test]
async fn bootstrap_creates_directories() {
    let root = tempdir().unwrap();
    let daemon = DaemonRuntime::bootstrap(test_config(root.path()))
        .await
        .unwrap();

    assert!(daemon.config().bookmarks_dir.is_absolute());
    assert!(root.path().join("bookmarks").is_dir());
    assert!(root.path().join("tmp").is_dir());
    assert!(root.path().join("state").join("state.db").exists());
    assert!(daemon.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_once_uploads_to_linked_folder() {
    let root = tempdir().unwrap();
    let cloud = root.path().join("cloud");
    std::fs::create_dir_all(&cloud).unwrap();
    let daemon = DaemonRuntime::bootstrap(test_config(root.path()))
        .await
        .unwrap();
    let account = daemon.link_folder(&cloud).await.unwrap();
    std::fs::write(root.path().join("bookmarks").join("Trip.kml"), b"<kml/>").unwrap();

    let results = daemon.sync_once().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, account.id);
    assert!(matches!(results[0].1, Ok(SyncOutcome::Synced(_))));
    assert_eq!(std::fs::read(cloud.join("Trip.kml")).unwrap(), b"<kml/>");

    let status = daemon.status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].backend, "folder");
    assert!(!status[0].stale);
    assert!(status[0].dir_state.is_some());
    assert_eq!(status[0].pending_changes, 0);
    assert!(status[0].last_error.is_none());

    let again = daemon.sync_once().await.unwrap();
    assert!(matches!(again[0].1, Ok(SyncOutcome::UpToDate)));
}

#[tokio::test]
async fn failed_pass_is_recorded_in_status() {
    let root = tempdir().unwrap();
    let not_a_dir = root.path().join("cloud.kml");
    std::fs::write(&not_a_dir, b"file").unwrap();
    let daemon = DaemonRuntime::bootstrap(test_config(root.path()))
        .await
        .unwrap();
    daemon.link_folder(&not_a_dir).await.unwrap();

    let results = daemon.sync_once().await.unwrap();
    assert!(results[0].1.is_err());

    let status = daemon.status().await.unwrap();
    assert!(status[0].last_error.is_some());
    let json = serde_json::to_value(&status).unwrap();
    assert!(json[0]["last_error"]["message"].is_string());
}

#[tokio::test]
async fn unlink_forgets_the_account() {
    let root = tempdir().unwrap();
    let daemon = DaemonRuntime::bootstrap(test_config(root.path()))
        .await
        .unwrap();
    let account = daemon
        .link_folder(&root.path().join("cloud"))
        .await
        .unwrap();

    daemon.unlink(account.id).await.unwrap();

    assert!(daemon.status().await.unwrap().is_empty());
    assert!(daemon.unlink(account.id).await.is_err());
}
