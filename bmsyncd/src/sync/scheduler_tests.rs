use super::*;
use std::path::Path;

use bmsync_core::{Account, BackendType, FolderBackend};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::{TempDir, tempdir};

use crate::sync::local_state::StateStore;
use crate::sync::storage::FsBookmarkStorage;
use crate::sync::syncer::{SyncReport, SyncerConfig};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        foreground_interval: Duration::from_secs(300),
        background_interval: Duration::from_secs(86_400),
        min_interval: Duration::from_secs(60),
        tick: Duration::from_secs(1),
        failure_backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(3600), false),
    }
}

fn synced() -> Result<SyncOutcome, SyncErrorKind> {
    Ok(SyncOutcome::Synced(SyncReport::default()))
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[test]
fn new_plan_is_due_immediately() {
    let now = Instant::now();
    let plan = SyncPlan::new(Mode::Background, now);
    assert!(plan.is_due(now));
}

#[test]
fn success_waits_for_mode_interval() {
    let cfg = config();
    let mut rng = StdRng::seed_from_u64(1);
    let now = Instant::now();
    let mut plan = SyncPlan::new(Mode::Background, now);

    plan.on_started(now, &cfg);
    plan.on_finished(now, &synced(), &cfg, &mut rng);

    assert_eq!(plan.next_due(), now + cfg.background_interval);
    assert!(!plan.is_due(now + secs(300)));
}

#[test]
fn foreground_cuts_a_long_background_wait() {
    let cfg = config();
    let mut rng = StdRng::seed_from_u64(1);
    let now = Instant::now();
    let mut plan = SyncPlan::new(Mode::Background, now);
    plan.on_started(now, &cfg);
    plan.on_finished(now, &synced(), &cfg, &mut rng);

    plan.on_foreground(now + secs(10), &cfg);

    assert_eq!(plan.mode(), Mode::Foreground);
    assert_eq!(plan.next_due(), now + secs(310));
}

#[test]
fn foreground_never_delays_a_pending_pass() {
    let cfg = config();
    let now = Instant::now();
    let mut plan = SyncPlan::new(Mode::Background, now);

    plan.on_foreground(now, &cfg);

    assert!(plan.is_due(now));
}

#[test]
fn enqueue_failure_falls_back_to_background() {
    let cfg = config();
    let now = Instant::now();
    let mut plan = SyncPlan::new(Mode::Foreground, now);

    plan.on_enqueue_failed(now, &cfg);

    assert_eq!(plan.mode(), Mode::Background);
    assert_eq!(plan.next_due(), now + cfg.background_interval);

    plan.on_foreground(now + secs(1), &cfg);
    assert_eq!(plan.mode(), Mode::Foreground);
    assert_eq!(plan.next_due(), now + secs(301));
}

#[test]
fn deferred_pass_retries_after_lock_hold() {
    let cfg = config();
    let mut rng = StdRng::seed_from_u64(1);
    let now = Instant::now();
    let mut plan = SyncPlan::new(Mode::Foreground, now);

    plan.on_finished(
        now,
        &Ok(SyncOutcome::Deferred {
            retry_after: secs(600),
        }),
        &cfg,
        &mut rng,
    );
    assert_eq!(plan.next_due(), now + secs(600));

    plan.on_finished(
        now,
        &Ok(SyncOutcome::Deferred {
            retry_after: secs(5),
        }),
        &cfg,
        &mut rng,
    );
    assert_eq!(plan.next_due(), now + cfg.min_interval);
}

#[test]
fn failures_back_off_and_reset_on_success() {
    let cfg = config();
    let mut rng = StdRng::seed_from_u64(1);
    let now = Instant::now();
    let mut plan = SyncPlan::new(Mode::Foreground, now);

    plan.on_finished(now, &Err(SyncErrorKind::Network), &cfg, &mut rng);
    assert_eq!(plan.failures(), 1);
    assert_eq!(plan.next_due(), now + cfg.foreground_interval);

    for _ in 0..3 {
        plan.on_finished(now, &Err(SyncErrorKind::Network), &cfg, &mut rng);
    }
    assert_eq!(plan.failures(), 4);
    assert_eq!(plan.next_due(), now + secs(480));

    plan.on_finished(now, &synced(), &cfg, &mut rng);
    assert_eq!(plan.failures(), 0);
    assert_eq!(plan.next_due(), now + cfg.foreground_interval);
}

#[test]
fn requests_are_debounced_by_min_interval() {
    let cfg = config();
    let now = Instant::now();
    let mut plan = SyncPlan::new(Mode::Foreground, now);
    plan.on_started(now, &cfg);

    plan.on_request(now + secs(10), &cfg);
    assert_eq!(plan.next_due(), now + secs(60));

    plan.on_request(now + secs(120), &cfg);
    assert_eq!(plan.next_due(), now + secs(60));
}

struct Fixture {
    _root: TempDir,
    bookmarks: PathBuf,
    cloud: PathBuf,
    syncer: Arc<Syncer>,
}

async fn fixture() -> Fixture {
    fixture_with_grace(Duration::ZERO).await
}

async fn fixture_with_grace(rerun_grace: Duration) -> Fixture {
    let root = tempdir().unwrap();
    let bookmarks = root.path().join("bookmarks");
    let cloud = root.path().join("cloud");
    std::fs::create_dir_all(&bookmarks).unwrap();
    std::fs::create_dir_all(&cloud).unwrap();
    let store = StateStore::open(&root.path().join("state.db")).await.unwrap();
    let account = Account {
        id: 7,
        backend_type: BackendType::Folder,
        auth_state: cloud.to_string_lossy().into_owned(),
    };
    let syncer = Syncer::new(
        account,
        Arc::new(FolderBackend::new(cloud.clone())),
        Arc::new(FsBookmarkStorage::new(bookmarks.clone())),
        store.for_account(7),
        SyncerConfig {
            temp_dir: root.path().join("tmp"),
            rerun_grace,
        },
    );
    Fixture {
        _root: root,
        bookmarks,
        cloud,
        syncer: Arc::new(syncer),
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        foreground_interval: Duration::from_secs(3600),
        background_interval: Duration::from_secs(86_400),
        min_interval: Duration::ZERO,
        tick: Duration::from_millis(10),
        failure_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(1), false),
    }
}

async fn wait_for(path: &Path) -> bool {
    for _ in 0..500 {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_first_pass(syncer: &Syncer) {
    for _ in 0..500 {
        if syncer.state().dir_state().await.unwrap().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("first pass never committed");
}

#[tokio::test]
async fn syncs_on_start_and_on_local_changes() {
    let fx = fixture().await;
    std::fs::write(fx.bookmarks.join("a.kml"), b"A").unwrap();
    let (scheduler, handle) = Scheduler::new(fast_config(), vec![fx.syncer.clone()], Mode::Foreground);
    let task = tokio::spawn(scheduler.run());

    assert!(wait_for(&fx.cloud.join("a.kml")).await);

    std::fs::write(fx.bookmarks.join("b.kml"), b"B").unwrap();
    assert!(handle.send(SchedulerCommand::LocalChanges(vec![fx.bookmarks.join("b.kml")])));
    assert!(wait_for(&fx.cloud.join("b.kml")).await);

    handle.send(SchedulerCommand::Shutdown);
    task.await.unwrap();
}

#[tokio::test]
async fn disabled_account_is_skipped_until_reenabled() {
    let fx = fixture().await;
    let (scheduler, handle) = Scheduler::new(fast_config(), vec![fx.syncer.clone()], Mode::Foreground);
    let task = tokio::spawn(scheduler.run());
    wait_for_first_pass(&fx.syncer).await;

    handle.send(SchedulerCommand::SetEnabled {
        account: 7,
        enabled: false,
    });
    std::fs::write(fx.bookmarks.join("c.kml"), b"C").unwrap();
    handle.send(SchedulerCommand::LocalChanges(vec![fx.bookmarks.join("c.kml")]));
    handle.send(SchedulerCommand::SyncNow(None));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!fx.cloud.join("c.kml").exists());
    assert!(fx.syncer.state().is_stale().await.unwrap());

    handle.send(SchedulerCommand::SetEnabled {
        account: 7,
        enabled: true,
    });
    assert!(wait_for(&fx.cloud.join("c.kml")).await);

    handle.send(SchedulerCommand::Shutdown);
    task.await.unwrap();
}

#[tokio::test]
async fn changes_during_a_pass_survive_shutdown() {
    // A foreign file forces an import, keeping the pass busy for the grace period.
    let fx = fixture_with_grace(Duration::from_millis(800)).await;
    std::fs::write(fx.cloud.join("Shared.kml"), b"<kml/>").unwrap();
    let (scheduler, handle) = Scheduler::new(fast_config(), vec![fx.syncer.clone()], Mode::Foreground);
    let task = tokio::spawn(scheduler.run());
    assert!(wait_for(&fx.bookmarks.join("Shared.kml")).await);

    let edited = fx.bookmarks.join("b.kml");
    std::fs::write(&edited, b"B").unwrap();
    handle.send(SchedulerCommand::LocalChanges(vec![edited.clone()]));
    handle.send(SchedulerCommand::Shutdown);
    task.await.unwrap();

    let still_marked = fx
        .syncer
        .state()
        .changed_files()
        .await
        .unwrap()
        .contains(&edited);
    assert!(still_marked || fx.cloud.join("b.kml").exists());
}
