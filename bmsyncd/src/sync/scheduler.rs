use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bmsync_core::SyncErrorKind;
use rand::Rng;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::syncer::{SyncOutcome, Syncer};

const DEFAULT_FOREGROUND_SECS: u64 = 5 * 60;
const DEFAULT_BACKGROUND_SECS: u64 = 24 * 60 * 60;
const DEFAULT_MIN_INTERVAL_SECS: u64 = 60;
const DEFAULT_TICK_MS: u64 = 1000;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 60;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The host is visible: short cadence.
    Foreground,
    /// Long cadence to save battery and traffic.
    Background,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub foreground_interval: Duration,
    pub background_interval: Duration,
    /// Minimum gap between the starts of two passes of one account.
    pub min_interval: Duration,
    pub tick: Duration,
    pub failure_backoff: Backoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            foreground_interval: Duration::from_secs(DEFAULT_FOREGROUND_SECS),
            background_interval: Duration::from_secs(DEFAULT_BACKGROUND_SECS),
            min_interval: Duration::from_secs(DEFAULT_MIN_INTERVAL_SECS),
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            failure_backoff: Backoff::new(
                Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
                Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
                true,
            ),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self, mode: Mode) -> Duration {
        match mode {
            Mode::Foreground => self.foreground_interval,
            Mode::Background => self.background_interval,
        }
    }
}

/// When the next pass of one account is due.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    mode: Mode,
    next_due: Instant,
    last_started: Option<Instant>,
    failures: u32,
}

impl SyncPlan {
    /// A new plan is due right away.
    pub fn new(mode: Mode, now: Instant) -> Self {
        Self {
            mode,
            next_due: now,
            last_started: None,
            failures: 0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    fn earliest_start(&self, now: Instant, config: &SchedulerConfig) -> Instant {
        match self.last_started {
            Some(started) => now.max(started + config.min_interval),
            None => now,
        }
    }

    /// A long background wait is cut down to the foreground interval.
    pub fn on_foreground(&mut self, now: Instant, config: &SchedulerConfig) {
        self.mode = Mode::Foreground;
        let target = (now + config.foreground_interval).max(self.earliest_start(now, config));
        if self.next_due > target {
            self.next_due = target;
        }
    }

    pub fn on_background(&mut self) {
        self.mode = Mode::Background;
    }

    /// Explicit or change-driven request, debounced by the minimum interval.
    pub fn on_request(&mut self, now: Instant, config: &SchedulerConfig) {
        let at = self.earliest_start(now, config);
        if at < self.next_due {
            self.next_due = at;
        }
    }

    pub fn on_started(&mut self, now: Instant, config: &SchedulerConfig) {
        self.last_started = Some(now);
        self.next_due = now + config.interval(self.mode);
    }

    /// The pass could not be handed to its worker. Fall back to the long
    /// cadence; the next foreground transition reschedules.
    pub fn on_enqueue_failed(&mut self, now: Instant, config: &SchedulerConfig) {
        self.mode = Mode::Background;
        self.next_due = now + config.background_interval;
    }

    pub fn on_finished<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        result: &Result<SyncOutcome, SyncErrorKind>,
        config: &SchedulerConfig,
        rng: &mut R,
    ) {
        let interval = config.interval(self.mode);
        let delay = match result {
            Ok(SyncOutcome::Deferred { retry_after }) => (*retry_after).max(config.min_interval),
            Ok(_) => {
                self.failures = 0;
                interval
            }
            Err(_) => {
                self.failures = self.failures.saturating_add(1);
                config
                    .failure_backoff
                    .after_failures_with_rng(self.failures, rng)
                    .max(interval)
            }
        };
        self.next_due = now + delay;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    Foreground,
    Background,
    /// Sync one account, or every enabled one.
    SyncNow(Option<i64>),
    SetEnabled { account: i64, enabled: bool },
    /// Bookmark files changed on disk.
    LocalChanges(Vec<PathBuf>),
    Shutdown,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Returns `false` once the scheduler has stopped.
    pub fn send(&self, command: SchedulerCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

struct Finished {
    account: i64,
    result: Result<SyncOutcome, SyncErrorKind>,
}

struct AccountSlot {
    syncer: Arc<Syncer>,
    plan: SyncPlan,
    enabled: bool,
    in_flight: bool,
    /// Files changed while a pass was running; another pass follows it.
    rerun: bool,
    requests: mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

impl AccountSlot {
    fn start(&mut self, now: Instant, config: &SchedulerConfig) {
        let account = self.syncer.account().id;
        if self.in_flight {
            debug!(account, "pass already running, dropping trigger");
            return;
        }
        match self.requests.try_send(()) {
            Ok(()) => {
                self.in_flight = true;
                self.plan.on_started(now, config);
            }
            Err(TrySendError::Full(())) => {
                debug!(account, "pass already queued, dropping trigger");
            }
            Err(TrySendError::Closed(())) => {
                warn!(account, "sync worker is gone, falling back to background schedule");
                self.plan.on_enqueue_failed(now, config);
            }
        }
    }

    async fn mark_changed(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let account = self.syncer.account().id;
        for path in paths {
            if let Err(err) = self.syncer.state().mark_changed(&path).await {
                warn!(account, path = %path.display(), error = %err, "failed to mark file changed");
            }
        }
    }
}

/// Runs passes for every account: one worker task per account, at most one
/// pass in flight each, driven by a single scheduling loop.
pub struct Scheduler {
    config: SchedulerConfig,
    slots: BTreeMap<i64, AccountSlot>,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    done_tx: mpsc::UnboundedSender<Finished>,
    done_rx: mpsc::UnboundedReceiver<Finished>,
}

impl Scheduler {
    /// Spawns the per-account workers; call from inside a Tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        syncers: Vec<Arc<Syncer>>,
        mode: Mode,
    ) -> (Self, SchedulerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let slots = syncers
            .into_iter()
            .map(|syncer| {
                let (requests, worker) = spawn_worker(Arc::clone(&syncer), done_tx.clone());
                let slot = AccountSlot {
                    syncer: Arc::clone(&syncer),
                    plan: SyncPlan::new(mode, now),
                    enabled: true,
                    in_flight: false,
                    rerun: false,
                    requests,
                    worker,
                };
                (syncer.account().id, slot)
            })
            .collect();
        let scheduler = Self {
            config,
            slots,
            commands,
            done_tx,
            done_rx,
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub async fn run(mut self) {
        info!(accounts = self.slots.len(), "scheduler started");
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.start_due(Instant::now()),
                command = self.commands.recv() => match command {
                    Some(SchedulerCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                Some(finished) = self.done_rx.recv() => self.on_finished(finished).await,
            }
        }
        self.shutdown().await;
    }

    fn start_due(&mut self, now: Instant) {
        for slot in self.slots.values_mut() {
            if slot.enabled && !slot.in_flight && slot.plan.is_due(now) {
                slot.start(now, &self.config);
            }
        }
    }

    async fn handle(&mut self, command: SchedulerCommand) {
        let now = Instant::now();
        match command {
            SchedulerCommand::Foreground => {
                for slot in self.slots.values_mut() {
                    if slot.requests.is_closed() {
                        let (requests, worker) =
                            spawn_worker(Arc::clone(&slot.syncer), self.done_tx.clone());
                        slot.requests = requests;
                        slot.worker = worker;
                        slot.in_flight = false;
                    }
                    slot.plan.on_foreground(now, &self.config);
                }
            }
            SchedulerCommand::Background => {
                for slot in self.slots.values_mut() {
                    slot.plan.on_background();
                }
            }
            SchedulerCommand::SyncNow(account) => {
                for (id, slot) in self.slots.iter_mut() {
                    if account.is_none_or(|wanted| wanted == *id) {
                        slot.plan.on_request(now, &self.config);
                    }
                }
                self.start_due(now);
            }
            SchedulerCommand::SetEnabled { account, enabled } => {
                let Some(slot) = self.slots.get_mut(&account) else {
                    warn!(account, "cannot toggle unknown account");
                    return;
                };
                slot.enabled = enabled;
                if let Err(err) = slot.syncer.set_tracking(enabled).await {
                    warn!(account, error = %err, "failed to update change tracking");
                }
                info!(account, enabled, "sync toggled");
                if enabled {
                    slot.plan.on_request(now, &self.config);
                    self.start_due(now);
                }
            }
            SchedulerCommand::LocalChanges(paths) => {
                // Marked right away; a running pass only clears marks it read.
                for slot in self.slots.values_mut() {
                    if !slot.enabled {
                        continue;
                    }
                    slot.mark_changed(paths.iter().cloned()).await;
                    if slot.in_flight {
                        slot.rerun = true;
                    } else {
                        slot.plan.on_request(now, &self.config);
                    }
                }
                self.start_due(now);
            }
            SchedulerCommand::Shutdown => {}
        }
    }

    async fn on_finished(&mut self, finished: Finished) {
        let now = Instant::now();
        let Some(slot) = self.slots.get_mut(&finished.account) else {
            return;
        };
        slot.in_flight = false;
        slot.plan
            .on_finished(now, &finished.result, &self.config, &mut rand::thread_rng());
        debug!(
            account = finished.account,
            failures = slot.plan.failures(),
            next_in = ?slot.plan.next_due().saturating_duration_since(now),
            "pass finished"
        );

        if !slot.enabled {
            // A pass that was running while sync got disabled cleared staleness.
            if let Err(err) = slot.syncer.set_tracking(false).await {
                warn!(account = finished.account, error = %err, "failed to pause change tracking");
            }
            slot.rerun = false;
            return;
        }
        if std::mem::take(&mut slot.rerun) {
            slot.plan.on_request(now, &self.config);
        }
    }

    async fn shutdown(self) {
        info!("scheduler stopping, waiting for running passes");
        let workers: Vec<_> = self
            .slots
            .into_values()
            .map(|slot| {
                drop(slot.requests);
                slot.worker
            })
            .collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "sync worker ended abnormally");
            }
        }
    }
}

fn spawn_worker(
    syncer: Arc<Syncer>,
    done: mpsc::UnboundedSender<Finished>,
) -> (mpsc::Sender<()>, JoinHandle<()>) {
    let (requests, mut rx) = mpsc::channel(1);
    let worker = tokio::spawn(async move {
        let account = syncer.account().id;
        while rx.recv().await.is_some() {
            let result = syncer.perform_sync().await;
            match &result {
                Ok(outcome) => debug!(account, ?outcome, "sync pass done"),
                Err(err) => {
                    warn!(account, error = %err, "sync pass failed");
                    if let Err(store_err) = syncer.state().record_error(&err.to_serialized()).await
                    {
                        warn!(account, error = %store_err, "failed to record sync error");
                    }
                }
            }
            let finished = Finished {
                account,
                result: result.map_err(|err| err.kind()),
            };
            if done.send(finished).is_err() {
                break;
            }
        }
    });
    (requests, worker)
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
