//! Sync scheduler: decides when a push-then-pull cycle runs.
//!
//! Only one cycle runs at a time. A trigger that arrives while a cycle is
//! running is a no-op, as is one that finds the device offline or without
//! credentials.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::remote::RemoteApi;
use super::{
    with_db, AppLifecycle, Clock, ConnectivityProbe, DrainReport, LifecycleSource, PullWorker,
    PushWorker, SyncConfig, SyncError, SyncResult, SystemClock, TokenProvider,
};
use crate::db::SharedDatabase;
use crate::models::EntityKind;

/// Scheduler state. The only transitions are `Idle -> Running -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// What asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// App moved to the foreground
    Foreground,
    /// Periodic timer while foregrounded
    Periodic,
    /// User pressed "sync now"
    Manual,
}

/// User-visible sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No cycle has completed on this device yet
    NotSynced,
    Synced,
    Syncing,
    Error,
}

/// Observable scheduler state for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Mutations discarded for reasons other than a plain conflict
    pub needs_attention: u32,
    pub pending_mutations: usize,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub push: DrainReport,
    /// Records applied per entity type
    pub pulled: Vec<(EntityKind, usize)>,
    /// Errors in the order they occurred
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    pub fn pulled(&self, entity: EntityKind) -> usize {
        self.pulled
            .iter()
            .find(|(e, _)| *e == entity)
            .map_or(0, |(_, n)| *n)
    }
}

/// Result of asking for a cycle.
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(CycleReport),
    AlreadyRunning,
    Offline,
    Unauthenticated,
}

impl TriggerOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            TriggerOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Cumulative counters across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub entries_pushed: u64,
    pub records_pulled: u64,
    pub conflicts: u64,
}

/// Host-provided collaborators.
#[derive(Clone)]
pub struct SyncPorts {
    pub clock: Arc<dyn Clock>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub tokens: Arc<dyn TokenProvider>,
    pub lifecycle: Arc<dyn LifecycleSource>,
}

impl SyncPorts {
    /// Ports with the system clock.
    pub fn new(
        connectivity: Arc<dyn ConnectivityProbe>,
        tokens: Arc<dyn TokenProvider>,
        lifecycle: Arc<dyn LifecycleSource>,
    ) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            connectivity,
            tokens,
            lifecycle,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Runs sync cycles against one local store and one remote.
pub struct SyncScheduler {
    db: SharedDatabase,
    push: PushWorker,
    pull: PullWorker,
    ports: SyncPorts,
    config: SyncConfig,
    state: RwLock<SchedulerState>,
    stats: RwLock<SyncStats>,
    snapshot: watch::Sender<SyncSnapshot>,
}

/// Returns the scheduler to `Idle` when the cycle ends, however it ends.
struct RunningGuard<'a> {
    state: &'a RwLock<SchedulerState>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.state.write() = SchedulerState::Idle;
    }
}

impl SyncScheduler {
    pub fn new(
        db: SharedDatabase,
        remote: Arc<dyn RemoteApi>,
        config: SyncConfig,
        ports: SyncPorts,
    ) -> SyncResult<Self> {
        let (last_synced_at, pending_mutations) =
            with_db(&db, |db| Ok((db.last_successful_sync()?, db.outbox_len()?)))?;
        let status = if last_synced_at.is_some() {
            SyncStatus::Synced
        } else {
            SyncStatus::NotSynced
        };
        let (snapshot, _) = watch::channel(SyncSnapshot {
            status,
            last_synced_at,
            last_error: None,
            needs_attention: 0,
            pending_mutations,
        });

        Ok(Self {
            push: PushWorker::new(
                db.clone(),
                remote.clone(),
                ports.clock.clone(),
                config.clone(),
            ),
            pull: PullWorker::new(db.clone(), remote, config.clone()),
            db,
            ports,
            config,
            state: RwLock::new(SchedulerState::Idle),
            stats: RwLock::new(SyncStats::default()),
            snapshot,
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receive every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.subscribe()
    }

    /// Run one cycle now unless one is running or a precondition fails.
    pub async fn trigger(&self, trigger: SyncTrigger) -> TriggerOutcome {
        let Some(_running) = self.begin() else {
            tracing::debug!(?trigger, "sync already running, ignoring trigger");
            return TriggerOutcome::AlreadyRunning;
        };

        if !self.ports.connectivity.is_online().await {
            tracing::debug!(?trigger, "offline, skipping sync");
            self.stats.write().cycles_skipped += 1;
            return TriggerOutcome::Offline;
        }
        let Some(token) = self.ports.tokens.bearer_token().await else {
            tracing::debug!(?trigger, "no credentials, skipping sync");
            self.stats.write().cycles_skipped += 1;
            return TriggerOutcome::Unauthenticated;
        };

        self.snapshot
            .send_modify(|s| s.status = SyncStatus::Syncing);
        let report = self.run_cycle(trigger, &token).await;
        self.finish(&report);
        TriggerOutcome::Completed(report)
    }

    fn begin(&self) -> Option<RunningGuard<'_>> {
        let mut state = self.state.write();
        if *state == SchedulerState::Running {
            return None;
        }
        *state = SchedulerState::Running;
        Some(RunningGuard { state: &self.state })
    }

    async fn run_cycle(&self, trigger: SyncTrigger, token: &str) -> CycleReport {
        let started_at = self.ports.clock.now();
        let mut errors = Vec::new();

        let push = match self.push.drain(token).await {
            Ok(report) => {
                if let Some(err) = &report.first_error {
                    errors.push(format!("push: {}", err));
                }
                report
            }
            Err(err) => {
                tracing::error!(error = %err, "push aborted");
                errors.push(format!("push: {}", err));
                DrainReport::default()
            }
        };

        let mut pulled = Vec::with_capacity(EntityKind::ALL.len());
        for entity in EntityKind::ALL {
            match self.pull.pull(entity, token).await {
                Ok(count) => pulled.push((entity, count)),
                Err(err) => {
                    match &err {
                        SyncError::Remote(_) => {
                            tracing::warn!(entity = %entity, error = %err, "pull failed")
                        }
                        _ => tracing::error!(entity = %entity, error = %err, "pull aborted"),
                    }
                    errors.push(format!("pull {}: {}", entity.resource(), err));
                    pulled.push((entity, 0));
                }
            }
        }

        CycleReport {
            trigger,
            started_at,
            finished_at: self.ports.clock.now(),
            push,
            pulled,
            errors,
        }
    }

    fn finish(&self, report: &CycleReport) {
        let mut last_synced_at = None;
        let mut errors: Vec<String> = Vec::new();

        if report.is_success() {
            match with_db(&self.db, |db| db.record_successful_sync(report.finished_at)) {
                Ok(()) => last_synced_at = Some(report.finished_at),
                Err(err) => {
                    tracing::error!(error = %err, "failed to record sync time");
                    errors.push(err.to_string());
                }
            }
        }
        let pending = with_db(&self.db, |db| db.outbox_len()).ok();

        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.entries_pushed += u64::from(report.push.succeeded);
            stats.records_pulled += report.pulled.iter().map(|(_, n)| *n as u64).sum::<u64>();
            stats.conflicts += u64::from(report.push.conflicts);
        }

        let first_error = report
            .first_error()
            .map(str::to_string)
            .or_else(|| errors.into_iter().next());
        let attention = report.push.needs_attention() as u32;

        self.snapshot.send_modify(|s| {
            match &first_error {
                None => {
                    s.status = SyncStatus::Synced;
                    s.last_error = None;
                }
                Some(err) => {
                    s.status = SyncStatus::Error;
                    s.last_error = Some(err.clone());
                }
            }
            if last_synced_at.is_some() {
                s.last_synced_at = last_synced_at;
            }
            s.needs_attention += attention;
            if let Some(pending) = pending {
                s.pending_mutations = pending;
            }
        });

        tracing::info!(
            trigger = ?report.trigger,
            pushed = report.push.succeeded,
            discarded = report.push.discarded.len(),
            pulled_patients = report.pulled(EntityKind::Patient),
            pulled_appointments = report.pulled(EntityKind::Appointment),
            error = first_error.as_deref().unwrap_or(""),
            "sync cycle finished"
        );
    }

    /// Start the trigger loop on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (commands, receiver) = mpsc::channel(8);
        let task = tokio::spawn(self.run(receiver));
        SchedulerHandle { commands, task }
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<Command>) {
        let mut lifecycle = self.ports.lifecycle.subscribe();
        let mut lifecycle_open = true;
        let mut foreground = *lifecycle.borrow_and_update() == AppLifecycle::Foreground;

        let period = self.config.sync_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if foreground {
            self.trigger(SyncTrigger::Foreground).await;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SyncNow(reply)) => {
                        let outcome = self.trigger(SyncTrigger::Manual).await;
                        let _ = reply.send(outcome);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                changed = lifecycle.changed(), if lifecycle_open => {
                    if changed.is_err() {
                        tracing::debug!("lifecycle source closed");
                        lifecycle_open = false;
                    } else {
                        let now_foreground =
                            *lifecycle.borrow_and_update() == AppLifecycle::Foreground;
                        let entered = now_foreground && !foreground;
                        foreground = now_foreground;
                        if entered {
                            ticker.reset();
                            self.trigger(SyncTrigger::Foreground).await;
                        }
                    }
                }
                _ = ticker.tick(), if foreground => {
                    self.trigger(SyncTrigger::Periodic).await;
                }
            }
        }

        tracing::debug!("sync scheduler stopped");
    }
}

enum Command {
    SyncNow(oneshot::Sender<TriggerOutcome>),
    Shutdown,
}

/// Handle to a running trigger loop.
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a manual cycle and wait for its outcome.
    ///
    /// Queued behind any cycle the loop is currently running.
    pub async fn sync_now(&self) -> SyncResult<TriggerOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::SyncNow(reply))
            .await
            .map_err(|_| SyncError::Runtime("scheduler stopped".into()))?;
        outcome
            .await
            .map_err(|_| SyncError::Runtime("scheduler stopped".into()))
    }

    /// Stop the loop after the current cycle and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "sync scheduler task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::PatientFields;
    use crate::sync::{
        ManualLifecycle, MockOp, MockRemote, RemoteError, StaticConnectivity, StaticTokenProvider,
    };

    struct Fixture {
        db: SharedDatabase,
        remote: Arc<MockRemote>,
        connectivity: Arc<StaticConnectivity>,
        tokens: Arc<StaticTokenProvider>,
        lifecycle: Arc<ManualLifecycle>,
        scheduler: Arc<SyncScheduler>,
    }

    fn setup(config: SyncConfig) -> Fixture {
        let db = Database::open_in_memory().unwrap().into_shared();
        let remote = Arc::new(MockRemote::new());
        let connectivity = Arc::new(StaticConnectivity::new(true));
        let tokens = Arc::new(StaticTokenProvider::new(Some("token".into())));
        let lifecycle = Arc::new(ManualLifecycle::new(AppLifecycle::Background));
        let ports = SyncPorts::new(connectivity.clone(), tokens.clone(), lifecycle.clone());
        let scheduler =
            Arc::new(SyncScheduler::new(db.clone(), remote.clone(), config, ports).unwrap());
        Fixture {
            db,
            remote,
            connectivity,
            tokens,
            lifecycle,
            scheduler,
        }
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<SyncSnapshot>, pred: F) -> SyncSnapshot
    where
        F: Fn(&SyncSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if pred(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_pushes_then_pulls() {
        let f = setup(SyncConfig::new("mock"));
        f.db.lock()
            .unwrap()
            .create_patient(PatientFields::named("Ana"))
            .unwrap();
        f.remote.server_create_patient(PatientFields::named("Bruno"));

        let outcome = f.scheduler.trigger(SyncTrigger::Manual).await;
        let report = outcome.report().unwrap();
        assert!(report.is_success());
        assert_eq!(report.push.succeeded, 1);
        assert_eq!(f.db.lock().unwrap().list_patients().unwrap().len(), 2);

        let snapshot = f.scheduler.snapshot();
        assert_eq!(snapshot.status, SyncStatus::Synced);
        assert_eq!(snapshot.pending_mutations, 0);
        assert_eq!(snapshot.last_synced_at, Some(report.finished_at));
        assert_eq!(
            f.db.lock().unwrap().last_successful_sync().unwrap(),
            Some(report.finished_at)
        );
        assert_eq!(f.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_status_starts_unsynced_until_first_cycle() {
        let f = setup(SyncConfig::new("mock"));
        let snapshot = f.scheduler.snapshot();
        assert_eq!(snapshot.status, SyncStatus::NotSynced);
        assert_eq!(snapshot.last_synced_at, None);

        f.scheduler.trigger(SyncTrigger::Manual).await;
        assert_eq!(f.scheduler.snapshot().status, SyncStatus::Synced);

        // A store that synced before starts out synced
        let ports = SyncPorts::new(
            f.connectivity.clone(),
            f.tokens.clone(),
            f.lifecycle.clone(),
        );
        let restarted =
            SyncScheduler::new(f.db.clone(), f.remote.clone(), SyncConfig::new("mock"), ports)
                .unwrap();
        assert_eq!(restarted.snapshot().status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_offline_and_unauthenticated_are_silent() {
        let f = setup(SyncConfig::new("mock"));

        f.connectivity.set_online(false);
        assert!(matches!(
            f.scheduler.trigger(SyncTrigger::Manual).await,
            TriggerOutcome::Offline
        ));

        f.connectivity.set_online(true);
        f.tokens.set_token(None);
        assert!(matches!(
            f.scheduler.trigger(SyncTrigger::Manual).await,
            TriggerOutcome::Unauthenticated
        ));

        assert!(f.remote.calls().is_empty());
        assert_eq!(f.scheduler.snapshot().status, SyncStatus::NotSynced);
        assert_eq!(f.scheduler.stats().cycles_skipped, 2);
        assert_eq!(f.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let f = setup(SyncConfig::new("mock"));
        f.remote.set_latency(Some(Duration::from_millis(100)));

        let (a, b) = tokio::join!(
            f.scheduler.trigger(SyncTrigger::Manual),
            f.scheduler.trigger(SyncTrigger::Periodic)
        );
        let completed = [&a, &b]
            .iter()
            .filter(|o| matches!(o, TriggerOutcome::Completed(_)))
            .count();
        let skipped = [&a, &b]
            .iter()
            .filter(|o| matches!(o, TriggerOutcome::AlreadyRunning))
            .count();
        assert_eq!((completed, skipped), (1, 1));
        assert_eq!(f.remote.call_count(MockOp::Fetch), 2);
    }

    #[tokio::test]
    async fn test_error_is_surfaced_and_cycle_continues() {
        let f = setup(SyncConfig::new("mock"));
        f.remote.server_create_appointment(
            "unknown",
            crate::models::AppointmentFields::scheduled("2024-03-01T09:00:00Z", 30),
        );
        f.remote.server_create_patient(PatientFields::named("Ana"));
        f.remote
            .fail_next(MockOp::Fetch, RemoteError::Transient("503".into()));

        let outcome = f.scheduler.trigger(SyncTrigger::Manual).await;
        let report = outcome.report().unwrap();
        assert!(!report.is_success());
        assert!(report.first_error().unwrap().contains("503"));
        // Patients failed, appointments were still pulled (and skipped)
        assert_eq!(f.remote.call_count(MockOp::Fetch), 2);

        let snapshot = f.scheduler.snapshot();
        assert_eq!(snapshot.status, SyncStatus::Error);
        assert_eq!(snapshot.last_synced_at, None);

        let outcome = f.scheduler.trigger(SyncTrigger::Manual).await;
        assert!(outcome.report().unwrap().is_success());
        assert_eq!(f.scheduler.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn test_loop_syncs_on_foreground_and_manual_request() {
        let f = setup(SyncConfig::new("mock").with_sync_interval(Duration::from_secs(3600)));
        let mut snapshots = f.scheduler.subscribe();
        let handle = f.scheduler.clone().spawn();

        f.db.lock()
            .unwrap()
            .create_patient(PatientFields::named("Ana"))
            .unwrap();
        f.lifecycle.set(AppLifecycle::Foreground);
        wait_for(&mut snapshots, |s| {
            s.last_synced_at.is_some() && s.status == SyncStatus::Synced
        })
        .await;
        assert_eq!(f.remote.patients().len(), 1);

        f.remote.server_create_patient(PatientFields::named("Bruno"));
        let outcome = handle.sync_now().await.unwrap();
        assert_eq!(outcome.report().unwrap().pulled(EntityKind::Patient), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_ticks_only_in_foreground() {
        let f = setup(SyncConfig::new("mock").with_sync_interval(Duration::from_millis(20)));
        let handle = f.scheduler.clone().spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.scheduler.stats().cycles_completed, 0);

        f.lifecycle.set(AppLifecycle::Foreground);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(f.scheduler.stats().cycles_completed >= 2);

        f.lifecycle.set(AppLifecycle::Background);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = f.scheduler.stats().cycles_completed;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.scheduler.stats().cycles_completed, settled);

        handle.shutdown().await;
    }
}
