use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vmjobs_core::JobDefinition;
use vmjobs_lock::LockManager;
use vmjobs_workflow::{RunReport, RunStatus};

use crate::error::{Result, SchedulerError};
use crate::registry::JobRegistry;
use crate::schedule::compute_next_run;

/// Executes one run of a job. Implementations never fail: errors belong in
/// the returned report.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, def: &JobDefinition) -> RunReport;
}

/// What the scheduler reports about every run it dispatched.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processed: Option<u64>,
    pub failed: Option<u64>,
}

impl RunSummary {
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            job_id: report.job_id.clone(),
            status: report.status,
            started_at: report.started_at,
            completed_at: report.completed_at,
            processed: report
                .output_u64("processed_count")
                .or_else(|| report.output_u64("records_saved")),
            failed: report
                .output_u64("failed_count")
                .or_else(|| report.output_u64("units_failed")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_workers: usize,
    pub tick_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_workers: 10,
            tick_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Jobs currently executing in this process, with their start time.
type InFlight = Arc<DashMap<String, DateTime<Utc>>>;

/// Shared handle for inspecting and reloading a running engine.
#[derive(Clone)]
pub struct SchedulerHandle {
    registry: Arc<JobRegistry>,
    running: InFlight,
    reload_tx: mpsc::Sender<Vec<JobDefinition>>,
}

impl SchedulerHandle {
    pub fn job_count(&self) -> usize {
        self.registry.len()
    }

    /// Ids of jobs running right now, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Queues a replacement job list. The engine validates it and keeps the
    /// current list if it is rejected.
    pub async fn reload(&self, jobs: Vec<JobDefinition>) -> Result<()> {
        self.reload_tx
            .send(jobs)
            .await
            .map_err(|_| SchedulerError::ShutDown)
    }
}

/// Drives job execution: evaluates triggers every tick and dispatches due jobs
/// onto a bounded worker pool, gated by an in-process guard and the advisory
/// lock.
pub struct SchedulerEngine {
    registry: Arc<JobRegistry>,
    locks: LockManager,
    runner: Arc<dyn JobRunner>,
    settings: EngineSettings,
    workers: Arc<Semaphore>,
    running: InFlight,
    /// If set, a summary of every finished run is sent here.
    report_tx: Option<mpsc::Sender<RunSummary>>,
    reload_tx: mpsc::Sender<Vec<JobDefinition>>,
    reload_rx: Option<mpsc::Receiver<Vec<JobDefinition>>>,
}

impl SchedulerEngine {
    /// Pass `Some(tx)` to receive a [`RunSummary`] per dispatched run. The
    /// sender is non-blocking (`try_send`) so runs never wait on the consumer.
    pub fn new(
        registry: Arc<JobRegistry>,
        locks: LockManager,
        runner: Arc<dyn JobRunner>,
        settings: EngineSettings,
        report_tx: Option<mpsc::Sender<RunSummary>>,
    ) -> Self {
        let (reload_tx, reload_rx) = mpsc::channel(4);
        Self {
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            registry,
            locks,
            runner,
            settings,
            running: Arc::new(DashMap::new()),
            report_tx,
            reload_tx,
            reload_rx: Some(reload_rx),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            registry: Arc::clone(&self.registry),
            running: Arc::clone(&self.running),
            reload_tx: self.reload_tx.clone(),
        }
    }

    /// Runs `job_id` now through the same guard and lock path as a scheduled
    /// fire. `Ok(None)` means another process holds the lock.
    pub async fn run_once(&self, job_id: &str) -> Result<Option<RunReport>> {
        let def = self.registry.get(job_id)?;
        let claim = Claim::take(&self.running, &def.id)
            .ok_or_else(|| SchedulerError::AlreadyRunning { id: def.id.clone() })?;
        let report = execute(self.dispatcher(), def).await;
        drop(claim);
        report
    }

    /// Main event loop. Ticks until `shutdown` broadcasts `true`, then drains
    /// in-flight runs for up to the grace period and aborts the rest.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_workers = self.settings.max_workers,
            degraded_locking = self.locks.is_degraded(),
            "Scheduler engine started"
        );
        let Some(mut reload_rx) = self.reload_rx.take() else {
            error!("Scheduler engine already ran");
            return;
        };

        let mut next_run = HashMap::new();
        let jobs = self.registry.snapshot();
        self.reschedule(&[], &jobs, &mut next_run, Utc::now());

        let mut tasks = JoinSet::new();
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now(), &mut next_run, &mut tasks);
                }
                Some(jobs) = reload_rx.recv() => {
                    self.apply_reload(jobs, &mut next_run);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Run task failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown sender dropped, stopping scheduler engine");
                        break;
                    }
                    if *shutdown.borrow() {
                        info!("Scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        self.registry.shutdown();
        self.drain(tasks).await;
        info!("Scheduler engine stopped");
    }

    // --- private helpers ---------------------------------------------------

    /// Dispatches every enabled job whose fire time has arrived. Missed fires
    /// collapse into one: the next fire is computed from `now`.
    fn tick(
        &self,
        now: DateTime<Utc>,
        next_run: &mut HashMap<String, DateTime<Utc>>,
        tasks: &mut JoinSet<()>,
    ) {
        let jobs = self.registry.snapshot();
        for def in jobs.iter().filter(|j| j.enabled) {
            let Some(due) = next_run.get(&def.id).copied() else {
                continue;
            };
            if due > now {
                continue;
            }
            match compute_next_run(&def.schedule, now) {
                Some(next) => {
                    next_run.insert(def.id.clone(), next);
                }
                None => {
                    next_run.remove(&def.id);
                }
            }
            self.dispatch(def.clone(), tasks);
        }
    }

    fn dispatch(&self, def: JobDefinition, tasks: &mut JoinSet<()>) {
        let Some(claim) = Claim::take(&self.running, &def.id) else {
            warn!(job_id = %def.id, "Previous run still in progress, skipping");
            return;
        };
        debug!(job_id = %def.id, "Dispatching job");
        let dispatcher = self.dispatcher();
        tasks.spawn(async move {
            let job_id = def.id.clone();
            if let Err(e) = execute(dispatcher, def).await {
                error!(job_id = %job_id, error = %e, "Lock store error, run skipped");
            }
            drop(claim);
        });
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            locks: self.locks.clone(),
            runner: Arc::clone(&self.runner),
            workers: Arc::clone(&self.workers),
            report_tx: self.report_tx.clone(),
        }
    }

    fn apply_reload(&self, jobs: Vec<JobDefinition>, next_run: &mut HashMap<String, DateTime<Utc>>) {
        let previous = self.registry.snapshot();
        if let Err(e) = self.registry.reload(jobs) {
            error!(error = %e, "Reload rejected, keeping current jobs");
            return;
        }
        let current = self.registry.snapshot();
        self.reschedule(&previous, &current, next_run, Utc::now());
    }

    /// Keeps fire times for jobs whose definition did not change and computes
    /// fresh ones for new or changed jobs.
    fn reschedule(
        &self,
        previous: &[JobDefinition],
        current: &[JobDefinition],
        next_run: &mut HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        next_run.retain(|id, _| current.iter().any(|j| &j.id == id && j.enabled));
        for def in current.iter().filter(|j| j.enabled) {
            let unchanged = previous.iter().any(|p| p == def);
            if unchanged && next_run.contains_key(&def.id) {
                continue;
            }
            match compute_next_run(&def.schedule, now) {
                Some(next) => {
                    info!(job_id = %def.id, schedule = %def.schedule, next_run = %next, "Job scheduled");
                    next_run.insert(def.id.clone(), next);
                }
                None => {
                    next_run.remove(&def.id);
                    warn!(job_id = %def.id, schedule = %def.schedule, "Schedule has no future fire time");
                }
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(
            in_flight = tasks.len(),
            grace_secs = self.settings.shutdown_grace.as_secs(),
            "Waiting for in-flight runs"
        );
        let deadline = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => error!("Run task panicked: {e}"),
                    Some(_) => {}
                },
                _ = &mut deadline => {
                    warn!(remaining = tasks.len(), "Grace period elapsed, aborting in-flight runs");
                    tasks.shutdown().await;
                    break;
                }
            }
        }
    }
}

/// Everything a spawned run needs, detached from the engine.
struct Dispatcher {
    locks: LockManager,
    runner: Arc<dyn JobRunner>,
    workers: Arc<Semaphore>,
    report_tx: Option<mpsc::Sender<RunSummary>>,
}

/// Waits for a worker slot, then runs the job under its advisory lock.
///
/// `Ok(None)` means the lock was contended and nothing ran.
async fn execute(d: Dispatcher, def: JobDefinition) -> Result<Option<RunReport>> {
    let Ok(_permit) = d.workers.acquire_owned().await else {
        return Err(SchedulerError::ShutDown);
    };
    let Some(guard) = d.locks.try_acquire(&def.id).await? else {
        info!(job_id = %def.id, "Job locked by another scheduler, skipping this tick");
        return Ok(None);
    };
    let report = d.runner.run(&def).await;
    guard.release().await;

    if let Some(tx) = &d.report_tx {
        // try_send never blocks the run; log a warning if the channel is full.
        if tx.try_send(RunSummary::from_report(&report)).is_err() {
            warn!(job_id = %def.id, "Run report channel full or closed, summary dropped");
        }
    }
    Ok(Some(report))
}

/// Marks a job as running in this process until dropped.
struct Claim {
    running: InFlight,
    job_id: String,
}

impl Claim {
    fn take(running: &InFlight, job_id: &str) -> Option<Self> {
        match running.entry(job_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(Self {
                    running: Arc::clone(running),
                    job_id: job_id.to_string(),
                })
            }
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}
