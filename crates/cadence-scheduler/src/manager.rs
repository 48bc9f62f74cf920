use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use cadence_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::invocation::JobInvocation;
use crate::job::{Job, ResolvedJob};
use crate::job_scheduler::JobScheduler;
use crate::status::{JobStatus, ManagerState, ManagerStatus};
use crate::tracer::Tracer;

/// Upper bound on waiting for cancelled invocations to be recorded during `stop`.
const CANCEL_SETTLE: Duration = Duration::from_millis(250);

/// Construction options for [`JobManager`].
#[derive(Clone)]
pub struct ManagerOptions {
    /// How often the loop checks every job for due-ness.
    pub tick_interval: Duration,
    /// Receives job lifecycle events.
    pub tracer: Option<Arc<dyn Tracer>>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(cadence_core::config::DEFAULT_TICK_INTERVAL_MS),
            tracer: None,
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            tracer: None,
        }
    }

    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("tick_interval", &self.tick_interval)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

/// Process-wide owner of a set of named jobs.
///
/// Cheap to clone: every clone is a handle to the same manager. Jobs can be
/// loaded before or after [`start`](Self::start); a job loaded while running
/// becomes eligible on the next tick.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    tick_interval: Duration,
    tracer: Option<Arc<dyn Tracer>>,
    jobs: RwLock<BTreeMap<String, Arc<JobScheduler>>>,
    state: watch::Sender<ManagerState>,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    /// Parent of every invocation token; cancelled on forced shutdown.
    root: CancellationToken,
    /// Stops the tick loop.
    ticker: CancellationToken,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    /// Flips to true when the current tick loop has returned.
    loop_exited: Option<watch::Receiver<bool>>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl JobManager {
    pub fn new(options: ManagerOptions) -> Self {
        let tick_interval = if options.tick_interval.is_zero() {
            warn!("zero tick interval, using default");
            ManagerOptions::default().tick_interval
        } else {
            options.tick_interval
        };
        Self {
            inner: Arc::new(Inner {
                tick_interval,
                tracer: options.tracer,
                jobs: RwLock::new(BTreeMap::new()),
                state: watch::channel(ManagerState::Stopped).0,
                lifecycle: Mutex::new(Lifecycle {
                    root: CancellationToken::new(),
                    ticker: CancellationToken::new(),
                    started_at: None,
                    stopped_at: None,
                    loop_exited: None,
                }),
            }),
        }
    }

    // --- registry ----------------------------------------------------------

    /// Register jobs. All-or-nothing: if any name is already loaded, appears
    /// twice in `jobs`, or has an `on_load` hook that fails, nothing is
    /// registered. Hooks that already succeeded are undone with `on_unload`.
    pub fn load_jobs<I>(&self, jobs: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn Job>>,
    {
        let resolved: Vec<ResolvedJob> = jobs.into_iter().map(ResolvedJob::resolve).collect();
        self.inner.check_new(&resolved)?;

        // User hooks run outside the registry lock.
        for (i, job) in resolved.iter().enumerate() {
            if let Err(err) = job.on_load() {
                warn!(job = %job.name, error = %format!("{err:#}"), "on_load failed, batch rejected");
                undo(resolved[..i].iter(), "on_unload", ResolvedJob::on_unload);
                return Err(hook_error(&job.name, "on_load", &err));
            }
        }

        let mut registry = self.inner.write_jobs();
        // Another load may have raced in while the hooks ran.
        if let Err(err) = check_names(&registry, &resolved) {
            drop(registry);
            undo(resolved.iter(), "on_unload", ResolvedJob::on_unload);
            return Err(err);
        }

        let now = Utc::now();
        for job in resolved {
            info!(
                job = %job.name,
                schedule = %job.schedule,
                timeout_ms = job.timeout.map(|t| t.as_millis() as u64),
                enabled = job.enabled,
                "job loaded"
            );
            let name = job.name.clone();
            let scheduler = JobScheduler::new(job, self.inner.tracer.clone(), now);
            registry.insert(name, Arc::new(scheduler));
        }
        Ok(())
    }

    /// Remove jobs, cancelling any in-flight invocation. All-or-nothing: an
    /// unknown name or a failing `on_unload` hook leaves every job loaded, and
    /// hooks that already succeeded are undone with `on_load`.
    pub fn unload_jobs<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let schedulers = self.inner.lookup(names)?;

        for (i, scheduler) in schedulers.iter().enumerate() {
            let job = scheduler.job();
            if let Err(err) = job.on_unload() {
                warn!(job = %job.name, error = %format!("{err:#}"), "on_unload failed, batch rejected");
                undo(
                    schedulers[..i].iter().map(|s| s.job()),
                    "on_load",
                    ResolvedJob::on_load,
                );
                return Err(hook_error(&job.name, "on_unload", &err));
            }
        }

        let mut registry = self.inner.write_jobs();
        for scheduler in &schedulers {
            let name = scheduler.name();
            // Only remove the exact instance the hooks ran for.
            if registry
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, scheduler))
            {
                registry.remove(name);
                if scheduler.cancel() {
                    debug!(job = %name, "cancelled in-flight invocation on unload");
                }
                info!(job = %name, "job unloaded");
            }
        }
        Ok(())
    }

    pub fn enable_jobs<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.set_enabled(names, true)
    }

    /// Stop scheduling jobs automatically. They can still be run with [`run_job`](Self::run_job).
    pub fn disable_jobs<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.set_enabled(names, false)
    }

    fn set_enabled<I, S>(&self, names: I, enabled: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let schedulers = self.inner.lookup(names)?;
        let now = Utc::now();
        for scheduler in schedulers {
            if scheduler.set_enabled(enabled, now) {
                info!(job = %scheduler.name(), enabled, "job toggled");
            }
        }
        Ok(())
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.inner.read_jobs().contains_key(name)
    }

    pub fn is_job_running(&self, name: &str) -> bool {
        self.inner.get(name).is_some_and(|s| s.is_running())
    }

    /// Registered job names, sorted.
    pub fn job_names(&self) -> Vec<String> {
        self.inner.read_jobs().keys().cloned().collect()
    }

    // --- manual control ----------------------------------------------------

    /// Launch a job now, ignoring its schedule and enabled flag.
    pub fn run_job(&self, name: &str) -> Result<Arc<JobInvocation>> {
        let scheduler = self.inner.get(name).ok_or_else(|| SchedulerError::JobNotFound {
            name: name.to_string(),
        })?;
        // Holding the lifecycle lock orders this against `stop` entering Stopping.
        let invocation = {
            let lifecycle = self.inner.lock_lifecycle();
            if self.state() == ManagerState::Stopping {
                return Err(SchedulerError::ManagerStopping {
                    name: name.to_string(),
                });
            }
            scheduler.run_now(&lifecycle.root)?
        };
        info!(job = %name, invocation = %invocation.id(), "job run manually");
        Ok(invocation)
    }

    /// Cancel the job's in-flight invocation. Returns whether there was one.
    pub fn cancel_job(&self, name: &str) -> Result<bool> {
        let scheduler = self.inner.get(name).ok_or_else(|| SchedulerError::JobNotFound {
            name: name.to_string(),
        })?;
        Ok(scheduler.cancel())
    }

    // --- lifecycle ---------------------------------------------------------

    pub fn state(&self) -> ManagerState {
        *self.inner.state.borrow()
    }

    /// Run the tick loop on the calling task until [`stop`](Self::stop)
    /// completes (from another handle).
    pub async fn start(&self) -> Result<()> {
        let (ticker, root, exited) = self.begin_start()?;
        run_loop(
            Arc::downgrade(&self.inner),
            self.inner.tick_interval,
            ticker,
            root,
            exited,
        )
        .await;
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ManagerState::Stopped).await;
        Ok(())
    }

    /// Spawn the tick loop and return immediately.
    pub fn start_async(&self) -> Result<()> {
        let (ticker, root, exited) = self.begin_start()?;
        tokio::spawn(run_loop(
            Arc::downgrade(&self.inner),
            self.inner.tick_interval,
            ticker,
            root,
            exited,
        ));
        Ok(())
    }

    /// Stopped → Running. Returns the loop's tokens and the sender it uses to
    /// report its exit to `stop`.
    fn begin_start(&self) -> Result<(CancellationToken, CancellationToken, watch::Sender<bool>)> {
        self.inner
            .transition(ManagerState::Stopped, ManagerState::Starting)
            .map_err(|state| SchedulerError::CannotStart { state })?;
        let (exited, loop_exited) = watch::channel(false);
        let tokens = {
            let mut lifecycle = self.inner.lock_lifecycle();
            lifecycle.started_at = Some(Utc::now());
            lifecycle.stopped_at = None;
            lifecycle.loop_exited = Some(loop_exited);
            (lifecycle.ticker.clone(), lifecycle.root.clone(), exited)
        };
        let _ = self
            .inner
            .transition(ManagerState::Starting, ManagerState::Running);
        info!(
            tick_ms = self.inner.tick_interval.as_millis() as u64,
            jobs = self.inner.read_jobs().len(),
            "job manager started"
        );
        Ok(tokens)
    }

    /// Stop ticking, give running jobs up to `grace` to finish, then cancel
    /// whatever is left and return. A job's own
    /// [`shutdown_grace_period`](Job::shutdown_grace_period) replaces `grace`
    /// for that job.
    ///
    /// Cancelled jobs are finalized right away; bodies that ignore
    /// cancellation keep running detached.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let (ticker, root, loop_exited) = {
            let mut lifecycle = self.inner.lock_lifecycle();
            self.inner
                .transition(ManagerState::Running, ManagerState::Stopping)
                .map_err(|state| SchedulerError::CannotStop { state })?;
            (
                lifecycle.ticker.clone(),
                lifecycle.root.clone(),
                lifecycle.loop_exited.take(),
            )
        };
        info!(grace_ms = grace.as_millis() as u64, "job manager stopping");

        ticker.cancel();
        if let Some(mut exited) = loop_exited {
            // Err means the loop's task went away without reporting.
            let _ = exited.wait_for(|done| *done).await;
        }

        let running: Vec<Arc<JobScheduler>> = self
            .inner
            .snapshot()
            .into_iter()
            .filter(|s| s.is_running())
            .collect();
        if !running.is_empty() {
            debug!(count = running.len(), "waiting for running jobs");
            join_all(running.iter().map(|s| drain(s, grace))).await;
        }
        root.cancel();

        {
            let mut lifecycle = self.inner.lock_lifecycle();
            lifecycle.root = CancellationToken::new();
            lifecycle.ticker = CancellationToken::new();
            lifecycle.stopped_at = Some(Utc::now());
        }
        let _ = self
            .inner
            .transition(ManagerState::Stopping, ManagerState::Stopped);
        info!("job manager stopped");
        Ok(())
    }

    // --- observation -------------------------------------------------------

    pub fn status(&self) -> ManagerStatus {
        let jobs = self
            .inner
            .snapshot()
            .iter()
            .map(|s| s.status())
            .collect();
        let (started_at, stopped_at) = {
            let lifecycle = self.inner.lock_lifecycle();
            (lifecycle.started_at, lifecycle.stopped_at)
        };
        ManagerStatus {
            state: self.state(),
            started_at,
            stopped_at,
            jobs,
        }
    }

    pub fn job_status(&self, name: &str) -> Option<JobStatus> {
        self.inner.get(name).map(|s| s.status())
    }
}

impl Inner {
    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<JobScheduler>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<JobScheduler>>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, name: &str) -> Option<Arc<JobScheduler>> {
        self.read_jobs().get(name).cloned()
    }

    /// Resolve every name or fail on the first unknown one.
    fn lookup<I, S>(&self, names: I) -> Result<Vec<Arc<JobScheduler>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = self.read_jobs();
        names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                registry
                    .get(name)
                    .cloned()
                    .ok_or_else(|| SchedulerError::JobNotFound {
                        name: name.to_string(),
                    })
            })
            .collect()
    }

    fn check_new(&self, jobs: &[ResolvedJob]) -> Result<()> {
        check_names(&self.read_jobs(), jobs)
    }

    /// Name-ordered copy of the registry, so no lock is held while iterating.
    fn snapshot(&self) -> Vec<Arc<JobScheduler>> {
        self.read_jobs().values().cloned().collect()
    }

    /// Compare-and-set on the manager state. Returns the observed state on mismatch.
    fn transition(
        &self,
        from: ManagerState,
        to: ManagerState,
    ) -> std::result::Result<(), ManagerState> {
        let mut observed = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                observed = *state;
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(observed)
        }
    }

    fn tick(&self, root: &CancellationToken) {
        let now = Utc::now();
        for scheduler in self.snapshot() {
            if let Some(invocation) = scheduler.tick(now, root) {
                debug!(job = %scheduler.name(), invocation = %invocation.id(), "job due, launched");
            }
        }
    }
}

fn check_names(registry: &BTreeMap<String, Arc<JobScheduler>>, jobs: &[ResolvedJob]) -> Result<()> {
    let mut batch = HashSet::new();
    for job in jobs {
        if registry.contains_key(&job.name) || !batch.insert(job.name.as_str()) {
            return Err(SchedulerError::JobAlreadyLoaded {
                name: job.name.clone(),
            });
        }
    }
    Ok(())
}

fn hook_error(name: &str, hook: &'static str, err: &anyhow::Error) -> SchedulerError {
    SchedulerError::LifecycleHook {
        name: name.to_string(),
        hook,
        message: format!("{err:#}"),
    }
}

/// Roll back lifecycle hooks of a rejected batch. Failures are only logged.
fn undo<'a>(
    jobs: impl Iterator<Item = &'a ResolvedJob>,
    hook: &str,
    run: fn(&ResolvedJob) -> anyhow::Result<()>,
) {
    for job in jobs {
        if let Err(err) = run(job) {
            warn!(job = %job.name, hook, error = %format!("{err:#}"), "rollback hook failed");
        }
    }
}

/// Wait out one job's grace period during `stop`, then cancel it.
async fn drain(scheduler: &JobScheduler, default_grace: Duration) {
    let grace = scheduler
        .job()
        .shutdown_grace_period
        .unwrap_or(default_grace);
    if tokio::time::timeout(grace, scheduler.wait_idle()).await.is_ok() {
        return;
    }
    warn!(
        job = %scheduler.name(),
        grace_ms = grace.as_millis() as u64,
        "grace period elapsed, cancelling job"
    );
    scheduler.cancel();
    // Cancelled invocations finalize without waiting for their bodies.
    let _ = tokio::time::timeout(CANCEL_SETTLE, scheduler.wait_idle()).await;
}

/// The tick loop. Holds only a weak reference so dropping every handle ends it.
async fn run_loop(
    inner: Weak<Inner>,
    tick_interval: Duration,
    ticker: CancellationToken,
    root: CancellationToken,
    exited: watch::Sender<bool>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = ticker.cancelled() => {
                debug!("tick loop stopping");
                break;
            }
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    debug!("job manager dropped, tick loop exiting");
                    break;
                };
                inner.tick(&root);
            }
        }
    }
    exited.send_replace(true);
}
