use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, SchedulerError};
use crate::invocation::{InvocationOutcome, InvocationStatus, JobInvocation, Trigger};
use crate::job::{guarded, panic_message, JobContext, ResolvedJob};
use crate::status::{CurrentInvocation, JobState, JobStatus};
use crate::tracer::{JobEvent, JobEventKind, Tracer};

/// Runtime wrapper around one registered job.
///
/// All mutable state sits behind a single per-job mutex. The tick loop takes
/// it to launch, the invocation's supervisor takes it to finish, and status
/// readers take it to copy fields out. Nobody holds it across an await.
pub(crate) struct JobScheduler {
    job: ResolvedJob,
    tracer: Option<Arc<dyn Tracer>>,
    state: Mutex<State>,
    running: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    enabled: bool,
    current: Option<Arc<JobInvocation>>,
    last_started: Option<DateTime<Utc>>,
    last_finished: Option<DateTime<Utc>>,
    last_outcome: Option<InvocationStatus>,
    next_due: Option<DateTime<Utc>>,
    run_count: u64,
    error_count: u64,
    timeout_count: u64,
}

/// How the race between the body, the deadline and cancellation settled.
enum Settled {
    Finished(InvocationStatus),
    TimedOut,
    Cancelled,
}

impl JobScheduler {
    pub fn new(job: ResolvedJob, tracer: Option<Arc<dyn Tracer>>, now: DateTime<Utc>) -> Self {
        let state = State {
            enabled: job.enabled,
            next_due: if job.enabled {
                job.schedule.next(None, now)
            } else {
                None
            },
            ..State::default()
        };
        Self {
            job,
            tracer,
            state: Mutex::new(state),
            running: watch::channel(false).0,
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn job(&self) -> &ResolvedJob {
        &self.job
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Launch the job if it is enabled, idle and due at `now`.
    pub fn tick(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        parent: &CancellationToken,
    ) -> Option<Arc<JobInvocation>> {
        let invocation = {
            let mut state = self.lock();
            if !state.enabled || state.current.is_some() {
                return None;
            }
            match state.next_due {
                Some(due) if due <= now => {}
                _ => return None,
            }
            self.launch(&mut state, Trigger::Scheduled, now, parent)
        };
        self.spawn_supervisor(Arc::clone(&invocation));
        Some(invocation)
    }

    /// Launch right away, regardless of schedule and enabled flag.
    pub fn run_now(self: &Arc<Self>, parent: &CancellationToken) -> Result<Arc<JobInvocation>> {
        let invocation = {
            let mut state = self.lock();
            if state.current.is_some() {
                return Err(SchedulerError::JobAlreadyRunning {
                    name: self.job.name.clone(),
                });
            }
            self.launch(&mut state, Trigger::Manual, Utc::now(), parent)
        };
        self.spawn_supervisor(Arc::clone(&invocation));
        Ok(invocation)
    }

    /// Idle → Running. Caller holds the lock.
    fn launch(
        &self,
        state: &mut State,
        trigger: Trigger,
        now: DateTime<Utc>,
        parent: &CancellationToken,
    ) -> Arc<JobInvocation> {
        let invocation = Arc::new(JobInvocation::new(
            &self.job.name,
            trigger,
            now,
            parent.child_token(),
        ));
        state.current = Some(Arc::clone(&invocation));
        state.last_started = Some(now);
        state.run_count += 1;
        state.next_due = if state.enabled {
            self.job.schedule.next(Some(now), now)
        } else {
            None
        };
        self.running.send_replace(true);
        invocation
    }

    fn spawn_supervisor(self: &Arc<Self>, invocation: Arc<JobInvocation>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervise(invocation).await });
    }

    /// Runs the body on its own task and races it against the deadline and
    /// the invocation's token.
    async fn supervise(self: Arc<Self>, invocation: Arc<JobInvocation>) {
        debug!(
            job = %self.job.name,
            invocation = %invocation.id(),
            trigger = %invocation.trigger(),
            "job started"
        );
        self.emit(JobEventKind::Started, &invocation, Duration::ZERO, None);
        self.job.on_begin(&invocation);

        let ctx = JobContext::new(&invocation);
        let job = Arc::clone(&self.job.job);
        let mut work: JoinHandle<anyhow::Result<()>> =
            tokio::spawn(async move { job.execute(ctx).await });

        let timeout = self.job.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let settled = tokio::select! {
            biased;
            // A body that returns after being cancelled counts as cancelled.
            joined = &mut work => {
                if invocation.is_cancelled() {
                    Settled::Cancelled
                } else {
                    Settled::Finished(status_from_join(joined))
                }
            }
            _ = deadline => Settled::TimedOut,
            _ = invocation.token().cancelled() => Settled::Cancelled,
        };

        let status = match settled {
            Settled::Finished(status) => status,
            Settled::TimedOut => {
                invocation.cancel();
                warn!(
                    job = %self.job.name,
                    invocation = %invocation.id(),
                    timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                    "job timed out"
                );
                InvocationStatus::TimedOut
            }
            Settled::Cancelled => {
                warn!(job = %self.job.name, invocation = %invocation.id(), "job cancelled");
                InvocationStatus::Cancelled
            }
        };

        if matches!(status, InvocationStatus::TimedOut | InvocationStatus::Cancelled) {
            self.job.on_cancellation(&invocation);
            drain_straggler(self.job.name.clone(), invocation.id().to_string(), work);
        }

        self.complete(&invocation, status);
    }

    /// Running → Idle: record the outcome, notify, then finalize the invocation.
    fn complete(&self, invocation: &JobInvocation, status: InvocationStatus) {
        let outcome = InvocationOutcome {
            status,
            finished: Utc::now(),
            elapsed: invocation.elapsed(),
        };
        let transition = {
            let mut state = self.lock();
            if state
                .current
                .as_ref()
                .is_some_and(|current| current.id() == invocation.id())
            {
                state.current = None;
            }
            state.last_finished = Some(outcome.finished);
            match &outcome.status {
                InvocationStatus::Errored(_) => state.error_count += 1,
                InvocationStatus::TimedOut => state.timeout_count += 1,
                _ => {}
            }
            let previous = state.last_outcome.replace(outcome.status.clone());
            self.running.send_replace(state.current.is_some());
            match (&previous, &outcome.status) {
                (Some(InvocationStatus::Errored(_)), InvocationStatus::Succeeded) => {
                    Some(JobEventKind::Fixed)
                }
                (prev, InvocationStatus::Errored(_))
                    if !prev.as_ref().is_some_and(InvocationStatus::is_error) =>
                {
                    Some(JobEventKind::Broken)
                }
                _ => None,
            }
        };

        let elapsed_ms = outcome.elapsed.as_millis() as u64;
        let kind = match &outcome.status {
            InvocationStatus::Succeeded => {
                debug!(job = %self.job.name, invocation = %invocation.id(), elapsed_ms, "job succeeded");
                JobEventKind::Succeeded
            }
            InvocationStatus::Errored(err) => {
                error!(job = %self.job.name, invocation = %invocation.id(), elapsed_ms, error = %err, "job failed");
                JobEventKind::Errored
            }
            InvocationStatus::TimedOut => JobEventKind::TimedOut,
            InvocationStatus::Cancelled => JobEventKind::Cancelled,
        };
        let error = outcome.err().map(str::to_string);
        self.emit(kind, invocation, outcome.elapsed, error.clone());
        if let Some(transition) = transition {
            self.emit(transition, invocation, outcome.elapsed, error);
        }

        self.job.on_complete(invocation, &outcome);
        // Waiters wake only after events and hooks have run.
        invocation.finish(outcome);
    }

    fn emit(
        &self,
        kind: JobEventKind,
        invocation: &JobInvocation,
        elapsed: Duration,
        error: Option<String>,
    ) {
        let Some(tracer) = &self.tracer else {
            return;
        };
        let event = JobEvent {
            kind,
            job_name: self.job.name.clone(),
            invocation_id: invocation.id().to_string(),
            elapsed,
            error,
            at: Utc::now(),
        };
        // A tracer panic must not take the supervisor down with it.
        guarded(&self.job.name, "tracer", || tracer.emit(&event));
    }

    /// Cancel the in-flight invocation. Returns false when idle.
    pub fn cancel(&self) -> bool {
        match &self.lock().current {
            Some(current) => {
                current.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns whether the flag changed. The job's toggle hook runs only then.
    pub fn set_enabled(&self, enabled: bool, now: DateTime<Utc>) -> bool {
        {
            let mut state = self.lock();
            if state.enabled == enabled {
                return false;
            }
            state.enabled = enabled;
            state.next_due = if enabled {
                self.job.schedule.next(state.last_started, now)
            } else {
                None
            };
        }
        self.job.on_toggled(enabled);
        true
    }

    /// Resolves once no invocation is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|running| !*running).await;
    }

    pub fn status(&self) -> JobStatus {
        let mut status = {
            let state = self.lock();
            JobStatus {
                name: self.job.name.clone(),
                state: if state.current.is_some() {
                    JobState::Running
                } else {
                    JobState::Idle
                },
                enabled: state.enabled,
                schedule: self.job.schedule.to_string(),
                description: self.job.description.clone(),
                labels: self.job.labels.clone(),
                current: state.current.as_ref().map(|c| CurrentInvocation {
                    id: c.id().to_string(),
                    started: c.started(),
                    trigger: c.trigger(),
                }),
                last_started: state.last_started,
                last_finished: state.last_finished,
                last_outcome: state.last_outcome.clone(),
                last_err: state
                    .last_outcome
                    .as_ref()
                    .and_then(|o| match o {
                        InvocationStatus::Errored(err) => Some(err.clone()),
                        _ => None,
                    }),
                next_due: state.next_due,
                run_count: state.run_count,
                error_count: state.error_count,
                timeout_count: state.timeout_count,
                detail: None,
            }
        };
        // User code runs outside the lock.
        status.detail = self.job.status_detail();
        status
    }
}

fn status_from_join(joined: std::result::Result<anyhow::Result<()>, JoinError>) -> InvocationStatus {
    match joined {
        Ok(Ok(())) => InvocationStatus::Succeeded,
        Ok(Err(err)) => InvocationStatus::Errored(format!("{err:#}")),
        Err(join) if join.is_panic() => InvocationStatus::Errored(format!(
            "job panicked: {}",
            panic_message(join.into_panic().as_ref())
        )),
        Err(join) => InvocationStatus::Errored(format!("job task failed: {join}")),
    }
}

/// Keep watching a body the scheduler has already given up on.
fn drain_straggler(job: String, invocation: String, work: JoinHandle<anyhow::Result<()>>) {
    if work.is_finished() {
        return;
    }
    tokio::spawn(async move {
        match work.await {
            Ok(Ok(())) => debug!(job = %job, invocation = %invocation, "straggler finished"),
            Ok(Err(err)) => {
                debug!(job = %job, invocation = %invocation, error = %format!("{err:#}"), "straggler returned an error")
            }
            Err(join) if join.is_panic() => error!(
                job = %job,
                invocation = %invocation,
                panic = %panic_message(join.into_panic().as_ref()),
                "straggler panicked"
            ),
            Err(_) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::builder::JobBuilder;
    use crate::schedule::Schedule;

    fn scheduler(job: Arc<dyn crate::job::Job>) -> Arc<JobScheduler> {
        Arc::new(JobScheduler::new(ResolvedJob::resolve(job), None, Utc::now()))
    }

    #[tokio::test]
    async fn tick_skips_while_running() {
        let job = JobBuilder::new("slow")
            .schedule(Schedule::every(Duration::ZERO))
            .action(|_| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .build();
        let sched = scheduler(job);
        let root = CancellationToken::new();

        let first = sched.tick(Utc::now(), &root).expect("due on first tick");
        assert!(sched.tick(Utc::now(), &root).is_none());
        assert!(sched.is_running());

        let outcome = first.wait().await;
        assert_eq!(outcome.status, InvocationStatus::Succeeded);
        assert!(!sched.is_running());
        assert!(sched.tick(Utc::now(), &root).is_some());
    }

    #[tokio::test]
    async fn disabled_job_not_ticked_but_runs_manually() {
        let job = JobBuilder::new("manual")
            .schedule(Schedule::every(Duration::from_millis(10)))
            .disabled()
            .build();
        let sched = scheduler(job);
        let root = CancellationToken::new();

        assert!(sched.tick(Utc::now(), &root).is_none());
        let inv = sched.run_now(&root).unwrap();
        assert_eq!(inv.trigger(), Trigger::Manual);
        inv.wait().await;
        assert_eq!(sched.status().run_count, 1);
        assert!(sched.status().next_due.is_none());
    }

    #[tokio::test]
    async fn run_now_rejects_overlap() {
        let job = JobBuilder::new("busy")
            .action(|ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .build();
        let sched = scheduler(job);
        let root = CancellationToken::new();

        let inv = sched.run_now(&root).unwrap();
        let err = sched.run_now(&root).unwrap_err();
        assert_eq!(err.code(), "JOB_ALREADY_RUNNING");
        assert!(sched.cancel());
        assert_eq!(inv.wait().await.status, InvocationStatus::Cancelled);
        assert!(!sched.cancel());
    }

    #[tokio::test]
    async fn broken_then_fixed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let job = JobBuilder::new("flaky")
            .action(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("attempt {n} failed")
                    }
                    Ok(())
                }
            })
            .build();
        let tracer: Arc<dyn Tracer> = Arc::new(move |e: &JobEvent| {
            sink.lock().unwrap().push(e.kind);
        });
        let sched = Arc::new(JobScheduler::new(
            ResolvedJob::resolve(job),
            Some(tracer),
            Utc::now(),
        ));
        let root = CancellationToken::new();
        for _ in 0..3 {
            sched.run_now(&root).unwrap().wait().await;
        }

        let kinds = events.lock().unwrap().clone();
        assert_eq!(
            kinds.iter().filter(|k| **k == JobEventKind::Broken).count(),
            1
        );
        assert_eq!(
            kinds.iter().filter(|k| **k == JobEventKind::Fixed).count(),
            1
        );
        let status = sched.status();
        assert_eq!(status.error_count, 2);
        assert_eq!(status.last_outcome, Some(InvocationStatus::Succeeded));
        assert!(status.last_err.is_none());
    }

    #[tokio::test]
    async fn status_hook_feeds_detail() {
        let job = JobBuilder::new("detail")
            .status(|| "42 rows pending".to_string())
            .build();
        let sched = scheduler(job);
        assert_eq!(sched.status().detail.as_deref(), Some("42 rows pending"));
        assert_eq!(sched.status().schedule, "@never");
    }

    #[tokio::test]
    async fn panicking_tracer_does_not_wedge_the_job() {
        let tracer: Arc<dyn Tracer> = Arc::new(|e: &JobEvent| {
            if matches!(e.kind, JobEventKind::Started | JobEventKind::Succeeded) {
                panic!("tracer exploded on {}", e.kind);
            }
        });
        let job = JobBuilder::new("traced").build();
        let sched = Arc::new(JobScheduler::new(
            ResolvedJob::resolve(job),
            Some(tracer),
            Utc::now(),
        ));
        let root = CancellationToken::new();

        for _ in 0..2 {
            let outcome = tokio::time::timeout(
                Duration::from_secs(2),
                sched.run_now(&root).unwrap().wait(),
            )
            .await
            .expect("invocation finalized despite tracer panic");
            assert_eq!(outcome.status, InvocationStatus::Succeeded);
        }
        let status = sched.status();
        assert_eq!(status.state, JobState::Idle);
        assert_eq!(status.run_count, 2);
        assert!(status.last_finished.is_some());
    }

    #[tokio::test]
    async fn on_begin_sees_each_invocation_before_the_body() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (begin_log, body_log) = (seen.clone(), seen.clone());
        let job = JobBuilder::new("ordered")
            .on_begin(move |inv| begin_log.lock().unwrap().push(format!("begin {}", inv.trigger())))
            .action(move |_| {
                let body_log = body_log.clone();
                async move {
                    body_log.lock().unwrap().push("body".to_string());
                    Ok(())
                }
            })
            .build();
        let sched = scheduler(job);
        sched
            .run_now(&CancellationToken::new())
            .unwrap()
            .wait()
            .await;
        assert_eq!(*seen.lock().unwrap(), vec!["begin manual", "body"]);
    }

    #[test]
    fn set_enabled_reports_changes_and_fires_hooks_once() {
        let toggles = Arc::new(Mutex::new(Vec::new()));
        let (on, off) = (toggles.clone(), toggles.clone());
        let job = JobBuilder::new("toggle")
            .schedule(Schedule::every(Duration::from_secs(60)))
            .label("team", "ops")
            .on_enabled(move || on.lock().unwrap().push("enabled"))
            .on_disabled(move || off.lock().unwrap().push("disabled"))
            .build();
        let sched = scheduler(job);
        let now = Utc::now();

        assert!(!sched.set_enabled(true, now), "already enabled");
        assert!(sched.set_enabled(false, now));
        assert!(!sched.set_enabled(false, now));
        assert!(sched.set_enabled(true, now));
        assert_eq!(*toggles.lock().unwrap(), vec!["disabled", "enabled"]);
        assert_eq!(sched.status().labels["team"], "ops");
    }

    #[test]
    fn join_errors_become_errored() {
        let status = status_from_join(Ok(Err(anyhow::anyhow!("inner").context("outer"))));
        assert_eq!(status, InvocationStatus::Errored("outer: inner".to_string()));
    }
}
