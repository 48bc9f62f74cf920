use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::invocation::{InvocationOutcome, JobInvocation};
use crate::schedule::Schedule;

/// A named unit of recurring work supplied by the embedding application.
///
/// Only `name`, `schedule` and `execute` are required. Everything else has a
/// default. The manager reads each method once, when the job is loaded.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Unique key within one manager.
    fn name(&self) -> &str;

    fn schedule(&self) -> Schedule;

    /// Per-invocation deadline. `None` or zero disables it.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// The work itself. Must return promptly once `ctx` is cancelled.
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()>;

    fn hooks(&self) -> JobHooks {
        JobHooks::default()
    }

    fn description(&self) -> Option<String> {
        None
    }

    /// Disabled jobs are registered but only run via `run_job`.
    fn enabled_by_default(&self) -> bool {
        true
    }

    /// Free-form key/value tags copied into every status snapshot.
    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// How long `stop` waits for this job before cancelling it. `None` uses
    /// the grace period passed to `stop`.
    fn shutdown_grace_period(&self) -> Option<Duration> {
        None
    }
}

/// Handed to [`Job::execute`] for every invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: String,
    name: String,
    started: DateTime<Utc>,
    token: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(invocation: &JobInvocation) -> Self {
        Self {
            id: invocation.id().to_string(),
            name: invocation.job_name().to_string(),
            started: invocation.started(),
            token: invocation.token().clone(),
        }
    }

    /// Invocation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the invocation is cancelled (timeout, cancel or shutdown).
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Token for handing cancellation down to sub-tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

pub type LifecycleHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
pub type InvocationHook = Arc<dyn Fn(&JobInvocation) + Send + Sync>;
pub type ToggleHook = Arc<dyn Fn() + Send + Sync>;
pub type CompleteHook = Arc<dyn Fn(&JobInvocation, &InvocationOutcome) + Send + Sync>;
pub type StatusHook = Arc<dyn Fn() -> String + Send + Sync>;

/// Optional callbacks a job can provide.
#[derive(Clone, Default)]
pub struct JobHooks {
    pub(crate) on_load: Option<LifecycleHook>,
    pub(crate) on_unload: Option<LifecycleHook>,
    pub(crate) on_begin: Option<InvocationHook>,
    pub(crate) on_enabled: Option<ToggleHook>,
    pub(crate) on_disabled: Option<ToggleHook>,
    pub(crate) on_cancellation: Option<InvocationHook>,
    pub(crate) on_complete: Option<CompleteHook>,
    pub(crate) status: Option<StatusHook>,
}

impl JobHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before the job is registered. An error rejects the whole
    /// `load_jobs` batch.
    pub fn on_load<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_load = Some(Arc::new(hook));
        self
    }

    /// Called before the job is removed. An error rejects the whole
    /// `unload_jobs` batch.
    pub fn on_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_unload = Some(Arc::new(hook));
        self
    }

    /// Called as each invocation starts, before the body runs.
    pub fn on_begin<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInvocation) + Send + Sync + 'static,
    {
        self.on_begin = Some(Arc::new(hook));
        self
    }

    /// Called when a disabled job is enabled.
    pub fn on_enabled<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_enabled = Some(Arc::new(hook));
        self
    }

    /// Called when an enabled job is disabled.
    pub fn on_disabled<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disabled = Some(Arc::new(hook));
        self
    }

    /// Called once when an invocation times out or is cancelled.
    pub fn on_cancellation<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInvocation) + Send + Sync + 'static,
    {
        self.on_cancellation = Some(Arc::new(hook));
        self
    }

    /// Called after every invocation is finalized, whatever the outcome.
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInvocation, &InvocationOutcome) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Free-form detail line shown in status snapshots.
    pub fn status<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.status = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for JobHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHooks")
            .field("on_load", &self.on_load.is_some())
            .field("on_unload", &self.on_unload.is_some())
            .field("on_begin", &self.on_begin.is_some())
            .field("on_enabled", &self.on_enabled.is_some())
            .field("on_disabled", &self.on_disabled.is_some())
            .field("on_cancellation", &self.on_cancellation.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("status", &self.status.is_some())
            .finish()
    }
}

/// A job with its trait methods read once at load time.
pub(crate) struct ResolvedJob {
    pub name: String,
    pub job: Arc<dyn Job>,
    pub schedule: Schedule,
    pub timeout: Option<Duration>,
    pub description: Option<String>,
    pub enabled: bool,
    pub labels: BTreeMap<String, String>,
    pub shutdown_grace_period: Option<Duration>,
    hooks: JobHooks,
}

impl ResolvedJob {
    pub fn resolve(job: Arc<dyn Job>) -> Self {
        Self {
            name: job.name().to_string(),
            schedule: job.schedule(),
            timeout: job.timeout().filter(|t| !t.is_zero()),
            description: job.description(),
            enabled: job.enabled_by_default(),
            labels: job.labels(),
            shutdown_grace_period: job.shutdown_grace_period(),
            hooks: job.hooks(),
            job,
        }
    }

    pub fn on_load(&self) -> anyhow::Result<()> {
        self.lifecycle("on_load", self.hooks.on_load.as_ref())
    }

    pub fn on_unload(&self) -> anyhow::Result<()> {
        self.lifecycle("on_unload", self.hooks.on_unload.as_ref())
    }

    /// A panicking lifecycle hook counts as a failed one.
    fn lifecycle(&self, name: &str, hook: Option<&LifecycleHook>) -> anyhow::Result<()> {
        let Some(hook) = hook else {
            return Ok(());
        };
        guarded(&self.name, name, || hook())
            .unwrap_or_else(|| Err(anyhow::anyhow!("{name} hook panicked")))
    }

    pub fn on_begin(&self, invocation: &JobInvocation) {
        if let Some(hook) = &self.hooks.on_begin {
            guarded(&self.name, "on_begin", || hook(invocation));
        }
    }

    pub fn on_toggled(&self, enabled: bool) {
        let (name, hook) = if enabled {
            ("on_enabled", &self.hooks.on_enabled)
        } else {
            ("on_disabled", &self.hooks.on_disabled)
        };
        if let Some(hook) = hook {
            guarded(&self.name, name, || hook());
        }
    }

    pub fn on_cancellation(&self, invocation: &JobInvocation) {
        if let Some(hook) = &self.hooks.on_cancellation {
            guarded(&self.name, "on_cancellation", || hook(invocation));
        }
    }

    pub fn on_complete(&self, invocation: &JobInvocation, outcome: &InvocationOutcome) {
        if let Some(hook) = &self.hooks.on_complete {
            guarded(&self.name, "on_complete", || hook(invocation, outcome));
        }
    }

    pub fn status_detail(&self) -> Option<String> {
        let hook = self.hooks.status.as_ref()?;
        guarded(&self.name, "status", || hook())
    }
}

/// Run user code (a hook or the tracer), logging instead of unwinding into
/// the engine.
pub(crate) fn guarded<T>(job: &str, hook: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(job = %job, hook = %hook, panic = %panic_message(payload.as_ref()), "job callback panicked");
            None
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
