use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use uuid::Uuid;

use crate::invocation::{InvocationOutcome, JobInvocation};
use crate::job::{Job, JobContext, JobHooks};
use crate::schedule::Schedule;

type Action = Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Build a [`Job`] from closures instead of implementing the trait.
///
/// ```ignore
/// let job = JobBuilder::new("heartbeat")
///     .schedule(Schedule::immediately().then(Schedule::every(Duration::from_secs(30))))
///     .timeout(Duration::from_secs(5))
///     .action(|ctx| async move {
///         tracing::info!(invocation = %ctx.id(), "beat");
///         Ok(())
///     })
///     .build();
/// manager.load_jobs([job])?;
/// ```
#[derive(Default)]
pub struct JobBuilder {
    name: Option<String>,
    schedule: Option<Schedule>,
    timeout: Option<Duration>,
    description: Option<String>,
    disabled: bool,
    labels: BTreeMap<String, String>,
    shutdown_grace_period: Option<Duration>,
    action: Option<Action>,
    hooks: JobHooks,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Defaults to [`Schedule::Never`] (on demand only).
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Register the job disabled; it then only runs via `run_job`.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Overrides the grace period `stop` gives this job.
    pub fn shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = Some(grace);
        self
    }

    /// The job body. Without one the job succeeds immediately.
    pub fn action<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.action = Some(Arc::new(move |ctx| action(ctx).boxed()));
        self
    }

    pub fn on_load<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_load(hook);
        self
    }

    pub fn on_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_unload(hook);
        self
    }

    pub fn on_begin<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInvocation) + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_begin(hook);
        self
    }

    pub fn on_enabled<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_enabled(hook);
        self
    }

    pub fn on_disabled<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_disabled(hook);
        self
    }

    pub fn on_cancellation<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInvocation) + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_cancellation(hook);
        self
    }

    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInvocation, &InvocationOutcome) + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_complete(hook);
        self
    }

    pub fn status<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.hooks = self.hooks.status(hook);
        self
    }

    pub fn build(self) -> Arc<dyn Job> {
        Arc::new(BuiltJob {
            name: self.name.unwrap_or_else(random_name),
            schedule: self.schedule.unwrap_or(Schedule::Never),
            timeout: self.timeout,
            description: self.description,
            enabled: !self.disabled,
            labels: self.labels,
            shutdown_grace_period: self.shutdown_grace_period,
            action: self.action,
            hooks: self.hooks,
        })
    }
}

/// Sixteen lowercase letters.
fn random_name() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .map(|b| char::from(b'a' + b % 26))
        .collect()
}

struct BuiltJob {
    name: String,
    schedule: Schedule,
    timeout: Option<Duration>,
    description: Option<String>,
    enabled: bool,
    labels: BTreeMap<String, String>,
    shutdown_grace_period: Option<Duration>,
    action: Option<Action>,
    hooks: JobHooks,
}

#[async_trait]
impl Job for BuiltJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> Schedule {
        self.schedule.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()> {
        match &self.action {
            Some(action) => action(ctx).await,
            None => Ok(()),
        }
    }

    fn hooks(&self) -> JobHooks {
        self.hooks.clone()
    }

    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    fn enabled_by_default(&self) -> bool {
        self.enabled
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.labels.clone()
    }

    fn shutdown_grace_period(&self) -> Option<Duration> {
        self.shutdown_grace_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_builder_gets_random_lowercase_name() {
        let a = JobBuilder::default().build();
        let b = JobBuilder::default().build();
        assert_eq!(a.name().len(), 16);
        assert!(a.name().chars().all(|c| c.is_ascii_lowercase()));
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn defaults_to_on_demand() {
        let job = JobBuilder::new("adhoc").build();
        assert!(matches!(job.schedule(), Schedule::Never));
        assert_eq!(job.timeout(), None);
        assert!(job.enabled_by_default());
    }

    #[test]
    fn carries_settings() {
        let job = JobBuilder::new("nightly")
            .schedule(Schedule::daily_at(2, 0, 0).unwrap())
            .timeout(Duration::from_secs(60))
            .description("compact the store")
            .label("tier", "storage")
            .shutdown_grace_period(Duration::from_secs(90))
            .disabled()
            .build();
        assert_eq!(job.name(), "nightly");
        assert_eq!(job.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(job.description().as_deref(), Some("compact the store"));
        assert!(!job.enabled_by_default());
        assert_eq!(job.labels().get("tier").map(String::as_str), Some("storage"));
        assert_eq!(job.shutdown_grace_period(), Some(Duration::from_secs(90)));
    }
}
