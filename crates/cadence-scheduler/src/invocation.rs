use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What caused an invocation to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The tick loop found the job due.
    Scheduled,
    /// `JobManager::run_job`.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum InvocationStatus {
    Succeeded,
    /// The job returned an error or panicked. Holds the rendered error chain.
    Errored(String),
    /// The deadline fired before the job returned.
    TimedOut,
    /// Cancelled from outside (cancel, unload or manager shutdown).
    Cancelled,
}

impl InvocationStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, InvocationStatus::Errored(_))
    }

    /// Short lowercase label, e.g. for table rendering.
    pub fn label(&self) -> &'static str {
        match self {
            InvocationStatus::Succeeded => "succeeded",
            InvocationStatus::Errored(_) => "errored",
            InvocationStatus::TimedOut => "timed_out",
            InvocationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationStatus::Errored(err) => write!(f, "errored: {err}"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Final, immutable record of an invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationOutcome {
    pub status: InvocationStatus,
    pub finished: DateTime<Utc>,
    pub elapsed: Duration,
}

impl InvocationOutcome {
    /// True when the invocation was ended by its deadline.
    pub fn timed_out(&self) -> bool {
        self.status == InvocationStatus::TimedOut
    }

    /// The error message, if the job failed.
    pub fn err(&self) -> Option<&str> {
        match &self.status {
            InvocationStatus::Errored(err) => Some(err),
            _ => None,
        }
    }
}

/// One execution attempt of a job.
///
/// Created when the job launches and finalized exactly once. After that the
/// outcome never changes, even if a timed-out body is still running.
#[derive(Debug)]
pub struct JobInvocation {
    id: String,
    job_name: String,
    started: DateTime<Utc>,
    started_at: Instant,
    trigger: Trigger,
    token: CancellationToken,
    done: CancellationToken,
    outcome: OnceLock<InvocationOutcome>,
}

impl JobInvocation {
    pub(crate) fn new(
        job_name: &str,
        trigger: Trigger,
        started: DateTime<Utc>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            started,
            started_at: Instant::now(),
            trigger,
            token,
            done: CancellationToken::new(),
            outcome: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Signal the job body to stop. Cooperative: the body must observe its context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn outcome(&self) -> Option<&InvocationOutcome> {
        self.outcome.get()
    }

    /// Wait until the invocation is finalized and return its outcome.
    pub async fn wait(&self) -> InvocationOutcome {
        loop {
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            self.done.cancelled().await;
        }
    }

    /// Time spent so far, or the total once finished.
    pub fn elapsed(&self) -> Duration {
        match self.outcome.get() {
            Some(outcome) => outcome.elapsed,
            None => self.started_at.elapsed(),
        }
    }

    /// Record the outcome and wake waiters. Returns false if already recorded.
    pub(crate) fn finish(&self, outcome: InvocationOutcome) -> bool {
        if self.outcome.set(outcome).is_err() {
            return false;
        }
        self.done.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> JobInvocation {
        JobInvocation::new("report", Trigger::Manual, Utc::now(), CancellationToken::new())
    }

    fn outcome(status: InvocationStatus) -> InvocationOutcome {
        InvocationOutcome {
            status,
            finished: Utc::now(),
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn outcome_is_write_once() {
        let inv = invocation();
        assert!(!inv.is_finished());
        assert!(inv.finish(outcome(InvocationStatus::TimedOut)));
        assert!(!inv.finish(outcome(InvocationStatus::Errored("late".into()))));
        assert_eq!(inv.elapsed(), Duration::from_millis(5));
        let outcome = inv.outcome().unwrap();
        assert!(outcome.timed_out());
        assert_eq!(outcome.err(), None);
    }

    #[test]
    fn cancel_trips_token() {
        let inv = invocation();
        let token = inv.token().clone();
        inv.cancel();
        assert!(token.is_cancelled());
        assert!(inv.is_cancelled());
    }

    #[tokio::test]
    async fn wait_returns_after_finish() {
        let inv = std::sync::Arc::new(invocation());
        let waiter = {
            let inv = inv.clone();
            tokio::spawn(async move { inv.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inv.finish(outcome(InvocationStatus::Errored("boom".into())));
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.err(), Some("boom"));
    }

    #[test]
    fn status_display() {
        assert_eq!(InvocationStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(
            InvocationStatus::Errored("exit 1".into()).to_string(),
            "errored: exit 1"
        );
        assert_eq!(InvocationStatus::TimedOut.label(), "timed_out");
    }
}
