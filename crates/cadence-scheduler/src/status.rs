use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::invocation::{InvocationStatus, Trigger};

/// Lifecycle of the job manager itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerState::Stopped => "stopped",
            ManagerState::Starting => "starting",
            ManagerState::Running => "running",
            ManagerState::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Running => write!(f, "running"),
        }
    }
}

/// The in-flight invocation of a running job.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentInvocation {
    pub id: String,
    pub started: DateTime<Utc>,
    pub trigger: Trigger,
}

/// Point-in-time copy of one job's state. Never changes after it is taken.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub enabled: bool,
    pub schedule: String,
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub current: Option<CurrentInvocation>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_outcome: Option<InvocationStatus>,
    pub last_err: Option<String>,
    pub next_due: Option<DateTime<Utc>>,
    /// Invocations launched, scheduled and manual.
    pub run_count: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    /// Output of the job's status hook, if it has one.
    pub detail: Option<String>,
}

impl JobStatus {
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    /// How long the current invocation has been running as of `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let current = self.current.as_ref()?;
        (now - current.started).to_std().ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub state: ManagerState,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Sorted by name.
    pub jobs: Vec<JobStatus>,
}

impl ManagerStatus {
    pub fn job(&self, name: &str) -> Option<&JobStatus> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn running(&self) -> impl Iterator<Item = &JobStatus> {
        self.jobs.iter().filter(|j| j.is_running())
    }
}
