use thiserror::Error;

use crate::status::ManagerState;

/// Errors surfaced synchronously to callers of the job manager.
///
/// Failures inside a running job never show up here; they are recorded on
/// the job's invocation and reported through the tracer.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with this name is already registered (or appears twice in one batch).
    #[error("Job already loaded: {name}")]
    JobAlreadyLoaded { name: String },

    /// No job with the given name is registered.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// The job has an invocation in flight; jobs never overlap.
    #[error("Job already running: {name}")]
    JobAlreadyRunning { name: String },

    #[error("Cannot start job manager while {state}")]
    CannotStart { state: ManagerState },

    #[error("Cannot stop job manager while {state}")]
    CannotStop { state: ManagerState },

    /// `run_job` was called while the manager was shutting down.
    #[error("Job manager is stopping, not launching {name}")]
    ManagerStopping { name: String },

    /// A job's `on_load` or `on_unload` hook returned an error. The batch it
    /// belonged to was not applied.
    #[error("Job {name}: {hook} failed: {message}")]
    LifecycleHook {
        name: String,
        hook: &'static str,
        message: String,
    },

    /// The schedule string could not be parsed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl SchedulerError {
    /// Short error code string for CLI and health-check renderers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::JobAlreadyLoaded { .. } => "JOB_ALREADY_LOADED",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobAlreadyRunning { .. } => "JOB_ALREADY_RUNNING",
            SchedulerError::CannotStart { .. } => "CANNOT_START",
            SchedulerError::CannotStop { .. } => "CANNOT_STOP",
            SchedulerError::ManagerStopping { .. } => "MANAGER_STOPPING",
            SchedulerError::LifecycleHook { .. } => "LIFECYCLE_HOOK_FAILED",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
