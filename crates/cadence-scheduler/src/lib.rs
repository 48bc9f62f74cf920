//! `cadence-scheduler`: in-process recurring job scheduler on Tokio.
//!
//! # Overview
//!
//! A [`JobManager`] owns a registry of named [`Job`]s. Its tick loop wakes on
//! a fixed interval (`tokio::time::interval`), asks each job whether it is
//! due, and launches due jobs on their own task. Each launch creates a
//! [`JobInvocation`] that races the job body against its timeout and
//! cancellation token. A job never overlaps itself: while an invocation is in
//! flight, further due ticks for that job are skipped.
//!
//! # Schedule variants
//!
//! | Variant       | Behaviour                                              |
//! |---------------|--------------------------------------------------------|
//! | `Never`       | Only runs on demand (`run_job`)                        |
//! | `Immediately` | Once, on the first tick                                |
//! | `Every`       | Fixed interval measured from the previous start        |
//! | `OnceAt`      | Single fire at an absolute UTC instant                 |
//! | `Daily`       | HH:MM:SS UTC on a set of weekdays                      |
//! | `Cron`        | 5/6/7 field cron expression (UTC)                      |
//! | `Then`        | First schedule for the first run, second afterwards    |
//!
//! # Outcomes
//!
//! Job failures, panics and timeouts never reach the caller. They are
//! recorded on the invocation, exposed through [`JobManager::status`] and
//! reported to the optional [`Tracer`].

pub mod builder;
pub mod error;
pub mod invocation;
pub mod job;
mod job_scheduler;
pub mod manager;
mod parse;
pub mod schedule;
pub mod status;
pub mod tracer;

pub use builder::JobBuilder;
pub use error::{Result, SchedulerError};
pub use invocation::{InvocationOutcome, InvocationStatus, JobInvocation, Trigger};
pub use job::{Job, JobContext, JobHooks};
pub use manager::{JobManager, ManagerOptions};
pub use schedule::{CronExpr, Schedule, Weekdays};
pub use status::{CurrentInvocation, JobState, JobStatus, ManagerState, ManagerStatus};
pub use tracer::{ChannelTracer, JobEvent, JobEventKind, Tracer, TracingTracer};
