//! Job lifecycle events and the sinks that receive them.
//!
//! The engine only ever calls [`Tracer::emit`]. Formatting, filtering and
//! transport are up to the implementation. `emit` runs on the invocation's
//! task, so implementations must not block.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Started,
    Succeeded,
    Errored,
    TimedOut,
    Cancelled,
    /// First failure after a non-failing run.
    Broken,
    /// First success after a failure.
    Fixed,
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobEventKind::Started => "started",
            JobEventKind::Succeeded => "succeeded",
            JobEventKind::Errored => "errored",
            JobEventKind::TimedOut => "timed_out",
            JobEventKind::Cancelled => "cancelled",
            JobEventKind::Broken => "broken",
            JobEventKind::Fixed => "fixed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_name: String,
    pub invocation_id: String,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

pub trait Tracer: Send + Sync {
    fn emit(&self, event: &JobEvent);
}

impl<F> Tracer for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn emit(&self, event: &JobEvent) {
        self(event)
    }
}

/// Writes every event as a `tracing` record under the `cadence::events` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn emit(&self, event: &JobEvent) {
        let elapsed_ms = event.elapsed.as_millis() as u64;
        match event.kind {
            JobEventKind::Errored | JobEventKind::Broken => error!(
                target: "cadence::events",
                kind = %event.kind,
                job = %event.job_name,
                invocation = %event.invocation_id,
                elapsed_ms,
                error = event.error.as_deref().unwrap_or(""),
                "job event"
            ),
            JobEventKind::TimedOut | JobEventKind::Cancelled => warn!(
                target: "cadence::events",
                kind = %event.kind,
                job = %event.job_name,
                invocation = %event.invocation_id,
                elapsed_ms,
                "job event"
            ),
            _ => info!(
                target: "cadence::events",
                kind = %event.kind,
                job = %event.job_name,
                invocation = %event.invocation_id,
                elapsed_ms,
                "job event"
            ),
        }
    }
}

/// Forwards events into a bounded channel without ever blocking.
#[derive(Debug, Clone)]
pub struct ChannelTracer {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelTracer {
    pub fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self { tx }
    }

    /// Create a tracer together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl Tracer for ChannelTracer {
    fn emit(&self, event: &JobEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            warn!(job = %event.job_name, kind = %event.kind, "event channel full or closed, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn event(kind: JobEventKind) -> JobEvent {
        JobEvent {
            kind,
            job_name: "ping".to_string(),
            invocation_id: "inv-1".to_string(),
            elapsed: Duration::from_millis(12),
            error: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn closures_are_tracers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracer: Arc<dyn Tracer> = Arc::new(move |e: &JobEvent| {
            sink.lock().unwrap().push(e.kind);
        });
        tracer.emit(&event(JobEventKind::Started));
        tracer.emit(&event(JobEventKind::Succeeded));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![JobEventKind::Started, JobEventKind::Succeeded]
        );
    }

    #[tokio::test]
    async fn channel_tracer_drops_when_full() {
        let (tracer, mut rx) = ChannelTracer::channel(1);
        tracer.emit(&event(JobEventKind::Started));
        tracer.emit(&event(JobEventKind::Errored));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, JobEventKind::Started);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tracing_tracer_accepts_every_kind() {
        for kind in [
            JobEventKind::Started,
            JobEventKind::Succeeded,
            JobEventKind::Errored,
            JobEventKind::TimedOut,
            JobEventKind::Cancelled,
            JobEventKind::Broken,
            JobEventKind::Fixed,
        ] {
            TracingTracer.emit(&event(kind));
        }
    }
}
