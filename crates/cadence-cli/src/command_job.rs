use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use cadence_core::{CadenceConfig, JobEntry};
use cadence_scheduler::{Job, JobContext, JobHooks, Schedule};
use tokio::process::Command;
use tracing::debug;

/// A `[[jobs]]` entry: runs its command through `sh -c`.
pub struct CommandJob {
    name: String,
    schedule: Schedule,
    command: String,
    timeout: Option<Duration>,
    description: Option<String>,
    enabled: bool,
    shutdown_grace_period: Option<Duration>,
    labels: BTreeMap<String, String>,
    last_exit: Arc<Mutex<Option<i32>>>,
}

impl CommandJob {
    pub fn from_entry(entry: &JobEntry) -> anyhow::Result<Self> {
        let schedule: Schedule = entry
            .schedule
            .parse()
            .with_context(|| format!("job {}: bad schedule '{}'", entry.name, entry.schedule))?;
        Ok(Self {
            name: entry.name.clone(),
            schedule,
            command: entry.command.clone(),
            timeout: entry.timeout,
            description: entry.description.clone(),
            enabled: !entry.disabled,
            shutdown_grace_period: entry.shutdown_grace_period,
            labels: entry.labels.clone(),
            last_exit: Arc::new(Mutex::new(None)),
        })
    }

    fn record_exit(&self, code: Option<i32>) {
        *self.last_exit.lock().unwrap_or_else(PoisonError::into_inner) = code;
    }
}

/// One job per config entry, in file order.
pub fn from_config(config: &CadenceConfig) -> anyhow::Result<Vec<Arc<dyn Job>>> {
    config
        .jobs
        .iter()
        .map(|entry| Ok(Arc::new(CommandJob::from_entry(entry)?) as Arc<dyn Job>))
        .collect()
}

#[async_trait]
impl Job for CommandJob {
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
        debug!(job = %self.name, invocation = %ctx.id(), command = %self.command, "spawning command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning `{}`", self.command))?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output.context("waiting for command")?,
            _ = ctx.cancelled() => bail!("cancelled, command killed"),
        };

        self.record_exit(output.status.code());
        if output.status.success() {
            debug!(
                job = %self.name,
                stdout_bytes = output.stdout.len(),
                "command succeeded"
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let status = match output.status.code() {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        };
        if stderr.is_empty() {
            bail!("{status}")
        }
        bail!("{status}: {stderr}")
    }

    fn hooks(&self) -> JobHooks {
        let last_exit = Arc::clone(&self.last_exit);
        JobHooks::new().status(move || {
            match *last_exit.lock().unwrap_or_else(PoisonError::into_inner) {
                Some(code) => format!("last exit {code}"),
                None => String::new(),
            }
        })
    }

    fn description(&self) -> Option<String> {
        self.description.clone().or_else(|| Some(self.command.clone()))
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

#[cfg(all(test, unix))]
mod tests {
    use cadence_scheduler::{InvocationStatus, JobManager, ManagerOptions};

    use super::*;

    fn entry(name: &str, command: &str) -> JobEntry {
        JobEntry {
            name: name.to_string(),
            schedule: "@never".to_string(),
            command: command.to_string(),
            timeout: None,
            disabled: false,
            description: None,
            shutdown_grace_period: None,
            labels: BTreeMap::new(),
        }
    }

    fn manager_with(entries: Vec<JobEntry>) -> JobManager {
        let config = CadenceConfig {
            jobs: entries,
            ..CadenceConfig::default()
        };
        let manager = JobManager::new(ManagerOptions::from_config(&config.scheduler));
        manager.load_jobs(from_config(&config).unwrap()).unwrap();
        manager
    }

    #[test]
    fn entry_settings_reach_the_status() {
        let mut tagged = entry("tagged", "true");
        tagged.labels.insert("team".to_string(), "infra".to_string());
        tagged.shutdown_grace_period = Some(Duration::from_secs(5));
        let job = CommandJob::from_entry(&tagged).unwrap();
        assert_eq!(job.shutdown_grace_period(), Some(Duration::from_secs(5)));

        let manager = manager_with(vec![tagged]);
        assert_eq!(manager.job_status("tagged").unwrap().labels["team"], "infra");
    }

    #[test]
    fn bad_schedule_names_the_job() {
        let mut bad = entry("broken", "true");
        bad.schedule = "@sometimes".to_string();
        let err = CommandJob::from_entry(&bad).err().unwrap();
        assert!(format!("{err:#}").contains("job broken"));
    }

    #[tokio::test]
    async fn successful_command() {
        let manager = manager_with(vec![entry("ok", "true")]);
        let outcome = manager.run_job("ok").unwrap().wait().await;
        assert_eq!(outcome.status, InvocationStatus::Succeeded);
        assert_eq!(
            manager.job_status("ok").unwrap().detail.as_deref(),
            Some("last exit 0")
        );
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let manager = manager_with(vec![entry("fail", "echo 'disk full' >&2; exit 3")]);
        let outcome = manager.run_job("fail").unwrap().wait().await;
        assert_eq!(outcome.err(), Some("exited with status 3: disk full"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_kills_the_child() {
        let manager = manager_with(vec![entry("sleeper", "sleep 30")]);
        let invocation = manager.run_job("sleeper").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.cancel_job("sleeper").unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), invocation.wait())
            .await
            .unwrap();
        assert_eq!(outcome.status, InvocationStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_applies_to_commands() {
        let mut slow = entry("slow", "sleep 30");
        slow.timeout = Some(Duration::from_millis(100));
        let manager = manager_with(vec![slow]);
        let outcome = manager.run_job("slow").unwrap().wait().await;
        assert!(outcome.timed_out());
        assert!(outcome.elapsed < Duration::from_secs(2));
    }
}
