use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::duration_serde;
use crate::error::{CoreError, Result};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_EVENT_BUFFER: usize = 256;
pub const DEFAULT_LOG_FILTER: &str = "cadence=info,cadence_scheduler=info";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

/// Knobs for the job manager's tick loop and shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the manager checks every registered job for due-ness.
    #[serde(default = "default_tick_interval", with = "duration_serde::duration")]
    pub tick_interval: Duration,
    /// How long `stop` waits for running jobs before cancelling them.
    #[serde(
        default = "default_shutdown_grace_period",
        with = "duration_serde::duration"
    )]
    pub shutdown_grace_period: Duration,
    /// Capacity of the job event queue; events are dropped when it is full.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            shutdown_grace_period: default_shutdown_grace_period(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// A shell-command job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub name: String,
    /// Schedule string, e.g. `@every 5m`, `@daily`, `0 */15 * * * *`.
    pub schedule: String,
    /// Passed to `sh -c`.
    pub command: String,
    #[serde(default, with = "duration_serde::option_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides `scheduler.shutdown_grace_period` for this job.
    #[serde(default, with = "duration_serde::option_duration")]
    pub shutdown_grace_period: Option<Duration>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(DEFAULT_TICK_INTERVAL_MS)
}
fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `CADENCE_CONFIG` env var
    ///   3. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; the defaults (and env overrides) apply.
    /// Nested keys use a double underscore: `CADENCE_SCHEDULER__TICK_INTERVAL=250ms`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CADENCE_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        tracing::debug!(%path, "loading config");

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configs the scheduler cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval.is_zero() {
            return Err(CoreError::Config(
                "scheduler.tick_interval must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(CoreError::Config("job name must not be empty".to_string()));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }
            if job.command.trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "job {} has an empty command",
                    job.name
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
