use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_core::CadenceConfig;
use cadence_scheduler::{ChannelTracer, JobManager, ManagerOptions, Tracer, TracingTracer};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

mod command_job;
mod render;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version)]
#[command(about = "Run shell commands on recurring schedules")]
struct Cli {
    /// Configuration file path (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured jobs until Ctrl-C
    Run {
        /// Log a status table at this interval, e.g. `30s` or `5m`
        #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
        status_every: Option<Duration>,
    },
    /// Validate the configuration and show when each job would next run
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CadenceConfig::load(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.filter.as_str().into()),
        )
        .init();

    match cli.command {
        Command::Run { status_every } => run(config, status_every).await,
        Command::Check => check(&config),
    }
}

async fn run(config: CadenceConfig, status_every: Option<Duration>) -> Result<()> {
    // Events are rendered off the invocation tasks.
    let (tracer, mut events) = ChannelTracer::channel(config.scheduler.event_buffer);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            TracingTracer.emit(&event);
        }
    });

    let manager = JobManager::new(
        ManagerOptions::from_config(&config.scheduler).tracer(Arc::new(tracer)),
    );
    manager.load_jobs(command_job::from_config(&config)?)?;
    manager.start_async()?;
    info!(
        jobs = manager.job_names().len(),
        tick_ms = config.scheduler.tick_interval.as_millis() as u64,
        "cadence running, press Ctrl-C to stop"
    );

    let reporter = status_every.map(|every| {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                info!("status\n{}", render::status_table(&manager.status(), Utc::now()));
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("shutdown signal received");

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    manager.stop(config.scheduler.shutdown_grace_period).await?;
    println!("{}", render::status_table(&manager.status(), Utc::now()));
    Ok(())
}

fn check(config: &CadenceConfig) -> Result<()> {
    let manager = JobManager::new(ManagerOptions::from_config(&config.scheduler));
    manager.load_jobs(command_job::from_config(config)?)?;
    println!(
        "configuration OK: {} job(s), tick every {}",
        config.jobs.len(),
        humantime::format_duration(config.scheduler.tick_interval)
    );
    println!("{}", render::status_table(&manager.status(), Utc::now()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_status_interval() {
        let cli = Cli::try_parse_from(["cadence", "run", "--status-every", "30s"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Run { status_every: Some(d) } if d == Duration::from_secs(30)
        ));
        assert!(cli.config.is_none());
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["cadence", "check", "--config", "jobs.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Check));
        assert_eq!(cli.config.as_deref(), Some("jobs.toml"));
    }
}
