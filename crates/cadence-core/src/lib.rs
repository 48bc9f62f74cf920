//! `cadence-core`: configuration and error types shared by the cadence crates.

pub mod config;
pub mod duration_serde;
pub mod error;

pub use config::{CadenceConfig, JobEntry, LogConfig, SchedulerConfig};
pub use error::{CoreError, Result};
