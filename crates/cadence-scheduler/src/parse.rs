//! Text form of [`Schedule`].
//!
//! | Input                          | Schedule                                  |
//! |--------------------------------|-------------------------------------------|
//! | `@never`                       | [`Schedule::Never`]                       |
//! | `@immediately`                 | [`Schedule::Immediately`]                 |
//! | `@immediately-then <schedule>` | immediately, then `<schedule>`            |
//! | `@every <duration>`            | fixed interval, e.g. `@every 1h30m`       |
//! | `@once-at <RFC 3339>`          | single absolute instant                   |
//! | `@yearly` / `@annually`        | `0 0 0 1 1 *`                             |
//! | `@monthly`                     | `0 0 0 1 * *`                             |
//! | `@weekly`                      | `0 0 0 * * Sun`                           |
//! | `@daily`                       | `0 0 0 * * *`                             |
//! | `@hourly`                      | `0 0 * * * *`                             |
//! | anything else                  | 5, 6 or 7 field cron expression           |

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::schedule::{CronExpr, Schedule};

const SHORTHANDS: &[(&str, &str)] = &[
    ("@yearly", "0 0 0 1 1 * *"),
    ("@annually", "0 0 0 1 1 * *"),
    ("@monthly", "0 0 0 1 * * *"),
    ("@weekly", "0 0 0 * * Sun *"),
    ("@daily", "0 0 0 * * * *"),
    ("@hourly", "0 0 * * * * *"),
];

impl FromStr for Schedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty schedule"));
        }

        // Must be checked before `@immediately`, which is its prefix.
        if let Some(rest) = s.strip_prefix("@immediately-then") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Err(invalid("@immediately-then needs a schedule to follow"));
            }
            return Ok(Schedule::immediately().then(rest.parse()?));
        }

        match s {
            "@never" => return Ok(Schedule::Never),
            "@immediately" => return Ok(Schedule::Immediately),
            _ => {}
        }

        if let Some(rest) = s.strip_prefix("@every") {
            let interval = humantime::parse_duration(rest.trim())
                .map_err(|e| invalid(&format!("@every '{}': {e}", rest.trim())))?;
            if interval.is_zero() {
                return Err(invalid("@every needs a non-zero interval"));
            }
            return Ok(Schedule::Every(interval));
        }

        if let Some(rest) = s.strip_prefix("@once-at") {
            let at = DateTime::parse_from_rfc3339(rest.trim())
                .map_err(|e| invalid(&format!("@once-at '{}': {e}", rest.trim())))?;
            return Ok(Schedule::OnceAt(at.with_timezone(&Utc)));
        }

        if let Some((name, expanded)) = SHORTHANDS.iter().find(|(name, _)| *name == s) {
            return CronExpr::with_source(name, expanded).map(Schedule::Cron);
        }

        if s.starts_with('@') {
            return Err(invalid(&format!("unknown shorthand '{s}'")));
        }

        Schedule::cron(s)
    }
}

fn invalid(msg: &str) -> SchedulerError {
    SchedulerError::InvalidSchedule(msg.to_string())
}
