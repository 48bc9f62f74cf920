use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};

use crate::error::{Result, SchedulerError};

/// Answers "given the last run, when is this job next due?".
///
/// Every variant is an immutable value and [`Schedule::next`] is a pure
/// function of its two arguments: calling it twice with the same inputs
/// always yields the same answer.
///
/// | Variant       | no previous run           | after a run at `last`         |
/// |---------------|---------------------------|-------------------------------|
/// | `Never`       | never                     | never                         |
/// | `Immediately` | now                       | never                         |
/// | `Every(d)`    | now                       | `last + d`                    |
/// | `OnceAt(t)`   | `t`                       | `t` if still after `last`     |
/// | `Daily`       | next matching time > now  | next matching time > `last`   |
/// | `Cron`        | next match > now          | next match > `last`           |
/// | `Then(a, b)`  | `a`                       | `b`                           |
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Registered but never fired automatically; can still be run on demand.
    Never,
    /// Fire once, as soon as possible.
    Immediately,
    /// Fire every fixed interval, measured from the previous start.
    Every(Duration),
    /// Fire once at an absolute UTC instant.
    OnceAt(DateTime<Utc>),
    /// Fire at a UTC time of day on the selected weekdays.
    Daily { at: NaiveTime, days: Weekdays },
    /// Fire according to a cron expression (UTC).
    Cron(CronExpr),
    /// Use the first schedule until the job has run once, then the second.
    Then(Box<Schedule>, Box<Schedule>),
}

impl Schedule {
    pub fn never() -> Self {
        Schedule::Never
    }

    pub fn immediately() -> Self {
        Schedule::Immediately
    }

    /// Fixed interval. A zero interval makes the job due on every tick; an
    /// interval too large to add to a date is due at `DateTime::<Utc>::MAX_UTC`.
    pub fn every(interval: Duration) -> Self {
        Schedule::Every(interval)
    }

    pub fn once_at(at: DateTime<Utc>) -> Self {
        Schedule::OnceAt(at)
    }

    /// Every day at `hour:minute:second` UTC.
    pub fn daily_at(hour: u32, minute: u32, second: u32) -> Result<Self> {
        Ok(Schedule::Daily {
            at: time_of_day(hour, minute, second)?,
            days: Weekdays::ALL,
        })
    }

    /// On each of `days` at `hour:minute:second` UTC.
    pub fn weekly_at(hour: u32, minute: u32, second: u32, days: &[Weekday]) -> Result<Self> {
        Ok(Schedule::Daily {
            at: time_of_day(hour, minute, second)?,
            days: Weekdays::from_days(days),
        })
    }

    /// Monday through Friday at `hour:minute:second` UTC.
    pub fn weekdays_at(hour: u32, minute: u32, second: u32) -> Result<Self> {
        Ok(Schedule::Daily {
            at: time_of_day(hour, minute, second)?,
            days: Weekdays::WEEKDAYS,
        })
    }

    /// Saturday and Sunday at `hour:minute:second` UTC.
    pub fn weekends_at(hour: u32, minute: u32, second: u32) -> Result<Self> {
        Ok(Schedule::Daily {
            at: time_of_day(hour, minute, second)?,
            days: Weekdays::WEEKENDS,
        })
    }

    /// Parse a 5, 6 or 7 field cron expression.
    pub fn cron(expression: &str) -> Result<Self> {
        CronExpr::parse(expression).map(Schedule::Cron)
    }

    /// Chain two schedules: `self` governs the first run, `then` every run after it.
    ///
    /// `Schedule::immediately().then(Schedule::every(d))` fires on the first
    /// tick and every `d` afterwards.
    pub fn then(self, then: Schedule) -> Self {
        Schedule::Then(Box::new(self), Box::new(then))
    }

    /// Compute the next due instant.
    ///
    /// `last_run` is the start time of the job's previous invocation, `None`
    /// if it has never run. Returns `None` when the schedule will not fire
    /// again on its own. A returned instant at or before `now` means the job
    /// is due now; several missed instants still produce a single run.
    pub fn next(
        &self,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Never => None,

            Schedule::Immediately => match last_run {
                None => Some(now),
                Some(_) => None,
            },

            Schedule::Every(interval) => match last_run {
                None => Some(now),
                // Intervals past chrono's range saturate to the far future.
                Some(last) => Some(
                    chrono::Duration::from_std(*interval)
                        .ok()
                        .and_then(|step| last.checked_add_signed(step))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                ),
            },

            Schedule::OnceAt(at) => match last_run {
                Some(last) if last >= *at => None,
                _ => Some(*at),
            },

            Schedule::Daily { at, days } => next_daily(*at, *days, last_run.unwrap_or(now)),

            Schedule::Cron(expr) => expr.next_after(&last_run.unwrap_or(now)),

            Schedule::Then(first, then) => match last_run {
                None => first.next(None, now),
                Some(_) => then.next(last_run, now),
            },
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Never => write!(f, "@never"),
            Schedule::Immediately => write!(f, "@immediately"),
            Schedule::Every(d) => write!(f, "@every {}", humantime::format_duration(*d)),
            Schedule::OnceAt(at) => write!(f, "@once-at {}", at.to_rfc3339()),
            Schedule::Daily { at, days } if *days == Weekdays::ALL => {
                write!(f, "{} UTC every day", at.format("%H:%M:%S"))
            }
            Schedule::Daily { at, days } => {
                write!(f, "{} UTC on {days}", at.format("%H:%M:%S"))
            }
            Schedule::Cron(expr) => write!(f, "{}", expr.as_str()),
            Schedule::Then(first, then) if matches!(**first, Schedule::Immediately) => {
                write!(f, "@immediately-then {then}")
            }
            Schedule::Then(first, then) => write!(f, "{first} then {then}"),
        }
    }
}

fn time_of_day(hour: u32, minute: u32, second: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!(
            "invalid time of day {hour:02}:{minute:02}:{second:02}"
        ))
    })
}

/// First instant strictly after `after` that falls on one of `days` at `at`.
fn next_daily(at: NaiveTime, days: Weekdays, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = Utc.from_utc_datetime(&after.date_naive().and_time(at));
    // Eight candidates cover "later today" plus a full week.
    (0..8)
        .map(|offset| today + chrono::Duration::days(offset))
        .find(|candidate| days.contains(candidate.weekday()) && *candidate > after)
}

/// A set of weekdays, one bit per day (bit 0 = Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const ALL: Weekdays = Weekdays(0b0111_1111);
    pub const WEEKDAYS: Weekdays = Weekdays(0b0011_1110);
    pub const WEEKENDS: Weekdays = Weekdays(0b0100_0001);

    pub fn from_days(days: &[Weekday]) -> Self {
        Weekdays(
            days.iter()
                .fold(0, |mask, day| mask | 1 << day.num_days_from_sunday()),
        )
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const ORDER: [Weekday; 7] = [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ];
        let names: Vec<String> = ORDER
            .iter()
            .filter(|d| self.contains(**d))
            .map(|d| d.to_string())
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

/// A parsed cron expression that remembers the text it was written as.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    /// Parse `[sec] min hour day-of-month month day-of-week [year]`.
    ///
    /// Five-field expressions get a `0` seconds field prepended. Day-of-week
    /// accepts names (`Mon-Fri`) or numbers 1-7 with 1 = Sunday.
    pub fn parse(expression: &str) -> Result<Self> {
        Self::with_source(expression, expression)
    }

    /// Parse `expanded` but display as `source` (used for `@daily` and friends).
    pub(crate) fn with_source(source: &str, expanded: &str) -> Result<Self> {
        let fields = expanded.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", expanded.trim()),
            6 | 7 => expanded.trim().to_string(),
            n => {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "cron expression '{source}' has {n} fields, expected 5 to 7"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            SchedulerError::InvalidSchedule(format!("cron expression '{source}': {e}"))
        })?;
        Ok(Self {
            source: source.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}
