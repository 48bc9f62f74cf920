use std::time::Duration;

use cadence_scheduler::{JobStatus, ManagerStatus};
use chrono::{DateTime, Utc};

const HEADERS: [&str; 7] = ["NAME", "STATE", "SCHEDULE", "LAST", "FINISHED", "NEXT", "RUNS"];

/// Fixed-width text table, one row per job.
pub fn status_table(status: &ManagerStatus, now: DateTime<Utc>) -> String {
    let rows: Vec<[String; 7]> = status.jobs.iter().map(|job| row(job, now)).collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = format!(
        "manager {} ({} job{})\n",
        status.state,
        status.jobs.len(),
        if status.jobs.len() == 1 { "" } else { "s" }
    );
    out.push_str(&line(&HEADERS.map(String::from), &widths));
    for row in &rows {
        out.push('\n');
        out.push_str(&line(row, &widths));
    }
    out
}

fn row(job: &JobStatus, now: DateTime<Utc>) -> [String; 7] {
    let state = match job.elapsed(now) {
        Some(elapsed) => format!("running {}", short(elapsed)),
        None if !job.enabled => "disabled".to_string(),
        None => "idle".to_string(),
    };
    let last = match (&job.last_outcome, &job.detail) {
        (Some(outcome), Some(detail)) if !detail.is_empty() => {
            format!("{} ({detail})", outcome.label())
        }
        (Some(outcome), _) => outcome.label().to_string(),
        (None, _) => "-".to_string(),
    };
    let finished = job
        .last_finished
        .map(|t| format!("{} ago", since(t, now)))
        .unwrap_or_else(|| "-".to_string());
    let next = match job.next_due {
        Some(due) if due <= now => "due".to_string(),
        Some(due) => format!("in {}", since(now, due)),
        None => "-".to_string(),
    };
    [
        job.name.clone(),
        state,
        job.schedule.clone(),
        last,
        finished,
        next,
        job.run_count.to_string(),
    ]
}

fn line(cells: &[String; 7], widths: &[usize; 7]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect();
    padded.join("  ").trim_end().to_string()
}

/// Whole seconds from `from` to `to`, never negative.
fn since(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    short((to - from).to_std().unwrap_or_default())
}

fn short(d: Duration) -> String {
    humantime::format_duration(Duration::from_secs(d.as_secs())).to_string()
}

#[cfg(test)]
mod tests {
    use cadence_scheduler::{
        CurrentInvocation, InvocationStatus, JobState, ManagerState, Trigger,
    };
    use chrono::TimeZone;

    use super::*;

    fn job(name: &str) -> JobStatus {
        JobStatus {
            name: name.to_string(),
            state: JobState::Idle,
            enabled: true,
            schedule: "@every 5m".to_string(),
            description: None,
            labels: Default::default(),
            current: None,
            last_started: None,
            last_finished: None,
            last_outcome: None,
            last_err: None,
            next_due: None,
            run_count: 0,
            error_count: 0,
            timeout_count: 0,
            detail: None,
        }
    }

    #[test]
    fn renders_aligned_rows() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let mut backup = job("backup");
        backup.last_outcome = Some(InvocationStatus::Errored("exit 1".into()));
        backup.detail = Some("last exit 1".into());
        backup.last_finished = Some(now - chrono::Duration::seconds(90));
        backup.next_due = Some(now + chrono::Duration::seconds(30));
        backup.run_count = 4;

        let mut ping = job("ping");
        ping.state = JobState::Running;
        ping.current = Some(CurrentInvocation {
            id: "x".into(),
            started: now - chrono::Duration::seconds(3),
            trigger: Trigger::Scheduled,
        });

        let mut paused = job("paused-job");
        paused.enabled = false;

        let status = ManagerStatus {
            state: ManagerState::Running,
            started_at: None,
            stopped_at: None,
            jobs: vec![backup, paused, ping],
        };
        let table = status_table(&status, now);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines[0], "manager running (3 jobs)");
        assert!(lines[1].starts_with("NAME        STATE"));
        assert!(lines[2].contains("errored (last exit 1)"));
        assert!(lines[2].contains("1m 30s ago"));
        assert!(lines[2].contains("in 30s"));
        assert!(lines[3].contains("disabled"));
        assert!(lines[4].contains("running 3s"));

        // Every column starts at the same offset on every line.
        let state_col = lines[1].find("STATE").unwrap();
        for l in &lines[2..] {
            assert_eq!(&l[state_col - 2..state_col], "  ");
        }
    }

    #[test]
    fn empty_manager() {
        let status = ManagerStatus {
            state: ManagerState::Stopped,
            started_at: None,
            stopped_at: None,
            jobs: vec![],
        };
        let table = status_table(&status, Utc::now());
        assert_eq!(table.lines().count(), 2);
        assert!(table.starts_with("manager stopped (0 jobs)"));
    }

    #[test]
    fn overdue_shows_due() {
        let now = Utc::now();
        let mut j = job("late");
        j.next_due = Some(now - chrono::Duration::seconds(5));
        assert_eq!(row(&j, now)[5], "due");
    }
}
