//! Per-run limits and the summary a worker run returns.

use std::time::Duration;

use chrono::{Days, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::jobs::JobStatus;
use crate::{Error, Result};

/// Limits for one `Worker::run`. All optional; none set means drain the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLimits {
    pub max_files: Option<u64>,
    pub max_duration: Option<Duration>,
    /// Local wall-clock time after which no new job is claimed.
    pub end_by: Option<NaiveTime>,
    pub cpu_cores: Option<u32>,
}

impl JobLimits {
    pub fn with_max_files(mut self, max_files: u64) -> Self {
        self.max_files = Some(max_files);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_end_by(mut self, end_by: NaiveTime) -> Self {
        self.end_by = Some(end_by);
        self
    }

    pub fn with_cpu_cores(mut self, cpu_cores: u32) -> Self {
        self.cpu_cores = Some(cpu_cores);
        self
    }
}

/// Parse an `HH:MM` end-by time.
pub fn parse_end_by(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| Error::config(format!("invalid end-by time '{}', expected HH:MM", value)))
}

/// First occurrence of `end_by` after `now`: today if still ahead, otherwise
/// tomorrow.
pub fn end_by_deadline(now: NaiveDateTime, end_by: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(end_by);
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

/// Why a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    QueueEmpty,
    MaxFiles,
    MaxDuration,
    EndTime,
    Shutdown,
}

/// Totals for one worker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Jobs abandoned after losing ownership; left for orphan recovery.
    pub lost: u64,
    /// Orphans found at startup, requeued or cancelled.
    pub recovered: u64,
    pub purged: u64,
    pub stop_reason: StopReason,
}

impl Default for WorkerSummary {
    fn default() -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            lost: 0,
            recovered: 0,
            purged: 0,
            stop_reason: StopReason::QueueEmpty,
        }
    }
}

impl WorkerSummary {
    /// Count a job that reached `status`.
    pub fn record(&mut self, status: JobStatus) {
        self.processed += 1;
        match status {
            JobStatus::Completed => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Queued | JobStatus::Running => {}
        }
    }

    pub fn record_lost(&mut self) {
        self.processed += 1;
        self.lost += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_end_by() {
        assert_eq!(
            parse_end_by("06:30").unwrap(),
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        );
        assert!(matches!(parse_end_by("25:00"), Err(Error::Configuration(_))));
        assert!(parse_end_by("six").is_err());
    }

    #[test]
    fn test_deadline_later_today() {
        let end_by = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert_eq!(end_by_deadline(at(1, 0), end_by), at(6, 0));
    }

    #[test]
    fn test_deadline_rolls_to_tomorrow() {
        let end_by = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let deadline = end_by_deadline(at(22, 0), end_by);
        assert_eq!(deadline.date(), NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
        assert_eq!(deadline.time(), end_by);
        // Exactly now also means tomorrow.
        assert_eq!(end_by_deadline(at(6, 0), end_by).date().to_string(), "2026-03-15");
    }

    #[test]
    fn test_summary_record() {
        let mut summary = WorkerSummary::default();
        summary.record(JobStatus::Completed);
        summary.record(JobStatus::Failed);
        summary.record(JobStatus::Cancelled);
        summary.record(JobStatus::Completed);
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 1);
        summary.record_lost();
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.lost, 1);
        assert_eq!(summary.stop_reason, StopReason::QueueEmpty);
    }
}
