//! Domain view of a job row.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::database::models::{JobDbModel, JobLogDbModel, JobStatus, JobType};
use crate::database::time::ms_to_datetime;
use crate::progress::ProgressSnapshot;
use crate::{Error, Result};

/// A queued or executed unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub file_path: PathBuf,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Lower runs sooner.
    pub priority: i64,
    /// Executor configuration, kept as the raw JSON object.
    pub policy_json: String,
    pub progress_percent: f64,
    pub progress: Option<ProgressSnapshot>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub worker_heartbeat: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub output_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub summary: Option<serde_json::Value>,
}

impl Job {
    /// Deserialize the executor configuration.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.policy_json).map_err(|e| {
            Error::validation(format!(
                "invalid {} config for job {}: {}",
                self.job_type, self.id, e
            ))
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        let job_type = JobType::parse(&row.job_type)
            .ok_or_else(|| Error::validation(format!("unknown job type: {}", row.job_type)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| Error::validation(format!("unknown job status: {}", row.status)))?;

        // Progress and summary are informational; a malformed blob must not
        // make the job unreadable.
        let progress = row.progress_json.as_deref().and_then(|json| {
            serde_json::from_str(json)
                .inspect_err(|e| warn!(job_id = %row.id, error = %e, "Ignoring malformed progress_json"))
                .ok()
        });
        let summary = row.summary_json.as_deref().and_then(|json| {
            serde_json::from_str(json)
                .inspect_err(|e| warn!(job_id = %row.id, error = %e, "Ignoring malformed summary_json"))
                .ok()
        });

        Ok(Self {
            id: row.id,
            file_path: PathBuf::from(row.file_path),
            job_type,
            status,
            priority: row.priority,
            policy_json: row.policy_json,
            progress_percent: row.progress_percent,
            progress,
            created_at: ms_to_datetime(row.created_at),
            started_at: row.started_at.map(ms_to_datetime),
            completed_at: row.completed_at.map(ms_to_datetime),
            worker_id: row.worker_id,
            worker_heartbeat: row.worker_heartbeat.map(ms_to_datetime),
            cancel_requested: row.cancel_requested,
            output_path: row.output_path.map(PathBuf::from),
            backup_path: row.backup_path.map(PathBuf::from),
            error_message: row.error_message,
            summary,
        })
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "DEBUG" => LogLevel::Debug,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One line of a job's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<JobLogDbModel> for JobLogEntry {
    fn from(row: JobLogDbModel) -> Self {
        Self {
            id: row.id,
            job_id: row.job_id,
            level: LogLevel::parse(&row.level),
            message: row.message,
            created_at: ms_to_datetime(row.created_at),
        }
    }
}
