//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Job database model.
/// One row of the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub file_path: String,
    /// Job type: transcode, move
    pub job_type: String,
    /// Status: queued, running, completed, failed, cancelled
    pub status: String,
    pub priority: i64,
    /// JSON blob for the executor configuration
    pub policy_json: String,
    pub progress_percent: f64,
    pub progress_json: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub worker_id: Option<String>,
    pub worker_heartbeat: Option<i64>,
    pub cancel_requested: bool,
    pub output_path: Option<String>,
    pub backup_path: Option<String>,
    pub error_message: Option<String>,
    pub summary_json: Option<String>,
}

impl JobDbModel {
    pub fn new(
        job_type: JobType,
        file_path: impl Into<String>,
        policy_json: impl Into<String>,
        priority: i64,
    ) -> Self {
        Self {
            // v7 ids sort by creation time, which keeps the claim tie-break
            // in submission order when two rows share a millisecond.
            id: uuid::Uuid::now_v7().to_string(),
            file_path: file_path.into(),
            job_type: job_type.as_str().to_string(),
            status: JobStatus::Queued.as_str().to_string(),
            priority,
            policy_json: policy_json.into(),
            progress_percent: 0.0,
            progress_json: None,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            worker_heartbeat: None,
            cancel_requested: false,
            output_path: None,
            backup_path: None,
            error_message: None,
            summary_json: None,
        }
    }
}

/// Job types.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Transcode,
    Move,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcode => "transcode",
            Self::Move => "move",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcode" => Some(Self::Transcode),
            "move" => Some(Self::Move),
            _ => None,
        }
    }
}

/// Job status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed and executing.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] = [Self::Completed, Self::Failed, Self::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One row of the `job_logs` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobLogDbModel {
    pub id: i64,
    pub job_id: String,
    pub level: String,
    pub message: String,
    pub created_at: i64,
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    /// Inclusive lower bound on `created_at` (epoch ms).
    pub created_since: Option<i64>,
    /// Exclusive upper bound on `created_at` (epoch ms).
    pub created_until: Option<i64>,
    /// Substring match on `file_path`.
    pub file_path_contains: Option<String>,
}

impl JobFilters {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }
}

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 500;

    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

/// Job counts grouped by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.running + self.completed + self.failed + self.cancelled
    }
}
