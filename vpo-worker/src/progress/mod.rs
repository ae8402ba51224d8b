//! Progress snapshots and the reporter handed to executors.

mod parser;

pub use parser::FfmpegProgressParser;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What `processed` and `total` count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressUnit {
    Frames,
    Bytes,
    Items,
}

/// Latest progress of a running job. Stored as `progress_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub unit: ProgressUnit,
    pub percent: f64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Units per second. For encoders this is media seconds per wall second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,

    // Encoder detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

impl ProgressSnapshot {
    pub fn new(unit: ProgressUnit) -> Self {
        Self {
            unit,
            percent: 0.0,
            updated_at: Utc::now(),
            processed: None,
            total: None,
            rate: None,
            eta_secs: None,
            frame: None,
            fps: None,
            out_time_ms: None,
            speed: None,
            bitrate_kbps: None,
            total_size: None,
        }
    }

    /// Byte-count progress, e.g. a cross-device copy.
    pub fn bytes(done: u64, total: u64) -> Self {
        let mut snapshot = Self::new(ProgressUnit::Bytes);
        snapshot.processed = Some(done);
        snapshot.total = Some(total);
        snapshot.percent = if total == 0 {
            100.0
        } else {
            (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };
        snapshot
    }
}

/// A progress update queued for the aggregator.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub snapshot: ProgressSnapshot,
}

/// Handle executors use to publish progress.
///
/// Reporting never blocks: when the channel is full the update is dropped,
/// and the next one supersedes it anyway.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: String,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    /// A reporter whose updates go nowhere.
    pub fn noop(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<ProgressUpdate>(1);
        Self::new(job_id, tx)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn report(&self, mut snapshot: ProgressSnapshot) {
        snapshot.updated_at = Utc::now();
        let _ = self.tx.try_send(ProgressUpdate {
            job_id: self.job_id.clone(),
            snapshot,
        });
    }
}
