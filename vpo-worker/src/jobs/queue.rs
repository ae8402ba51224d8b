//! Database-backed job queue.
//!
//! The queue is shared by submitters and by the worker. It owns the
//! in-process pieces that sit next to the durable rows: per-job cancellation
//! tokens and a progress aggregator that coalesces executor updates before
//! they reach SQLite.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobLogEntry, LogLevel};
use super::purge::{JobPurgeService, PurgeConfig};
use crate::database::DbPool;
use crate::database::models::{JobCounts, JobDbModel, JobFilters, JobStatus, JobType, Pagination};
use crate::database::repositories::{
    CancelOutcome, HeartbeatAck, JobRepository, OrphanRecovery, SqlxJobRepository,
    TransitionFields, TransitionOutcome,
};
use crate::database::time::ms_before_now;
use crate::progress::{ProgressReporter, ProgressSnapshot, ProgressUpdate};
use crate::{Error, Result};

/// Longest error message stored on a job row.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 4000;

/// Default priority for new jobs. Lower runs sooner.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Capacity of the executor → aggregator progress channel.
    #[serde(default = "default_progress_channel_capacity")]
    pub progress_channel_capacity: usize,
    /// How often coalesced progress is written, in milliseconds.
    #[serde(default = "default_progress_flush_interval_ms")]
    pub progress_flush_interval_ms: u64,
}

fn default_progress_channel_capacity() -> usize {
    1024
}

fn default_progress_flush_interval_ms() -> u64 {
    250
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            progress_channel_capacity: default_progress_channel_capacity(),
            progress_flush_interval_ms: default_progress_flush_interval_ms(),
        }
    }
}

/// Result fields recorded with a terminal transition.
#[derive(Debug, Clone, Default)]
pub struct JobResult {
    pub output_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
}

impl JobResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Counts per status plus a total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub counts: JobCounts,
    pub total: u64,
}

/// The job queue service.
pub struct JobQueue {
    config: JobQueueConfig,
    job_repository: Arc<dyn JobRepository>,
    purge_service: JobPurgeService,
    /// Cancellation tokens for jobs claimed by this process.
    cancellation_tokens: Arc<DashMap<String, CancellationToken>>,
    /// Latest progress snapshot per job (in-memory). Only live jobs have an
    /// entry.
    progress_cache: Arc<DashMap<String, ProgressSnapshot>>,
    progress_tx: mpsc::Sender<ProgressUpdate>,
}

impl JobQueue {
    /// Create a queue over an existing repository.
    pub fn new(
        config: JobQueueConfig,
        purge_config: PurgeConfig,
        job_repository: Arc<dyn JobRepository>,
    ) -> Self {
        let (progress_tx, progress_rx) =
            mpsc::channel::<ProgressUpdate>(config.progress_channel_capacity.max(1));
        let progress_cache: Arc<DashMap<String, ProgressSnapshot>> = Arc::new(DashMap::new());
        let cancellation_tokens: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());
        spawn_progress_aggregator(
            job_repository.clone(),
            progress_rx,
            progress_cache.clone(),
            cancellation_tokens.clone(),
            Duration::from_millis(config.progress_flush_interval_ms.max(1)),
        );

        Self {
            purge_service: JobPurgeService::new(purge_config, job_repository.clone()),
            config,
            job_repository,
            cancellation_tokens,
            progress_cache,
            progress_tx,
        }
    }

    /// Create a queue backed by the SQLite pool with default settings.
    pub fn from_pool(pool: DbPool) -> Self {
        Self::new(
            JobQueueConfig::default(),
            PurgeConfig::default(),
            Arc::new(SqlxJobRepository::new(pool)),
        )
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Insert a new `queued` job and return its id.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        file_path: impl Into<PathBuf>,
        policy: &serde_json::Value,
        priority: i64,
    ) -> Result<String> {
        let file_path = file_path.into();
        let path_str = file_path.to_string_lossy();
        if path_str.trim().is_empty() {
            return Err(Error::validation("file path must not be empty"));
        }
        if !policy.is_object() {
            return Err(Error::validation("job config must be a JSON object"));
        }

        let row = JobDbModel::new(
            job_type,
            path_str.into_owned(),
            serde_json::to_string(policy)?,
            priority,
        );
        self.job_repository.create_job(&row).await?;

        info!(
            job_id = %row.id,
            job_type = %job_type,
            priority,
            file = %row.file_path,
            "Job queued"
        );
        self.append_log(&row.id, LogLevel::Info, format!("Queued {} job", job_type))
            .await;

        Ok(row.id)
    }

    /// Atomically claim the next eligible job for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let Some(row) = self.job_repository.claim_next(worker_id).await? else {
            return Ok(None);
        };
        let job = Job::try_from(row)?;

        self.cancellation_tokens
            .insert(job.id.clone(), CancellationToken::new());

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id,
            file = %job.file_path.display(),
            "Job claimed"
        );
        self.append_log(&job.id, LogLevel::Info, format!("Claimed by worker {}", worker_id))
            .await;

        Ok(Some(job))
    }

    /// Token tripped when a claimed job should stop.
    pub fn cancellation_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.cancellation_tokens
            .get(job_id)
            .map(|entry| entry.value().clone())
    }

    /// Reporter that feeds the coalescing aggregator.
    pub fn progress_reporter(&self, job_id: &str) -> ProgressReporter {
        ProgressReporter::new(job_id, self.progress_tx.clone())
    }

    /// Write a snapshot immediately. Applies only while the job runs and never
    /// lowers the stored percent. Returns whether the row was updated.
    pub async fn update_progress(&self, job_id: &str, snapshot: &ProgressSnapshot) -> Result<bool> {
        if self.cancellation_tokens.contains_key(job_id) {
            self.progress_cache
                .insert(job_id.to_string(), snapshot.clone());
        }
        persist_progress(self.job_repository.as_ref(), job_id, snapshot).await
    }

    /// Latest known progress for a job. Finished jobs always report the
    /// stored row.
    pub async fn progress(&self, job_id: &str) -> Result<Option<ProgressSnapshot>> {
        if self.cancellation_tokens.contains_key(job_id) {
            if let Some(snapshot) = self.progress_cache.get(job_id) {
                return Ok(Some(snapshot.clone()));
            }
        } else {
            self.progress_cache.remove(job_id);
        }
        // The row's percent is authoritative: monotonic, and 100 once completed.
        Ok(self.get_job(job_id).await?.and_then(|job| {
            let mut snapshot = job.progress?;
            snapshot.percent = job.progress_percent;
            Some(snapshot)
        }))
    }

    /// Move a job to a terminal status.
    ///
    /// Repeating the status a job already has is a no-op. Leaving a terminal
    /// status is rejected with [`Error::InvalidStateTransition`].
    pub async fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        result: JobResult,
    ) -> Result<TransitionOutcome> {
        let fields = TransitionFields {
            error_message: result
                .error
                .as_deref()
                .map(|e| truncate_chars(e, MAX_ERROR_MESSAGE_CHARS)),
            output_path: result
                .output_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            backup_path: result
                .backup_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            summary_json: result
                .summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            progress_percent: (status == JobStatus::Completed).then_some(100.0),
        };

        let outcome = self
            .job_repository
            .transition(job_id, status, &fields)
            .await?;

        self.forget(job_id);

        match outcome {
            TransitionOutcome::Applied => {
                if let Some(error_text) = &result.error {
                    error!(job_id = %job_id, status = %status, error = %error_text, "Job error");
                    self.append_log(job_id, LogLevel::Error, error_text.clone())
                        .await;
                }
                info!(job_id = %job_id, status = %status, "Job finished");
                self.append_log(job_id, LogLevel::Info, format!("Job {}", status))
                    .await;
            }
            TransitionOutcome::Unchanged => {
                debug!(job_id = %job_id, status = %status, "Job already in requested state");
            }
        }
        Ok(outcome)
    }

    /// Drop the in-process state of a job this process no longer runs. The
    /// token is tripped so anything still holding it stops.
    pub fn forget(&self, job_id: &str) {
        if let Some((_, token)) = self.cancellation_tokens.remove(job_id) {
            token.cancel();
        }
        self.progress_cache.remove(job_id);
    }

    pub async fn complete(&self, job_id: &str, result: JobResult) -> Result<TransitionOutcome> {
        self.transition(job_id, JobStatus::Completed, result).await
    }

    pub async fn fail(&self, job_id: &str, error: impl Into<String>) -> Result<TransitionOutcome> {
        self.transition(job_id, JobStatus::Failed, JobResult::failed(error))
            .await
    }

    /// Refresh the heartbeat of a job owned by `worker_id`.
    pub async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<HeartbeatAck> {
        self.job_repository.heartbeat(job_id, worker_id).await
    }

    /// Request cancellation.
    ///
    /// A queued job is cancelled at once. A running job is flagged and its
    /// worker stops it on the next poll; when that worker lives in this
    /// process the token is tripped immediately as well.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let outcome = self.job_repository.request_cancel(job_id).await?;
        match outcome {
            CancelOutcome::Cancelled => {
                info!(job_id = %job_id, "Queued job cancelled");
                self.append_log(job_id, LogLevel::Info, "Cancelled before start")
                    .await;
            }
            CancelOutcome::Requested => {
                info!(job_id = %job_id, "Cancellation requested for running job");
                self.append_log(job_id, LogLevel::Info, "Cancellation requested")
                    .await;
                if let Some(token) = self.cancellation_token(job_id) {
                    token.cancel();
                }
            }
            CancelOutcome::AlreadyFinished(status) => {
                debug!(job_id = %job_id, status = %status, "Cancel ignored for finished job");
            }
        }
        Ok(outcome)
    }

    /// Queue a fresh copy of a failed or cancelled job. The original keeps its
    /// terminal status.
    pub async fn resubmit(&self, job_id: &str) -> Result<String> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("Job", job_id))?;

        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(Error::validation(format!(
                "only failed or cancelled jobs can be resubmitted (job {} is {})",
                job_id, job.status
            )));
        }

        let row = JobDbModel::new(
            job.job_type,
            job.file_path.to_string_lossy().into_owned(),
            job.policy_json,
            job.priority,
        );
        self.job_repository.create_job(&row).await?;

        info!(job_id = %row.id, resubmitted_from = %job_id, "Job resubmitted");
        self.append_log(job_id, LogLevel::Info, format!("Resubmitted as {}", row.id))
            .await;
        self.append_log(&row.id, LogLevel::Info, format!("Resubmitted from {}", job_id))
            .await;

        Ok(row.id)
    }

    /// Put `running` jobs with a heartbeat older than `stale_after` (or none)
    /// back in the queue. Orphans with a pending cancel request end
    /// `cancelled` instead.
    pub async fn recover_orphans(&self, stale_after: Duration) -> Result<OrphanRecovery> {
        let recovered = self
            .job_repository
            .recover_orphans(ms_before_now(stale_after))
            .await?;

        if recovered.requeued > 0 || recovered.cancelled > 0 {
            warn!(
                requeued = recovered.requeued,
                cancelled = recovered.cancelled,
                stale_after_secs = stale_after.as_secs(),
                "Recovered orphaned jobs"
            );
        }
        Ok(recovered)
    }

    /// Delete terminal jobs finished more than `older_than` ago. `None` means
    /// every terminal status.
    pub async fn purge(&self, older_than: Duration, statuses: Option<&[JobStatus]>) -> Result<u64> {
        self.purge_service
            .purge(older_than, statuses.unwrap_or(&JobStatus::TERMINAL))
            .await
    }

    /// Purge using the configured retention window.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.purge_service.run_purge().await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.job_repository
            .get_job(job_id)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    /// Newest first.
    pub async fn list_jobs(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<Job>, u64)> {
        let (rows, total) = self.job_repository.list_jobs(filters, pagination).await?;
        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((jobs, total))
    }

    /// Oldest first.
    pub async fn job_logs(
        &self,
        job_id: &str,
        pagination: &Pagination,
    ) -> Result<(Vec<JobLogEntry>, u64)> {
        let (rows, total) = self.job_repository.list_logs(job_id, pagination).await?;
        Ok((rows.into_iter().map(JobLogEntry::from).collect(), total))
    }

    /// Append a line to the job's history. Failures are logged, not returned.
    pub async fn append_log(&self, job_id: &str, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        if let Err(e) = self
            .job_repository
            .add_log(job_id, level.as_str(), &message)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to persist job log entry");
        }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = self.job_repository.count_by_status().await?;
        Ok(QueueStats {
            total: counts.total(),
            counts,
        })
    }
}

/// Keep at most `max` characters, respecting char boundaries.
fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

async fn persist_progress(
    repo: &dyn JobRepository,
    job_id: &str,
    snapshot: &ProgressSnapshot,
) -> Result<bool> {
    let json = serde_json::to_string(snapshot)?;
    repo.update_progress(job_id, snapshot.percent, Some(&json))
        .await
}

fn spawn_progress_aggregator(
    repo: Arc<dyn JobRepository>,
    mut rx: mpsc::Receiver<ProgressUpdate>,
    progress_cache: Arc<DashMap<String, ProgressSnapshot>>,
    live_jobs: Arc<DashMap<String, CancellationToken>>,
    flush_every: Duration,
) {
    if tokio::runtime::Handle::try_current().is_err() {
        // Without a runtime there is nothing to persist progress with.
        return;
    }

    tokio::spawn(async move {
        let mut pending: HashMap<String, ProgressSnapshot> = HashMap::new();
        let mut tick = tokio::time::interval(flush_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    flush_pending(repo.as_ref(), &mut pending).await;
                }
                update = rx.recv() => {
                    let Some(update) = update else {
                        flush_pending(repo.as_ref(), &mut pending).await;
                        break;
                    };
                    // Updates still buffered after a job finished must not
                    // revive its cache entry.
                    if live_jobs.contains_key(&update.job_id) {
                        progress_cache.insert(update.job_id.clone(), update.snapshot.clone());
                    }
                    pending.insert(update.job_id, update.snapshot);
                }
            }
        }
    });
}

async fn flush_pending(repo: &dyn JobRepository, pending: &mut HashMap<String, ProgressSnapshot>) {
    for (job_id, snapshot) in pending.drain() {
        if let Err(e) = persist_progress(repo, &job_id, &snapshot).await {
            debug!(job_id = %job_id, error = %e, "Dropping progress update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};
    use crate::progress::ProgressUnit;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, JobQueue) {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("jobs.db").to_string_lossy().replace('\\', "/")
        );
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, JobQueue::from_pool(pool))
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_enqueue_validates_input() {
        let (_dir, queue) = setup().await;
        let err = queue
            .enqueue(JobType::Move, "  ", &json!({}), DEFAULT_PRIORITY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = queue
            .enqueue(JobType::Move, "/a.mkv", &json!([1, 2]), DEFAULT_PRIORITY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_error_message_truncated_but_logged_in_full() {
        let (_dir, queue) = setup().await;
        let id = queue
            .enqueue(JobType::Move, "/a.mkv", &json!({}), DEFAULT_PRIORITY)
            .await
            .unwrap();
        queue.claim_next("w1").await.unwrap().unwrap();

        let long = "x".repeat(MAX_ERROR_MESSAGE_CHARS + 100);
        queue.fail(&id, long.clone()).await.unwrap();

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.unwrap().chars().count(),
            MAX_ERROR_MESSAGE_CHARS
        );

        let (logs, _) = queue.job_logs(&id, &Pagination::default()).await.unwrap();
        assert!(logs.iter().any(|l| l.level == LogLevel::Error && l.message == long));
    }

    #[tokio::test]
    async fn test_cancel_paths() {
        let (_dir, queue) = setup().await;
        let queued = queue
            .enqueue(JobType::Move, "/a.mkv", &json!({}), 1)
            .await
            .unwrap();
        let running = queue
            .enqueue(JobType::Move, "/b.mkv", &json!({}), 2)
            .await
            .unwrap();

        assert_eq!(queue.cancel(&queued).await.unwrap(), CancelOutcome::Cancelled);

        let claimed = queue.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, running);
        let token = queue.cancellation_token(&running).unwrap();
        assert_eq!(queue.cancel(&running).await.unwrap(), CancelOutcome::Requested);
        assert!(token.is_cancelled());

        assert_eq!(
            queue.cancel(&queued).await.unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
        );
        assert!(matches!(
            queue.cancel("nope").await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_resubmit_creates_new_job() {
        let (_dir, queue) = setup().await;
        let id = queue
            .enqueue(JobType::Transcode, "/a.mkv", &json!({"target_video_codec": "hevc"}), 7)
            .await
            .unwrap();

        let err = queue.resubmit(&id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        queue.cancel(&id).await.unwrap();
        let new_id = queue.resubmit(&id).await.unwrap();
        assert_ne!(new_id, id);

        let original = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::Cancelled);
        let copy = queue.get_job(&new_id).await.unwrap().unwrap();
        assert_eq!(copy.status, JobStatus::Queued);
        assert_eq!(copy.priority, 7);
        assert_eq!(copy.policy_json, original.policy_json);
    }

    #[tokio::test]
    async fn test_progress_reporter_reaches_database() {
        let (_dir, queue) = setup().await;
        let id = queue
            .enqueue(JobType::Move, "/a.mkv", &json!({}), 1)
            .await
            .unwrap();
        queue.claim_next("w1").await.unwrap();

        let mut snapshot = ProgressSnapshot::new(ProgressUnit::Frames);
        snapshot.percent = 42.0;
        queue.progress_reporter(&id).report(snapshot);

        let mut stored = 0.0;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stored = queue.get_job(&id).await.unwrap().unwrap().progress_percent;
            if stored > 0.0 {
                break;
            }
        }
        assert_eq!(stored, 42.0);
        assert_eq!(queue.progress(&id).await.unwrap().unwrap().percent, 42.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffered_progress_does_not_outlive_completion() {
        let (_dir, queue) = setup().await;
        let id = queue
            .enqueue(JobType::Move, "/a.mkv", &json!({}), 1)
            .await
            .unwrap();
        queue.claim_next("w1").await.unwrap();

        let mut stored = ProgressSnapshot::new(ProgressUnit::Frames);
        stored.percent = 10.0;
        queue.update_progress(&id, &stored).await.unwrap();

        let reporter = queue.progress_reporter(&id);
        for percent in [30.0, 50.0, 70.0] {
            let mut snapshot = ProgressSnapshot::new(ProgressUnit::Frames);
            snapshot.percent = percent;
            reporter.report(snapshot);
        }
        queue.complete(&id, JobResult::default()).await.unwrap();

        // Let the aggregator drain whatever was still buffered.
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!queue.progress_cache.contains_key(&id));
        assert_eq!(queue.progress(&id).await.unwrap().map(|p| p.percent), Some(100.0));
        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_ignored_for_finished_job() {
        let (_dir, queue) = setup().await;
        let id = queue
            .enqueue(JobType::Move, "/a.mkv", &json!({}), 1)
            .await
            .unwrap();
        queue.claim_next("w1").await.unwrap();
        queue.complete(&id, JobResult::default()).await.unwrap();

        let mut snapshot = ProgressSnapshot::new(ProgressUnit::Frames);
        snapshot.percent = 99.5;
        queue.progress_cache.insert(id.clone(), snapshot);

        assert_eq!(queue.progress(&id).await.unwrap().map(|p| p.percent), None);
        assert!(!queue.progress_cache.contains_key(&id));
    }

    #[tokio::test]
    async fn test_repeated_failure_logs_error_once() {
        let (_dir, queue) = setup().await;
        let id = queue
            .enqueue(JobType::Move, "/a.mkv", &json!({}), 1)
            .await
            .unwrap();
        queue.claim_next("w1").await.unwrap();

        assert_eq!(queue.fail(&id, "boom").await.unwrap(), TransitionOutcome::Applied);
        assert_eq!(queue.fail(&id, "boom").await.unwrap(), TransitionOutcome::Unchanged);
        let err = queue
            .transition(&id, JobStatus::Cancelled, JobResult::failed("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let (logs, _) = queue.job_logs(&id, &Pagination::default()).await.unwrap();
        let errors: Vec<_> = logs
            .iter()
            .filter(|l| l.level == LogLevel::Error)
            .map(|l| l.message.as_str())
            .collect();
        assert_eq!(errors, vec!["boom"]);
    }

    #[tokio::test]
    async fn test_forget_drops_live_state() {
        let (_dir, queue) = setup().await;
        let id = queue
            .enqueue(JobType::Move, "/a.mkv", &json!({}), 1)
            .await
            .unwrap();
        queue.claim_next("w1").await.unwrap();

        let mut snapshot = ProgressSnapshot::new(ProgressUnit::Frames);
        snapshot.percent = 20.0;
        queue.update_progress(&id, &snapshot).await.unwrap();
        let token = queue.cancellation_token(&id).unwrap();
        assert!(queue.progress_cache.contains_key(&id));

        queue.forget(&id);
        assert!(token.is_cancelled());
        assert!(queue.cancellation_token(&id).is_none());
        assert!(!queue.progress_cache.contains_key(&id));

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, queue) = setup().await;
        for i in 0..3 {
            queue
                .enqueue(JobType::Move, format!("/{i}.mkv"), &json!({}), 1)
                .await
                .unwrap();
        }
        queue.claim_next("w1").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.counts.queued, 2);
        assert_eq!(stats.counts.running, 1);
        assert_eq!(stats.total, 3);
    }
}
