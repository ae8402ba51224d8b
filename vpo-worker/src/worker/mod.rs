//! The worker loop: recover, purge, then claim and run jobs one at a time
//! until a limit is reached or the queue is empty.

pub mod limits;
pub mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use serde_json::Value;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::executor::{ExecutionContext, ExecutionOutcome, ExecutorRegistry};
use crate::jobs::{HeartbeatAck, Job, JobQueue, JobResult, JobStatus, LogLevel};
use crate::{Error, Result};

pub use limits::{JobLimits, StopReason, WorkerSummary, end_by_deadline, parse_end_by};
pub use shutdown::spawn_signal_listener;

/// Timing knobs for the per-job monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub heartbeat_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub max_heartbeat_failures: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            cancel_poll_interval: Duration::from_secs(2),
            max_heartbeat_failures: 3,
        }
    }
}

/// Single-job-at-a-time queue consumer.
pub struct Worker {
    queue: Arc<JobQueue>,
    registry: ExecutorRegistry,
    worker_id: String,
    stale_after: Duration,
    monitor: MonitorSettings,
    temp_root: Option<PathBuf>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>, registry: ExecutorRegistry, config: &WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            worker_id: config.resolved_worker_id(),
            stale_after: config.stale_after(),
            monitor: MonitorSettings {
                heartbeat_interval: config.heartbeat_interval(),
                cancel_poll_interval: config.cancel_poll_interval(),
                max_heartbeat_failures: config.max_heartbeat_failures,
            },
            temp_root: config.temp_dir.clone(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Cancelling this token stops the current job (it ends `cancelled`) and
    /// ends the run.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Process jobs until a limit is hit, the queue is empty or shutdown is
    /// requested.
    pub async fn run(&self, limits: JobLimits) -> Result<WorkerSummary> {
        info!(worker_id = %self.worker_id, ?limits, "Worker starting");
        let started = Instant::now();
        let deadline = limits
            .end_by
            .map(|end_by| end_by_deadline(Local::now().naive_local(), end_by));

        let mut summary = WorkerSummary::default();

        let recovered = self.queue.recover_orphans(self.stale_after).await?;
        summary.recovered = recovered.requeued + recovered.cancelled;

        match self.queue.purge_expired().await {
            Ok(purged) => summary.purged = purged,
            Err(e) => warn!(error = %e, "Job purge failed, continuing"),
        }

        summary.stop_reason = loop {
            if let Some(reason) = self.limit_reached(&limits, &summary, started, deadline) {
                break reason;
            }

            let Some(job) = self.queue.claim_next(&self.worker_id).await? else {
                break StopReason::QueueEmpty;
            };

            match self.process_job(job, &limits).await {
                Some(status) => summary.record(status),
                None => summary.record_lost(),
            }
        };

        info!(
            worker_id = %self.worker_id,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            stop_reason = %summary.stop_reason,
            "Worker stopped"
        );
        Ok(summary)
    }

    fn limit_reached(
        &self,
        limits: &JobLimits,
        summary: &WorkerSummary,
        started: Instant,
        deadline: Option<NaiveDateTime>,
    ) -> Option<StopReason> {
        if self.shutdown.is_cancelled() {
            return Some(StopReason::Shutdown);
        }
        if let Some(max_files) = limits.max_files
            && summary.processed >= max_files
        {
            info!(max_files, "Reached max files limit");
            return Some(StopReason::MaxFiles);
        }
        if let Some(max_duration) = limits.max_duration
            && started.elapsed() >= max_duration
        {
            info!(max_duration_secs = max_duration.as_secs(), "Reached max duration limit");
            return Some(StopReason::MaxDuration);
        }
        if let Some(deadline) = deadline
            && Local::now().naive_local() >= deadline
        {
            info!(%deadline, "Reached end time");
            return Some(StopReason::EndTime);
        }
        None
    }

    /// Run one claimed job to a terminal state. `None` when ownership was
    /// lost and the row was left for orphan recovery.
    async fn process_job(&self, job: Job, limits: &JobLimits) -> Option<JobStatus> {
        let job_id = job.id.clone();
        let token = self
            .queue
            .cancellation_token(&job_id)
            .unwrap_or_default();

        let stop_monitor = CancellationToken::new();
        let monitor = tokio::spawn(monitor_job(
            self.queue.clone(),
            job_id.clone(),
            self.worker_id.clone(),
            token.clone(),
            self.shutdown.clone(),
            self.monitor,
            stop_monitor.clone(),
        ));

        let result = match self.registry.get(job.job_type) {
            Some(executor) => {
                debug!(job_id = %job_id, executor = executor.name(), "Dispatching job");
                let ctx = ExecutionContext::new(token.clone(), self.queue.progress_reporter(&job_id))
                    .with_cpu_cores(limits.cpu_cores)
                    .with_temp_root(self.temp_root.clone());
                executor.execute(&job, &ctx).await
            }
            None => Err(Error::validation(format!(
                "no executor registered for job type {}",
                job.job_type
            ))),
        };

        stop_monitor.cancel();
        let lost = match monitor.await {
            Ok(lost) => lost,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job monitor task failed");
                false
            }
        };

        if lost {
            warn!(
                job_id = %job_id,
                "Lost ownership of job; leaving it for orphan recovery"
            );
            self.queue.forget(&job_id);
            return None;
        }

        let (status, transition) = match result {
            Ok(outcome) => {
                if let Some(reason) = &outcome.skipped {
                    self.queue
                        .append_log(&job_id, LogLevel::Info, format!("Skipped: {}", reason))
                        .await;
                }
                let result = completed_result(outcome);
                (
                    JobStatus::Completed,
                    self.queue.complete(&job_id, result).await,
                )
            }
            Err(e) if e.is_cancelled() => {
                let reason = if self.shutdown.is_cancelled() {
                    "cancelled by worker shutdown"
                } else {
                    "cancelled on request"
                };
                self.queue.append_log(&job_id, LogLevel::Warn, reason).await;
                (
                    JobStatus::Cancelled,
                    self.queue
                        .transition(&job_id, JobStatus::Cancelled, JobResult::default())
                        .await,
                )
            }
            Err(e) => (JobStatus::Failed, self.queue.fail(&job_id, e.to_string()).await),
        };

        if let Err(e) = transition {
            error!(job_id = %job_id, status = %status, error = %e, "Failed to record job outcome");
        }
        Some(status)
    }
}

/// Fold the skip reason into the stored summary.
fn completed_result(outcome: ExecutionOutcome) -> JobResult {
    let mut summary = outcome.summary;
    if let Some(reason) = outcome.skipped {
        match &mut summary {
            Value::Object(map) => {
                map.entry("skipped").or_insert(Value::String(reason));
            }
            _ => summary = serde_json::json!({ "skipped": reason }),
        }
    }

    JobResult {
        output_path: outcome.output_path,
        backup_path: outcome.backup_path,
        error: None,
        summary: (!summary.is_null()).then_some(summary),
    }
}

/// Heartbeat and cancel-poll side task for one running job.
///
/// Trips `token` when cancellation is requested (row flag or shutdown) or
/// ownership is lost. Returns whether ownership was lost.
async fn monitor_job(
    queue: Arc<JobQueue>,
    job_id: String,
    worker_id: String,
    token: CancellationToken,
    shutdown: CancellationToken,
    settings: MonitorSettings,
    stop: CancellationToken,
) -> bool {
    let start = tokio::time::Instant::now();
    let mut heartbeat = interval_at(start + settings.heartbeat_interval, settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll = interval_at(
        start + settings.cancel_poll_interval,
        settings.cancel_poll_interval,
    );
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return false,
            _ = shutdown.cancelled(), if !token.is_cancelled() => {
                info!(job_id = %job_id, "Shutdown requested, cancelling job");
                token.cancel();
            }
            _ = heartbeat.tick() => match queue.heartbeat(&job_id, &worker_id).await {
                Ok(HeartbeatAck::Owned { cancel_requested }) => {
                    failures = 0;
                    if cancel_requested && !token.is_cancelled() {
                        info!(job_id = %job_id, "Cancellation requested");
                        token.cancel();
                    }
                }
                Ok(HeartbeatAck::Lost) => {
                    warn!(job_id = %job_id, "Heartbeat rejected, job no longer owned");
                    token.cancel();
                    return true;
                }
                Err(e) => {
                    failures += 1;
                    warn!(job_id = %job_id, failures, error = %e, "Heartbeat failed");
                    if failures >= settings.max_heartbeat_failures {
                        error!(job_id = %job_id, "Too many heartbeat failures, abandoning job");
                        token.cancel();
                        return true;
                    }
                }
            },
            _ = poll.tick() => match queue.get_job(&job_id).await {
                Ok(Some(job)) => {
                    let owned = job.status == JobStatus::Running
                        && job.worker_id.as_deref() == Some(worker_id.as_str());
                    if !owned {
                        warn!(job_id = %job_id, status = %job.status, "Job no longer owned");
                        token.cancel();
                        return true;
                    }
                    if job.cancel_requested && !token.is_cancelled() {
                        info!(job_id = %job_id, "Cancellation requested");
                        token.cancel();
                    }
                }
                Ok(None) => {
                    warn!(job_id = %job_id, "Job row disappeared");
                    token.cancel();
                    return true;
                }
                Err(e) => debug!(job_id = %job_id, error = %e, "Cancel poll failed"),
            },
        }
    }
}
