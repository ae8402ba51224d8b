//! Job repository.
//!
//! Every state change is a single conditional statement (or one
//! `BEGIN IMMEDIATE` transaction), so concurrent workers and submitters
//! sharing the database file never observe a half-applied transition.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::begin_immediate;
use crate::database::models::{
    JobCounts, JobDbModel, JobFilters, JobLogDbModel, JobStatus, Pagination,
};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Result fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub error_message: Option<String>,
    pub output_path: Option<String>,
    pub backup_path: Option<String>,
    pub summary_json: Option<String>,
    pub progress_percent: Option<f64>,
}

/// What a transition request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row moved to the requested status.
    Applied,
    /// The row was already in the requested terminal status.
    Unchanged,
}

/// What a cancellation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A queued job was cancelled directly.
    Cancelled,
    /// A running job was flagged; its worker will stop it.
    Requested,
    /// The job had already finished; nothing changed.
    AlreadyFinished(JobStatus),
}

/// Heartbeat acknowledgement for the owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAck {
    /// Still owned; carries the cancellation flag.
    Owned { cancel_requested: bool },
    /// The job is no longer running under this worker.
    Lost,
}

/// Counts from one orphan recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanRecovery {
    /// Orphans put back into the queue.
    pub requeued: u64,
    /// Orphans that had a pending cancellation and were finished as cancelled.
    pub cancelled: u64,
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<JobDbModel>>;
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn claim_next(&self, worker_id: &str) -> Result<Option<JobDbModel>>;
    async fn update_progress(
        &self,
        id: &str,
        percent: f64,
        progress_json: Option<&str>,
    ) -> Result<bool>;
    async fn transition(
        &self,
        id: &str,
        to: JobStatus,
        fields: &TransitionFields,
    ) -> Result<TransitionOutcome>;
    async fn heartbeat(&self, id: &str, worker_id: &str) -> Result<HeartbeatAck>;
    async fn request_cancel(&self, id: &str) -> Result<CancelOutcome>;
    async fn recover_orphans(&self, stale_before_ms: i64) -> Result<OrphanRecovery>;
    async fn purge_terminal(
        &self,
        completed_before_ms: i64,
        statuses: &[JobStatus],
        batch_size: u32,
    ) -> Result<u64>;
    async fn list_jobs(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<JobDbModel>, u64)>;
    async fn count_by_status(&self) -> Result<JobCounts>;

    // Job logs
    async fn add_log(&self, job_id: &str, level: &str, message: &str) -> Result<()>;
    async fn list_logs(
        &self,
        job_id: &str,
        pagination: &Pagination,
    ) -> Result<(Vec<JobLogDbModel>, u64)>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// `'a','b'` list for an `IN (...)` clause built from fixed status names.
fn status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &JobFilters) {
    if let Some(status) = filters.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(job_type) = filters.job_type {
        qb.push(" AND job_type = ").push_bind(job_type.as_str());
    }
    if let Some(since) = filters.created_since {
        qb.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = filters.created_until {
        qb.push(" AND created_at < ").push_bind(until);
    }
    if let Some(needle) = &filters.file_path_contains {
        qb.push(" AND instr(file_path, ")
            .push_bind(needle.clone())
            .push(") > 0");
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, file_path, job_type, status, priority, policy_json,
                progress_percent, progress_json, created_at, started_at, completed_at,
                worker_id, worker_heartbeat, cancel_requested,
                output_path, backup_path, error_message, summary_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.file_path)
        .bind(&job.job_type)
        .bind(&job.status)
        .bind(job.priority)
        .bind(&job.policy_json)
        .bind(job.progress_percent)
        .bind(&job.progress_json)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.worker_id)
        .bind(job.worker_heartbeat)
        .bind(job.cancel_requested)
        .bind(&job.output_path)
        .bind(&job.backup_path)
        .bind(&job.error_message)
        .bind(&job.summary_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<JobDbModel>> {
        let mut tx = begin_immediate(&self.pool).await?;

        let candidate = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'queued'
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut job) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        let now = now_ms();
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'running',
                worker_id = ?,
                worker_heartbeat = ?,
                started_at = ?,
                progress_percent = 0.0,
                progress_json = NULL,
                cancel_requested = 0
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;

        job.status = JobStatus::Running.as_str().to_string();
        job.worker_id = Some(worker_id.to_string());
        job.worker_heartbeat = Some(now);
        job.started_at = Some(now);
        job.progress_percent = 0.0;
        job.progress_json = None;
        job.cancel_requested = false;
        Ok(Some(job))
    }

    async fn update_progress(
        &self,
        id: &str,
        percent: f64,
        progress_json: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                progress_percent = MAX(progress_percent, ?),
                progress_json = COALESCE(?, progress_json)
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(percent.clamp(0.0, 100.0))
        .bind(progress_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition(
        &self,
        id: &str,
        to: JobStatus,
        fields: &TransitionFields,
    ) -> Result<TransitionOutcome> {
        if !to.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: "any".to_string(),
                to: to.to_string(),
            });
        }

        let sql = format!(
            r#"
            UPDATE jobs SET
                status = ?,
                completed_at = ?,
                worker_id = NULL,
                worker_heartbeat = NULL,
                error_message = COALESCE(?, error_message),
                output_path = COALESCE(?, output_path),
                backup_path = COALESCE(?, backup_path),
                summary_json = COALESCE(?, summary_json),
                progress_percent = COALESCE(?, progress_percent)
            WHERE id = ? AND status IN ({})
            "#,
            status_list(to.transition_sources())
        );

        let result = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(now_ms())
            .bind(&fields.error_message)
            .bind(&fields.output_path)
            .bind(&fields.backup_path)
            .bind(&fields.summary_json)
            .bind(fields.progress_percent)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(TransitionOutcome::Applied);
        }

        // Terminal states are absorbing, so reading after the failed update
        // cannot race with another writer changing the answer.
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match current.as_deref().and_then(JobStatus::parse) {
            None => Err(Error::not_found("Job", id)),
            Some(current) if current == to => Ok(TransitionOutcome::Unchanged),
            Some(current) => Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: to.to_string(),
            }),
        }
    }

    async fn heartbeat(&self, id: &str, worker_id: &str) -> Result<HeartbeatAck> {
        let flag: Option<bool> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET worker_heartbeat = ?
            WHERE id = ? AND status = 'running' AND worker_id = ?
            RETURNING cancel_requested
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match flag {
            Some(cancel_requested) => HeartbeatAck::Owned { cancel_requested },
            None => HeartbeatAck::Lost,
        })
    }

    async fn request_cancel(&self, id: &str) -> Result<CancelOutcome> {
        let mut tx = begin_immediate(&self.pool).await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(status) = status.as_deref().and_then(JobStatus::parse) else {
            tx.rollback().await?;
            return Err(Error::not_found("Job", id));
        };

        let outcome = match status {
            JobStatus::Queued => {
                sqlx::query(
                    "UPDATE jobs SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = 'queued'",
                )
                .bind(now_ms())
                .bind(id)
                .execute(&mut *tx)
                .await?;
                CancelOutcome::Cancelled
            }
            JobStatus::Running => {
                sqlx::query(
                    "UPDATE jobs SET cancel_requested = 1 WHERE id = ? AND status = 'running'",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                CancelOutcome::Requested
            }
            terminal => CancelOutcome::AlreadyFinished(terminal),
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn recover_orphans(&self, stale_before_ms: i64) -> Result<OrphanRecovery> {
        let mut tx = begin_immediate(&self.pool).await?;
        let now = now_ms();

        // A crashed run that was already asked to stop finishes as cancelled.
        let cancelled = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'cancelled',
                completed_at = ?,
                worker_id = NULL,
                worker_heartbeat = NULL
            WHERE status = 'running'
              AND cancel_requested = 1
              AND (worker_heartbeat IS NULL OR worker_heartbeat < ?)
            "#,
        )
        .bind(now)
        .bind(stale_before_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'queued',
                started_at = NULL,
                worker_id = NULL,
                worker_heartbeat = NULL,
                progress_percent = 0.0,
                progress_json = NULL
            WHERE status = 'running'
              AND (worker_heartbeat IS NULL OR worker_heartbeat < ?)
            "#,
        )
        .bind(stale_before_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(OrphanRecovery {
            requeued,
            cancelled,
        })
    }

    async fn purge_terminal(
        &self,
        completed_before_ms: i64,
        statuses: &[JobStatus],
        batch_size: u32,
    ) -> Result<u64> {
        let terminal: Vec<JobStatus> = statuses
            .iter()
            .copied()
            .filter(JobStatus::is_terminal)
            .collect();
        if terminal.is_empty() {
            return Ok(0);
        }

        // Logs go with their job through ON DELETE CASCADE.
        let sql = format!(
            r#"
            DELETE FROM jobs WHERE id IN (
                SELECT id FROM jobs
                WHERE status IN ({})
                  AND completed_at IS NOT NULL
                  AND completed_at < ?
                LIMIT ?
            )
            "#,
            status_list(&terminal)
        );

        let result = sqlx::query(&sql)
            .bind(completed_before_ms)
            .bind(i64::from(batch_size.max(1)))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_jobs(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<JobDbModel>, u64)> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs WHERE 1 = 1");
        push_filters(&mut count_qb, filters);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE 1 = 1");
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(pagination.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(pagination.offset));

        let jobs = qb
            .build_query_as::<JobDbModel>()
            .fetch_all(&self.pool)
            .await?;

        Ok((jobs, total.max(0) as u64))
    }

    async fn count_by_status(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => counts.queued = count,
                Some(JobStatus::Running) => counts.running = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::Failed) => counts.failed = count,
                Some(JobStatus::Cancelled) => counts.cancelled = count,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn add_log(&self, job_id: &str, level: &str, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_logs (job_id, level, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(level)
        .bind(message)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(
        &self,
        job_id: &str,
        pagination: &Pagination,
    ) -> Result<(Vec<JobLogDbModel>, u64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_logs WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;

        let logs = sqlx::query_as::<_, JobLogDbModel>(
            "SELECT * FROM job_logs WHERE job_id = ? ORDER BY id ASC LIMIT ? OFFSET ?",
        )
        .bind(job_id)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&self.pool)
        .await?;

        Ok((logs, total.max(0) as u64))
    }
}
