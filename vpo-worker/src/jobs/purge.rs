//! Retention purge for finished jobs.
//!
//! Deletes terminal jobs whose `completed_at` is older than the retention
//! window, in bounded batches so the write lock is never held for long.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;
use crate::database::models::JobStatus;
use crate::database::repositories::JobRepository;
use crate::database::time::ms_before_now;

/// Configuration for job purging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Number of days to retain finished jobs.
    /// Set to 0 to retain all jobs indefinitely.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Rows deleted per statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_retention_days() -> u32 {
    30
}

fn default_batch_size() -> u32 {
    500
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
        }
    }
}

impl PurgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Retention as a duration, `None` when purging is disabled.
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0)
            .then(|| Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60))
    }
}

/// Batched deletion of old terminal jobs.
pub struct JobPurgeService {
    config: PurgeConfig,
    job_repository: Arc<dyn JobRepository>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, job_repository: Arc<dyn JobRepository>) -> Self {
        Self {
            config,
            job_repository,
        }
    }

    /// Delete jobs in `statuses` that finished more than `older_than` ago.
    /// Non-terminal statuses are ignored.
    pub async fn purge(&self, older_than: Duration, statuses: &[JobStatus]) -> Result<u64> {
        let cutoff = ms_before_now(older_than);
        let batch_size = self.config.batch_size.max(1);
        let mut total_deleted: u64 = 0;

        loop {
            let deleted = self
                .job_repository
                .purge_terminal(cutoff, statuses, batch_size)
                .await?;
            total_deleted += deleted;

            if deleted < u64::from(batch_size) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if total_deleted > 0 {
            info!(
                deleted = total_deleted,
                older_than_secs = older_than.as_secs(),
                "Purged finished jobs"
            );
        } else {
            debug!("No jobs to purge");
        }
        Ok(total_deleted)
    }

    /// Apply the configured retention window to all terminal statuses.
    pub async fn run_purge(&self) -> Result<u64> {
        let Some(retention) = self.config.retention() else {
            debug!("Job purging disabled (retention_days = 0)");
            return Ok(0);
        };
        self.purge(retention, &JobStatus::TERMINAL).await
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_config_default() {
        let config = PurgeConfig::default();
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.batch_size, 500);
        assert_eq!(
            config.retention(),
            Some(Duration::from_secs(30 * 24 * 60 * 60))
        );
    }

    #[test]
    fn test_retention_days_zero_disables_purge() {
        let config = PurgeConfig::new().with_retention_days(0);
        assert!(config.retention().is_none());
    }

    #[test]
    fn test_batch_size_never_zero() {
        assert_eq!(PurgeConfig::new().with_batch_size(0).batch_size, 1);
    }
}
