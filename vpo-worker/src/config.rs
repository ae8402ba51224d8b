//! Worker configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::PurgeConfig;
use crate::worker::limits::{JobLimits, parse_end_by};
use crate::{Error, Result};

fn default_database_url() -> String {
    "sqlite:vpo.db?mode=rwc".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_stale_secs() -> u64 {
    300
}

fn default_cancel_poll_ms() -> u64 {
    2000
}

fn default_max_heartbeat_failures() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    30
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

/// Everything the worker binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Root for job temp directories. `None` keeps them next to outputs.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Stable worker identity. Generated per process when unset.
    #[serde(default)]
    pub worker_id: Option<String>,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    /// A running job whose heartbeat is older than this is an orphan.
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_interval_ms: u64,

    /// Consecutive heartbeat failures before the job is treated as lost.
    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,

    /// 0 disables purging.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default)]
    pub max_files: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    /// `HH:MM`, local time.
    #[serde(default)]
    pub end_by: Option<String>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            temp_dir: None,
            worker_id: None,
            heartbeat_interval_secs: default_heartbeat_secs(),
            stale_after_secs: default_stale_secs(),
            cancel_poll_interval_ms: default_cancel_poll_ms(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
            retention_days: default_retention_days(),
            max_files: None,
            max_duration_secs: None,
            end_by: None,
            cpu_cores: None,
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl WorkerConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = get("VPO_LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VPO_TEMP_DIR") {
            config.temp_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("VPO_WORKER_ID") {
            config.worker_id = Some(v);
        }
        if let Some(v) = get("VPO_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse_var("VPO_HEARTBEAT_SECS", &v)?;
        }
        if let Some(v) = get("VPO_STALE_SECS") {
            config.stale_after_secs = parse_var("VPO_STALE_SECS", &v)?;
        }
        if let Some(v) = get("VPO_CANCEL_POLL_MS") {
            config.cancel_poll_interval_ms = parse_var("VPO_CANCEL_POLL_MS", &v)?;
        }
        if let Some(v) = get("VPO_RETENTION_DAYS") {
            config.retention_days = parse_var("VPO_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("VPO_MAX_FILES") {
            config.max_files = Some(parse_var("VPO_MAX_FILES", &v)?);
        }
        if let Some(v) = get("VPO_MAX_DURATION_SECS") {
            config.max_duration_secs = Some(parse_var("VPO_MAX_DURATION_SECS", &v)?);
        }
        if let Some(v) = get("VPO_END_BY") {
            config.end_by = Some(v);
        }
        if let Some(v) = get("VPO_CPU_CORES") {
            config.cpu_cores = Some(parse_var("VPO_CPU_CORES", &v)?);
        }
        if let Some(v) = get("FFMPEG_PATH") {
            config.ffmpeg_path = PathBuf::from(v);
        }
        if let Some(v) = get("FFPROBE_PATH") {
            config.ffprobe_path = PathBuf::from(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(Error::config("heartbeat interval must be positive"));
        }
        if self.heartbeat_interval_secs >= self.stale_after_secs {
            return Err(Error::config(format!(
                "heartbeat interval ({}s) must be shorter than the stale threshold ({}s)",
                self.heartbeat_interval_secs, self.stale_after_secs
            )));
        }
        if self.cancel_poll_interval_ms == 0 {
            return Err(Error::config("cancel poll interval must be positive"));
        }
        if self.max_heartbeat_failures == 0 {
            return Err(Error::config("max heartbeat failures must be positive"));
        }
        if self.cpu_cores == Some(0) {
            return Err(Error::config("cpu cores must be positive"));
        }
        if let Some(end_by) = &self.end_by {
            parse_end_by(end_by)?;
        }
        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_heartbeat(mut self, interval_secs: u64, stale_after_secs: u64) -> Self {
        self.heartbeat_interval_secs = interval_secs;
        self.stale_after_secs = stale_after_secs;
        self
    }

    pub fn with_cancel_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.cancel_poll_interval_ms = interval_ms;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn purge_config(&self) -> PurgeConfig {
        PurgeConfig::new().with_retention_days(self.retention_days)
    }

    /// Run limits from the `VPO_MAX_*`, `VPO_END_BY` and `VPO_CPU_CORES`
    /// settings.
    pub fn limits(&self) -> Result<JobLimits> {
        Ok(JobLimits {
            max_files: self.max_files,
            max_duration: self.max_duration_secs.map(Duration::from_secs),
            end_by: self.end_by.as_deref().map(parse_end_by).transpose()?,
            cpu_cores: self.cpu_cores,
        })
    }

    /// Configured worker id, or one unique to this process.
    pub fn resolved_worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("worker-{}-{}", std::process::id(), &suffix[..8])
        })
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid {}='{}': {}", key, value, e)))
}
