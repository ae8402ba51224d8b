//! Job executors.
//!
//! An executor turns one claimed [`Job`] into an [`ExecutionOutcome`]. The
//! worker owns the job lifecycle; executors only do the work, honour the
//! cancellation token and report progress.

pub mod command;
pub mod move_file;
pub mod probe;
pub mod resource;
pub mod template;
pub mod transcode;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::database::models::JobType;
use crate::jobs::Job;
use crate::progress::ProgressReporter;

pub use move_file::{MoveConfig, MoveExecutor};
pub use probe::{AudioTrack, FfprobeProbe, MediaInfo, MediaProbe};
pub use resource::{DiskSpace, DiskSpaceStatus, SystemDiskSpace};
pub use transcode::{TranscodeConfig, TranscodeExecutor};

/// Per-run inputs handed to an executor alongside the job.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
    /// Thread cap for the encoder, if limited.
    pub cpu_cores: Option<u32>,
    /// Where job temp directories go. `None` means next to the output.
    pub temp_root: Option<PathBuf>,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            cancel,
            progress,
            cpu_cores: None,
            temp_root: None,
        }
    }

    pub fn with_cpu_cores(mut self, cpu_cores: Option<u32>) -> Self {
        self.cpu_cores = cpu_cores;
        self
    }

    pub fn with_temp_root(mut self, temp_root: Option<PathBuf>) -> Self {
        self.temp_root = temp_root;
        self
    }
}

/// What a successful execution produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub output_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    /// Set when the executor decided there was nothing to do.
    pub skipped: Option<String>,
    pub summary: serde_json::Value,
}

impl ExecutionOutcome {
    pub fn skipped(reason: impl Into<String>, summary: serde_json::Value) -> Self {
        Self {
            skipped: Some(reason.into()),
            summary,
            ..Default::default()
        }
    }
}

/// Executes one kind of job.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The job type this executor handles.
    fn job_type(&self) -> JobType;

    fn name(&self) -> &'static str;

    /// Run the job.
    ///
    /// # Cancel Safety
    ///
    /// Implementations must return [`crate::Error::Cancelled`] promptly once
    /// `ctx.cancel` fires and must leave the source file as it was.
    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<ExecutionOutcome>;
}

/// Executors keyed by job type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transcode and move executors using the given tool paths.
    pub fn with_defaults(ffmpeg_path: impl Into<PathBuf>, ffprobe_path: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(
            TranscodeExecutor::new(ffmpeg_path).with_probe(Arc::new(FfprobeProbe::new(ffprobe_path))),
        ));
        registry.register(Arc::new(MoveExecutor::new()));
        registry
    }

    /// Register an executor, replacing any previous one for the same type.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.job_type(), executor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&job_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.executors.values().map(|e| e.name()).collect();
        names.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &names)
            .finish()
    }
}
