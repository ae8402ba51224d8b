//! Durable job queue: domain types, lifecycle rules, queue service and
//! retention purge.

mod job;
mod purge;
mod queue;
mod state;

pub use job::{Job, JobLogEntry, LogLevel};
pub use purge::{JobPurgeService, PurgeConfig};
pub use queue::{
    DEFAULT_PRIORITY, JobQueue, JobQueueConfig, JobResult, MAX_ERROR_MESSAGE_CHARS, QueueStats,
};

pub use crate::database::models::{JobCounts, JobFilters, JobStatus, JobType, Pagination};
pub use crate::database::repositories::{
    CancelOutcome, HeartbeatAck, OrphanRecovery, TransitionOutcome,
};
