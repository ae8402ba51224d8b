use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use vpo_worker::config::WorkerConfig;
use vpo_worker::database;
use vpo_worker::executor::ExecutorRegistry;
use vpo_worker::jobs::{JobQueue, JobQueueConfig};
use vpo_worker::logging::init_logging;
use vpo_worker::worker::{Worker, spawn_signal_listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;

    // Keep the guard alive so buffered file output is flushed on exit.
    let (logging, _log_guard) = init_logging(&config.log_dir)?;
    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let queue = Arc::new(JobQueue::new(
        JobQueueConfig::default(),
        config.purge_config(),
        Arc::new(database::repositories::SqlxJobRepository::new(pool.clone())),
    ));
    let registry = ExecutorRegistry::with_defaults(&config.ffmpeg_path, &config.ffprobe_path);
    let worker = Worker::new(queue, registry, &config);

    let _signals = spawn_signal_listener(worker.shutdown_token());

    info!(worker_id = %worker.worker_id(), database = %config.database_url, "vpo-worker started");
    let summary = worker.run(config.limits()?).await?;
    info!(summary = %serde_json::to_string(&summary)?, "Run complete");

    background.cancel();
    pool.close().await;
    Ok(())
}
