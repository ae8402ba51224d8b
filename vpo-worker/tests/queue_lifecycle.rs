use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use vpo_worker::Error;
use vpo_worker::database::{self, DbPool};
use vpo_worker::jobs::{
    CancelOutcome, HeartbeatAck, JobFilters, JobQueue, JobResult, JobStatus, JobType, LogLevel,
    Pagination, TransitionOutcome,
};
use vpo_worker::progress::ProgressSnapshot;

async fn setup(dir: &TempDir) -> (DbPool, JobQueue) {
    let db_path = dir.path().join("queue.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = database::init_pool(&db_url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    let queue = JobQueue::from_pool(pool.clone());
    (pool, queue)
}

async fn enqueue(queue: &JobQueue, name: &str, priority: i64) -> String {
    let id = queue
        .enqueue(JobType::Transcode, format!("/media/{name}.mkv"), &json!({}), priority)
        .await
        .unwrap();
    // Keep created_at strictly increasing between submissions.
    tokio::time::sleep(Duration::from_millis(2)).await;
    id
}

#[tokio::test]
async fn claims_follow_priority_then_age() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let a = enqueue(&queue, "a", 2).await;
    let b = enqueue(&queue, "b", 1).await;
    let c = enqueue(&queue, "c", 1).await;

    let order: Vec<String> = [
        queue.claim_next("w").await.unwrap().unwrap().id,
        queue.claim_next("w").await.unwrap().unwrap().id,
        queue.claim_next("w").await.unwrap().unwrap().id,
    ]
    .into();
    assert_eq!(order, vec![b, c, a]);
    assert!(queue.claim_next("w").await.unwrap().is_none());
}

#[tokio::test]
async fn equal_priority_and_age_claim_by_id() {
    let dir = TempDir::new().unwrap();
    let (pool, queue) = setup(&dir).await;

    // Inserted out of id order, all sharing one priority and timestamp.
    for id in ["job-c", "job-a", "job-b"] {
        sqlx::query(
            "INSERT INTO jobs (id, file_path, job_type, status, priority, policy_json, created_at)
             VALUES (?, ?, 'move', 'queued', 5, '{}', 1700000000000)",
        )
        .bind(id)
        .bind(format!("/media/{id}.mkv"))
        .execute(&pool)
        .await
        .unwrap();
    }

    let mut order = Vec::new();
    while let Some(job) = queue.claim_next("w").await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec!["job-a", "job-b", "job-c"]);
}

#[tokio::test]
async fn terminal_transitions_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let id = enqueue(&queue, "x", 1).await;
    queue.claim_next("w").await.unwrap().unwrap();

    assert_eq!(
        queue.fail(&id, "encoder exploded").await.unwrap(),
        TransitionOutcome::Applied
    );
    assert_eq!(
        queue.fail(&id, "encoder exploded again").await.unwrap(),
        TransitionOutcome::Unchanged
    );

    let err = queue
        .complete(&id, JobResult::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("encoder exploded"));
    assert!(job.completed_at.is_some());

    let err = queue.fail("missing", "x").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn long_errors_are_truncated() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let id = enqueue(&queue, "x", 1).await;
    queue.claim_next("w").await.unwrap().unwrap();
    queue.fail(&id, "e".repeat(10_000)).await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(
        job.error_message.unwrap().chars().count(),
        vpo_worker::jobs::MAX_ERROR_MESSAGE_CHARS
    );
}

#[tokio::test]
async fn stale_running_jobs_are_requeued() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let stale = enqueue(&queue, "stale", 1).await;
    let flagged = enqueue(&queue, "flagged", 1).await;
    queue.claim_next("dead-worker").await.unwrap().unwrap();
    queue.claim_next("dead-worker").await.unwrap().unwrap();
    queue
        .update_progress(&stale, &ProgressSnapshot::bytes(40, 100))
        .await
        .unwrap();
    assert_eq!(queue.cancel(&flagged).await.unwrap(), CancelOutcome::Requested);

    tokio::time::sleep(Duration::from_millis(30)).await;

    // A fresh heartbeat window leaves both alone.
    let none = queue.recover_orphans(Duration::from_secs(60)).await.unwrap();
    assert_eq!((none.requeued, none.cancelled), (0, 0));

    let recovered = queue
        .recover_orphans(Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(recovered.requeued, 1);
    assert_eq!(recovered.cancelled, 1);

    let job = queue.get_job(&stale).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.worker_id.is_none());
    assert!(job.worker_heartbeat.is_none());
    assert_eq!(job.progress_percent, 0.0);

    let job = queue.get_job(&flagged).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    // The requeued job can be claimed again.
    let again = queue.claim_next("new-worker").await.unwrap().unwrap();
    assert_eq!(again.id, stale);
}

#[tokio::test]
async fn heartbeat_requires_ownership() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let id = enqueue(&queue, "x", 1).await;
    queue.claim_next("owner").await.unwrap().unwrap();

    assert_eq!(
        queue.heartbeat(&id, "owner").await.unwrap(),
        HeartbeatAck::Owned {
            cancel_requested: false
        }
    );
    assert_eq!(
        queue.heartbeat(&id, "intruder").await.unwrap(),
        HeartbeatAck::Lost
    );

    queue.cancel(&id).await.unwrap();
    assert_eq!(
        queue.heartbeat(&id, "owner").await.unwrap(),
        HeartbeatAck::Owned {
            cancel_requested: true
        }
    );

    queue.complete(&id, JobResult::default()).await.unwrap();
    assert_eq!(queue.heartbeat(&id, "owner").await.unwrap(), HeartbeatAck::Lost);
}

#[tokio::test]
async fn cancel_depends_on_status() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let queued = enqueue(&queue, "queued", 1).await;
    assert_eq!(queue.cancel(&queued).await.unwrap(), CancelOutcome::Cancelled);
    let job = queue.get_job(&queued).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(queue.claim_next("w").await.unwrap().is_none());

    let running = enqueue(&queue, "running", 1).await;
    queue.claim_next("w").await.unwrap().unwrap();
    let token = queue.cancellation_token(&running).unwrap();
    assert_eq!(queue.cancel(&running).await.unwrap(), CancelOutcome::Requested);
    assert!(token.is_cancelled());
    let job = queue.get_job(&running).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.cancel_requested);

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
async fn resubmit_creates_a_new_job() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let id = enqueue(&queue, "x", 7).await;
    assert!(matches!(
        queue.resubmit(&id).await.unwrap_err(),
        Error::Validation(_)
    ));

    queue.claim_next("w").await.unwrap().unwrap();
    queue.fail(&id, "boom").await.unwrap();

    let new_id = queue.resubmit(&id).await.unwrap();
    assert_ne!(new_id, id);

    let original = queue.get_job(&id).await.unwrap().unwrap();
    let copy = queue.get_job(&new_id).await.unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Failed);
    assert_eq!(copy.status, JobStatus::Queued);
    assert_eq!(copy.priority, 7);
    assert_eq!(copy.file_path, original.file_path);
    assert_eq!(copy.policy_json, original.policy_json);
}

#[tokio::test]
async fn progress_never_moves_backwards() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let id = enqueue(&queue, "x", 1).await;
    assert!(
        !queue
            .update_progress(&id, &ProgressSnapshot::bytes(10, 100))
            .await
            .unwrap(),
        "queued jobs take no progress"
    );

    queue.claim_next("w").await.unwrap().unwrap();
    assert!(
        queue
            .update_progress(&id, &ProgressSnapshot::bytes(55, 100))
            .await
            .unwrap()
    );
    queue
        .update_progress(&id, &ProgressSnapshot::bytes(20, 100))
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.progress_percent, 55.0);

    queue.complete(&id, JobResult::default()).await.unwrap();
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.progress_percent, 100.0);
}

#[tokio::test]
async fn reporter_updates_reach_the_database() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let id = enqueue(&queue, "x", 1).await;
    queue.claim_next("w").await.unwrap().unwrap();

    let reporter = queue.progress_reporter(&id);
    for done in [5, 15, 42] {
        reporter.report(ProgressSnapshot::bytes(done, 100));
    }

    let mut stored = 0.0;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stored = queue.get_job(&id).await.unwrap().unwrap().progress_percent;
        if stored >= 42.0 {
            break;
        }
    }
    assert_eq!(stored, 42.0);
    assert_eq!(queue.progress(&id).await.unwrap().unwrap().percent, 42.0);
}

#[tokio::test]
async fn job_logs_are_persisted_in_order() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let id = enqueue(&queue, "x", 1).await;
    queue.claim_next("w").await.unwrap().unwrap();
    queue.append_log(&id, LogLevel::Warn, "low disk").await;
    queue.fail(&id, "boom").await.unwrap();

    let (logs, total) = queue.job_logs(&id, &Pagination::new(100, 0)).await.unwrap();
    assert_eq!(total as usize, logs.len());
    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages.first().copied(), Some("Queued transcode job"));
    assert!(messages.contains(&"low disk"));
    assert!(messages.contains(&"boom"));
    let warn = logs.iter().find(|l| l.message == "low disk").unwrap();
    assert_eq!(warn.level, LogLevel::Warn);
}

#[tokio::test]
async fn listing_and_stats() {
    let dir = TempDir::new().unwrap();
    let (_pool, queue) = setup(&dir).await;

    let a = enqueue(&queue, "a", 1).await;
    enqueue(&queue, "b", 1).await;
    queue
        .enqueue(JobType::Move, "/media/c.mkv", &json!({}), 1)
        .await
        .unwrap();
    queue.claim_next("w").await.unwrap().unwrap();
    queue.complete(&a, JobResult::default()).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.counts.completed, 1);
    assert_eq!(stats.counts.queued, 2);

    let (moves, total) = queue
        .list_jobs(
            &JobFilters::default().with_job_type(JobType::Move),
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(moves[0].job_type, JobType::Move);

    let (queued, _) = queue
        .list_jobs(
            &JobFilters::default().with_status(JobStatus::Queued),
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(queued.len(), 2);
    // Newest first.
    assert!(queued[0].created_at >= queued[1].created_at);
}

#[tokio::test]
async fn purge_removes_only_old_terminal_jobs() {
    let dir = TempDir::new().unwrap();
    let (pool, queue) = setup(&dir).await;

    let done = enqueue(&queue, "done", 1).await;
    let pending = enqueue(&queue, "pending", 2).await;
    queue.claim_next("w").await.unwrap().unwrap();
    queue.complete(&done, JobResult::default()).await.unwrap();

    assert_eq!(queue.purge(Duration::from_secs(3600), None).await.unwrap(), 0);

    // Age the finished row past the window.
    sqlx::query("UPDATE jobs SET completed_at = completed_at - 7200000 WHERE id = ?")
        .bind(&done)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(
        queue
            .purge(Duration::from_secs(3600), Some(&[JobStatus::Failed]))
            .await
            .unwrap(),
        0
    );
    assert_eq!(queue.purge(Duration::from_secs(3600), None).await.unwrap(), 1);
    assert!(queue.get_job(&done).await.unwrap().is_none());
    assert!(queue.get_job(&pending).await.unwrap().is_some());
}
