use chrono::{TimeDelta, Utc};
use harvester_core::clock::{Clock, ManualClock};
use harvester_core::export::{ExportJob, ExportProgress, ExportStatus};
use harvester_core::job::CreateJobRequest;
use harvester_core::job_registry::{SYSTEM_ACTOR, TaskOutcome};
use harvester_core::queue::{Nack, NackDisposition, NewTask, Queue, TaskPayload, TaskTally};
use harvester_core::record::RecordQuery;
use harvester_core::testutil::{MockAuditSink, source_fixture};
use harvester_core::traits::{ExportStore, SourceStore};
use harvester_core::{ExportFormat, JobRegistry, JobStatus, QueueManager, Scheduler, TaskState};
use harvester_db::{Database, PgJobStore, PgSourceStore};
use uuid::Uuid;

use crate::common::setup_test_db;

const Q: &str = "listing_api";

struct Harness {
    registry: JobRegistry<PgJobStore, PgSourceStore>,
    clock: ManualClock,
    source_id: Uuid,
}

async fn harness(db: &Database) -> Harness {
    let clock = ManualClock::new(Utc::now());
    let source = source_fixture();
    db.source_store().insert(&source).await.unwrap();
    let registry = JobRegistry::new(
        db.job_store(),
        db.source_store(),
        clock.shared(),
        MockAuditSink::new().shared(),
    );
    Harness {
        registry,
        clock,
        source_id: source.id,
    }
}

async fn running_job(h: &Harness) -> Uuid {
    let job = h
        .registry
        .create_job(CreateJobRequest::new("sweep", h.source_id, "ops"))
        .await
        .unwrap();
    h.registry.start_job(job.id, SYSTEM_ACTOR).await.unwrap();
    h.registry.mark_running(job.id).await.unwrap();
    job.id
}

/// Enqueue, claim and finish one task of `job_id`.
async fn finished_task(db: &Database, h: &Harness, job_id: Uuid, error: Option<&str>) -> Uuid {
    let queue = db.queue();
    let now = h.clock.now();
    let task = queue
        .enqueue(
            NewTask {
                queue: Q.into(),
                job_id,
                source_id: h.source_id,
                payload: TaskPayload::default(),
                priority: 0,
                max_attempts: 3,
            },
            now,
        )
        .await
        .unwrap();
    queue.dequeue(task.id, "worker-0", None, now).await.unwrap();
    match error {
        None => queue.ack(task.id, now).await.unwrap(),
        Some(error) => queue
            .nack(
                task.id,
                Nack {
                    error: error.into(),
                    category: "network".into(),
                    disposition: NackDisposition::DeadLetter,
                },
                now,
            )
            .await
            .unwrap(),
    };
    task.id
}

#[tokio::test]
async fn retry_all_failed_and_reasons_read_every_failed_task() {
    let (db, _container) = setup_test_db().await;
    let h = harness(&db).await;
    let job_id = running_job(&h).await;
    finished_task(&db, &h, job_id, Some("connection reset")).await;
    finished_task(&db, &h, job_id, Some("connection reset")).await;
    finished_task(&db, &h, job_id, Some("dns failure")).await;
    finished_task(&db, &h, job_id, None).await;

    let manager = QueueManager::new(
        db.queue(),
        db.job_store(),
        h.clock.shared(),
        MockAuditSink::new().shared(),
    );

    let all_failed = db
        .queue()
        .list(Q, Some(TaskState::Failed), 0, None)
        .await
        .unwrap();
    assert_eq!(all_failed.len(), 3);

    let reasons = manager.failed_reasons(Some(Q), 10).await.unwrap();
    assert_eq!(reasons.len(), 2);
    assert_eq!(reasons[0].reason, "connection reset");
    assert_eq!(reasons[0].count, 2);

    assert_eq!(manager.retry_all_failed(Q, "ops").await.unwrap(), 3);
    let waiting = manager
        .list_tasks(Q, Some(TaskState::Waiting), 0, 50)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 3);
    assert!(waiting.iter().all(|t| t.attempt == 0));
    assert!(manager.failed_reasons(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_refuses_tasks_of_failed_jobs() {
    let (db, _container) = setup_test_db().await;
    let h = harness(&db).await;
    let job_id = running_job(&h).await;
    let task_id = finished_task(&db, &h, job_id, Some("blocked")).await;
    let tasks = db.queue().job_tasks(job_id).await.unwrap();
    h.registry
        .record_task_outcome(
            job_id,
            &TaskOutcome {
                task_id,
                attempt: 1,
                error: Some("blocked".into()),
                ..Default::default()
            },
            TaskTally::from_tasks(&tasks),
        )
        .await
        .unwrap();
    assert_eq!(h.registry.get_job(job_id).await.unwrap().status, JobStatus::Failed);

    let manager = QueueManager::new(
        db.queue(),
        db.job_store(),
        h.clock.shared(),
        MockAuditSink::new().shared(),
    );
    assert!(manager.retry_task(task_id, "ops").await.is_err());
    assert_eq!(manager.retry_all_failed(Q, "ops").await.unwrap(), 0);
    assert_eq!(
        manager.get_task(task_id).await.unwrap().state,
        TaskState::Failed
    );
}

#[tokio::test]
async fn clean_removes_only_tasks_past_grace() {
    let (db, _container) = setup_test_db().await;
    let h = harness(&db).await;
    let job_id = running_job(&h).await;
    let old = finished_task(&db, &h, job_id, None).await;
    h.clock.advance(TimeDelta::hours(2));
    let recent = finished_task(&db, &h, job_id, None).await;

    let manager = QueueManager::new(
        db.queue(),
        db.job_store(),
        h.clock.shared(),
        MockAuditSink::new().shared(),
    );
    let removed = manager
        .clean_queue(Q, TaskState::Completed, 3_600_000, "ops")
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(manager.get_task(old).await.is_err());
    assert!(manager.get_task(recent).await.is_ok());
}

#[tokio::test]
async fn resumed_job_with_failed_tasks_settles_as_failed() {
    let (db, _container) = setup_test_db().await;
    let h = harness(&db).await;
    let scheduler = Scheduler::new(
        h.registry.clone(),
        db.job_store(),
        db.source_store(),
        db.queue(),
        h.clock.shared(),
    );
    let job = h
        .registry
        .create_job(CreateJobRequest::new("sweep", h.source_id, "ops"))
        .await
        .unwrap();
    h.registry.start_job(job.id, "ops").await.unwrap();
    assert_eq!(scheduler.tick().await.unwrap().planned, 1);
    h.registry.mark_running(job.id).await.unwrap();
    h.registry.pause_job(job.id, None, "ops").await.unwrap();

    let queue = db.queue();
    let task = queue.job_tasks(job.id).await.unwrap().remove(0);
    let now = h.clock.now();
    queue.dequeue(task.id, "worker-0", None, now).await.unwrap();
    queue
        .nack(
            task.id,
            Nack {
                error: "blocked".into(),
                category: "blocked".into(),
                disposition: NackDisposition::DeadLetter,
            },
            now,
        )
        .await
        .unwrap();
    let tasks = queue.job_tasks(job.id).await.unwrap();
    h.registry
        .record_task_outcome(
            job.id,
            &TaskOutcome {
                task_id: task.id,
                attempt: 1,
                error: Some("blocked".into()),
                ..Default::default()
            },
            TaskTally::from_tasks(&tasks),
        )
        .await
        .unwrap();

    h.registry.resume_job(job.id, "ops").await.unwrap();
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(h.registry.get_job(job.id).await.unwrap().status, JobStatus::Failed);
    assert_eq!(
        queue.get(task.id).await.unwrap().unwrap().state,
        TaskState::Failed
    );
}

#[tokio::test]
async fn stalled_exports_are_failed_in_one_step() {
    let (db, _container) = setup_test_db().await;
    let exports = db.export_store();
    let now = Utc::now();
    let export = |updated_at| ExportJob {
        id: Uuid::new_v4(),
        filter: RecordQuery::default(),
        format: ExportFormat::Jsonl,
        status: ExportStatus::Processing,
        artifact_ref: None,
        progress: ExportProgress {
            rows_written: 1_000,
            total_rows: 5_000,
        },
        retriable: false,
        error: None,
        created_by: "ops".into(),
        created_at: updated_at,
        updated_at,
        completed_at: None,
    };
    let stalled = export(now - TimeDelta::hours(1));
    let live = export(now);
    exports.insert(&stalled).await.unwrap();
    exports.insert(&live).await.unwrap();

    let failed = exports
        .fail_stalled(now - TimeDelta::minutes(15), "interrupted", now)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, stalled.id);
    assert_eq!(failed[0].status, ExportStatus::Failed);
    assert!(failed[0].retriable);
    assert_eq!(failed[0].error.as_deref(), Some("interrupted"));

    let untouched = exports.get(live.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, ExportStatus::Processing);
}
