use harvester_core::AppError;
use harvester_core::job::{JobFilter, JobLogEntry, JobStatus, LogLevel};
use harvester_core::testutil::{job_fixture, source_fixture};
use harvester_core::traits::{JobStore, SourceStore};
use uuid::Uuid;

use crate::common::setup_test_db;

#[tokio::test]
async fn insert_and_get_job() {
    let (db, _container) = setup_test_db().await;
    let (sources, jobs) = (db.source_store(), db.job_store());

    let source = source_fixture();
    sources.insert(&source).await.unwrap();
    let mut job = job_fixture(source.id);
    job.tags = vec!["nightly".into(), "eu".into()];
    job.schedule.repeat_every_secs = Some(3600);
    jobs.insert(&job).await.unwrap();

    let stored = jobs.get(job.id).await.unwrap().expect("job should exist");
    assert_eq!(stored.name, "nightly sweep");
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.source_id, source.id);
    assert_eq!(stored.tags, job.tags);
    assert_eq!(stored.schedule.repeat_every_secs, Some(3600));
    assert_eq!(stored.max_retries, job.max_retries);
    assert_eq!(stored.version, 0);

    assert!(jobs.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn update_bumps_version_and_rejects_stale_writes() {
    let (db, _container) = setup_test_db().await;
    let jobs = db.job_store();

    let job = job_fixture(Uuid::new_v4());
    jobs.insert(&job).await.unwrap();

    let mut queued = job.clone();
    queued.status = JobStatus::Queued;
    queued.progress.tasks_total = 4;
    let saved = jobs.update(&queued).await.unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(saved.progress.tasks_total, 4);

    // Still carries version 0.
    let err = jobs.update(&queued).await.unwrap_err();
    assert!(matches!(err, AppError::VersionConflict { .. }));

    let stored = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn update_unknown_job_is_not_found() {
    let (db, _container) = setup_test_db().await;
    let jobs = db.job_store();

    let err = jobs.update(&job_fixture(Uuid::new_v4())).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn list_and_count_apply_filters() {
    let (db, _container) = setup_test_db().await;
    let jobs = db.job_store();
    let source_id = Uuid::new_v4();

    for i in 0..5 {
        let mut job = job_fixture(source_id);
        job.name = format!("sweep {i}");
        if i % 2 == 0 {
            job.status = JobStatus::Queued;
            job.tags = vec!["priority".into()];
        }
        jobs.insert(&job).await.unwrap();
    }
    jobs.insert(&job_fixture(Uuid::new_v4())).await.unwrap();

    let queued = JobFilter::with_status(JobStatus::Queued);
    assert_eq!(jobs.count(&queued).await.unwrap(), 3);

    let tagged = JobFilter {
        tag: Some("priority".into()),
        source_id: Some(source_id),
        ..Default::default()
    };
    assert_eq!(jobs.list(&tagged).await.unwrap().len(), 3);

    let paged = JobFilter {
        source_id: Some(source_id),
        offset: 2,
        limit: Some(2),
        ..Default::default()
    };
    assert_eq!(jobs.list(&paged).await.unwrap().len(), 2);
    assert_eq!(jobs.count(&JobFilter::default()).await.unwrap(), 6);
}

#[tokio::test]
async fn logs_are_newest_first_and_deleted_with_the_job() {
    let (db, _container) = setup_test_db().await;
    let jobs = db.job_store();

    let job = job_fixture(Uuid::new_v4());
    jobs.insert(&job).await.unwrap();
    for (i, level) in [LogLevel::Info, LogLevel::Warn, LogLevel::Error]
        .into_iter()
        .enumerate()
    {
        jobs.append_log(&JobLogEntry {
            job_id: job.id,
            level,
            message: format!("entry {i}"),
            at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    }

    let logs = jobs.logs(job.id, 2).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "entry 2");
    assert_eq!(logs[0].level, LogLevel::Error);

    assert!(jobs.delete(job.id).await.unwrap());
    assert!(jobs.logs(job.id, 10).await.unwrap().is_empty());
    assert!(!jobs.delete(job.id).await.unwrap());
}
