use std::time::Duration;

use harvester_core::clock::system_clock;
use harvester_core::dedup::DedupPolicy;
use harvester_core::dispatcher::DispatcherConfig;
use harvester_core::export::{ExportConfig, ExportStatus};
use harvester_core::gate::GateConfig;
use harvester_core::job::{CreateJobRequest, RetryConfig};
use harvester_core::job_registry::SYSTEM_ACTOR;
use harvester_core::record::{RecordQuery, RecordStatus};
use harvester_core::source_registry::SourceRegistryConfig;
use harvester_core::testutil::{
    MockAuditSink, MockFetcher, MockProber, MockReporter, raw_record, source_fixture,
};
use harvester_core::traits::SourceStore;
use harvester_core::worker::WorkerConfig;
use harvester_core::{
    Dispatcher, ExportFormat, ExportService, FsArtifactSink, JobRegistry, JobStatus, Scheduler,
    SourceRegistry, ValidationEngine, WorkerService, spawn_gate,
};

use crate::common::setup_test_db;

/// A two-page job flows through scheduler, dispatcher and worker on the
/// PostgreSQL stores, then its records are exported.
#[tokio::test]
async fn job_runs_end_to_end_and_exports() {
    let (db, _container) = setup_test_db().await;
    let clock = system_clock();
    let audit = MockAuditSink::new();

    let source = source_fixture();
    db.source_store().insert(&source).await.unwrap();

    let registry = JobRegistry::new(db.job_store(), db.source_store(), clock.clone(), audit.shared());
    let source_registry = SourceRegistry::new(
        db.source_store(),
        db.job_store(),
        MockProber::ok(5),
        clock.clone(),
        audit.shared(),
        SourceRegistryConfig::default(),
    );
    let engine = ValidationEngine::new(
        db.record_store(),
        clock.clone(),
        audit.shared(),
        DedupPolicy::default(),
    );
    let gate = spawn_gate(clock.clone(), GateConfig::default());
    let scheduler = Scheduler::new(
        registry.clone(),
        db.job_store(),
        db.source_store(),
        db.queue(),
        clock.clone(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let dispatcher = Dispatcher::new(
        registry.clone(),
        source_registry.clone(),
        db.job_store(),
        db.source_store(),
        db.queue(),
        gate.clone(),
        tx,
        clock.clone(),
        DispatcherConfig::default(),
    );
    // Both pages return the same candidates.
    let fetcher = MockFetcher::returning(vec![
        raw_record("Ada Lovelace", "ada@example.com"),
        raw_record("Alan Turing", "alan@example.com"),
    ]);
    let worker = WorkerService::new(
        fetcher.clone(),
        registry.clone(),
        source_registry,
        db.job_store(),
        db.queue(),
        engine,
        gate,
        clock.clone(),
        WorkerConfig {
            worker_id: "worker-it".into(),
            fetch_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        },
    );

    let job = registry
        .create_job(CreateJobRequest::new("nightly sweep", source.id, "ops").with_pages(2))
        .await
        .unwrap();
    registry.start_job(job.id, SYSTEM_ACTOR).await.unwrap();

    let tick = scheduler.tick().await.unwrap();
    assert_eq!(tick.planned, 1);

    let report = dispatcher.cycle("listing_api").await.unwrap();
    assert_eq!(report.dispatched, 2);

    let reporter = MockReporter::new();
    for _ in 0..2 {
        let dispatched = rx.recv().await.expect("a dispatched task");
        worker.process(dispatched, &reporter).await;
    }
    assert_eq!(fetcher.calls().len(), 2);

    let job = registry.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.found, 4);
    assert_eq!(job.progress.validated, 2);
    assert_eq!(job.progress.duplicate, 2);
    assert_eq!(job.progress.tasks_completed, 2);

    let dir = tempfile::tempdir().unwrap();
    let exports = ExportService::new(
        db.export_store(),
        db.record_store(),
        FsArtifactSink::new(dir.path()),
        clock,
        audit.shared(),
        ExportConfig::default(),
    );
    let filter = RecordQuery {
        job_id: Some(job.id),
        status: Some(RecordStatus::Validated),
        ..Default::default()
    };
    let export = exports
        .create_export(filter, ExportFormat::Csv, "ops")
        .await
        .unwrap();
    assert_eq!(export.status, ExportStatus::Completed);
    assert_eq!(export.progress.rows_written, 2);

    let stored = exports.get_export_status(export.id).await.unwrap();
    assert_eq!(stored.status, ExportStatus::Completed);
    assert!(stored.artifact_ref.is_some());
}
