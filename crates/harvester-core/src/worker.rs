use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::dispatcher::Dispatched;
use crate::error::{AppError, FetchError};
use crate::gate::{GateHandle, Permit, ProxyOutcome};
use crate::job::RetryConfig;
use crate::job_registry::{JobRegistry, TaskOutcome};
use crate::queue::{Nack, NackDisposition, Queue, QueueTask, TaskTally};
use crate::record::RawRecord;
use crate::source_registry::SourceRegistry;
use crate::traits::{Fetcher, JobStore, Prober, RecordStore, SourceStore};
use crate::validation_engine::ValidationEngine;

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    TaskStarted {
        task_id: Uuid,
        job_id: Uuid,
        page: u32,
        attempt: u32,
    },
    TaskCompleted {
        task_id: Uuid,
        job_id: Uuid,
        records: u64,
    },
    TaskFailed {
        task_id: Uuid,
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    /// The task's job was cancelled or deleted while it was in flight.
    TaskSkipped {
        task_id: Uuid,
        job_id: Uuid,
    },
    ShuttingDown {
        worker_id: &'a str,
        tasks_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::TaskStarted {
                task_id,
                job_id,
                page,
                attempt,
            } => {
                tracing::debug!(%task_id, %job_id, page, attempt, "Processing task");
            }
            WorkerEvent::TaskCompleted {
                task_id,
                job_id,
                records,
            } => {
                tracing::info!(%task_id, %job_id, records, "Task completed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%task_id, %job_id, %error, %will_retry, "Task failed");
            }
            WorkerEvent::TaskSkipped { task_id, job_id } => {
                tracing::info!(%task_id, %job_id, "Task dropped, job no longer runnable");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                tasks_released,
            } => {
                tracing::info!(%worker_id, %tasks_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub fetch_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            fetch_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Receiving end of the dispatch channel, shared by the pool.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Dispatched>>>;

/// Executes dispatched tasks: fetch, ingest, then settle the task and its job.
#[derive(Clone)]
pub struct WorkerService<F, J, S, Q, R, P>
where
    F: Fetcher,
    J: JobStore,
    S: SourceStore,
    Q: Queue,
    R: RecordStore,
    P: Prober,
{
    fetcher: F,
    registry: JobRegistry<J, S>,
    source_registry: SourceRegistry<S, J, P>,
    jobs: J,
    queue: Q,
    engine: ValidationEngine<R>,
    gate: GateHandle,
    clock: SharedClock,
    config: WorkerConfig,
}

enum Settled {
    Completed(u64),
    Failed { error: String, will_retry: bool },
}

impl<F, J, S, Q, R, P> WorkerService<F, J, S, Q, R, P>
where
    F: Fetcher,
    J: JobStore,
    S: SourceStore,
    Q: Queue,
    R: RecordStore,
    P: Prober,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: F,
        registry: JobRegistry<J, S>,
        source_registry: SourceRegistry<S, J, P>,
        jobs: J,
        queue: Q,
        engine: ValidationEngine<R>,
        gate: GateHandle,
        clock: SharedClock,
        config: WorkerConfig,
    ) -> Self {
        Self {
            fetcher,
            registry,
            source_registry,
            jobs,
            queue,
            engine,
            gate,
            clock,
            config,
        }
    }

    /// Copy of this worker under another id, for building a pool.
    pub fn with_worker_id(&self, worker_id: impl Into<String>) -> Self {
        let mut worker = self.clone();
        worker.config.worker_id = worker_id.into();
        worker
    }

    /// Run the worker loop until cancellation or until the channel closes.
    pub async fn run<WR: WorkerReporter>(
        &self,
        rx: SharedReceiver,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let worker_id = self.config.worker_id.as_str();
        reporter.report(WorkerEvent::Started { worker_id });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            let next = tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                next = async { rx.lock().await.recv().await } => next,
            };
            let Some(dispatched) = next else {
                break;
            };
            self.process(dispatched, reporter).await;
        }

        // Graceful shutdown: hand back anything still waiting in the channel
        let mut released = 0;
        loop {
            let pending = rx.lock().await.try_recv();
            let Ok(dispatched) = pending else {
                break;
            };
            self.requeue(&dispatched.task, "worker shutting down").await;
            self.release(dispatched.permit, ProxyOutcome::Neutral).await;
            released += 1;
        }

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id,
            tasks_released: released,
        });
        reporter.report(WorkerEvent::Stopped { worker_id });
        Ok(())
    }

    pub async fn process<WR: WorkerReporter>(&self, dispatched: Dispatched, reporter: &WR) {
        let Dispatched {
            task,
            permit,
            source,
        } = dispatched;
        reporter.report(WorkerEvent::TaskStarted {
            task_id: task.id,
            job_id: task.job_id,
            page: task.payload.page,
            attempt: task.attempt,
        });

        if !self.job_runnable(&task).await {
            self.skip(&task, permit, reporter).await;
            return;
        }

        let proxy = permit.proxy_id.and_then(|id| source.proxy(id)).cloned();
        let fetched = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.fetch(&task, &source, proxy.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.config.fetch_timeout.as_secs())),
        };

        // Cancellation only stops new work; a result for a cancelled job is dropped.
        if !self.job_runnable(&task).await {
            self.skip(&task, permit, reporter).await;
            return;
        }

        let has_proxy = permit.proxy_id.is_some();
        let (settled, outcome) = match fetched {
            Ok(raws) => self.on_success(&task, permit, raws).await,
            Err(e) if e.is_proxy_failure() && has_proxy => {
                self.on_proxy_failure(&task, permit, &e).await
            }
            Err(e) => self.on_failure(&task, permit, e).await,
        };

        match &settled {
            Settled::Completed(records) => reporter.report(WorkerEvent::TaskCompleted {
                task_id: task.id,
                job_id: task.job_id,
                records: *records,
            }),
            Settled::Failed { error, will_retry } => reporter.report(WorkerEvent::TaskFailed {
                task_id: task.id,
                job_id: task.job_id,
                error,
                will_retry: *will_retry,
            }),
        }

        if let Some(outcome) = outcome {
            self.report_outcome(&task, &outcome).await;
        }
    }

    async fn on_success(
        &self,
        task: &QueueTask,
        permit: Permit,
        raws: Vec<RawRecord>,
    ) -> (Settled, Option<TaskOutcome>) {
        let summary = match self
            .engine
            .ingest(task.source_id, Some(task.job_id), raws)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to store fetched records");
                self.release(permit, ProxyOutcome::Success).await;
                let will_retry = e.is_retryable() && task.attempt < task.max_attempts;
                let disposition = if will_retry {
                    NackDisposition::Retry {
                        at: self.config.retry.next_attempt_at(task.attempt, self.clock.now()),
                    }
                } else {
                    NackDisposition::DeadLetter
                };
                let error = e.to_string();
                self.nack(task, &error, "other", disposition).await;
                let outcome = TaskOutcome {
                    task_id: task.id,
                    attempt: task.attempt,
                    error: Some(error.clone()),
                    ..Default::default()
                };
                return (Settled::Failed { error, will_retry }, Some(outcome));
            }
        };

        if let Err(e) = self.queue.ack(task.id, self.clock.now()).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to ack task");
        }
        self.release(permit, ProxyOutcome::Success).await;
        if let Err(e) = self.source_registry.record_success(task.source_id).await {
            tracing::warn!(source_id = %task.source_id, error = %e, "Failed to record source success");
        }

        let outcome = TaskOutcome {
            task_id: task.id,
            attempt: task.attempt,
            found: summary.found,
            validated: summary.validated,
            duplicate: summary.duplicate,
            failed: summary.invalid,
            error: None,
        };
        (Settled::Completed(summary.found), Some(outcome))
    }

    /// The proxy is charged; the task goes back without losing an attempt.
    async fn on_proxy_failure(
        &self,
        task: &QueueTask,
        permit: Permit,
        error: &FetchError,
    ) -> (Settled, Option<TaskOutcome>) {
        let proxy_id = permit.proxy_id;
        let message = error.to_string();
        self.nack(task, &message, error.category(), NackDisposition::Requeue)
            .await;
        if self.release(permit, ProxyOutcome::Failure).await {
            tracing::warn!(task_id = %task.id, proxy_id = ?proxy_id, "Proxy excluded from rotation");
        }
        (
            Settled::Failed {
                error: message,
                will_retry: true,
            },
            None,
        )
    }

    async fn on_failure(
        &self,
        task: &QueueTask,
        permit: Permit,
        error: FetchError,
    ) -> (Settled, Option<TaskOutcome>) {
        let will_retry = error.is_retryable() && task.attempt < task.max_attempts;
        let disposition = if will_retry {
            NackDisposition::Retry {
                at: self.config.retry.next_attempt_at(task.attempt, self.clock.now()),
            }
        } else {
            NackDisposition::DeadLetter
        };
        let message = error.to_string();
        self.nack(task, &message, error.category(), disposition).await;
        self.release(permit, ProxyOutcome::Neutral).await;

        if !matches!(error, FetchError::Parse(_) | FetchError::Unsupported(_))
            && let Err(e) = self
                .source_registry
                .record_failure(task.source_id, &message)
                .await
        {
            tracing::warn!(source_id = %task.source_id, error = %e, "Failed to record source failure");
        }

        let outcome = TaskOutcome {
            task_id: task.id,
            attempt: task.attempt,
            error: Some(message.clone()),
            ..Default::default()
        };
        (
            Settled::Failed {
                error: message,
                will_retry,
            },
            Some(outcome),
        )
    }

    async fn report_outcome(&self, task: &QueueTask, outcome: &TaskOutcome) {
        let tally = match self.queue.job_tasks(task.job_id).await {
            Ok(tasks) => TaskTally::from_tasks(&tasks),
            Err(e) => {
                tracing::error!(job_id = %task.job_id, error = %e, "Failed to load job tasks");
                return;
            }
        };
        if let Err(e) = self
            .registry
            .record_task_outcome(task.job_id, outcome, tally)
            .await
        {
            tracing::error!(job_id = %task.job_id, error = %e, "Failed to record task outcome");
        }
    }

    async fn job_runnable(&self, task: &QueueTask) -> bool {
        match self.jobs.get(task.job_id).await {
            Ok(Some(job)) => !job.status.is_terminal(),
            Ok(None) => false,
            Err(e) => {
                // Keep the task; a store hiccup is not a cancellation.
                tracing::warn!(job_id = %task.job_id, error = %e, "Could not load job");
                true
            }
        }
    }

    async fn skip<WR: WorkerReporter>(&self, task: &QueueTask, permit: Permit, reporter: &WR) {
        if let Err(e) = self.queue.remove(task.id).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to remove task");
        }
        self.release(permit, ProxyOutcome::Neutral).await;
        reporter.report(WorkerEvent::TaskSkipped {
            task_id: task.id,
            job_id: task.job_id,
        });
    }

    async fn nack(&self, task: &QueueTask, error: &str, category: &str, disposition: NackDisposition) {
        let nack = Nack {
            error: error.to_string(),
            category: category.to_string(),
            disposition,
        };
        if let Err(e) = self.queue.nack(task.id, nack, self.clock.now()).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to nack task");
        }
    }

    async fn requeue(&self, task: &QueueTask, reason: &str) {
        self.nack(task, reason, "other", NackDisposition::Requeue).await;
    }

    /// Returns true if the release excluded the permit's proxy.
    async fn release(&self, permit: Permit, outcome: ProxyOutcome) -> bool {
        match self.gate.release(permit, outcome).await {
            Ok(excluded) => excluded,
            Err(e) => {
                tracing::error!(error = %e, "Failed to release permit");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::dedup::DedupPolicy;
    use crate::gate::{GateConfig, spawn_gate};
    use crate::job::{JobStatus, ScrapingJob};
    use crate::job_registry::SYSTEM_ACTOR;
    use crate::memory::{MemoryJobStore, MemoryQueue, MemoryRecordStore, MemorySourceStore};
    use crate::queue::{NewTask, TaskPayload, TaskState};
    use crate::record::RecordQuery;
    use crate::source::{HealthStatus, Proxy, ProxyProtocol, Source};
    use crate::source_registry::SourceRegistryConfig;
    use crate::testutil::{
        MockAuditSink, MockFetcher, MockProber, MockReporter, job_fixture, raw_record,
        source_fixture,
    };

    type TestWorker = WorkerService<
        MockFetcher,
        MemoryJobStore,
        MemorySourceStore,
        MemoryQueue,
        MemoryRecordStore,
        MockProber,
    >;

    struct Fixture {
        worker: TestWorker,
        registry: JobRegistry<MemoryJobStore, MemorySourceStore>,
        jobs: MemoryJobStore,
        sources: MemorySourceStore,
        records: MemoryRecordStore,
        queue: MemoryQueue,
        gate: GateHandle,
        clock: ManualClock,
    }

    fn fixture(fetcher: MockFetcher) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let jobs = MemoryJobStore::default();
        let sources = MemorySourceStore::default();
        let records = MemoryRecordStore::default();
        let queue = MemoryQueue::default();
        let audit = MockAuditSink::new().shared();
        let registry = JobRegistry::new(jobs.clone(), sources.clone(), clock.shared(), audit.clone());
        let source_registry = SourceRegistry::new(
            sources.clone(),
            jobs.clone(),
            MockProber::ok(5),
            clock.shared(),
            audit.clone(),
            SourceRegistryConfig::default(),
        );
        let engine = ValidationEngine::new(
            records.clone(),
            clock.shared(),
            audit,
            DedupPolicy::default(),
        );
        let gate = spawn_gate(clock.shared(), GateConfig::default());
        let worker = WorkerService::new(
            fetcher,
            registry.clone(),
            source_registry,
            jobs.clone(),
            queue.clone(),
            engine,
            gate.clone(),
            clock.shared(),
            WorkerConfig {
                worker_id: "worker-test".into(),
                fetch_timeout: Duration::from_millis(200),
                retry: RetryConfig::default(),
            },
        );
        Fixture {
            worker,
            registry,
            jobs,
            sources,
            records,
            queue,
            gate,
            clock,
        }
    }

    /// A running job with one task, claimed and admitted like the dispatcher would.
    async fn dispatched(f: &Fixture, source: &Source, max_attempts: u32) -> (ScrapingJob, Dispatched) {
        f.sources.insert(source).await.unwrap();
        let mut job = job_fixture(source.id);
        job.max_retries = max_attempts;
        f.jobs.insert(&job).await.unwrap();
        f.registry.start_job(job.id, SYSTEM_ACTOR).await.unwrap();
        let now = f.clock.now();
        let task = f
            .queue
            .enqueue(
                NewTask {
                    queue: "listing_api".into(),
                    job_id: job.id,
                    source_id: source.id,
                    payload: TaskPayload { page: 1, cursor: None },
                    priority: 0,
                    max_attempts,
                },
                now,
            )
            .await
            .unwrap();
        f.registry.record_plan(job.id, 1).await.unwrap();
        let job = f.registry.mark_running(job.id).await.unwrap();
        (job, admit(f, source, task.id).await)
    }

    async fn admit(f: &Fixture, source: &Source, task_id: Uuid) -> Dispatched {
        let permit = f.gate.try_acquire(source).await.unwrap();
        let task = f
            .queue
            .dequeue(task_id, "dispatch:listing_api", permit.proxy_id, f.clock.now())
            .await
            .unwrap()
            .unwrap();
        Dispatched {
            task,
            permit,
            source: source.clone(),
        }
    }

    #[tokio::test]
    async fn test_success_ingests_and_completes_job() {
        let fetcher = MockFetcher::returning(vec![
            raw_record("Ada Lovelace", "ada@example.com"),
            raw_record("Alan Turing", "alan@example.com"),
        ]);
        let f = fixture(fetcher);
        let reporter = MockReporter::default();
        let (job, d) = dispatched(&f, &source_fixture(), 3).await;

        f.worker.process(d, &reporter).await;

        let job = f.registry.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.found, 2);
        assert_eq!(job.progress.validated, 2);
        assert_eq!(job.progress.tasks_completed, 1);
        assert_eq!(f.records.count(&RecordQuery::default()).await.unwrap(), 2);
        assert_eq!(
            reporter.events(),
            vec!["TaskStarted".to_string(), "TaskCompleted".to_string()]
        );
        assert!(f.gate.snapshot().await.unwrap().iter().all(|s| s.active == 0));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_job() {
        let fetcher = MockFetcher::failing(FetchError::Network("connection reset".into()));
        let f = fixture(fetcher.clone());
        let reporter = MockReporter::default();
        let source = source_fixture();
        let (job, mut d) = dispatched(&f, &source, 3).await;

        for attempt in 1..=3 {
            assert_eq!(d.task.attempt, attempt);
            f.worker.process(d, &reporter).await;
            if attempt == 3 {
                break;
            }
            let task = f.queue.get(job_task(&f, job.id).await).await.unwrap().unwrap();
            assert_eq!(task.state, TaskState::Delayed);
            f.clock.set(task.available_at);
            d = admit(&f, &source, task.id).await;
        }

        let job = f.registry.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, job.max_retries);
        assert!(job.last_error_reason.as_deref().is_some_and(|r| !r.is_empty()));
        assert_eq!(fetcher.calls().len(), 3);
    }

    async fn job_task(f: &Fixture, job_id: Uuid) -> Uuid {
        f.queue.job_tasks(job_id).await.unwrap()[0].id
    }

    #[tokio::test]
    async fn test_proxy_failure_requeues_without_consuming_attempt() {
        let fetcher = MockFetcher::failing(FetchError::Proxy("tunnel refused".into()));
        let f = fixture(fetcher);
        let reporter = MockReporter::default();
        let mut source = source_fixture();
        source.proxies.push(Proxy {
            id: Uuid::new_v4(),
            host: "10.1.1.1".into(),
            port: 3128,
            username: None,
            password: None,
            protocol: ProxyProtocol::Http,
            last_tested_at: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            is_active: true,
        });
        let (job, d) = dispatched(&f, &source, 3).await;

        f.worker.process(d, &reporter).await;

        let task = f.queue.get(job_task(&f, job.id).await).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Waiting);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.error_category.as_deref(), Some("proxy"));
        let job = f.registry.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        let proxies = &f.gate.snapshot().await.unwrap()[0].proxies;
        assert_eq!(proxies[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_result_is_discarded() {
        let fetcher = MockFetcher::returning(vec![raw_record("Grace Hopper", "grace@example.com")])
            .with_delay(Duration::from_millis(50));
        let f = fixture(fetcher);
        let (job, d) = dispatched(&f, &source_fixture(), 3).await;

        let worker = f.worker.clone();
        let handle = tokio::spawn(async move {
            let reporter = MockReporter::default();
            worker.process(d, &reporter).await;
            reporter
        });
        f.registry.cancel_job(job.id, "operator").await.unwrap();
        let events = handle.await.unwrap().events();

        assert_eq!(events.last().map(String::as_str), Some("TaskSkipped"));
        assert_eq!(f.records.count(&RecordQuery::default()).await.unwrap(), 0);
        assert!(f.queue.job_tasks(job.id).await.unwrap().is_empty());
        assert_eq!(
            f.registry.get_job(job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_retryable() {
        let fetcher = MockFetcher::returning(vec![]).with_delay(Duration::from_secs(5));
        let f = fixture(fetcher);
        let reporter = MockReporter::default();
        let (job, d) = dispatched(&f, &source_fixture(), 3).await;

        f.worker.process(d, &reporter).await;

        let task = f.queue.get(job_task(&f, job.id).await).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Delayed);
        assert_eq!(task.error_category.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_source_degrades_after_repeated_failures() {
        let fetcher = MockFetcher::failing(FetchError::Blocked(503));
        let f = fixture(fetcher);
        let reporter = MockReporter::default();
        let source = source_fixture();
        let (job, mut d) = dispatched(&f, &source, 10).await;

        for _ in 0..5 {
            f.worker.process(d, &reporter).await;
            let task = f.queue.get(job_task(&f, job.id).await).await.unwrap().unwrap();
            f.clock.set(task.available_at);
            d = admit(&f, &source, task.id).await;
        }
        let source = f.sources.get(source.id).await.unwrap().unwrap();
        assert_eq!(source.health.status, HealthStatus::Degraded);
        assert_eq!(source.health.consecutive_failures, 5);
    }

    #[tokio::test]
    async fn test_shutdown_releases_undelivered_tasks() {
        let f = fixture(MockFetcher::returning(vec![]));
        let source = source_fixture();
        let (job, d) = dispatched(&f, &source, 3).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(d).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reporter = MockReporter::default();
        f.worker
            .run(Arc::new(Mutex::new(rx)), cancel, &reporter)
            .await
            .unwrap();

        let events = reporter.events();
        assert_eq!(events.first().map(String::as_str), Some("Started"));
        assert!(events.contains(&"ShuttingDown(1)".to_string()));
        let task = f.queue.get(job_task(&f, job.id).await).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Waiting);
        assert!(f.gate.snapshot().await.unwrap().iter().all(|s| s.active == 0));
    }
}
