//! Turns queued jobs into queue tasks and re-arms recurring jobs.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::error::AppError;
use crate::job::{JobFilter, JobStatus, ScrapingJob};
use crate::job_registry::{JobRegistry, Settlement};
use crate::queue::{NewTask, Queue, TaskPayload, TaskState, TaskTally};
use crate::traits::{JobStore, SourceStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Jobs whose tasks were enqueued for the first time.
    pub planned: u64,
    /// Jobs whose failed tasks were put back.
    pub retried: u64,
    /// Queued jobs whose tasks had all finished, settled without new dispatches.
    pub settled: u64,
    pub rearmed: u64,
}

enum Planned {
    Enqueued(u64),
    Retried(u64),
    Settled,
    Nothing,
}

pub struct Scheduler<J: JobStore, S: SourceStore, Q: Queue> {
    registry: JobRegistry<J, S>,
    jobs: J,
    sources: S,
    queue: Q,
    clock: SharedClock,
}

impl<J: JobStore, S: SourceStore, Q: Queue> Scheduler<J, S, Q> {
    pub fn new(registry: JobRegistry<J, S>, jobs: J, sources: S, queue: Q, clock: SharedClock) -> Self {
        Self {
            registry,
            jobs,
            sources,
            queue,
            clock,
        }
    }

    /// One scheduling pass. Failures on one job are logged and skipped.
    pub async fn tick(&self) -> Result<TickReport, AppError> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let queued = self
            .jobs
            .list(&JobFilter::with_status(JobStatus::Queued))
            .await?;
        for job in queued.iter().filter(|j| j.schedule.is_open(now)) {
            match self.plan(job).await {
                Ok(Planned::Enqueued(tasks)) => {
                    tracing::info!(job_id = %job.id, tasks, "Job planned");
                    report.planned += 1;
                }
                Ok(Planned::Retried(tasks)) => {
                    tracing::info!(job_id = %job.id, tasks, "Failed tasks re-queued");
                    report.retried += 1;
                }
                Ok(Planned::Settled) => report.settled += 1,
                Ok(Planned::Nothing) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to plan job");
                }
            }
        }

        let finished = self
            .jobs
            .list(&JobFilter::with_status(JobStatus::Completed))
            .await?;
        for job in finished
            .iter()
            .filter(|j| j.schedule.repeat_every_secs.is_some() && j.next_run_id.is_none())
        {
            match self.registry.rearm(job.id).await {
                Ok(Some(_)) => report.rearmed += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to re-arm job");
                }
            }
        }

        Ok(report)
    }

    async fn plan(&self, job: &ScrapingJob) -> Result<Planned, AppError> {
        let tasks = self.queue.job_tasks(job.id).await?;
        if tasks.is_empty() {
            return self.enqueue_pages(job).await.map(Planned::Enqueued);
        }

        let tally = TaskTally::from_tasks(&tasks);
        if tally.outstanding > 0 {
            return Ok(Planned::Nothing);
        }
        match self.registry.settle_queued(job.id, tally).await? {
            Settlement::RerunFailed => {
                let mut retried = 0;
                for task in tasks.iter().filter(|t| t.state == TaskState::Failed) {
                    self.queue.retry(task.id, self.clock.now()).await?;
                    retried += 1;
                }
                Ok(Planned::Retried(retried))
            }
            Settlement::Finished(_) => Ok(Planned::Settled),
            Settlement::Unchanged => Ok(Planned::Nothing),
        }
    }

    async fn enqueue_pages(&self, job: &ScrapingJob) -> Result<u64, AppError> {
        let source = self
            .sources
            .get(job.source_id)
            .await?
            .ok_or_else(|| AppError::not_found("source", job.source_id))?;
        let pages = if source.kind.is_paged() {
            job.pages.max(1)
        } else {
            1
        };

        let now = self.clock.now();
        for page in 1..=pages {
            let task = NewTask {
                queue: source.kind.queue_name().to_string(),
                job_id: job.id,
                source_id: source.id,
                payload: TaskPayload { page, cursor: None },
                priority: job.priority,
                max_attempts: job.max_retries.max(1),
            };
            self.queue.enqueue(task, now).await?;
        }
        self.registry.record_plan(job.id, u64::from(pages)).await?;
        Ok(u64::from(pages))
    }

    /// Tick every `interval` until cancelled.
    pub async fn run(&self, cancel_token: CancellationToken, interval: Duration) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "Scheduler started");
        loop {
            match self.tick().await {
                Ok(report) if report != TickReport::default() => {
                    tracing::debug!(?report, "Scheduler tick");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel_token.cancelled() => break,
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
