//! Moves ready tasks from one queue to the worker channel, admitting each
//! through the gate.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::AppError;
use crate::gate::{Denial, GateHandle, Permit, ProxyOutcome};
use crate::job::{JobStatus, ScrapingJob};
use crate::job_registry::JobRegistry;
use crate::queue::{Nack, NackDisposition, Queue, QueueTask};
use crate::source::Source;
use crate::source_registry::SourceRegistry;
use crate::traits::{JobStore, Prober, SourceStore};

/// A claimed task with its admission, ready for a worker.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub task: QueueTask,
    pub permit: Permit,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dispatched: u64,
    /// Tasks of deleted or finished jobs, dropped from the queue.
    pub removed: u64,
    /// Tasks held back by the gate.
    pub denied: u64,
    /// Tasks left in place because their job or source is not runnable now.
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ready tasks read per cycle.
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

pub struct Dispatcher<J, S, Q, P>
where
    J: JobStore,
    S: SourceStore,
    Q: Queue,
    P: Prober,
{
    registry: JobRegistry<J, S>,
    source_registry: SourceRegistry<S, J, P>,
    jobs: J,
    sources: S,
    queue: Q,
    gate: GateHandle,
    tx: mpsc::Sender<Dispatched>,
    clock: SharedClock,
    config: DispatcherConfig,
}

impl<J, S, Q, P> Dispatcher<J, S, Q, P>
where
    J: JobStore,
    S: SourceStore,
    Q: Queue,
    P: Prober,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: JobRegistry<J, S>,
        source_registry: SourceRegistry<S, J, P>,
        jobs: J,
        sources: S,
        queue: Q,
        gate: GateHandle,
        tx: mpsc::Sender<Dispatched>,
        clock: SharedClock,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            source_registry,
            jobs,
            sources,
            queue,
            gate,
            tx,
            clock,
            config,
        }
    }

    /// One pass over a queue's ready tasks in dispatch order.
    ///
    /// Once a source is denied, its remaining tasks wait for the next cycle,
    /// so lower-priority work of other sources still moves.
    pub async fn cycle(&self, queue_name: &str) -> Result<DispatchReport, AppError> {
        let mut report = DispatchReport::default();
        if self.queue.is_paused(queue_name).await? {
            return Ok(report);
        }

        let now = self.clock.now();
        let ready = self
            .queue
            .ready(queue_name, now, self.config.batch_size)
            .await?;
        let worker_id = format!("dispatch:{queue_name}");

        let mut jobs: HashMap<Uuid, Option<ScrapingJob>> = HashMap::new();
        let mut sources: HashMap<Uuid, Option<Source>> = HashMap::new();
        let mut blocked: HashSet<Uuid> = HashSet::new();

        for task in ready {
            if blocked.contains(&task.source_id) {
                report.skipped += 1;
                continue;
            }

            if !jobs.contains_key(&task.job_id) {
                jobs.insert(task.job_id, self.jobs.get(task.job_id).await?);
            }
            let job_status = jobs
                .get(&task.job_id)
                .and_then(|j| j.as_ref())
                .map(|j| j.status);
            match job_status {
                None => {
                    self.drop_task(&task, "job no longer exists").await?;
                    report.removed += 1;
                    continue;
                }
                Some(status) if status.is_terminal() => {
                    self.drop_task(&task, status.as_str()).await?;
                    report.removed += 1;
                    continue;
                }
                Some(JobStatus::Queued | JobStatus::Running) => {}
                Some(_) => {
                    report.skipped += 1;
                    continue;
                }
            }

            if !sources.contains_key(&task.source_id) {
                sources.insert(task.source_id, self.sources.get(task.source_id).await?);
            }
            let Some(source) = sources.get(&task.source_id).and_then(|s| s.clone()) else {
                self.drop_task(&task, "source no longer exists").await?;
                report.removed += 1;
                continue;
            };
            if !source.is_dispatchable() {
                blocked.insert(source.id);
                report.skipped += 1;
                continue;
            }

            let permit = match self.gate.try_acquire(&source).await {
                Ok(permit) => permit,
                Err(Denial::Unavailable) => {
                    return Err(AppError::Generic("Gate task is not running".into()));
                }
                Err(denial) => {
                    tracing::debug!(source_id = %source.id, %denial, "Dispatch denied");
                    blocked.insert(source.id);
                    report.denied += 1;
                    if denial == Denial::ProxyPoolExhausted {
                        self.on_pool_exhausted(&source).await;
                    }
                    continue;
                }
            };

            if job_status == Some(JobStatus::Queued) {
                match self.registry.mark_running(task.job_id).await {
                    Ok(job) => {
                        jobs.insert(job.id, Some(job));
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %task.job_id, error = %e, "Could not mark job running");
                        self.release(permit).await;
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            let Some(claimed) = self
                .queue
                .dequeue(task.id, &worker_id, permit.proxy_id, now)
                .await?
            else {
                self.release(permit).await;
                continue;
            };

            let dispatched = Dispatched {
                task: claimed,
                permit,
                source,
            };
            if let Err(mpsc::error::SendError(back)) = self.tx.send(dispatched).await {
                self.requeue(&back.task, "worker pool closed").await;
                self.release(back.permit).await;
                return Err(AppError::Generic("Worker channel closed".into()));
            }
            report.dispatched += 1;
        }

        Ok(report)
    }

    /// Dispatch until cancelled, pausing `interval` after an idle cycle.
    pub async fn run(&self, queue_name: &str, cancel_token: CancellationToken, interval: Duration) {
        tracing::info!(queue = %queue_name, "Dispatcher started");
        loop {
            if cancel_token.is_cancelled() {
                break;
            }
            let idle = match self.cycle(queue_name).await {
                Ok(report) => report.dispatched == 0,
                Err(e) => {
                    tracing::error!(queue = %queue_name, error = %e, "Dispatch cycle failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel_token.cancelled() => break,
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
        tracing::info!(queue = %queue_name, "Dispatcher stopped");
    }

    async fn drop_task(&self, task: &QueueTask, reason: &str) -> Result<(), AppError> {
        tracing::debug!(task_id = %task.id, job_id = %task.job_id, %reason, "Dropping task");
        self.queue.remove(task.id).await?;
        Ok(())
    }

    async fn on_pool_exhausted(&self, source: &Source) {
        let reason = "all proxies excluded";
        if let Err(e) = self.source_registry.mark_degraded(source.id, reason).await {
            tracing::error!(source_id = %source.id, error = %e, "Failed to degrade source");
        }
        match self.registry.auto_pause_for_source(source.id, reason).await {
            Ok(paused) if !paused.is_empty() => {
                tracing::warn!(source_id = %source.id, jobs = paused.len(), "Running jobs paused");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(source_id = %source.id, error = %e, "Failed to pause jobs");
            }
        }
    }

    async fn requeue(&self, task: &QueueTask, reason: &str) {
        let nack = Nack {
            error: reason.to_string(),
            category: "other".into(),
            disposition: NackDisposition::Requeue,
        };
        if let Err(e) = self.queue.nack(task.id, nack, self.clock.now()).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to requeue task");
        }
    }

    async fn release(&self, permit: Permit) {
        if let Err(e) = self.gate.release(permit, ProxyOutcome::Neutral).await {
            tracing::error!(error = %e, "Failed to release permit");
        }
    }
}
