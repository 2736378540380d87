//! Admin and monitoring operations over the named task queues.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::analytics::{DateRange, HISTORY_LOOKBACK};
use crate::audit::{AuditEvent, SharedAuditSink};
use crate::clock::SharedClock;
use crate::error::AppError;
use crate::job::JobStatus;
use crate::queue::{Queue, QueueCounts, QueueTask, TaskState};
use crate::source::QUEUE_NAMES;
use crate::traits::JobStore;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue: String,
    pub counts: QueueCounts,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    pub hour: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub queue: String,
    pub range: DateRange,
    pub completed: u64,
    pub failed: u64,
    pub failure_rate: f64,
    pub avg_processing_ms: Option<f64>,
    pub throughput: Vec<HourBucket>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedReason {
    pub reason: String,
    pub category: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub queue: String,
    pub status: QueueHealthStatus,
    pub backlog: u64,
    pub failure_ratio: f64,
}

/// Backlog and failure-ratio limits for [`QueueManager::queue_health`].
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub degraded_backlog: u64,
    pub degraded_failure_ratio: f64,
    pub critical_backlog: u64,
    pub critical_failure_ratio: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_backlog: 1_000,
            degraded_failure_ratio: 0.10,
            critical_backlog: 10_000,
            critical_failure_ratio: 0.25,
        }
    }
}

impl HealthThresholds {
    pub fn classify(&self, counts: &QueueCounts) -> QueueHealthStatus {
        let backlog = counts.backlog();
        let ratio = counts.failure_ratio();
        if backlog >= self.critical_backlog || ratio >= self.critical_failure_ratio {
            QueueHealthStatus::Critical
        } else if backlog >= self.degraded_backlog || ratio >= self.degraded_failure_ratio {
            QueueHealthStatus::Degraded
        } else {
            QueueHealthStatus::Healthy
        }
    }
}

#[derive(Clone)]
pub struct QueueManager<Q: Queue, J: JobStore> {
    queue: Q,
    jobs: J,
    clock: SharedClock,
    audit: SharedAuditSink,
    thresholds: HealthThresholds,
}

impl<Q: Queue, J: JobStore> QueueManager<Q, J> {
    pub fn new(queue: Q, jobs: J, clock: SharedClock, audit: SharedAuditSink) -> Self {
        Self {
            queue,
            jobs,
            clock,
            audit,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn queue_status(&self, queue: &str) -> Result<QueueStatus, AppError> {
        let queue = known_queue(queue)?;
        Ok(QueueStatus {
            queue: queue.to_string(),
            counts: self.queue.stats(queue).await?,
            paused: self.queue.is_paused(queue).await?,
        })
    }

    pub async fn all_queue_status(&self) -> Result<Vec<QueueStatus>, AppError> {
        let mut out = Vec::with_capacity(QUEUE_NAMES.len());
        for name in QUEUE_NAMES {
            out.push(self.queue_status(name).await?);
        }
        Ok(out)
    }

    pub async fn list_tasks(
        &self,
        queue: &str,
        state: Option<TaskState>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<QueueTask>, AppError> {
        let queue = known_queue(queue)?;
        self.queue.list(queue, state, offset, Some(limit)).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<QueueTask, AppError> {
        self.queue
            .get(task_id)
            .await?
            .ok_or_else(|| AppError::not_found("task", task_id))
    }

    /// Put a failed task back in line with a fresh attempt budget.
    ///
    /// Refused unless the task's job is queued, running or paused. Tasks of a
    /// failed job come back through the job registry's `retry_job`.
    pub async fn retry_task(&self, task_id: Uuid, actor: &str) -> Result<QueueTask, AppError> {
        let task = self.get_task(task_id).await?;
        let status = self.job_status(task.job_id).await?;
        if !dispatches_tasks(status) {
            return Err(not_dispatchable(&task, status));
        }
        let task = self.queue.retry(task_id, self.clock.now()).await?;
        tracing::info!(%task_id, queue = %task.queue, %actor, "Task retried");
        self.audited(actor, "queue.task.retry", &task.id.to_string());
        Ok(task)
    }

    pub async fn retry_all_failed(&self, queue: &str, actor: &str) -> Result<u64, AppError> {
        let queue = known_queue(queue)?;
        let failed = self
            .queue
            .list(queue, Some(TaskState::Failed), 0, None)
            .await?;
        let now = self.clock.now();
        let mut statuses: HashMap<Uuid, Option<JobStatus>> = HashMap::new();
        let mut retried = 0;
        let mut skipped = 0;
        for task in failed {
            let status = match statuses.get(&task.job_id) {
                Some(status) => *status,
                None => {
                    let status = self.jobs.get(task.job_id).await?.map(|j| j.status);
                    statuses.insert(task.job_id, status);
                    status
                }
            };
            if !status.is_some_and(dispatches_tasks) {
                skipped += 1;
                continue;
            }
            match self.queue.retry(task.id, now).await {
                Ok(_) => retried += 1,
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Retry skipped"),
            }
        }
        tracing::info!(%queue, retried, skipped, %actor, "Failed tasks retried");
        self.audited(actor, "queue.retry_all", queue);
        Ok(retried)
    }

    pub async fn remove_task(&self, task_id: Uuid, actor: &str) -> Result<(), AppError> {
        if !self.queue.remove(task_id).await? {
            return Err(AppError::not_found("task", task_id));
        }
        tracing::info!(%task_id, %actor, "Task removed");
        self.audited(actor, "queue.task.remove", &task_id.to_string());
        Ok(())
    }

    /// Remove tasks in `state` that finished (or were enqueued, if unfinished)
    /// more than `grace_period_ms` ago.
    pub async fn clean_queue(
        &self,
        queue: &str,
        state: TaskState,
        grace_period_ms: u64,
        actor: &str,
    ) -> Result<u64, AppError> {
        let queue = known_queue(queue)?;
        if state == TaskState::Active {
            return Err(AppError::Validation("active tasks cannot be cleaned".into()));
        }
        let grace = TimeDelta::milliseconds(i64::try_from(grace_period_ms).unwrap_or(i64::MAX));
        let older_than = self.clock.now() - grace;
        let removed = self.queue.clean(queue, state, older_than).await?;
        tracing::info!(%queue, %state, removed, "Queue cleaned");
        self.audited(actor, "queue.clean", queue);
        Ok(removed)
    }

    pub async fn pause_queue(&self, queue: &str, actor: &str) -> Result<(), AppError> {
        let queue = known_queue(queue)?;
        self.queue.set_paused(queue, true).await?;
        tracing::info!(%queue, %actor, "Queue paused");
        self.audited(actor, "queue.pause", queue);
        Ok(())
    }

    pub async fn resume_queue(&self, queue: &str, actor: &str) -> Result<(), AppError> {
        let queue = known_queue(queue)?;
        self.queue.set_paused(queue, false).await?;
        tracing::info!(%queue, %actor, "Queue resumed");
        self.audited(actor, "queue.resume", queue);
        Ok(())
    }

    /// Drop waiting and delayed tasks. Active and finished tasks stay.
    pub async fn empty_queue(&self, queue: &str, actor: &str) -> Result<u64, AppError> {
        let queue = known_queue(queue)?;
        let removed = self.queue.empty(queue).await?;
        tracing::info!(%queue, removed, %actor, "Queue emptied");
        self.audited(actor, "queue.empty", queue);
        Ok(removed)
    }

    pub async fn queue_metrics(
        &self,
        queue: &str,
        range: DateRange,
    ) -> Result<QueueMetrics, AppError> {
        let queue = known_queue(queue)?;
        let tasks = self
            .queue
            .history(Some(queue), range.start - HISTORY_LOOKBACK)
            .await?;

        let mut buckets: BTreeMap<DateTime<Utc>, HourBucket> = BTreeMap::new();
        let mut completed = 0;
        let mut failed = 0;
        let mut processing = Vec::new();
        for task in &tasks {
            let Some(finished) = task.finished_at else {
                continue;
            };
            if !range.contains(finished) {
                continue;
            }
            let hour = finished
                .duration_trunc(TimeDelta::hours(1))
                .unwrap_or(finished);
            let bucket = buckets.entry(hour).or_insert(HourBucket {
                hour,
                completed: 0,
                failed: 0,
            });
            match task.state {
                TaskState::Completed => {
                    completed += 1;
                    bucket.completed += 1;
                    processing.extend(task.processing_ms());
                }
                TaskState::Failed => {
                    failed += 1;
                    bucket.failed += 1;
                }
                _ => {}
            }
        }

        let finished = completed + failed;
        Ok(QueueMetrics {
            queue: queue.to_string(),
            range,
            completed,
            failed,
            failure_rate: if finished == 0 {
                0.0
            } else {
                failed as f64 / finished as f64
            },
            avg_processing_ms: mean(&processing),
            throughput: buckets.into_values().collect(),
        })
    }

    /// Most common failure reasons across failed tasks, most frequent first.
    pub async fn failed_reasons(
        &self,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FailedReason>, AppError> {
        let names: Vec<&str> = match queue {
            Some(q) => vec![known_queue(q)?],
            None => QUEUE_NAMES.to_vec(),
        };
        let mut grouped: HashMap<(String, String), u64> = HashMap::new();
        for name in names {
            for task in self
                .queue
                .list(name, Some(TaskState::Failed), 0, None)
                .await?
            {
                let reason = task.last_error.unwrap_or_else(|| "unknown".into());
                let category = task.error_category.unwrap_or_else(|| "other".into());
                *grouped.entry((reason, category)).or_default() += 1;
            }
        }
        let mut reasons: Vec<FailedReason> = grouped
            .into_iter()
            .map(|((reason, category), count)| FailedReason {
                reason,
                category,
                count,
            })
            .collect();
        reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
        reasons.truncate(limit);
        Ok(reasons)
    }

    pub async fn queue_health(&self) -> Result<Vec<QueueHealth>, AppError> {
        let mut out = Vec::with_capacity(QUEUE_NAMES.len());
        for name in QUEUE_NAMES {
            let counts = self.queue.stats(name).await?;
            out.push(QueueHealth {
                queue: name.to_string(),
                status: self.thresholds.classify(&counts),
                backlog: counts.backlog(),
                failure_ratio: counts.failure_ratio(),
            });
        }
        Ok(out)
    }

    async fn job_status(&self, job_id: Uuid) -> Result<JobStatus, AppError> {
        self.jobs
            .get(job_id)
            .await?
            .map(|j| j.status)
            .ok_or_else(|| AppError::not_found("job", job_id))
    }

    fn audited(&self, actor: &str, action: &str, entity_id: &str) {
        self.audit
            .emit(AuditEvent::new(actor, action, "queue", entity_id, self.clock.now()));
    }
}

fn known_queue(name: &str) -> Result<&'static str, AppError> {
    QUEUE_NAMES
        .iter()
        .copied()
        .find(|q| *q == name)
        .ok_or_else(|| AppError::not_found("queue", name))
}

/// Statuses whose waiting tasks the dispatcher will eventually hand out.
fn dispatches_tasks(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Queued | JobStatus::Running | JobStatus::Paused
    )
}

fn not_dispatchable(task: &QueueTask, status: JobStatus) -> AppError {
    AppError::Validation(format!(
        "Task {} belongs to a {status} job ({}); its tasks are not dispatched",
        task.id, task.job_id
    ))
}

fn mean(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<i64>() as f64 / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::memory::{MemoryJobStore, MemoryQueue};
    use crate::queue::{Nack, NackDisposition, NewTask, TaskPayload};
    use crate::testutil::{MockAuditSink, job_fixture};

    const Q: &str = "listing_api";

    struct Fixture {
        manager: QueueManager<MemoryQueue, MemoryJobStore>,
        queue: MemoryQueue,
        jobs: MemoryJobStore,
        clock: ManualClock,
        job_id: Uuid,
    }

    async fn job_with_status(jobs: &MemoryJobStore, status: JobStatus) -> Uuid {
        let mut job = job_fixture(Uuid::new_v4());
        job.status = status;
        jobs.insert(&job).await.unwrap();
        job.id
    }

    async fn setup() -> Fixture {
        let queue = MemoryQueue::default();
        let jobs = MemoryJobStore::default();
        let clock = ManualClock::new(Utc::now());
        let manager = QueueManager::new(
            queue.clone(),
            jobs.clone(),
            clock.shared(),
            MockAuditSink::new().shared(),
        );
        let job_id = job_with_status(&jobs, JobStatus::Running).await;
        Fixture {
            manager,
            queue,
            jobs,
            clock,
            job_id,
        }
    }

    fn new_task(job_id: Uuid) -> NewTask {
        NewTask {
            queue: Q.into(),
            job_id,
            source_id: Uuid::new_v4(),
            payload: TaskPayload::default(),
            priority: 0,
            max_attempts: 3,
        }
    }

    async fn finish_for(f: &Fixture, job_id: Uuid, ok: bool, error: &str) -> QueueTask {
        let now = f.clock.now();
        let task = f.queue.enqueue(new_task(job_id), now).await.unwrap();
        f.queue.dequeue(task.id, "w", None, now).await.unwrap();
        f.clock.advance(TimeDelta::milliseconds(200));
        let now = f.clock.now();
        if ok {
            f.queue.ack(task.id, now).await.unwrap()
        } else {
            let nack = Nack {
                error: error.into(),
                category: "network".into(),
                disposition: NackDisposition::DeadLetter,
            };
            f.queue.nack(task.id, nack, now).await.unwrap()
        }
    }

    async fn finish(f: &Fixture, ok: bool, error: &str) -> QueueTask {
        finish_for(f, f.job_id, ok, error).await
    }

    #[tokio::test]
    async fn test_unknown_queue_is_not_found() {
        let f = setup().await;
        let err = f.manager.queue_status("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { entity: "queue", .. }));
    }

    #[tokio::test]
    async fn test_clean_only_removes_tasks_past_grace() {
        let f = setup().await;
        let old = finish(&f, true, "").await;
        f.clock.advance(TimeDelta::minutes(10));
        let recent = finish(&f, true, "").await;

        let removed = f
            .manager
            .clean_queue(Q, TaskState::Completed, 60_000, "ops")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(f.manager.get_task(old.id).await.is_err());
        assert!(f.manager.get_task(recent.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_all_failed() {
        let f = setup().await;
        finish(&f, false, "reset").await;
        finish(&f, false, "reset").await;
        finish(&f, true, "").await;

        assert_eq!(f.manager.retry_all_failed(Q, "ops").await.unwrap(), 2);
        let status = f.manager.queue_status(Q).await.unwrap();
        assert_eq!(status.counts.waiting, 2);
        assert_eq!(status.counts.failed, 0);
        assert_eq!(status.counts.completed, 1);
    }

    #[tokio::test]
    async fn test_retry_all_failed_skips_tasks_no_job_will_dispatch() {
        let f = setup().await;
        let failed_job = job_with_status(&f.jobs, JobStatus::Failed).await;
        let stranded = finish_for(&f, failed_job, false, "reset").await;
        let orphan = finish_for(&f, Uuid::new_v4(), false, "reset").await;
        let live = finish(&f, false, "reset").await;

        assert_eq!(f.manager.retry_all_failed(Q, "ops").await.unwrap(), 1);
        assert_eq!(f.manager.get_task(live.id).await.unwrap().state, TaskState::Waiting);
        assert_eq!(f.manager.get_task(stranded.id).await.unwrap().state, TaskState::Failed);
        assert_eq!(f.manager.get_task(orphan.id).await.unwrap().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_retry_task_follows_job_status() {
        let f = setup().await;
        let failed_job = job_with_status(&f.jobs, JobStatus::Failed).await;
        let stranded = finish_for(&f, failed_job, false, "reset").await;
        let err = f.manager.retry_task(stranded.id, "ops").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(f.manager.get_task(stranded.id).await.unwrap().state, TaskState::Failed);

        let paused_job = job_with_status(&f.jobs, JobStatus::Paused).await;
        let parked = finish_for(&f, paused_job, false, "reset").await;
        let retried = f.manager.retry_task(parked.id, "ops").await.unwrap();
        assert_eq!(retried.state, TaskState::Waiting);
        assert_eq!(retried.attempt, 0);
    }

    #[tokio::test]
    async fn test_empty_keeps_finished_tasks() {
        let f = setup().await;
        f.queue.enqueue(new_task(f.job_id), Utc::now()).await.unwrap();
        finish(&f, true, "").await;

        assert_eq!(f.manager.empty_queue(Q, "ops").await.unwrap(), 1);
        assert_eq!(f.manager.queue_status(Q).await.unwrap().counts.completed, 1);
    }

    #[tokio::test]
    async fn test_pause_flag() {
        let f = setup().await;
        f.manager.pause_queue(Q, "ops").await.unwrap();
        assert!(f.manager.queue_status(Q).await.unwrap().paused);
        f.manager.resume_queue(Q, "ops").await.unwrap();
        assert!(!f.manager.queue_status(Q).await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_metrics_and_reasons() {
        let f = setup().await;
        let start = f.clock.now();
        finish(&f, true, "").await;
        finish(&f, true, "").await;
        finish(&f, false, "connection reset").await;
        finish(&f, false, "connection reset").await;
        finish(&f, false, "dns failure").await;

        let range = DateRange::new(start, f.clock.now() + TimeDelta::seconds(1)).unwrap();
        let metrics = f.manager.queue_metrics(Q, range).await.unwrap();
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.failed, 3);
        assert!((metrics.failure_rate - 0.6).abs() < 1e-9);
        assert_eq!(metrics.avg_processing_ms, Some(200.0));
        let total: u64 = metrics.throughput.iter().map(|b| b.completed + b.failed).sum();
        assert_eq!(total, 5);

        let reasons = f.manager.failed_reasons(Some(Q), 1).await.unwrap();
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].reason, "connection reset");
        assert_eq!(reasons[0].count, 2);
    }

    #[tokio::test]
    async fn test_metrics_count_tasks_enqueued_before_range() {
        let f = setup().await;
        let task = f
            .queue
            .enqueue(new_task(f.job_id), f.clock.now())
            .await
            .unwrap();
        f.queue.dequeue(task.id, "w", None, f.clock.now()).await.unwrap();
        f.clock.advance(TimeDelta::hours(2));
        let start = f.clock.now();
        f.clock.advance(TimeDelta::minutes(5));
        f.queue.ack(task.id, f.clock.now()).await.unwrap();

        let range = DateRange::new(start, f.clock.now() + TimeDelta::seconds(1)).unwrap();
        let metrics = f.manager.queue_metrics(Q, range).await.unwrap();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.throughput.len(), 1);
    }

    #[test]
    fn test_health_thresholds() {
        let thresholds = HealthThresholds::default();
        let mut counts = QueueCounts {
            completed: 95,
            failed: 5,
            ..Default::default()
        };
        assert_eq!(thresholds.classify(&counts), QueueHealthStatus::Healthy);
        counts.waiting = 1_000;
        assert_eq!(thresholds.classify(&counts), QueueHealthStatus::Degraded);
        counts.waiting = 0;
        counts.failed = 40;
        assert_eq!(thresholds.classify(&counts), QueueHealthStatus::Critical);
    }
}
