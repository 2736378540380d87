//! Scraping job lifecycle.
//!
//! Every mutation is a read-modify-write against the store's version CAS,
//! retried a bounded number of times on conflict. Admin mutations emit an
//! audit event and append to the job's activity log.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditEvent, SharedAuditSink};
use crate::clock::SharedClock;
use crate::error::AppError;
use crate::job::{
    BulkAction, BulkResult, CreateJobRequest, JobFilter, JobLogEntry, JobStats, JobStatus,
    LogLevel, ScheduleWindow, ScrapingJob, UpdateJobRequest,
};
use crate::queue::TaskTally;
use crate::traits::{JobStore, SourceStore};

const MAX_CAS_ATTEMPTS: usize = 5;

/// Actor recorded for mutations the system makes on its own.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<ScrapingJob>,
    pub total: u64,
    pub offset: usize,
}

/// What one finished task contributes to its job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    /// Executions the task has consumed.
    pub attempt: u32,
    pub found: u64,
    pub validated: u64,
    pub duplicate: u64,
    pub failed: u64,
    pub error: Option<String>,
}

/// How [`JobRegistry::settle_queued`] resolved a queued job whose tasks
/// are all finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// A job retry released the failed tasks; they run again.
    RerunFailed,
    /// The job finished with this status.
    Finished(JobStatus),
    /// The job is no longer queued.
    Unchanged,
}

#[derive(Clone)]
pub struct JobRegistry<J: JobStore, S: SourceStore> {
    jobs: J,
    sources: S,
    clock: SharedClock,
    audit: SharedAuditSink,
}

impl<J: JobStore, S: SourceStore> JobRegistry<J, S> {
    pub fn new(jobs: J, sources: S, clock: SharedClock, audit: SharedAuditSink) -> Self {
        Self {
            jobs,
            sources,
            clock,
            audit,
        }
    }

    pub async fn create_job(
        &self,
        request: CreateJobRequest,
    ) -> Result<ScrapingJob, AppError> {
        request.validate()?;
        if self.sources.get(request.source_id).await?.is_none() {
            return Err(AppError::not_found("source", request.source_id));
        }
        let job = ScrapingJob::from_request(request, self.clock.now());
        self.jobs.insert(&job).await?;

        tracing::info!(job_id = %job.id, source_id = %job.source_id, "Job created");
        self.log(job.id, LogLevel::Info, format!("Job created by {}", job.created_by))
            .await;
        self.audit.emit(
            AuditEvent::new(&job.created_by, "job.create", "job", job.id, job.created_at)
                .after(&job),
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<ScrapingJob, AppError> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("job", id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, AppError> {
        let jobs = self.jobs.list(filter).await?;
        let total = self.jobs.count(filter).await?;
        Ok(JobPage {
            jobs,
            total,
            offset: filter.offset,
        })
    }

    /// Change configuration of a job that is not in flight.
    pub async fn update_job(
        &self,
        id: Uuid,
        request: UpdateJobRequest,
        actor: &str,
    ) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |job| {
                if !matches!(
                    job.status,
                    JobStatus::Pending | JobStatus::Paused | JobStatus::Failed
                ) {
                    return Err(invalid(job, "update"));
                }
                request.clone().apply(job)?;
                job.updated_at = now;
                Ok(true)
            })
            .await?;
        self.admin_done(actor, "job.update", &before, &after, "Configuration updated")
            .await;
        Ok(after)
    }

    pub async fn delete_job(&self, id: Uuid, actor: &str) -> Result<(), AppError> {
        let job = self.get_job(id).await?;
        if !(job.status.is_terminal() || job.status == JobStatus::Pending) {
            return Err(invalid(&job, "delete"));
        }
        if !self.jobs.delete(id).await? {
            return Err(AppError::not_found("job", id));
        }
        tracing::info!(job_id = %id, %actor, "Job deleted");
        self.audit.emit(
            AuditEvent::new(actor, "job.delete", "job", id, self.clock.now()).before(&job),
        );
        Ok(())
    }

    pub async fn start_job(&self, id: Uuid, actor: &str) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |job| {
                if !matches!(job.status, JobStatus::Pending | JobStatus::Paused) {
                    return Err(invalid(job, "start"));
                }
                job.transition(JobStatus::Queued, "start", now)?;
                Ok(true)
            })
            .await?;
        self.admin_done(actor, "job.start", &before, &after, "Job queued").await;
        Ok(after)
    }

    /// Stop dispatching new tasks; tasks already running finish.
    pub async fn pause_job(
        &self,
        id: Uuid,
        reason: Option<String>,
        actor: &str,
    ) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |job| {
                if job.status != JobStatus::Running {
                    return Err(invalid(job, "pause"));
                }
                job.transition(JobStatus::Paused, "pause", now)?;
                job.pause_reason = reason.clone();
                Ok(true)
            })
            .await?;
        self.admin_done(actor, "job.pause", &before, &after, "Job paused").await;
        Ok(after)
    }

    pub async fn resume_job(&self, id: Uuid, actor: &str) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |job| {
                if job.status != JobStatus::Paused {
                    return Err(invalid(job, "resume"));
                }
                job.transition(JobStatus::Queued, "resume", now)?;
                Ok(true)
            })
            .await?;
        self.admin_done(actor, "job.resume", &before, &after, "Job resumed").await;
        Ok(after)
    }

    /// Cancel a non-terminal job. Its waiting tasks are dropped by the
    /// dispatcher; completions of in-flight tasks become no-ops.
    pub async fn cancel_job(&self, id: Uuid, actor: &str) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |job| {
                job.transition(JobStatus::Cancelled, "cancel", now)?;
                Ok(true)
            })
            .await?;
        self.admin_done(actor, "job.cancel", &before, &after, "Job cancelled").await;
        Ok(after)
    }

    /// Re-queue a failed job, consuming one retry. Its failed tasks run again
    /// once the scheduler sees the job.
    pub async fn retry_job(&self, id: Uuid, actor: &str) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |job| {
                if job.status != JobStatus::Failed {
                    return Err(invalid(job, "retry"));
                }
                if job.attempt + 1 > job.max_retries {
                    return Err(AppError::Validation(format!(
                        "Job {} has used all {} retries",
                        job.id, job.max_retries
                    )));
                }
                job.transition(JobStatus::Queued, "retry", now)?;
                job.attempt += 1;
                job.completed_at = None;
                job.progress.tasks_failed = 0;
                Ok(true)
            })
            .await?;
        self.admin_done(actor, "job.retry", &before, &after, "Job retried").await;
        Ok(after)
    }

    /// A new pending job with the same configuration.
    pub async fn clone_job(&self, id: Uuid, actor: &str) -> Result<ScrapingJob, AppError> {
        let original = self.get_job(id).await?;
        let copy = original.clone_config(actor, self.clock.now());
        self.jobs.insert(&copy).await?;

        tracing::info!(job_id = %copy.id, cloned_from = %id, "Job cloned");
        self.log(copy.id, LogLevel::Info, format!("Cloned from {id}")).await;
        self.audit.emit(
            AuditEvent::new(actor, "job.clone", "job", copy.id, copy.created_at)
                .before(&original)
                .after(&copy),
        );
        Ok(copy)
    }

    /// Apply one action to many jobs. Each id gets its own result; a failure
    /// never stops the batch.
    pub async fn bulk_operation(
        &self,
        action: BulkAction,
        ids: &[Uuid],
        actor: &str,
    ) -> Vec<BulkResult> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let outcome = match action {
                BulkAction::Start => self.start_job(id, actor).await.map(Some),
                BulkAction::Pause => self
                    .pause_job(id, Some("bulk pause".into()), actor)
                    .await
                    .map(Some),
                BulkAction::Resume => self.resume_job(id, actor).await.map(Some),
                BulkAction::Cancel => self.cancel_job(id, actor).await.map(Some),
                BulkAction::Retry => self.retry_job(id, actor).await.map(Some),
                BulkAction::Delete => self.delete_job(id, actor).await.map(|()| None),
            };
            results.push(match outcome {
                Ok(job) => BulkResult {
                    id,
                    success: true,
                    status: job.map(|j| j.status),
                    error: None,
                },
                Err(e) => BulkResult {
                    id,
                    success: false,
                    status: None,
                    error: Some(e.to_string()),
                },
            });
        }
        results
    }

    pub async fn job_logs(&self, id: Uuid, limit: usize) -> Result<Vec<JobLogEntry>, AppError> {
        self.get_job(id).await?;
        self.jobs.logs(id, limit).await
    }

    pub async fn job_stats(&self) -> Result<JobStats, AppError> {
        let jobs = self.jobs.list(&JobFilter::default()).await?;
        let mut by_status: BTreeMap<String, u64> = JobStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut by_type = BTreeMap::new();
        for job in &jobs {
            *by_status.entry(job.status.as_str().to_string()).or_default() += 1;
            *by_type.entry(job.job_type.as_str().to_string()).or_default() += 1;
        }
        Ok(JobStats {
            total: jobs.len() as u64,
            by_status,
            by_type,
        })
    }

    // -----------------------------------------------------------------------
    // System transitions, driven by the scheduler, dispatcher and workers.
    // -----------------------------------------------------------------------

    /// Move a queued job to running on its first dispatch. No-op if already running.
    pub async fn mark_running(&self, id: Uuid) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |job| {
                if job.status == JobStatus::Running {
                    return Ok(false);
                }
                job.transition(JobStatus::Running, "dispatch", now)?;
                Ok(true)
            })
            .await?;
        if before.status != after.status {
            tracing::info!(job_id = %id, "Job running");
            self.log(id, LogLevel::Info, "First task dispatched".into()).await;
        }
        Ok(after)
    }

    /// Pause every running job of a source. Returns the ids paused.
    ///
    /// Queued jobs are left queued: the dispatcher holds their tasks while the
    /// source is not dispatchable and they start once it recovers.
    pub async fn auto_pause_for_source(
        &self,
        source_id: Uuid,
        reason: &str,
    ) -> Result<Vec<Uuid>, AppError> {
        let filter = JobFilter {
            source_id: Some(source_id),
            ..JobFilter::with_status(JobStatus::Running)
        };
        let now = self.clock.now();
        let mut paused = Vec::new();
        for job in self.jobs.list(&filter).await? {
            let result = self
                .modify(job.id, |job| {
                    if job.status != JobStatus::Running {
                        return Ok(false);
                    }
                    job.transition(JobStatus::Paused, "pause", now)?;
                    job.pause_reason = Some(reason.to_string());
                    Ok(true)
                })
                .await;
            match result {
                Ok((before, after)) if before.status != after.status => {
                    tracing::warn!(job_id = %job.id, %source_id, %reason, "Job auto-paused");
                    self.log(job.id, LogLevel::Warn, format!("Auto-paused: {reason}"))
                        .await;
                    self.audit.emit(
                        AuditEvent::new(SYSTEM_ACTOR, "job.auto_pause", "job", job.id, now)
                            .before(&before)
                            .after(&after),
                    );
                    paused.push(job.id);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to auto-pause job");
                }
            }
        }
        Ok(paused)
    }

    /// Record how many tasks the scheduler planned for a job.
    pub async fn record_plan(&self, id: Uuid, tasks: u64) -> Result<ScrapingJob, AppError> {
        let now = self.clock.now();
        let (_, after) = self
            .modify(id, |job| {
                job.progress.tasks_total = tasks;
                job.updated_at = now;
                Ok(true)
            })
            .await?;
        self.log(id, LogLevel::Info, format!("Planned {tasks} task(s)")).await;
        Ok(after)
    }

    /// Resolve a queued job whose tasks are all finished.
    ///
    /// Right after `retry_job` the failed-task counter is zero while failed
    /// tasks remain, and those tasks run again. Any other settled queued job
    /// (one resumed after its tasks finished while paused) finishes the way
    /// [`record_task_outcome`](Self::record_task_outcome) would finish it.
    pub async fn settle_queued(&self, id: Uuid, tally: TaskTally) -> Result<Settlement, AppError> {
        let now = self.clock.now();
        let mut settlement = Settlement::Unchanged;
        let (before, after) = self
            .modify(id, |job| {
                if job.status != JobStatus::Queued || !tally.is_settled() {
                    settlement = Settlement::Unchanged;
                    return Ok(false);
                }
                if tally.failed > 0 && job.progress.tasks_failed == 0 {
                    settlement = Settlement::RerunFailed;
                    return Ok(false);
                }
                job.transition(JobStatus::Running, "dispatch", now)?;
                if tally.completed == 0 {
                    job.transition(JobStatus::Failed, "fail", now)?;
                } else {
                    job.transition(JobStatus::Completed, "complete", now)?;
                }
                apply_tally(job, tally);
                settlement = Settlement::Finished(job.status);
                Ok(true)
            })
            .await?;
        if before.status != after.status {
            tracing::info!(job_id = %id, status = %after.status, "Settled job finished");
            self.log(
                id,
                LogLevel::Info,
                format!(
                    "Finished without new dispatches: {} task(s) completed, {} failed",
                    tally.completed, tally.failed
                ),
            )
            .await;
        }
        Ok(settlement)
    }

    /// Fold one finished task into its job and settle the job's status once
    /// no task is outstanding.
    ///
    /// Returns `None` if the job is gone or already terminal.
    pub async fn record_task_outcome(
        &self,
        job_id: Uuid,
        outcome: &TaskOutcome,
        tally: TaskTally,
    ) -> Result<Option<ScrapingJob>, AppError> {
        let now = self.clock.now();
        let result = self
            .modify(job_id, |job| {
                if job.status.is_terminal() {
                    return Ok(false);
                }
                job.progress.found += outcome.found;
                job.progress.validated += outcome.validated;
                job.progress.duplicate += outcome.duplicate;
                job.progress.failed += outcome.failed;
                apply_tally(job, tally);
                job.attempt = job.attempt.max(outcome.attempt);
                if let Some(error) = &outcome.error {
                    job.last_error_reason = Some(error.clone());
                }
                job.updated_at = now;

                if job.status == JobStatus::Running && tally.is_settled() {
                    if tally.completed == 0 {
                        job.transition(JobStatus::Failed, "fail", now)?;
                    } else {
                        job.transition(JobStatus::Completed, "complete", now)?;
                    }
                }
                Ok(true)
            })
            .await;

        let (before, after) = match result {
            Ok(pair) => pair,
            Err(AppError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if after.status.is_terminal() && before.status == after.status {
            tracing::debug!(%job_id, task_id = %outcome.task_id, "Outcome for terminal job ignored");
            return Ok(None);
        }
        if before.status != after.status {
            match after.status {
                JobStatus::Failed => {
                    tracing::warn!(%job_id, attempt = after.attempt, "Job failed");
                    let reason = after.last_error_reason.as_deref().unwrap_or("unknown error");
                    self.log(job_id, LogLevel::Error, format!("Job failed: {reason}"))
                        .await;
                }
                _ => {
                    tracing::info!(
                        %job_id,
                        tasks_failed = after.progress.tasks_failed,
                        "Job completed"
                    );
                    self.log(
                        job_id,
                        LogLevel::Info,
                        format!(
                            "Job completed: {} record(s), {} task(s) failed",
                            after.progress.found, after.progress.tasks_failed
                        ),
                    )
                    .await;
                }
            }
        } else if let Some(error) = &outcome.error {
            self.log(job_id, LogLevel::Warn, format!("Task failed: {error}"))
                .await;
        }
        Ok(Some(after))
    }

    /// Schedule the next run of a completed recurring job.
    ///
    /// The next run starts `repeat_every_secs` after completion and keeps the
    /// window's length. Returns `None` if the job does not repeat or was
    /// already re-armed.
    pub async fn rearm(&self, id: Uuid) -> Result<Option<ScrapingJob>, AppError> {
        let now = self.clock.now();
        let next_id = Uuid::new_v4();
        let (before, after) = self
            .modify(id, |job| {
                let eligible = job.status == JobStatus::Completed
                    && job.next_run_id.is_none()
                    && job.schedule.repeat_every_secs.is_some();
                if !eligible {
                    return Ok(false);
                }
                job.next_run_id = Some(next_id);
                Ok(true)
            })
            .await?;
        if before.next_run_id.is_some() || after.next_run_id != Some(next_id) {
            return Ok(None);
        }

        let mut next = after.clone_config(SYSTEM_ACTOR, now);
        next.id = next_id;
        next.schedule = next_window(&after.schedule, after.completed_at.unwrap_or(now));
        next.transition(JobStatus::Queued, "start", now)?;
        self.jobs.insert(&next).await?;

        tracing::info!(job_id = %id, next_run = %next_id, start_at = ?next.schedule.start_at, "Recurring job re-armed");
        self.log(id, LogLevel::Info, format!("Next run scheduled as {next_id}"))
            .await;
        self.log(next_id, LogLevel::Info, format!("Scheduled run of {id}"))
            .await;
        Ok(Some(next))
    }

    async fn modify<F>(&self, id: Uuid, mut f: F) -> Result<(ScrapingJob, ScrapingJob), AppError>
    where
        F: FnMut(&mut ScrapingJob) -> Result<bool, AppError> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_job(id).await?;
            let mut next = current.clone();
            if !f(&mut next)? {
                return Ok((current.clone(), current));
            }
            match self.jobs.update(&next).await {
                Ok(saved) => return Ok((current, saved)),
                Err(AppError::VersionConflict { .. }) => {
                    tracing::debug!(job_id = %id, "Job version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::conflict("job", id))
    }

    async fn admin_done(
        &self,
        actor: &str,
        action: &str,
        before: &ScrapingJob,
        after: &ScrapingJob,
        message: &str,
    ) {
        tracing::info!(job_id = %after.id, %actor, from = %before.status, to = %after.status, "{message}");
        self.log(after.id, LogLevel::Info, format!("{message} by {actor}"))
            .await;
        self.audit.emit(
            AuditEvent::new(actor, action, "job", after.id, after.updated_at)
                .before(before)
                .after(after),
        );
    }

    async fn log(&self, job_id: Uuid, level: LogLevel, message: String) {
        let entry = JobLogEntry {
            job_id,
            level,
            message,
            at: self.clock.now(),
        };
        if let Err(e) = self.jobs.append_log(&entry).await {
            tracing::warn!(%job_id, error = %e, "Failed to append job log");
        }
    }
}

fn invalid(job: &ScrapingJob, action: &'static str) -> AppError {
    AppError::InvalidTransition {
        entity: "job",
        id: job.id.to_string(),
        from: job.status.to_string(),
        action,
    }
}

fn apply_tally(job: &mut ScrapingJob, tally: TaskTally) {
    job.progress.tasks_total = job.progress.tasks_total.max(tally.total);
    job.progress.tasks_completed = tally.completed;
    job.progress.tasks_failed = tally.failed;
}

fn next_window(window: &ScheduleWindow, completed_at: DateTime<Utc>) -> ScheduleWindow {
    let interval = TimeDelta::seconds(window.repeat_every_secs.unwrap_or(0) as i64);
    let start_at = completed_at + interval;
    let end_at = match (window.start_at, window.end_at) {
        (Some(start), Some(end)) => Some(start_at + (end - start)),
        _ => None,
    };
    ScheduleWindow {
        start_at: Some(start_at),
        end_at,
        repeat_every_secs: window.repeat_every_secs,
    }
}
