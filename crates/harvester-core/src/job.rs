use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle status of a scraping job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Finished for reporting purposes (a failed job may still be retried).
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The declared state graph.
    ///
    /// ```text
    /// pending → queued → running → {completed, failed, paused, cancelled}
    /// paused → queued, failed → queued, any non-terminal → cancelled
    /// ```
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (*self, next) {
            (Pending, Queued) | (Queued, Running) | (Paused, Queued) | (Failed, Queued) => true,
            (Running, Completed | Failed | Paused) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullScrape,
    Incremental,
    Targeted,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullScrape => "full_scrape",
            JobType::Incremental => "incremental",
            JobType::Targeted => "targeted",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full_scrape" => Ok(JobType::FullScrape),
            "incremental" => Ok(JobType::Incremental),
            "targeted" => Ok(JobType::Targeted),
            _ => Err(format!("Unknown job type: {}", s)),
        }
    }
}

/// When a job may run, and whether it repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    /// Re-run interval for recurring jobs.
    pub repeat_every_secs: Option<u64>,
}

impl ScheduleWindow {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.start_at.is_none_or(|start| start <= now) && self.end_at.is_none_or(|end| now <= end)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if let (Some(start), Some(end)) = (self.start_at, self.end_at)
            && end <= start
        {
            return Err(AppError::Validation(
                "schedule end_at must be after start_at".into(),
            ));
        }
        if self.repeat_every_secs.is_some_and(|secs| secs < 60) {
            return Err(AppError::Validation(
                "repeat_every_secs must be at least 60".into(),
            ));
        }
        Ok(())
    }
}

/// Record and task counters for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub found: u64,
    pub validated: u64,
    pub duplicate: u64,
    pub failed: u64,
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Retry configuration: exponential backoff with jitter.
///
/// Delay for attempt `n` (1-indexed) is `base * multiplier^(n-1)`, capped at
/// `max_delay`, then spread by ±`jitter_factor`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt).as_secs_f64();
        if self.jitter_factor <= 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter_factor;
        let jitter = rand::random_range(-spread..spread);
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt);
        now + TimeDelta::milliseconds(delay.as_millis() as i64)
    }
}

/// A unit of scraping work scoped to one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingJob {
    pub id: Uuid,
    pub name: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    pub source_id: Uuid,
    pub schedule: ScheduleWindow,
    /// Number of pages (tasks) to fetch per run.
    pub pages: u32,
    pub tags: Vec<String>,
    pub created_by: String,
    pub progress: JobProgress,
    pub attempt: u32,
    pub max_retries: u32,
    pub last_error_reason: Option<String>,
    pub pause_reason: Option<String>,
    /// Set once a recurring job has been re-armed as a new job.
    pub next_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl ScrapingJob {
    pub fn from_request(request: CreateJobRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            job_type: request.job_type,
            status: JobStatus::Pending,
            priority: request.priority,
            source_id: request.source_id,
            schedule: request.schedule,
            pages: request.pages,
            tags: request.tags,
            created_by: request.created_by,
            progress: JobProgress::default(),
            attempt: 0,
            max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            last_error_reason: None,
            pause_reason: None,
            next_run_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    /// Apply a transition, or fail with the state untouched.
    pub fn transition(
        &mut self,
        next: JobStatus,
        action: &'static str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                entity: "job",
                id: self.id.to_string(),
                from: self.status.to_string(),
                action,
            });
        }
        self.status = next;
        self.updated_at = now;
        match next {
            JobStatus::Queued => self.pause_reason = None,
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            JobStatus::Pending | JobStatus::Paused => {}
        }
        Ok(())
    }

    /// A copy of this job's configuration with fresh identity and counters.
    pub fn clone_config(&self, created_by: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            job_type: self.job_type,
            status: JobStatus::Pending,
            priority: self.priority,
            source_id: self.source_id,
            schedule: self.schedule.clone(),
            pages: self.pages,
            tags: self.tags.clone(),
            created_by: created_by.to_string(),
            progress: JobProgress::default(),
            attempt: 0,
            max_retries: self.max_retries,
            last_error_reason: None,
            pause_reason: None,
            next_run_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
const MAX_PAGES: u32 = 10_000;
const MAX_RETRIES_LIMIT: u32 = 20;

/// Request to create a new scraping job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub source_id: Uuid,
    pub job_type: JobType,
    pub priority: i32,
    pub schedule: ScheduleWindow,
    pub pages: u32,
    pub tags: Vec<String>,
    pub max_retries: Option<u32>,
    pub created_by: String,
}

impl CreateJobRequest {
    pub fn new(name: impl Into<String>, source_id: Uuid, created_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_id,
            job_type: JobType::FullScrape,
            priority: 0,
            schedule: ScheduleWindow::default(),
            pages: 1,
            tags: Vec::new(),
            max_retries: None,
            created_by: created_by.into(),
        }
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_pages(mut self, pages: u32) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleWindow) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("job name must not be empty".into()));
        }
        validate_pages(self.pages)?;
        if let Some(max) = self.max_retries {
            validate_max_retries(max)?;
        }
        self.schedule.validate()
    }
}

/// Partial update of a job's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub schedule: Option<ScheduleWindow>,
    pub pages: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub max_retries: Option<u32>,
}

impl UpdateJobRequest {
    pub fn apply(self, job: &mut ScrapingJob) -> Result<(), AppError> {
        if let Some(name) = self.name {
            if name.trim().is_empty() {
                return Err(AppError::Validation("job name must not be empty".into()));
            }
            job.name = name;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(schedule) = self.schedule {
            schedule.validate()?;
            job.schedule = schedule;
        }
        if let Some(pages) = self.pages {
            validate_pages(pages)?;
            job.pages = pages;
        }
        if let Some(tags) = self.tags {
            job.tags = tags;
        }
        if let Some(max) = self.max_retries {
            validate_max_retries(max)?;
            job.max_retries = max;
        }
        Ok(())
    }
}

fn validate_pages(pages: u32) -> Result<(), AppError> {
    if pages == 0 || pages > MAX_PAGES {
        return Err(AppError::Validation(format!(
            "pages must be between 1 and {MAX_PAGES}"
        )));
    }
    Ok(())
}

fn validate_max_retries(max: u32) -> Result<(), AppError> {
    if max > MAX_RETRIES_LIMIT {
        return Err(AppError::Validation(format!(
            "max_retries must be at most {MAX_RETRIES_LIMIT}"
        )));
    }
    Ok(())
}

/// Query over jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub source_id: Option<Uuid>,
    pub job_type: Option<JobType>,
    pub tag: Option<String>,
    pub created_by: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &ScrapingJob) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.source_id.is_none_or(|s| job.source_id == s)
            && self.job_type.is_none_or(|t| job.job_type == t)
            && self.tag.as_ref().is_none_or(|t| job.tags.contains(t))
            && self
                .created_by
                .as_ref()
                .is_none_or(|c| &job.created_by == c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Unknown log level: {s}")),
        }
    }
}

/// One line in a job's activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Operations accepted by bulk job updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Start,
    Pause,
    Resume,
    Cancel,
    Retry,
    Delete,
}

impl FromStr for BulkAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" => Ok(BulkAction::Start),
            "pause" => Ok(BulkAction::Pause),
            "resume" => Ok(BulkAction::Resume),
            "cancel" => Ok(BulkAction::Cancel),
            "retry" => Ok(BulkAction::Retry),
            "delete" => Ok(BulkAction::Delete),
            _ => Err(format!("Unknown bulk action: {s}")),
        }
    }
}

/// Per-id outcome of a bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkResult {
    pub id: Uuid,
    pub success: bool,
    /// Status after the operation (or unchanged status on failure, if known).
    pub status: Option<JobStatus>,
    pub error: Option<String>,
}

/// Counts of jobs by status and type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub by_status: std::collections::BTreeMap<String, u64>,
    pub by_type: std::collections::BTreeMap<String, u64>,
}
