//! Read-only rollups over jobs, sources, records and task history.
//!
//! Range-scoped reports share one [`Snapshot`] per minute-aligned range, held
//! in a moka cache whose time-to-live is the refresh interval.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::AppError;
use crate::job::{JobFilter, JobProgress, JobStatus, ScrapingJob};
use crate::queue::{Queue, QueueCounts, QueueTask, TaskState};
use crate::record::{CvRecord, RecordQuery, RecordStatus};
use crate::source::{HealthStatus, Source, SourceFilter};
use crate::traits::{JobStore, RecordStore, SourceStore};

/// Error categories reported by [`AnalyticsService::error_breakdown`].
pub const ERROR_CATEGORIES: [&str; 7] = [
    "timeout",
    "network",
    "proxy",
    "rate_limited",
    "blocked",
    "parse",
    "other",
];

const SCAN_CHUNK: usize = 500;
const TOP_N: usize = 10;
const MAX_TREND_DAYS: u32 = 365;
const MAX_HOURLY_SPAN: TimeDelta = TimeDelta::days(31);
/// Tasks enqueued this long before a range may still finish inside it.
pub(crate) const HISTORY_LOOKBACK: TimeDelta = TimeDelta::days(1);

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AppError> {
        if start >= end {
            return Err(AppError::Validation(
                "range start must be before its end".into(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn last_hours(now: DateTime<Utc>, hours: i64) -> Result<Self, AppError> {
        Self::new(now - TimeDelta::hours(hours), now)
    }

    pub fn last_days(now: DateTime<Utc>, days: i64) -> Result<Self, AppError> {
        Self::new(now - TimeDelta::days(days), now)
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Both ends truncated to the minute.
    fn cache_key(&self) -> DateRange {
        let minute = TimeDelta::minutes(1);
        DateRange {
            start: truncate(self.start, minute),
            end: truncate(self.end, minute),
        }
    }
}

fn truncate(t: DateTime<Utc>, step: TimeDelta) -> DateTime<Utc> {
    let secs = t.timestamp();
    let floor = secs - secs.rem_euclid(step.num_seconds().max(1));
    DateTime::from_timestamp(floor, 0).unwrap_or(t)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardOverview {
    pub range: DateRange,
    pub jobs_by_status: BTreeMap<String, u64>,
    pub active_jobs: u64,
    pub sources_total: u64,
    pub sources_by_health: BTreeMap<String, u64>,
    pub records_collected: u64,
    pub records_validated: u64,
    pub records_duplicate: u64,
    pub average_quality: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub queue_backlog: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatistics {
    pub job_id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub attempt: u32,
    pub duration_secs: Option<i64>,
    pub tasks: QueueCounts,
    pub avg_task_ms: Option<f64>,
    pub success_rate: f64,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatistics {
    pub source_id: Uuid,
    pub name: String,
    pub health: HealthStatus,
    pub is_active: bool,
    pub jobs_total: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub records: u64,
    pub records_validated: u64,
    pub records_duplicate: u64,
    pub average_quality: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub avg_task_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranked {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvStatistics {
    pub range: DateRange,
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
    pub average_score: f64,
    pub top_skills: Vec<Ranked>,
    pub top_locations: Vec<Ranked>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub range: DateRange,
    pub tasks_finished: u64,
    pub throughput_per_hour: f64,
    pub avg_processing_ms: Option<f64>,
    pub p95_processing_ms: Option<i64>,
    pub success_rate: f64,
    pub records_per_task: f64,
    pub by_queue: BTreeMap<String, QueueCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityPoint {
    pub date: NaiveDate,
    pub records: u64,
    pub average_score: f64,
    pub validated_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyActivity {
    pub hour: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub category: &'static str,
    pub count: u64,
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBreakdown {
    pub range: DateRange,
    pub total: u64,
    pub categories: Vec<CategoryCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Records,
    AverageScore,
    Tasks,
    FailedTasks,
    FailureRate,
    Jobs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    None,
    Source,
    Status,
    Day,
    Hour,
    Queue,
    ErrorCategory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFilters {
    #[serde(default)]
    pub source_ids: Vec<Uuid>,
    /// Status of the measured entity: record, task or job status name.
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomReportSpec {
    pub metric: Metric,
    pub group_by: GroupBy,
    pub range: DateRange,
    #[serde(default)]
    pub filters: ReportFilters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub group: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomReport {
    pub spec: CustomReportSpec,
    pub rows: Vec<ReportRow>,
}

/// Everything a range-scoped report reads, loaded once per cache key.
#[derive(Debug)]
struct Snapshot {
    range: DateRange,
    jobs: Vec<ScrapingJob>,
    sources: Vec<Source>,
    records: Vec<CvRecord>,
    /// Tasks enqueued or finished within the range.
    tasks: Vec<QueueTask>,
}

impl Snapshot {
    fn jobs_in_range(&self) -> impl Iterator<Item = &ScrapingJob> {
        self.jobs
            .iter()
            .filter(|j| self.range.contains(j.created_at))
    }

    fn finished_tasks(&self) -> impl Iterator<Item = &QueueTask> {
        self.tasks.iter().filter(|t| {
            matches!(t.state, TaskState::Completed | TaskState::Failed)
                && t.finished_at.is_some_and(|f| self.range.contains(f))
        })
    }

    fn source_name(&self, id: Uuid) -> String {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .map_or_else(|| id.to_string(), |s| s.name.clone())
    }
}

#[derive(Clone)]
pub struct AnalyticsService<J, S, R, Q>
where
    J: JobStore,
    S: SourceStore,
    R: RecordStore,
    Q: Queue,
{
    jobs: J,
    sources: S,
    records: R,
    queue: Q,
    clock: SharedClock,
    cache: Cache<DateRange, Arc<Snapshot>>,
}

impl<J, S, R, Q> AnalyticsService<J, S, R, Q>
where
    J: JobStore,
    S: SourceStore,
    R: RecordStore,
    Q: Queue,
{
    pub fn new(jobs: J, sources: S, records: R, queue: Q, clock: SharedClock, refresh: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(64)
            .time_to_live(refresh)
            .build();
        Self {
            jobs,
            sources,
            records,
            queue,
            clock,
            cache,
        }
    }

    /// Drop every cached snapshot.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }

    pub async fn dashboard_overview(&self, range: DateRange) -> Result<DashboardOverview, AppError> {
        let snap = self.snapshot(range).await?;

        let mut jobs_by_status = zeroed(JobStatus::ALL.iter().map(|s| s.as_str()));
        for job in snap.jobs_in_range() {
            *jobs_by_status.entry(job.status.as_str().to_string()).or_default() += 1;
        }
        let active_jobs = snap
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Queued | JobStatus::Running))
            .count() as u64;

        let mut sources_by_health = zeroed(["healthy", "degraded", "down"]);
        for source in &snap.sources {
            *sources_by_health.entry(source.health.status.to_string()).or_default() += 1;
        }

        let (completed, failed) = finished_split(snap.finished_tasks());
        let queue_backlog = snap
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Waiting | TaskState::Delayed))
            .count() as u64;

        Ok(DashboardOverview {
            range: snap.range,
            jobs_by_status,
            active_jobs,
            sources_total: snap.sources.len() as u64,
            sources_by_health,
            records_collected: snap.records.len() as u64,
            records_validated: count_status(&snap.records, RecordStatus::Validated),
            records_duplicate: count_status(&snap.records, RecordStatus::Duplicate),
            average_quality: average(snap.records.iter().map(|r| r.quality_score)),
            tasks_completed: completed,
            tasks_failed: failed,
            success_rate: ratio(completed, completed + failed),
            queue_backlog,
        })
    }

    /// Live figures for one job; not cached.
    pub async fn job_statistics(&self, job_id: Uuid) -> Result<JobStatistics, AppError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::not_found("job", job_id))?;
        let tasks = self.queue.job_tasks(job_id).await?;

        let mut counts = QueueCounts::default();
        for task in &tasks {
            counts.add(task.state);
        }
        let records = self
            .records
            .count(&RecordQuery {
                job_id: Some(job_id),
                ..Default::default()
            })
            .await?;
        let end = job.completed_at.unwrap_or_else(|| self.clock.now());

        Ok(JobStatistics {
            job_id,
            name: job.name.clone(),
            status: job.status,
            progress: job.progress,
            attempt: job.attempt,
            duration_secs: job.started_at.map(|s| (end - s).num_seconds().max(0)),
            tasks: counts,
            avg_task_ms: average_opt(tasks.iter().filter_map(QueueTask::processing_ms)),
            success_rate: ratio(counts.completed, counts.completed + counts.failed),
            records,
        })
    }

    pub async fn source_statistics(
        &self,
        source_id: Uuid,
        range: DateRange,
    ) -> Result<SourceStatistics, AppError> {
        let snap = self.snapshot(range).await?;
        source_stats(&snap, source_id)
    }

    pub async fn compare_sources(
        &self,
        source_ids: &[Uuid],
        range: DateRange,
    ) -> Result<Vec<SourceStatistics>, AppError> {
        if source_ids.is_empty() {
            return Err(AppError::Validation("no sources to compare".into()));
        }
        let snap = self.snapshot(range).await?;
        source_ids.iter().map(|&id| source_stats(&snap, id)).collect()
    }

    pub async fn cv_statistics(&self, range: DateRange) -> Result<CvStatistics, AppError> {
        let snap = self.snapshot(range).await?;

        let mut by_status = zeroed(RecordStatus::ALL.iter().map(|s| s.as_str()));
        let mut by_source: BTreeMap<String, u64> = BTreeMap::new();
        let mut skills: HashMap<String, (String, u64)> = HashMap::new();
        let mut locations: HashMap<String, (String, u64)> = HashMap::new();
        for record in &snap.records {
            *by_status.entry(record.status.as_str().to_string()).or_default() += 1;
            *by_source.entry(snap.source_name(record.source_id)).or_default() += 1;
            if !record.is_canonical() {
                continue;
            }
            for skill in &record.fields.skills {
                bump(&mut skills, skill);
            }
            if let Some(location) = &record.fields.location {
                bump(&mut locations, location);
            }
        }

        Ok(CvStatistics {
            range: snap.range,
            total: snap.records.len() as u64,
            by_status,
            by_source,
            average_score: average(snap.records.iter().map(|r| r.quality_score)),
            top_skills: top(skills),
            top_locations: top(locations),
        })
    }

    pub async fn performance_metrics(&self, range: DateRange) -> Result<PerformanceMetrics, AppError> {
        let snap = self.snapshot(range).await?;
        let finished: Vec<&QueueTask> = snap.finished_tasks().collect();
        let (completed, failed) = finished_split(finished.iter().copied());

        let mut durations: Vec<i64> = finished.iter().filter_map(|t| t.processing_ms()).collect();
        durations.sort_unstable();
        let p95 = (!durations.is_empty()).then(|| {
            let idx = ((durations.len() as f64) * 0.95).ceil() as usize;
            durations[idx.clamp(1, durations.len()) - 1]
        });

        let mut by_queue: BTreeMap<String, QueueCounts> = BTreeMap::new();
        for task in &snap.tasks {
            by_queue.entry(task.queue.clone()).or_default().add(task.state);
        }

        let hours = (snap.range.span().num_seconds() as f64 / 3600.0).max(1.0 / 60.0);
        let found: u64 = snap
            .jobs
            .iter()
            .filter(|j| j.started_at.is_some_and(|s| snap.range.contains(s)))
            .map(|j| j.progress.found)
            .sum();

        Ok(PerformanceMetrics {
            range: snap.range,
            tasks_finished: completed + failed,
            throughput_per_hour: (completed + failed) as f64 / hours,
            avg_processing_ms: average_opt(durations.iter().copied()),
            p95_processing_ms: p95,
            success_rate: ratio(completed, completed + failed),
            records_per_task: if completed == 0 {
                0.0
            } else {
                found as f64 / completed as f64
            },
            by_queue,
        })
    }

    /// Daily quality for the last `days` days, oldest first, today included.
    pub async fn quality_trend(&self, days: u32) -> Result<Vec<QualityPoint>, AppError> {
        if days == 0 || days > MAX_TREND_DAYS {
            return Err(AppError::Validation(format!(
                "days must be between 1 and {MAX_TREND_DAYS}"
            )));
        }
        let now = self.clock.now();
        let today = truncate(now, TimeDelta::days(1));
        let range = DateRange::new(
            today - TimeDelta::days(i64::from(days) - 1),
            today + TimeDelta::days(1),
        )?;
        let snap = self.snapshot(range).await?;

        let mut per_day: BTreeMap<NaiveDate, Vec<&CvRecord>> = (0..i64::from(days))
            .map(|d| ((range.start + TimeDelta::days(d)).date_naive(), Vec::new()))
            .collect();
        for record in &snap.records {
            if let Some(bucket) = per_day.get_mut(&record.created_at.date_naive()) {
                bucket.push(record);
            }
        }

        Ok(per_day
            .into_iter()
            .map(|(date, records)| {
                let validated = records
                    .iter()
                    .filter(|r| r.status == RecordStatus::Validated)
                    .count() as u64;
                QualityPoint {
                    date,
                    records: records.len() as u64,
                    average_score: average(records.iter().map(|r| r.quality_score)),
                    validated_ratio: ratio(validated, records.len() as u64),
                }
            })
            .collect())
    }

    pub async fn hourly_activity(&self, range: DateRange) -> Result<Vec<HourlyActivity>, AppError> {
        if range.span() > MAX_HOURLY_SPAN {
            return Err(AppError::Validation(
                "hourly activity covers at most 31 days".into(),
            ));
        }
        let snap = self.snapshot(range).await?;

        let hour = TimeDelta::hours(1);
        let mut buckets: BTreeMap<DateTime<Utc>, HourlyActivity> = BTreeMap::new();
        let mut at = truncate(snap.range.start, hour);
        while at < snap.range.end {
            buckets.insert(
                at,
                HourlyActivity {
                    hour: at,
                    tasks_completed: 0,
                    tasks_failed: 0,
                    records: 0,
                },
            );
            at += hour;
        }

        for task in snap.finished_tasks() {
            if let Some(finished) = task.finished_at
                && let Some(bucket) = buckets.get_mut(&truncate(finished, hour))
            {
                match task.state {
                    TaskState::Completed => bucket.tasks_completed += 1,
                    _ => bucket.tasks_failed += 1,
                }
            }
        }
        for record in &snap.records {
            if let Some(bucket) = buckets.get_mut(&truncate(record.created_at, hour)) {
                bucket.records += 1;
            }
        }
        Ok(buckets.into_values().collect())
    }

    /// Tasks that carried an error in the range, by category. Every category is
    /// listed, zero or not.
    pub async fn error_breakdown(&self, range: DateRange) -> Result<ErrorBreakdown, AppError> {
        let snap = self.snapshot(range).await?;
        let mut counts: BTreeMap<&'static str, u64> =
            ERROR_CATEGORIES.iter().map(|c| (*c, 0)).collect();
        for task in &snap.tasks {
            if let Some(category) = task.error_category.as_deref()
                && snap.range.contains(task.updated_at)
            {
                *counts.entry(known_category(category)).or_default() += 1;
            }
        }
        let total: u64 = counts.values().sum();

        Ok(ErrorBreakdown {
            range: snap.range,
            total,
            categories: ERROR_CATEGORIES
                .iter()
                .map(|&category| {
                    let count = counts.get(category).copied().unwrap_or(0);
                    CategoryCount {
                        category,
                        count,
                        share: ratio(count, total),
                    }
                })
                .collect(),
        })
    }

    pub async fn custom_report(&self, spec: CustomReportSpec) -> Result<CustomReport, AppError> {
        check_grouping(spec.metric, spec.group_by)?;
        let snap = self.snapshot(spec.range).await?;
        let filters = &spec.filters;
        let source_ok = |id: Uuid| filters.source_ids.is_empty() || filters.source_ids.contains(&id);
        let status_ok = |s: &str| filters.status.as_deref().is_none_or(|want| want == s);

        let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        match spec.metric {
            Metric::Records | Metric::AverageScore => {
                for r in snap
                    .records
                    .iter()
                    .filter(|r| source_ok(r.source_id) && status_ok(r.status.as_str()))
                {
                    let key = match spec.group_by {
                        GroupBy::Source => snap.source_name(r.source_id),
                        GroupBy::Status => r.status.as_str().to_string(),
                        _ => time_group(spec.group_by, r.created_at),
                    };
                    groups.entry(key).or_default().push(r.quality_score);
                }
            }
            Metric::Tasks | Metric::FailedTasks | Metric::FailureRate => {
                for t in snap
                    .finished_tasks()
                    .filter(|t| source_ok(t.source_id) && status_ok(t.state.as_str()))
                {
                    let key = match spec.group_by {
                        GroupBy::Source => snap.source_name(t.source_id),
                        GroupBy::Status => t.state.as_str().to_string(),
                        GroupBy::Queue => t.queue.clone(),
                        GroupBy::ErrorCategory => t
                            .error_category
                            .as_deref()
                            .map_or("none", known_category)
                            .to_string(),
                        _ => time_group(spec.group_by, t.finished_at.unwrap_or(t.updated_at)),
                    };
                    let failed = if t.state == TaskState::Failed { 1.0 } else { 0.0 };
                    groups.entry(key).or_default().push(failed);
                }
            }
            Metric::Jobs => {
                for j in snap
                    .jobs_in_range()
                    .filter(|j| source_ok(j.source_id) && status_ok(j.status.as_str()))
                {
                    let key = match spec.group_by {
                        GroupBy::Source => snap.source_name(j.source_id),
                        GroupBy::Status => j.status.as_str().to_string(),
                        _ => time_group(spec.group_by, j.created_at),
                    };
                    groups.entry(key).or_default().push(1.0);
                }
            }
        }

        let rows = groups
            .into_iter()
            .map(|(group, values)| {
                let value = match spec.metric {
                    Metric::AverageScore | Metric::FailureRate => average(values.iter().copied()),
                    Metric::FailedTasks => values.iter().sum(),
                    Metric::Records | Metric::Tasks | Metric::Jobs => values.len() as f64,
                };
                ReportRow { group, value }
            })
            .collect();
        Ok(CustomReport { spec, rows })
    }

    async fn snapshot(&self, range: DateRange) -> Result<Arc<Snapshot>, AppError> {
        let key = range.cache_key();
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        let snapshot = Arc::new(self.load(range).await?);
        self.cache.insert(key, snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn load(&self, range: DateRange) -> Result<Snapshot, AppError> {
        let jobs = self.jobs.list(&JobFilter::default()).await?;
        let sources = self.sources.list(&SourceFilter::default()).await?;

        let query = RecordQuery {
            created_after: Some(range.start),
            created_before: Some(range.end),
            ..Default::default()
        };
        let mut records = Vec::new();
        let mut cursor = None;
        loop {
            let chunk = self.records.scan(&query, cursor, SCAN_CHUNK).await?;
            let Some(last) = chunk.last() else {
                break;
            };
            cursor = Some(last.cursor());
            records.extend(chunk);
        }

        let tasks = self
            .queue
            .history(None, range.start - HISTORY_LOOKBACK)
            .await?
            .into_iter()
            .filter(|t| {
                range.contains(t.enqueued_at) || t.finished_at.is_some_and(|f| range.contains(f))
            })
            .collect();

        tracing::debug!(
            start = %range.start,
            end = %range.end,
            records = records.len(),
            "Analytics snapshot loaded"
        );
        Ok(Snapshot {
            range,
            jobs,
            sources,
            records,
            tasks,
        })
    }
}

fn source_stats(snap: &Snapshot, source_id: Uuid) -> Result<SourceStatistics, AppError> {
    let source = snap
        .sources
        .iter()
        .find(|s| s.id == source_id)
        .ok_or_else(|| AppError::not_found("source", source_id))?;

    let jobs: Vec<&ScrapingJob> = snap
        .jobs_in_range()
        .filter(|j| j.source_id == source_id)
        .collect();
    let records: Vec<&CvRecord> = snap
        .records
        .iter()
        .filter(|r| r.source_id == source_id)
        .collect();
    let tasks: Vec<&QueueTask> = snap
        .finished_tasks()
        .filter(|t| t.source_id == source_id)
        .collect();
    let (completed, failed) = finished_split(tasks.iter().copied());

    Ok(SourceStatistics {
        source_id,
        name: source.name.clone(),
        health: source.health.status,
        is_active: source.is_active,
        jobs_total: jobs.len() as u64,
        jobs_completed: jobs.iter().filter(|j| j.status == JobStatus::Completed).count() as u64,
        jobs_failed: jobs.iter().filter(|j| j.status == JobStatus::Failed).count() as u64,
        records: records.len() as u64,
        records_validated: records
            .iter()
            .filter(|r| r.status == RecordStatus::Validated)
            .count() as u64,
        records_duplicate: records
            .iter()
            .filter(|r| r.status == RecordStatus::Duplicate)
            .count() as u64,
        average_quality: average(records.iter().map(|r| r.quality_score)),
        tasks_completed: completed,
        tasks_failed: failed,
        success_rate: ratio(completed, completed + failed),
        avg_task_ms: average_opt(tasks.iter().filter_map(|t| t.processing_ms())),
    })
}

fn check_grouping(metric: Metric, group_by: GroupBy) -> Result<(), AppError> {
    let task_only = matches!(group_by, GroupBy::Queue | GroupBy::ErrorCategory);
    let task_metric = matches!(metric, Metric::Tasks | Metric::FailedTasks | Metric::FailureRate);
    if task_only && !task_metric {
        return Err(AppError::Validation(format!(
            "{metric:?} cannot be grouped by {group_by:?}"
        )));
    }
    Ok(())
}

fn time_group(group_by: GroupBy, at: DateTime<Utc>) -> String {
    match group_by {
        GroupBy::Day => at.format("%Y-%m-%d").to_string(),
        GroupBy::Hour => truncate(at, TimeDelta::hours(1)).format("%Y-%m-%dT%H:00Z").to_string(),
        _ => "all".to_string(),
    }
}

fn known_category(category: &str) -> &'static str {
    ERROR_CATEGORIES
        .iter()
        .copied()
        .find(|c| *c == category)
        .unwrap_or("other")
}

fn finished_split<'a>(tasks: impl Iterator<Item = &'a QueueTask>) -> (u64, u64) {
    tasks.fold((0, 0), |(ok, failed), t| match t.state {
        TaskState::Completed => (ok + 1, failed),
        TaskState::Failed => (ok, failed + 1),
        _ => (ok, failed),
    })
}

fn count_status(records: &[CvRecord], status: RecordStatus) -> u64 {
    records.iter().filter(|r| r.status == status).count() as u64
}

fn zeroed<'a>(keys: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, u64> {
    keys.into_iter().map(|k| (k.to_string(), 0)).collect()
}

fn bump(counts: &mut HashMap<String, (String, u64)>, value: &str) {
    let entry = counts
        .entry(value.to_lowercase())
        .or_insert_with(|| (value.to_string(), 0));
    entry.1 += 1;
}

fn top(counts: HashMap<String, (String, u64)>) -> Vec<Ranked> {
    let mut ranked: Vec<Ranked> = counts
        .into_values()
        .map(|(value, count)| Ranked { value, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    ranked.truncate(TOP_N);
    ranked
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0u64), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

fn average_opt(values: impl Iterator<Item = i64>) -> Option<f64> {
    let (sum, n) = values.fold((0i64, 0u64), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum as f64 / n as f64)
}
