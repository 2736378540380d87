use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use harvester_core::error::AppError;
use harvester_core::job::{JobFilter, JobLogEntry, JobProgress, ScheduleWindow, ScrapingJob};
use harvester_core::traits::JobStore;

use crate::database::{corrupt, db_error, sql_count};

/// PostgreSQL-backed job store. `update` is a compare-and-swap on `version`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: Uuid) -> Result<bool, AppError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM scraping_jobs WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(exists)
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    job_type: String,
    status: String,
    priority: i32,
    source_id: Uuid,
    schedule: Json<ScheduleWindow>,
    pages: i32,
    tags: Vec<String>,
    created_by: String,
    progress: Json<JobProgress>,
    attempt: i32,
    max_retries: i32,
    last_error_reason: Option<String>,
    pause_reason: Option<String>,
    next_run_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<JobRow> for ScrapingJob {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ScrapingJob {
            id: row.id,
            name: row.name,
            job_type: row.job_type.parse().map_err(|e| corrupt("job_type", e))?,
            status: row.status.parse().map_err(|e| corrupt("job status", e))?,
            priority: row.priority,
            source_id: row.source_id,
            schedule: row.schedule.0,
            pages: row.pages as u32,
            tags: row.tags,
            created_by: row.created_by,
            progress: row.progress.0,
            attempt: row.attempt as u32,
            max_retries: row.max_retries as u32,
            last_error_reason: row.last_error_reason,
            pause_reason: row.pause_reason,
            next_run_id: row.next_run_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            version: row.version as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    job_id: Uuid,
    level: String,
    message: String,
    at: DateTime<Utc>,
}

impl TryFrom<LogRow> for JobLogEntry {
    type Error = AppError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(JobLogEntry {
            job_id: row.job_id,
            level: row.level.parse().map_err(|e| corrupt("log level", e))?,
            message: row.message,
            at: row.at,
        })
    }
}

const FILTER: &str = r#"
    ($1::text IS NULL OR status = $1)
    AND ($2::uuid IS NULL OR source_id = $2)
    AND ($3::text IS NULL OR job_type = $3)
    AND ($4::text IS NULL OR $4 = ANY(tags))
    AND ($5::text IS NULL OR created_by = $5)
"#;

impl JobStore for PgJobStore {
    async fn insert(&self, job: &ScrapingJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO scraping_jobs (
                id, name, job_type, status, priority, source_id, schedule, pages, tags,
                created_by, progress, attempt, max_retries, last_error_reason, pause_reason,
                next_run_id, created_at, updated_at, started_at, completed_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.source_id)
        .bind(Json(&job.schedule))
        .bind(job.pages as i32)
        .bind(&job.tags)
        .bind(&job.created_by)
        .bind(Json(job.progress))
        .bind(job.attempt as i32)
        .bind(job.max_retries as i32)
        .bind(&job.last_error_reason)
        .bind(&job.pause_reason)
        .bind(job.next_run_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScrapingJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM scraping_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, job: &ScrapingJob) -> Result<ScrapingJob, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE scraping_jobs
            SET name = $2, job_type = $3, status = $4, priority = $5, source_id = $6,
                schedule = $7, pages = $8, tags = $9, progress = $10, attempt = $11,
                max_retries = $12, last_error_reason = $13, pause_reason = $14,
                next_run_id = $15, updated_at = $16, started_at = $17, completed_at = $18,
                version = version + 1
            WHERE id = $1 AND version = $19
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.source_id)
        .bind(Json(&job.schedule))
        .bind(job.pages as i32)
        .bind(&job.tags)
        .bind(Json(job.progress))
        .bind(job.attempt as i32)
        .bind(job.max_retries as i32)
        .bind(&job.last_error_reason)
        .bind(&job.pause_reason)
        .bind(job.next_run_id)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => row.try_into(),
            None if self.exists(job.id).await? => Err(AppError::conflict("job", job.id)),
            None => Err(AppError::not_found("job", job.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM scraping_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<ScrapingJob>, AppError> {
        let sql = format!(
            "SELECT * FROM scraping_jobs WHERE {FILTER} \
             ORDER BY created_at DESC, id OFFSET $6 LIMIT $7"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.source_id)
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(filter.tag.as_deref())
            .bind(filter.created_by.as_deref())
            .bind(sql_count(filter.offset))
            .bind(filter.limit.map(sql_count))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, AppError> {
        let sql = format!("SELECT COUNT(*) FROM scraping_jobs WHERE {FILTER}");
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.source_id)
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(filter.tag.as_deref())
            .bind(filter.created_by.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(count as u64)
    }

    async fn append_log(&self, entry: &JobLogEntry) -> Result<(), AppError> {
        sqlx::query("INSERT INTO job_logs (job_id, level, message, at) VALUES ($1, $2, $3, $4)")
            .bind(entry.job_id)
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .bind(entry.at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(())
    }

    async fn logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<JobLogEntry>, AppError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT job_id, level, message, at FROM job_logs
            WHERE job_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(sql_count(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
