use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use harvester_core::error::AppError;
use harvester_core::export::{ExportJob, ExportProgress};
use harvester_core::record::RecordQuery;
use harvester_core::traits::ExportStore;

use crate::database::{corrupt, db_error, sql_count};

/// PostgreSQL-backed export registry.
#[derive(Clone)]
pub struct PgExportStore {
    pool: Pool<Postgres>,
}

impl PgExportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ExportRow {
    id: Uuid,
    filter: Json<RecordQuery>,
    format: String,
    status: String,
    artifact_ref: Option<String>,
    rows_written: i64,
    total_rows: i64,
    retriable: bool,
    error: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExportRow> for ExportJob {
    type Error = AppError;

    fn try_from(row: ExportRow) -> Result<Self, Self::Error> {
        Ok(ExportJob {
            id: row.id,
            filter: row.filter.0,
            format: row.format.parse().map_err(|e| corrupt("export format", e))?,
            status: row.status.parse().map_err(|e| corrupt("export status", e))?,
            artifact_ref: row.artifact_ref,
            progress: ExportProgress {
                rows_written: row.rows_written as u64,
                total_rows: row.total_rows as u64,
            },
            retriable: row.retriable,
            error: row.error,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

impl ExportStore for PgExportStore {
    async fn insert(&self, export: &ExportJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO exports (
                id, filter, format, status, artifact_ref, rows_written, total_rows,
                retriable, error, created_by, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(export.id)
        .bind(Json(&export.filter))
        .bind(export.format.as_str())
        .bind(export.status.as_str())
        .bind(&export.artifact_ref)
        .bind(export.progress.rows_written as i64)
        .bind(export.progress.total_rows as i64)
        .bind(export.retriable)
        .bind(&export.error)
        .bind(&export.created_by)
        .bind(export.created_at)
        .bind(export.updated_at)
        .bind(export.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExportJob>, AppError> {
        let row = sqlx::query_as::<_, ExportRow>("SELECT * FROM exports WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, export: &ExportJob) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE exports
            SET status = $2, artifact_ref = $3, rows_written = $4, total_rows = $5,
                retriable = $6, error = $7, updated_at = $8, completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(export.id)
        .bind(export.status.as_str())
        .bind(&export.artifact_ref)
        .bind(export.progress.rows_written as i64)
        .bind(export.progress.total_rows as i64)
        .bind(export.retriable)
        .bind(&export.error)
        .bind(export.updated_at)
        .bind(export.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("export", export.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM exports WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, limit: usize) -> Result<Vec<ExportJob>, AppError> {
        let rows = sqlx::query_as::<_, ExportRow>(
            "SELECT * FROM exports ORDER BY created_at DESC, id LIMIT $1",
        )
        .bind(sql_count(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn fail_stalled(
        &self,
        stalled_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportJob>, AppError> {
        let rows = sqlx::query_as::<_, ExportRow>(
            r#"
            UPDATE exports
            SET status = 'failed', retriable = TRUE, error = $2, updated_at = $3
            WHERE status = 'processing' AND updated_at < $1
            RETURNING *
            "#,
        )
        .bind(stalled_before)
        .bind(error)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
