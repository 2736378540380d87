use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Pool, Postgres};
use uuid::Uuid;

use harvester_core::dedup::{MergePlan, blocking_keys};
use harvester_core::error::AppError;
use harvester_core::record::{
    CvFields, CvRecord, MergeLogEntry, RecordCursor, RecordQuery, ValidationIssue,
};
use harvester_core::traits::RecordStore;

use crate::database::{corrupt, db_error, sql_count};

/// PostgreSQL-backed CV record store with the merge log.
///
/// `full_name` and `blocking_keys` are derived columns kept in step with
/// `fields` on every write so name filters and contact lookups stay indexed.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    source_id: Uuid,
    job_id: Option<Uuid>,
    fields: Json<CvFields>,
    content_hash: String,
    status: String,
    quality_score: f64,
    issues: Json<Vec<ValidationIssue>>,
    duplicate_of: Option<Uuid>,
    merged_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<RecordRow> for CvRecord {
    type Error = AppError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(CvRecord {
            id: row.id,
            source_id: row.source_id,
            job_id: row.job_id,
            fields: row.fields.0,
            content_hash: row.content_hash,
            status: row.status.parse().map_err(|e| corrupt("record status", e))?,
            quality_score: row.quality_score,
            issues: row.issues.0,
            duplicate_of: row.duplicate_of,
            merged_at: row.merged_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MergeLogRow {
    primary_id: Uuid,
    duplicate_id: Uuid,
    field: String,
    primary_value: Option<String>,
    duplicate_value: Option<String>,
    resolution: String,
    merged_at: DateTime<Utc>,
}

impl TryFrom<MergeLogRow> for MergeLogEntry {
    type Error = AppError;

    fn try_from(row: MergeLogRow) -> Result<Self, Self::Error> {
        Ok(MergeLogEntry {
            primary_id: row.primary_id,
            duplicate_id: row.duplicate_id,
            field: row.field,
            primary_value: row.primary_value,
            duplicate_value: row.duplicate_value,
            resolution: row.resolution.parse().map_err(|e| corrupt("resolution", e))?,
            merged_at: row.merged_at,
        })
    }
}

const COLUMNS: &str = "id, source_id, job_id, fields, content_hash, status, quality_score, \
                       issues, duplicate_of, merged_at, created_at, updated_at, version";

const FILTER: &str = r#"
    ($1::uuid IS NULL OR source_id = $1)
    AND ($2::uuid IS NULL OR job_id = $2)
    AND ($3::text IS NULL OR status = $3)
    AND ($4::float8 IS NULL OR quality_score >= $4)
    AND ($5::timestamptz IS NULL OR created_at >= $5)
    AND ($6::timestamptz IS NULL OR created_at < $6)
    AND ($7::text IS NULL OR strpos(lower(full_name), lower($7)) > 0)
"#;

/// Version-checked write of one record. `None` means the version moved.
async fn write_record<'e>(
    executor: impl PgExecutor<'e>,
    record: &CvRecord,
) -> Result<Option<CvRecord>, AppError> {
    let sql = format!(
        r#"
        UPDATE cv_records
        SET fields = $2, full_name = $3, blocking_keys = $4, content_hash = $5, status = $6,
            quality_score = $7, issues = $8, duplicate_of = $9, merged_at = $10,
            updated_at = $11, version = version + 1
        WHERE id = $1 AND version = $12
        RETURNING {COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, RecordRow>(&sql)
        .bind(record.id)
        .bind(Json(&record.fields))
        .bind(record.fields.full_name.as_deref())
        .bind(blocking_keys(&record.fields))
        .bind(&record.content_hash)
        .bind(record.status.as_str())
        .bind(record.quality_score)
        .bind(Json(&record.issues))
        .bind(record.duplicate_of)
        .bind(record.merged_at)
        .bind(record.updated_at)
        .bind(record.version as i64)
        .fetch_optional(executor)
        .await
        .map_err(db_error)?;

    row.map(TryInto::try_into).transpose()
}

impl RecordStore for PgRecordStore {
    async fn insert(&self, record: &CvRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO cv_records (
                id, source_id, job_id, fields, full_name, blocking_keys, content_hash, status,
                quality_score, issues, duplicate_of, merged_at, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(record.id)
        .bind(record.source_id)
        .bind(record.job_id)
        .bind(Json(&record.fields))
        .bind(record.fields.full_name.as_deref())
        .bind(blocking_keys(&record.fields))
        .bind(&record.content_hash)
        .bind(record.status.as_str())
        .bind(record.quality_score)
        .bind(Json(&record.issues))
        .bind(record.duplicate_of)
        .bind(record.merged_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CvRecord>, AppError> {
        let sql = format!("SELECT {COLUMNS} FROM cv_records WHERE id = $1");
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, record: &CvRecord) -> Result<CvRecord, AppError> {
        if let Some(updated) = write_record(&self.pool, record).await? {
            return Ok(updated);
        }
        match self.get(record.id).await? {
            Some(_) => Err(AppError::conflict("record", record.id)),
            None => Err(AppError::not_found("record", record.id)),
        }
    }

    async fn scan(
        &self,
        query: &RecordQuery,
        after: Option<RecordCursor>,
        limit: usize,
    ) -> Result<Vec<CvRecord>, AppError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM cv_records WHERE {FILTER} \
             AND ($8::timestamptz IS NULL OR (created_at, id) > ($8, $9::uuid)) \
             ORDER BY created_at, id LIMIT $10"
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(query.source_id)
            .bind(query.job_id)
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.min_score)
            .bind(query.created_after)
            .bind(query.created_before)
            .bind(query.name_contains.as_deref())
            .bind(after.map(|c| c.created_at))
            .bind(after.map(|c| c.id))
            .bind(sql_count(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count(&self, query: &RecordQuery) -> Result<u64, AppError> {
        let sql = format!("SELECT COUNT(*) FROM cv_records WHERE {FILTER}");
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(query.source_id)
            .bind(query.job_id)
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.min_score)
            .bind(query.created_after)
            .bind(query.created_before)
            .bind(query.name_contains.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(count as u64)
    }

    async fn find_by_contact(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<CvRecord>, AppError> {
        let probe = CvFields {
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            ..Default::default()
        };
        let keys = blocking_keys(&probe);
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {COLUMNS} FROM cv_records \
             WHERE duplicate_of IS NULL AND blocking_keys && $1 \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<CvRecord>, AppError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM cv_records \
             WHERE duplicate_of IS NULL AND content_hash = $1 \
             ORDER BY created_at, id LIMIT 1"
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn apply_merge(&self, plan: &MergePlan) -> Result<CvRecord, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let primary = write_record(&mut *tx, &plan.primary)
            .await?
            .ok_or_else(|| AppError::conflict("record", plan.primary.id))?;
        for dup in &plan.duplicates {
            write_record(&mut *tx, dup)
                .await?
                .ok_or_else(|| AppError::conflict("record", dup.id))?;
        }

        for entry in &plan.log {
            sqlx::query(
                r#"
                INSERT INTO merge_log (
                    primary_id, duplicate_id, field, primary_value, duplicate_value,
                    resolution, merged_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(entry.primary_id)
            .bind(entry.duplicate_id)
            .bind(&entry.field)
            .bind(&entry.primary_value)
            .bind(&entry.duplicate_value)
            .bind(entry.resolution.as_str())
            .bind(entry.merged_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        tracing::debug!(
            primary_id = %primary.id,
            duplicates = plan.duplicates.len(),
            "Merge group applied"
        );
        Ok(primary)
    }

    async fn merge_log(&self, record_id: Uuid) -> Result<Vec<MergeLogEntry>, AppError> {
        let rows = sqlx::query_as::<_, MergeLogRow>(
            r#"
            SELECT primary_id, duplicate_id, field, primary_value, duplicate_value,
                   resolution, merged_at
            FROM merge_log
            WHERE primary_id = $1 OR duplicate_id = $1
            ORDER BY id
            "#,
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
