use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use harvester_core::error::AppError;
use harvester_core::source::{
    Credentials, Proxy, RateLimitPolicy, Source, SourceFilter, SourceHealth, SourceKind,
};
use harvester_core::traits::SourceStore;

use crate::database::{corrupt, db_error};

/// PostgreSQL-backed source store. Proxies live in a JSONB column on the
/// source row so a source and its pool change under one version.
#[derive(Clone)]
pub struct PgSourceStore {
    pool: Pool<Postgres>,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    kind: Json<SourceKind>,
    base_url: String,
    credentials: Option<Json<Credentials>>,
    proxies: Json<Vec<Proxy>>,
    rate_limit: Json<RateLimitPolicy>,
    category: String,
    health: Json<SourceHealth>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<SourceRow> for Source {
    type Error = AppError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        Ok(Source {
            id: row.id,
            name: row.name,
            kind: row.kind.0,
            base_url: row.base_url,
            credentials: row.credentials.map(|c| c.0),
            proxies: row.proxies.0,
            rate_limit: row.rate_limit.0,
            category: row.category.parse().map_err(|e| corrupt("category", e))?,
            health: row.health.0,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version as u64,
        })
    }
}

const COLUMNS: &str = "id, name, kind, base_url, credentials, proxies, rate_limit, category, \
                       health, is_active, created_at, updated_at, version";

fn map_unique_name(err: sqlx::Error, name: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Validation(format!("a source named '{name}' already exists"))
        }
        _ => db_error(err),
    }
}

impl SourceStore for PgSourceStore {
    async fn insert(&self, source: &Source) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO sources (
                id, name, kind_name, kind, base_url, credentials, proxies, rate_limit,
                category, health_status, health, is_active, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(source.kind.type_name())
        .bind(Json(&source.kind))
        .bind(&source.base_url)
        .bind(source.credentials.as_ref().map(Json))
        .bind(Json(&source.proxies))
        .bind(Json(source.rate_limit))
        .bind(source.category.as_str())
        .bind(source.health.status.as_str())
        .bind(Json(&source.health))
        .bind(source.is_active)
        .bind(source.created_at)
        .bind(source.updated_at)
        .bind(source.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_name(e, &source.name))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Source>, AppError> {
        let sql = format!("SELECT {COLUMNS} FROM sources WHERE id = $1");
        let row = sqlx::query_as::<_, SourceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, source: &Source) -> Result<Source, AppError> {
        let sql = format!(
            r#"
            UPDATE sources
            SET name = $2, kind_name = $3, kind = $4, base_url = $5, credentials = $6,
                proxies = $7, rate_limit = $8, category = $9, health_status = $10,
                health = $11, is_active = $12, updated_at = $13, version = version + 1
            WHERE id = $1 AND version = $14
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, SourceRow>(&sql)
            .bind(source.id)
            .bind(&source.name)
            .bind(source.kind.type_name())
            .bind(Json(&source.kind))
            .bind(&source.base_url)
            .bind(source.credentials.as_ref().map(Json))
            .bind(Json(&source.proxies))
            .bind(Json(source.rate_limit))
            .bind(source.category.as_str())
            .bind(source.health.status.as_str())
            .bind(Json(&source.health))
            .bind(source.is_active)
            .bind(source.updated_at)
            .bind(source.version as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_unique_name(e, &source.name))?;

        if let Some(row) = row {
            return row.try_into();
        }
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM sources WHERE id = $1)")
            .bind(source.id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        if exists {
            Err(AppError::conflict("source", source.id))
        } else {
            Err(AppError::not_found("source", source.id))
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM sources WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: &SourceFilter) -> Result<Vec<Source>, AppError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM sources
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR kind_name = $2)
              AND ($3::bool IS NULL OR is_active = $3)
              AND ($4::text IS NULL OR health_status = $4)
            ORDER BY name, id
            "#
        );
        let rows = sqlx::query_as::<_, SourceRow>(&sql)
            .bind(filter.category.map(|c| c.as_str()))
            .bind(filter.kind.as_deref())
            .bind(filter.is_active)
            .bind(filter.health.map(|h| h.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
