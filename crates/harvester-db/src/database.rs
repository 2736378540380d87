use harvester_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::export_store::PgExportStore;
use crate::job_store::PgJobStore;
use crate::queue::PgQueue;
use crate::record_store::PgRecordStore;
use crate::source_store::PgSourceStore;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends store instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;
        tracing::debug!(max_connections = config.max_connections, "Database pool ready");

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn job_store(&self) -> PgJobStore {
        PgJobStore::new(self.pool.clone())
    }

    pub fn source_store(&self) -> PgSourceStore {
        PgSourceStore::new(self.pool.clone())
    }

    pub fn record_store(&self) -> PgRecordStore {
        PgRecordStore::new(self.pool.clone())
    }

    pub fn export_store(&self) -> PgExportStore {
        PgExportStore::new(self.pool.clone())
    }

    pub fn queue(&self) -> PgQueue {
        PgQueue::new(self.pool.clone())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

pub(crate) fn db_error(err: sqlx::Error) -> AppError {
    AppError::DatabaseError(err.to_string())
}

/// A row count or offset as a `BIGINT` bind value, saturating at `i64::MAX`.
pub(crate) fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Error for a stored string that no longer parses into its enum.
pub(crate) fn corrupt(column: &str, err: String) -> AppError {
    AppError::DatabaseError(format!("Unreadable {column}: {err}"))
}
