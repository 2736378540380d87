use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use harvester_core::error::AppError;
use harvester_core::queue::{
    Nack, NackDisposition, NewTask, Queue, QueueCounts, QueueTask, TaskPayload, TaskState,
};

use crate::database::{corrupt, db_error, sql_count};

/// PostgreSQL task broker. Claims use `SELECT ... FOR UPDATE SKIP LOCKED`
/// so concurrent dispatchers never hand out the same task twice.
#[derive(Clone)]
pub struct PgQueue {
    pool: Pool<Postgres>,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load a task that refused a state change, to report why.
    async fn refused(&self, task_id: Uuid, action: &'static str) -> AppError {
        match Queue::get(self, task_id).await {
            Ok(Some(task)) => AppError::InvalidTransition {
                entity: "task",
                id: task.id.to_string(),
                from: task.state.to_string(),
                action,
            },
            Ok(None) => AppError::not_found("task", task_id),
            Err(e) => e,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    queue: String,
    job_id: Uuid,
    source_id: Uuid,
    payload: Json<TaskPayload>,
    priority: i32,
    seq: i64,
    attempt: i32,
    max_attempts: i32,
    state: String,
    available_at: DateTime<Utc>,
    worker_id: Option<String>,
    proxy_id: Option<Uuid>,
    last_error: Option<String>,
    error_category: Option<String>,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for QueueTask {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(QueueTask {
            id: row.id,
            queue: row.queue,
            job_id: row.job_id,
            source_id: row.source_id,
            payload: row.payload.0,
            priority: row.priority,
            seq: row.seq,
            attempt: row.attempt as u32,
            max_attempts: row.max_attempts as u32,
            state: row.state.parse().map_err(|e| corrupt("task state", e))?,
            available_at: row.available_at,
            worker_id: row.worker_id,
            proxy_id: row.proxy_id,
            last_error: row.last_error,
            error_category: row.error_category,
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<QueueTask>, AppError> {
    rows.into_iter().map(TryInto::try_into).collect()
}

/// A task is ready when waiting, or delayed with its backoff elapsed.
const READY: &str = "(state = 'waiting' OR (state = 'delayed' AND available_at <= $2))";

impl Queue for PgQueue {
    async fn enqueue(&self, task: NewTask, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO queue_tasks (
                id, queue, job_id, source_id, payload, priority, max_attempts, state,
                available_at, enqueued_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'waiting', $8, $8, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&task.queue)
        .bind(task.job_id)
        .bind(task.source_id)
        .bind(Json(&task.payload))
        .bind(task.priority)
        .bind(task.max_attempts as i32)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        row.try_into()
    }

    async fn ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueTask>, AppError> {
        let sql = format!(
            "SELECT * FROM queue_tasks WHERE queue = $1 AND {READY} \
             ORDER BY priority DESC, seq LIMIT $3"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(queue)
            .bind(now)
            .bind(sql_count(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        into_tasks(rows)
    }

    async fn dequeue(
        &self,
        task_id: Uuid,
        worker_id: &str,
        proxy_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueTask>, AppError> {
        let sql = format!(
            r#"
            UPDATE queue_tasks
            SET state = 'active', attempt = attempt + 1, worker_id = $3, proxy_id = $4,
                started_at = $2, finished_at = NULL, updated_at = $2
            WHERE id = (
                SELECT id FROM queue_tasks
                WHERE id = $1 AND {READY}
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task_id)
            .bind(now)
            .bind(worker_id)
            .bind(proxy_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn ack(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE queue_tasks
            SET state = 'completed', finished_at = $2, updated_at = $2
            WHERE id = $1 AND state = 'active'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.refused(task_id, "ack").await),
        }
    }

    async fn nack(&self, task_id: Uuid, nack: Nack, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        // (state, available_at, finished_at, attempts given back)
        let (state, available_at, finished_at, refund) = match nack.disposition {
            NackDisposition::Retry { at } => (TaskState::Delayed, Some(at), None, 0),
            NackDisposition::DeadLetter => (TaskState::Failed, None, Some(now), 0),
            NackDisposition::Requeue => (TaskState::Waiting, Some(now), None, 1),
        };
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE queue_tasks
            SET state = $2,
                available_at = COALESCE($3, available_at),
                finished_at = COALESCE($4, finished_at),
                attempt = GREATEST(attempt - $5, 0),
                last_error = $6,
                error_category = $7,
                updated_at = $8
            WHERE id = $1 AND state = 'active'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(state.as_str())
        .bind(available_at)
        .bind(finished_at)
        .bind(refund)
        .bind(&nack.error)
        .bind(&nack.category)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.refused(task_id, "nack").await),
        }
    }

    async fn stats(&self, queue: &str) -> Result<QueueCounts, AppError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM queue_tasks WHERE queue = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let state: TaskState = state.parse().map_err(|e| corrupt("task state", e))?;
            match state {
                TaskState::Waiting => counts.waiting = count as u64,
                TaskState::Active => counts.active = count as u64,
                TaskState::Completed => counts.completed = count as u64,
                TaskState::Failed => counts.failed = count as u64,
                TaskState::Delayed => counts.delayed = count as u64,
            }
        }
        Ok(counts)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<QueueTask>, AppError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM queue_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(
        &self,
        queue: &str,
        state: Option<TaskState>,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<QueueTask>, AppError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM queue_tasks
            WHERE queue = $1 AND ($2::text IS NULL OR state = $2)
            ORDER BY priority DESC, seq
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(queue)
        .bind(state.map(|s| s.as_str()))
        .bind(sql_count(offset))
        .bind(limit.map(sql_count))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        into_tasks(rows)
    }

    async fn retry(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE queue_tasks
            SET state = 'waiting', attempt = 0, available_at = $2, worker_id = NULL,
                finished_at = NULL, updated_at = $2
            WHERE id = $1 AND state = 'failed'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.refused(task_id, "retry").await),
        }
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM queue_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn clean(
        &self,
        queue: &str,
        state: TaskState,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_tasks
            WHERE queue = $1 AND state = $2 AND COALESCE(finished_at, enqueued_at) < $3
            "#,
        )
        .bind(queue)
        .bind(state.as_str())
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), AppError> {
        let sql = if paused {
            "INSERT INTO paused_queues (queue) VALUES ($1) ON CONFLICT (queue) DO NOTHING"
        } else {
            "DELETE FROM paused_queues WHERE queue = $1"
        };
        sqlx::query(sql)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, AppError> {
        let (paused,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM paused_queues WHERE queue = $1)")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(paused)
    }

    async fn empty(&self, queue: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM queue_tasks WHERE queue = $1 AND state IN ('waiting', 'delayed')",
        )
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn job_tasks(&self, job_id: Uuid) -> Result<Vec<QueueTask>, AppError> {
        let rows =
            sqlx::query_as::<_, TaskRow>("SELECT * FROM queue_tasks WHERE job_id = $1 ORDER BY seq")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;

        into_tasks(rows)
    }

    async fn remove_job_tasks(&self, job_id: Uuid, states: &[TaskState]) -> Result<u64, AppError> {
        let states: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query("DELETE FROM queue_tasks WHERE job_id = $1 AND state = ANY($2)")
            .bind(job_id)
            .bind(&states)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn history(
        &self,
        queue: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueueTask>, AppError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM queue_tasks
            WHERE ($1::text IS NULL OR queue = $1) AND enqueued_at >= $2
            ORDER BY seq
            "#,
        )
        .bind(queue)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        into_tasks(rows)
    }
}
