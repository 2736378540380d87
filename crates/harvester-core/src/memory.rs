//! In-process implementations of every store and the task queue.
//!
//! Used for tests and single-process runs. Each backend is a cheap `Clone`
//! handle over shared state; locks are never held across an await.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dedup::{MergePlan, blocking_keys};
use crate::error::AppError;
use crate::export::{ExportJob, ExportStatus};
use crate::job::{JobFilter, JobLogEntry, ScrapingJob};
use crate::queue::{
    Nack, NackDisposition, NewTask, Queue, QueueCounts, QueueTask, TaskState,
    invalid_task_transition, task_not_found,
};
use crate::record::{CvFields, CvRecord, MergeLogEntry, RecordCursor, RecordQuery};
use crate::source::{Source, SourceFilter};
use crate::traits::{ExportStore, JobStore, RecordStore, SourceStore};

/// Acquires a mutex, recovering from poison if necessary.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

fn page<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, ScrapingJob>>>,
    logs: Arc<Mutex<Vec<JobLogEntry>>>,
}

impl MemoryJobStore {
    fn sorted(&self, filter: &JobFilter) -> Vec<ScrapingJob> {
        let jobs = lock(&self.jobs);
        let mut matched: Vec<ScrapingJob> =
            jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        matched
    }
}

impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &ScrapingJob) -> Result<(), AppError> {
        lock(&self.jobs).insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScrapingJob>, AppError> {
        Ok(lock(&self.jobs).get(&id).cloned())
    }

    async fn update(&self, job: &ScrapingJob) -> Result<ScrapingJob, AppError> {
        let mut jobs = lock(&self.jobs);
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| AppError::not_found("job", job.id))?;
        if stored.version != job.version {
            return Err(AppError::conflict("job", job.id));
        }
        let mut updated = job.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let removed = lock(&self.jobs).remove(&id).is_some();
        if removed {
            lock(&self.logs).retain(|l| l.job_id != id);
        }
        Ok(removed)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<ScrapingJob>, AppError> {
        Ok(page(self.sorted(filter), filter.offset, filter.limit))
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, AppError> {
        Ok(lock(&self.jobs).values().filter(|j| filter.matches(j)).count() as u64)
    }

    async fn append_log(&self, entry: &JobLogEntry) -> Result<(), AppError> {
        lock(&self.logs).push(entry.clone());
        Ok(())
    }

    async fn logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<JobLogEntry>, AppError> {
        let logs = lock(&self.logs);
        Ok(logs
            .iter()
            .rev()
            .filter(|l| l.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemorySourceStore {
    sources: Arc<Mutex<HashMap<Uuid, Source>>>,
}

impl SourceStore for MemorySourceStore {
    async fn insert(&self, source: &Source) -> Result<(), AppError> {
        lock(&self.sources).insert(source.id, source.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Source>, AppError> {
        Ok(lock(&self.sources).get(&id).cloned())
    }

    async fn update(&self, source: &Source) -> Result<Source, AppError> {
        let mut sources = lock(&self.sources);
        let stored = sources
            .get_mut(&source.id)
            .ok_or_else(|| AppError::not_found("source", source.id))?;
        if stored.version != source.version {
            return Err(AppError::conflict("source", source.id));
        }
        let mut updated = source.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(lock(&self.sources).remove(&id).is_some())
    }

    async fn list(&self, filter: &SourceFilter) -> Result<Vec<Source>, AppError> {
        let sources = lock(&self.sources);
        let mut matched: Vec<Source> = sources
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(matched)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordTables {
    by_id: HashMap<Uuid, CvRecord>,
    order: BTreeMap<RecordCursor, Uuid>,
    merge_log: Vec<MergeLogEntry>,
}

impl RecordTables {
    fn check_version(&self, record: &CvRecord) -> Result<(), AppError> {
        let stored = self
            .by_id
            .get(&record.id)
            .ok_or_else(|| AppError::not_found("record", record.id))?;
        if stored.version != record.version {
            return Err(AppError::conflict("record", record.id));
        }
        Ok(())
    }

    fn write(&mut self, record: &CvRecord) -> CvRecord {
        let mut updated = record.clone();
        updated.version += 1;
        self.by_id.insert(updated.id, updated.clone());
        updated
    }
}

#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    tables: Arc<Mutex<RecordTables>>,
}

impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &CvRecord) -> Result<(), AppError> {
        let mut tables = lock(&self.tables);
        tables.order.insert(record.cursor(), record.id);
        tables.by_id.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CvRecord>, AppError> {
        Ok(lock(&self.tables).by_id.get(&id).cloned())
    }

    async fn update(&self, record: &CvRecord) -> Result<CvRecord, AppError> {
        let mut tables = lock(&self.tables);
        tables.check_version(record)?;
        Ok(tables.write(record))
    }

    async fn scan(
        &self,
        query: &RecordQuery,
        after: Option<RecordCursor>,
        limit: usize,
    ) -> Result<Vec<CvRecord>, AppError> {
        let tables = lock(&self.tables);
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(tables
            .order
            .range((lower, Bound::Unbounded))
            .filter_map(|(_, id)| tables.by_id.get(id))
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, query: &RecordQuery) -> Result<u64, AppError> {
        let tables = lock(&self.tables);
        Ok(tables.by_id.values().filter(|r| query.matches(r)).count() as u64)
    }

    async fn find_by_contact(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<CvRecord>, AppError> {
        let fields = CvFields {
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            ..Default::default()
        };
        let wanted: HashSet<String> = blocking_keys(&fields).into_iter().collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let tables = lock(&self.tables);
        Ok(tables
            .order
            .values()
            .filter_map(|id| tables.by_id.get(id))
            .filter(|r| r.is_canonical())
            .filter(|r| {
                blocking_keys(&r.fields)
                    .iter()
                    .any(|k| wanted.contains(k))
            })
            .cloned()
            .collect())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<CvRecord>, AppError> {
        let tables = lock(&self.tables);
        Ok(tables
            .order
            .values()
            .filter_map(|id| tables.by_id.get(id))
            .find(|r| r.is_canonical() && r.content_hash == content_hash)
            .cloned())
    }

    async fn apply_merge(&self, plan: &MergePlan) -> Result<CvRecord, AppError> {
        let mut tables = lock(&self.tables);
        tables.check_version(&plan.primary)?;
        for dup in &plan.duplicates {
            tables.check_version(dup)?;
        }

        let primary = tables.write(&plan.primary);
        for dup in &plan.duplicates {
            tables.write(dup);
        }
        tables.merge_log.extend(plan.log.iter().cloned());
        Ok(primary)
    }

    async fn merge_log(&self, record_id: Uuid) -> Result<Vec<MergeLogEntry>, AppError> {
        Ok(lock(&self.tables)
            .merge_log
            .iter()
            .filter(|e| e.primary_id == record_id || e.duplicate_id == record_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryExportStore {
    exports: Arc<Mutex<HashMap<Uuid, ExportJob>>>,
}

impl ExportStore for MemoryExportStore {
    async fn insert(&self, export: &ExportJob) -> Result<(), AppError> {
        lock(&self.exports).insert(export.id, export.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExportJob>, AppError> {
        Ok(lock(&self.exports).get(&id).cloned())
    }

    async fn update(&self, export: &ExportJob) -> Result<(), AppError> {
        let mut exports = lock(&self.exports);
        let stored = exports
            .get_mut(&export.id)
            .ok_or_else(|| AppError::not_found("export", export.id))?;
        *stored = export.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(lock(&self.exports).remove(&id).is_some())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ExportJob>, AppError> {
        let exports = lock(&self.exports);
        let mut all: Vec<ExportJob> = exports.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn fail_stalled(
        &self,
        stalled_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportJob>, AppError> {
        let mut exports = lock(&self.exports);
        let mut failed = Vec::new();
        for export in exports.values_mut() {
            if export.status == ExportStatus::Processing && export.updated_at < stalled_before {
                export.status = ExportStatus::Failed;
                export.retriable = true;
                export.error = Some(error.to_string());
                export.updated_at = now;
                failed.push(export.clone());
            }
        }
        Ok(failed)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    tasks: HashMap<Uuid, QueueTask>,
    paused: HashSet<String>,
    next_seq: i64,
}

impl QueueState {
    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut QueueTask, AppError> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| task_not_found(task_id))
    }

    fn sorted<'a>(&'a self, pred: impl Fn(&QueueTask) -> bool) -> Vec<&'a QueueTask> {
        let mut tasks: Vec<&QueueTask> = self.tasks.values().filter(|t| pred(*t)).collect();
        tasks.sort_by_key(|t| t.dispatch_key());
        tasks
    }

    fn remove_where(&mut self, pred: impl Fn(&QueueTask) -> bool) -> u64 {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| !pred(t));
        (before - self.tasks.len()) as u64
    }
}

/// In-memory broker. Claims are serialized by the state lock.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl Queue for MemoryQueue {
    async fn enqueue(&self, task: NewTask, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        let mut state = lock(&self.state);
        state.next_seq += 1;
        let queued = QueueTask {
            id: Uuid::new_v4(),
            queue: task.queue,
            job_id: task.job_id,
            source_id: task.source_id,
            payload: task.payload,
            priority: task.priority,
            seq: state.next_seq,
            attempt: 0,
            max_attempts: task.max_attempts,
            state: TaskState::Waiting,
            available_at: now,
            worker_id: None,
            proxy_id: None,
            last_error: None,
            error_category: None,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        state.tasks.insert(queued.id, queued.clone());
        Ok(queued)
    }

    async fn ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueTask>, AppError> {
        let state = lock(&self.state);
        Ok(state
            .sorted(|t| t.queue == queue && t.is_ready(now))
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn dequeue(
        &self,
        task_id: Uuid,
        worker_id: &str,
        proxy_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueTask>, AppError> {
        let mut state = lock(&self.state);
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if !task.is_ready(now) {
            return Ok(None);
        }
        task.state = TaskState::Active;
        task.attempt += 1;
        task.worker_id = Some(worker_id.to_string());
        task.proxy_id = proxy_id;
        task.started_at = Some(now);
        task.finished_at = None;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn ack(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        let mut state = lock(&self.state);
        let task = state.task_mut(task_id)?;
        if task.state != TaskState::Active {
            return Err(invalid_task_transition(task, "ack"));
        }
        task.state = TaskState::Completed;
        task.finished_at = Some(now);
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn nack(&self, task_id: Uuid, nack: Nack, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        let mut state = lock(&self.state);
        let task = state.task_mut(task_id)?;
        if task.state != TaskState::Active {
            return Err(invalid_task_transition(task, "nack"));
        }
        match nack.disposition {
            NackDisposition::Retry { at } => {
                task.state = TaskState::Delayed;
                task.available_at = at;
            }
            NackDisposition::DeadLetter => {
                task.state = TaskState::Failed;
                task.finished_at = Some(now);
            }
            NackDisposition::Requeue => {
                task.state = TaskState::Waiting;
                task.attempt = task.attempt.saturating_sub(1);
                task.available_at = now;
            }
        }
        task.last_error = Some(nack.error);
        task.error_category = Some(nack.category);
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn stats(&self, queue: &str) -> Result<QueueCounts, AppError> {
        let state = lock(&self.state);
        let mut counts = QueueCounts::default();
        for task in state.tasks.values().filter(|t| t.queue == queue) {
            counts.add(task.state);
        }
        Ok(counts)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<QueueTask>, AppError> {
        Ok(lock(&self.state).tasks.get(&task_id).cloned())
    }

    async fn list(
        &self,
        queue: &str,
        task_state: Option<TaskState>,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<QueueTask>, AppError> {
        let state = lock(&self.state);
        let tasks = state
            .sorted(|t| t.queue == queue && task_state.is_none_or(|s| t.state == s))
            .into_iter()
            .cloned()
            .collect();
        Ok(page(tasks, offset, limit))
    }

    async fn retry(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<QueueTask, AppError> {
        let mut state = lock(&self.state);
        let task = state.task_mut(task_id)?;
        if task.state != TaskState::Failed {
            return Err(invalid_task_transition(task, "retry"));
        }
        task.state = TaskState::Waiting;
        task.attempt = 0;
        task.available_at = now;
        task.worker_id = None;
        task.finished_at = None;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, AppError> {
        Ok(lock(&self.state).tasks.remove(&task_id).is_some())
    }

    async fn clean(
        &self,
        queue: &str,
        task_state: TaskState,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        Ok(lock(&self.state).remove_where(|t| {
            t.queue == queue && t.state == task_state && t.age_anchor() < older_than
        }))
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), AppError> {
        let mut state = lock(&self.state);
        if paused {
            state.paused.insert(queue.to_string());
        } else {
            state.paused.remove(queue);
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, AppError> {
        Ok(lock(&self.state).paused.contains(queue))
    }

    async fn empty(&self, queue: &str) -> Result<u64, AppError> {
        Ok(lock(&self.state).remove_where(|t| {
            t.queue == queue && matches!(t.state, TaskState::Waiting | TaskState::Delayed)
        }))
    }

    async fn job_tasks(&self, job_id: Uuid) -> Result<Vec<QueueTask>, AppError> {
        let state = lock(&self.state);
        let mut tasks: Vec<QueueTask> = state
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    async fn remove_job_tasks(&self, job_id: Uuid, states: &[TaskState]) -> Result<u64, AppError> {
        Ok(lock(&self.state).remove_where(|t| t.job_id == job_id && states.contains(&t.state)))
    }

    async fn history(
        &self,
        queue: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueueTask>, AppError> {
        let state = lock(&self.state);
        let mut tasks: Vec<QueueTask> = state
            .tasks
            .values()
            .filter(|t| queue.is_none_or(|q| t.queue == q) && t.enqueued_at >= since)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }
}
