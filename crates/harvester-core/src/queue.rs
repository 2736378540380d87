//! Broker-agnostic task queue.
//!
//! Tasks are ordered by `priority` (descending) then `seq` (ascending). `seq`
//! is assigned once, at first enqueue, so a retried task keeps its place ahead
//! of newer work of the same priority.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Waiting,
        TaskState::Active,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Delayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Delayed => "delayed",
        }
    }

    /// Still owed an execution.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            TaskState::Waiting | TaskState::Active | TaskState::Delayed
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("Unknown task state: {s}"))
    }
}

/// What a task should fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub page: u32,
    /// Explicit target URL or continuation cursor, if the fetcher needs one.
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: Uuid,
    pub queue: String,
    pub job_id: Uuid,
    pub source_id: Uuid,
    pub payload: TaskPayload,
    pub priority: i32,
    pub seq: i64,
    /// Executions started so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: TaskState,
    pub available_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub proxy_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub error_category: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl QueueTask {
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::Waiting => true,
            TaskState::Delayed => self.available_at <= now,
            _ => false,
        }
    }

    pub fn processing_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }

    /// Time used by `clean`: finish time, or enqueue time for unfinished tasks.
    pub fn age_anchor(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.enqueued_at)
    }

    /// Dispatch order: higher priority first, then lower sequence.
    pub fn dispatch_key(&self) -> (std::cmp::Reverse<i32>, i64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub queue: String,
    pub job_id: Uuid,
    pub source_id: Uuid,
    pub payload: TaskPayload,
    pub priority: i32,
    pub max_attempts: u32,
}

/// What to do with a task whose execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDisposition {
    /// Back off and run again at `at`.
    Retry { at: DateTime<Utc> },
    /// Give up; the task ends `failed`.
    DeadLetter,
    /// Put back immediately without consuming the attempt.
    Requeue,
}

#[derive(Debug, Clone)]
pub struct Nack {
    pub error: String,
    pub category: String,
    pub disposition: NackDisposition,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Waiting => self.waiting += 1,
            TaskState::Active => self.active += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Delayed => self.delayed += 1,
        }
    }

    pub fn backlog(&self) -> u64 {
        self.waiting + self.delayed
    }

    /// Failed share of finished tasks; zero when nothing has finished.
    pub fn failure_ratio(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

/// Terminal/outstanding breakdown of one job's tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTally {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub outstanding: u64,
}

impl TaskTally {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a QueueTask>) -> Self {
        let mut tally = TaskTally::default();
        for task in tasks {
            tally.total += 1;
            match task.state {
                TaskState::Completed => tally.completed += 1,
                TaskState::Failed => tally.failed += 1,
                _ => tally.outstanding += 1,
            }
        }
        tally
    }

    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.outstanding == 0
    }
}

/// Task broker.
///
/// Claiming (`dequeue`) must be atomic: a task handed out once is not handed
/// out again until it is nacked back to a ready state.
pub trait Queue: Send + Sync + Clone {
    fn enqueue(
        &self,
        task: NewTask,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueueTask, AppError>> + Send;

    /// Ready tasks in dispatch order, without claiming them.
    fn ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<QueueTask>, AppError>> + Send;

    /// Claim a specific ready task. Returns `None` if it is no longer ready.
    fn dequeue(
        &self,
        task_id: Uuid,
        worker_id: &str,
        proxy_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<QueueTask>, AppError>> + Send;

    fn ack(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueueTask, AppError>> + Send;

    fn nack(
        &self,
        task_id: Uuid,
        nack: Nack,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueueTask, AppError>> + Send;

    fn stats(&self, queue: &str) -> impl Future<Output = Result<QueueCounts, AppError>> + Send;

    fn get(&self, task_id: Uuid)
    -> impl Future<Output = Result<Option<QueueTask>, AppError>> + Send;

    /// Tasks of a queue, optionally in one state, in dispatch order.
    /// `limit: None` returns every match.
    fn list(
        &self,
        queue: &str,
        state: Option<TaskState>,
        offset: usize,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<QueueTask>, AppError>> + Send;

    /// Move a failed task back to waiting with a fresh attempt budget.
    fn retry(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueueTask, AppError>> + Send;

    fn remove(&self, task_id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Remove tasks in `state` whose age anchor is before `older_than`.
    fn clean(
        &self,
        queue: &str,
        state: TaskState,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn set_paused(
        &self,
        queue: &str,
        paused: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn is_paused(&self, queue: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Remove waiting and delayed tasks.
    fn empty(&self, queue: &str) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn job_tasks(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Vec<QueueTask>, AppError>> + Send;

    /// Remove a job's tasks that are in any of `states`.
    fn remove_job_tasks(
        &self,
        job_id: Uuid,
        states: &[TaskState],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Tasks enqueued at or after `since`, across all queues when `queue` is `None`.
    fn history(
        &self,
        queue: Option<&str>,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<QueueTask>, AppError>> + Send;
}

pub(crate) fn task_not_found(task_id: Uuid) -> AppError {
    AppError::not_found("task", task_id)
}

pub(crate) fn invalid_task_transition(task: &QueueTask, action: &'static str) -> AppError {
    AppError::InvalidTransition {
        entity: "task",
        id: task.id.to_string(),
        from: task.state.to_string(),
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(state: TaskState) -> QueueTask {
        let now = Utc::now();
        QueueTask {
            id: Uuid::new_v4(),
            queue: "listing_api".into(),
            job_id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            payload: TaskPayload::default(),
            priority: 0,
            seq: 1,
            attempt: 0,
            max_attempts: 3,
            state,
            available_at: now,
            worker_id: None,
            proxy_id: None,
            last_error: None,
            error_category: None,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn test_tally() {
        let tasks = [
            task(TaskState::Completed),
            task(TaskState::Failed),
            task(TaskState::Delayed),
        ];
        let tally = TaskTally::from_tasks(&tasks);
        assert_eq!(tally.total, 3);
        assert_eq!(tally.completed, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.outstanding, 1);
        assert!(!tally.is_settled());
        assert!(!TaskTally::default().is_settled());
    }

    #[test]
    fn test_delayed_task_ready_after_available_at() {
        let mut t = task(TaskState::Delayed);
        let now = Utc::now();
        t.available_at = now + chrono::TimeDelta::seconds(5);
        assert!(!t.is_ready(now));
        assert!(t.is_ready(now + chrono::TimeDelta::seconds(5)));
        assert!(!task(TaskState::Active).is_ready(now));
    }

    #[test]
    fn test_dispatch_order() {
        let mut a = task(TaskState::Waiting);
        a.priority = 1;
        a.seq = 10;
        let mut b = task(TaskState::Waiting);
        b.priority = 5;
        b.seq = 20;
        let mut c = task(TaskState::Waiting);
        c.priority = 5;
        c.seq = 15;
        let mut tasks = vec![a.clone(), b.clone(), c.clone()];
        tasks.sort_by_key(QueueTask::dispatch_key);
        assert_eq!(
            tasks.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![c.id, b.id, a.id]
        );
    }

    #[test]
    fn test_failure_ratio() {
        let counts = QueueCounts {
            completed: 9,
            failed: 1,
            ..Default::default()
        };
        assert!((counts.failure_ratio() - 0.1).abs() < f64::EPSILON);
        assert_eq!(QueueCounts::default().failure_ratio(), 0.0);
    }
}
