use chrono::{TimeDelta, Utc};
use harvester_core::AppError;
use harvester_core::queue::{Nack, NackDisposition, NewTask, Queue, TaskPayload, TaskState};
use uuid::Uuid;

use crate::common::setup_test_db;

fn new_task(queue: &str, priority: i32, page: u32) -> NewTask {
    NewTask {
        queue: queue.into(),
        job_id: Uuid::new_v4(),
        source_id: Uuid::new_v4(),
        payload: TaskPayload { page, cursor: None },
        priority,
        max_attempts: 3,
    }
}

fn nack(disposition: NackDisposition) -> Nack {
    Nack {
        error: "connection reset".into(),
        category: "network".into(),
        disposition,
    }
}

#[tokio::test]
async fn ready_orders_by_priority_then_sequence() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue();
    let now = Utc::now();

    let low = queue.enqueue(new_task("listing_api", 0, 1), now).await.unwrap();
    let high = queue.enqueue(new_task("listing_api", 5, 2), now).await.unwrap();
    let low2 = queue.enqueue(new_task("listing_api", 0, 3), now).await.unwrap();
    queue.enqueue(new_task("file_import", 9, 1), now).await.unwrap();

    assert!(low.seq < low2.seq);
    let ready = queue.ready("listing_api", now, 10).await.unwrap();
    let ids: Vec<Uuid> = ready.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![high.id, low.id, low2.id]);
    assert_eq!(ready[0].payload.page, 2);
}

#[tokio::test]
async fn dequeue_claims_a_task_once() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue();
    let now = Utc::now();
    let task = queue.enqueue(new_task("listing_api", 0, 1), now).await.unwrap();
    let proxy_id = Uuid::new_v4();

    let claimed = queue
        .dequeue(task.id, "worker-1", Some(proxy_id), now)
        .await
        .unwrap()
        .expect("task should be claimable");
    assert_eq!(claimed.state, TaskState::Active);
    assert_eq!(claimed.attempt, 1);
    assert_eq!(claimed.proxy_id, Some(proxy_id));
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));

    assert!(queue.dequeue(task.id, "worker-2", None, now).await.unwrap().is_none());
    assert!(queue.ready("listing_api", now, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_claims_hand_out_a_task_once() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue();
    let now = Utc::now();
    let task_id = queue
        .enqueue(new_task("listing_api", 0, 1), now)
        .await
        .unwrap()
        .id;

    let mut handles = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .dequeue(task_id, &format!("worker-{i}"), None, now)
                .await
                .unwrap()
        }));
    }
    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn nack_dispositions() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue();
    let now = Utc::now();
    let task = queue.enqueue(new_task("listing_api", 0, 1), now).await.unwrap();

    // Requeue gives the attempt back.
    queue.dequeue(task.id, "w", None, now).await.unwrap().unwrap();
    let requeued = queue
        .nack(task.id, nack(NackDisposition::Requeue), now)
        .await
        .unwrap();
    assert_eq!(requeued.state, TaskState::Waiting);
    assert_eq!(requeued.attempt, 0);

    // Retry delays until `at`.
    let at = now + TimeDelta::seconds(30);
    queue.dequeue(task.id, "w", None, now).await.unwrap().unwrap();
    let delayed = queue
        .nack(task.id, nack(NackDisposition::Retry { at }), now)
        .await
        .unwrap();
    assert_eq!(delayed.state, TaskState::Delayed);
    assert_eq!(delayed.attempt, 1);
    assert_eq!(delayed.error_category.as_deref(), Some("network"));
    assert!(queue.ready("listing_api", now, 10).await.unwrap().is_empty());
    assert_eq!(
        queue.ready("listing_api", at, 10).await.unwrap().len(),
        1
    );

    // Dead-letter, then a manual retry resets the budget.
    queue.dequeue(task.id, "w", None, at).await.unwrap().unwrap();
    let failed = queue
        .nack(task.id, nack(NackDisposition::DeadLetter), at)
        .await
        .unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert!(failed.finished_at.is_some());

    let retried = queue.retry(task.id, at).await.unwrap();
    assert_eq!(retried.state, TaskState::Waiting);
    assert_eq!(retried.attempt, 0);
    assert_eq!(retried.seq, task.seq);
}

#[tokio::test]
async fn state_changes_on_the_wrong_state_are_refused() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue();
    let now = Utc::now();
    let task = queue.enqueue(new_task("listing_api", 0, 1), now).await.unwrap();

    let err = queue.ack(task.id, now).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { action: "ack", .. }));
    let err = queue.retry(task.id, now).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    let err = queue.ack(Uuid::new_v4(), now).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn stats_pause_clean_and_empty() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue();
    let start = Utc::now();

    let done = queue.enqueue(new_task("listing_api", 0, 1), start).await.unwrap();
    queue.dequeue(done.id, "w", None, start).await.unwrap().unwrap();
    queue.ack(done.id, start).await.unwrap();
    queue.enqueue(new_task("listing_api", 0, 2), start).await.unwrap();
    queue.enqueue(new_task("listing_api", 0, 3), start).await.unwrap();

    let counts = queue.stats("listing_api").await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 2);

    queue.set_paused("listing_api", true).await.unwrap();
    queue.set_paused("listing_api", true).await.unwrap();
    assert!(queue.is_paused("listing_api").await.unwrap());
    queue.set_paused("listing_api", false).await.unwrap();
    assert!(!queue.is_paused("listing_api").await.unwrap());

    // Completed just now: inside the grace period.
    let removed = queue
        .clean("listing_api", TaskState::Completed, start - TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 0);
    let removed = queue
        .clean("listing_api", TaskState::Completed, start + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert_eq!(queue.empty("listing_api").await.unwrap(), 2);
    assert_eq!(queue.stats("listing_api").await.unwrap().backlog(), 0);
}

#[tokio::test]
async fn job_tasks_and_history() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue();
    let now = Utc::now();
    let job_id = Uuid::new_v4();

    for page in 1..=3 {
        let mut task = new_task("paginated_html", 0, page);
        task.job_id = job_id;
        queue.enqueue(task, now).await.unwrap();
    }
    queue.enqueue(new_task("listing_api", 0, 1), now).await.unwrap();

    let tasks = queue.job_tasks(job_id).await.unwrap();
    let pages: Vec<u32> = tasks.iter().map(|t| t.payload.page).collect();
    assert_eq!(pages, vec![1, 2, 3]);

    // Stored timestamps are truncated to microseconds.
    let since = now - TimeDelta::seconds(1);
    assert_eq!(queue.history(None, since).await.unwrap().len(), 4);
    assert_eq!(
        queue.history(Some("paginated_html"), since).await.unwrap().len(),
        3
    );

    let removed = queue
        .remove_job_tasks(job_id, &[TaskState::Waiting, TaskState::Delayed])
        .await
        .unwrap();
    assert_eq!(removed, 3);
    assert!(queue.job_tasks(job_id).await.unwrap().is_empty());
}
