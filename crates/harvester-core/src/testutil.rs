//! Test utilities: mock implementations of the core traits and fixtures.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink, SharedAuditSink};
use crate::error::FetchError;
use crate::job::{CreateJobRequest, ScrapingJob};
use crate::queue::QueueTask;
use crate::record::RawRecord;
use crate::source::{
    CreateSourceRequest, ProbeResult, Proxy, RateLimitPolicy, Source, SourceCategory, SourceKind,
};
use crate::traits::{Fetcher, Prober};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

type FetchResult = Result<Vec<RawRecord>, FetchError>;

/// One recorded `fetch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub task_id: Uuid,
    pub page: u32,
    pub proxy_id: Option<Uuid>,
}

/// Mock fetcher with scripted results.
///
/// Each call pops the next scripted result; once the script is empty every
/// call returns the fallback.
#[derive(Clone)]
pub struct MockFetcher {
    script: Arc<Mutex<VecDeque<FetchResult>>>,
    fallback: FetchResult,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<FetchCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockFetcher {
    fn with_fallback(fallback: FetchResult) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call returns these records.
    pub fn returning(records: Vec<RawRecord>) -> Self {
        Self::with_fallback(Ok(records))
    }

    /// Every call fails with this error.
    pub fn failing(error: FetchError) -> Self {
        Self::with_fallback(Err(error))
    }

    /// Queue a result ahead of the fallback.
    pub fn then(self, result: FetchResult) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of calls that were running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        task: &QueueTask,
        _source: &Source,
        proxy: Option<&Proxy>,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.calls.lock().unwrap().push(FetchCall {
            task_id: task.id,
            page: task.payload.page,
            proxy_id: proxy.map(|p| p.id),
        });
        let now_running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// MockProber
// ---------------------------------------------------------------------------

/// Mock prober that answers every probe the same way.
#[derive(Clone)]
pub struct MockProber {
    result: ProbeResult,
    calls: Arc<Mutex<Vec<(String, Option<Uuid>)>>>,
}

impl MockProber {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            result: ProbeResult {
                success: true,
                latency_ms,
                error: None,
            },
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            result: ProbeResult {
                success: false,
                latency_ms: 0,
                error: Some(error.to_string()),
            },
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Probed URLs with the proxy used, in call order.
    pub fn calls(&self) -> Vec<(String, Option<Uuid>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Prober for MockProber {
    async fn probe(&self, url: &str, proxy: Option<&Proxy>, _timeout: Duration) -> ProbeResult {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), proxy.map(|p| p.id)));
        self.result.clone()
    }
}

// ---------------------------------------------------------------------------
// MockAuditSink
// ---------------------------------------------------------------------------

/// Audit sink that keeps every event.
#[derive(Clone, Default)]
pub struct MockAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MockAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared handle onto the same event list.
    pub fn shared(&self) -> SharedAuditSink {
        Arc::new(self.clone())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

impl AuditSink for MockAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records events.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started".to_string(),
            WorkerEvent::TaskStarted { .. } => "TaskStarted".to_string(),
            WorkerEvent::TaskCompleted { .. } => "TaskCompleted".to_string(),
            WorkerEvent::TaskFailed { will_retry, .. } => format!("TaskFailed(retry={will_retry})"),
            WorkerEvent::TaskSkipped { .. } => "TaskSkipped".to_string(),
            WorkerEvent::ShuttingDown { tasks_released, .. } => {
                format!("ShuttingDown({tasks_released})")
            }
            WorkerEvent::Stopped { .. } => "Stopped".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// An active, healthy listing-API source with the default rate limit and no
/// proxies.
pub fn source_fixture() -> Source {
    let request = CreateSourceRequest {
        name: format!("board-{}", &Uuid::new_v4().simple().to_string()[..8]),
        kind: SourceKind::ListingApi {
            endpoint: "/v1/candidates".into(),
            page_param: "page".into(),
            page_size: 50,
            records_path: Some("data".into()),
        },
        base_url: "https://api.board.example.com".into(),
        credentials: None,
        rate_limit: RateLimitPolicy::default(),
        category: SourceCategory::JobBoard,
    };
    Source::from_request(request, Utc::now())
}

/// A pending single-page job on `source_id`.
pub fn job_fixture(source_id: Uuid) -> ScrapingJob {
    let request = CreateJobRequest::new("nightly sweep", source_id, "tester");
    ScrapingJob::from_request(request, Utc::now())
}

/// A raw candidate with a name and an email.
pub fn raw_record(name: &str, email: &str) -> RawRecord {
    let value = json!({
        "name": name,
        "email": email,
        "headline": "Software Engineer",
        "skills": ["Rust", "PostgreSQL"],
    });
    RawRecord::from_value(value).unwrap_or_default()
}
