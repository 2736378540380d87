pub mod analytics;
pub mod audit;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod gate;
pub mod job;
pub mod job_registry;
pub mod memory;
pub mod proxy_pool;
pub mod queue;
pub mod queue_manager;
pub mod rate_limit;
pub mod record;
pub mod scheduler;
pub mod source;
pub mod source_registry;
pub mod traits;
pub mod validation;
pub mod validation_engine;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use analytics::{AnalyticsService, DateRange};
pub use audit::{AuditEvent, AuditSink, SharedAuditSink, TracingAuditSink};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::HarvesterConfig;
pub use dispatcher::{Dispatched, Dispatcher};
pub use error::{AppError, FetchError};
pub use export::{ExportFormat, ExportJob, ExportService, FsArtifactSink};
pub use gate::{GateHandle, spawn_gate};
pub use job::{JobStatus, ScrapingJob};
pub use job_registry::JobRegistry;
pub use queue::{Queue, QueueTask, TaskState};
pub use queue_manager::QueueManager;
pub use record::{CvRecord, RawRecord, compute_hash};
pub use scheduler::Scheduler;
pub use source::{Proxy, Source, SourceKind};
pub use source_registry::SourceRegistry;
pub use traits::{ArtifactSink, ExportStore, Fetcher, JobStore, Prober, RecordStore, SourceStore};
pub use validation_engine::ValidationEngine;
pub use worker::{TracingWorkerReporter, WorkerReporter, WorkerService};
