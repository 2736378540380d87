use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use uuid::Uuid;

use crate::dedup::MergePlan;
use crate::error::{AppError, FetchError};
use crate::export::{ExportFormat, ExportJob};
use crate::job::{JobFilter, JobLogEntry, ScrapingJob};
use crate::queue::QueueTask;
use crate::record::{CvRecord, MergeLogEntry, RawRecord, RecordCursor, RecordQuery};
use crate::source::{ProbeResult, Proxy, Source, SourceFilter};

/// Pulls one task's worth of raw records from a source.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        task: &QueueTask,
        source: &Source,
        proxy: Option<&Proxy>,
    ) -> impl Future<Output = Result<Vec<RawRecord>, FetchError>> + Send;
}

/// Connectivity check against a URL, optionally through a proxy.
pub trait Prober: Send + Sync + Clone {
    /// Never fails: errors are reported in the result.
    fn probe(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> impl Future<Output = ProbeResult> + Send;
}

/// Persists scraping jobs and their activity log.
///
/// `update` is a compare-and-swap on `version`: it succeeds only if the stored
/// version equals the given job's version, and bumps it.
pub trait JobStore: Send + Sync + Clone {
    fn insert(&self, job: &ScrapingJob) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<ScrapingJob>, AppError>> + Send;

    fn update(
        &self,
        job: &ScrapingJob,
    ) -> impl Future<Output = Result<ScrapingJob, AppError>> + Send;

    fn delete(&self, id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Newest first.
    fn list(
        &self,
        filter: &JobFilter,
    ) -> impl Future<Output = Result<Vec<ScrapingJob>, AppError>> + Send;

    fn count(&self, filter: &JobFilter) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn append_log(&self, entry: &JobLogEntry)
    -> impl Future<Output = Result<(), AppError>> + Send;

    /// Newest first.
    fn logs(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JobLogEntry>, AppError>> + Send;
}

/// Persists sources with their nested proxies. `update` is a version CAS.
pub trait SourceStore: Send + Sync + Clone {
    fn insert(&self, source: &Source) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<Source>, AppError>> + Send;

    fn update(&self, source: &Source) -> impl Future<Output = Result<Source, AppError>> + Send;

    fn delete(&self, id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn list(
        &self,
        filter: &SourceFilter,
    ) -> impl Future<Output = Result<Vec<Source>, AppError>> + Send;
}

/// Persists CV records and the merge log.
pub trait RecordStore: Send + Sync + Clone {
    fn insert(&self, record: &CvRecord) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<CvRecord>, AppError>> + Send;

    /// Version CAS.
    fn update(
        &self,
        record: &CvRecord,
    ) -> impl Future<Output = Result<CvRecord, AppError>> + Send;

    /// Matching records in `(created_at, id)` order, strictly after `after`.
    fn scan(
        &self,
        query: &RecordQuery,
        after: Option<RecordCursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<CvRecord>, AppError>> + Send;

    fn count(&self, query: &RecordQuery) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Canonical records sharing the normalized email or phone.
    fn find_by_contact(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> impl Future<Output = Result<Vec<CvRecord>, AppError>> + Send;

    /// A canonical record with this content hash, if any.
    fn find_by_hash(
        &self,
        content_hash: &str,
    ) -> impl Future<Output = Result<Option<CvRecord>, AppError>> + Send;

    /// Apply a merge group atomically: every record's version is checked, and
    /// either all writes and log entries land or none do.
    fn apply_merge(
        &self,
        plan: &MergePlan,
    ) -> impl Future<Output = Result<CvRecord, AppError>> + Send;

    /// Entries where the record was primary or duplicate, oldest first.
    fn merge_log(
        &self,
        record_id: Uuid,
    ) -> impl Future<Output = Result<Vec<MergeLogEntry>, AppError>> + Send;
}

pub trait ExportStore: Send + Sync + Clone {
    fn insert(&self, export: &ExportJob) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<ExportJob>, AppError>> + Send;

    fn update(&self, export: &ExportJob) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete(&self, id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Newest first.
    fn list(&self, limit: usize)
    -> impl Future<Output = Result<Vec<ExportJob>, AppError>> + Send;

    /// Mark every `processing` export last updated before `stalled_before` as
    /// failed and retriable, in one step. Returns the exports changed.
    fn fail_stalled(
        &self,
        stalled_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ExportJob>, AppError>> + Send;
}

/// Destination for export artifacts.
pub trait ArtifactSink: Send + Sync + Clone + 'static {
    type Writer: AsyncWrite + Unpin + Send;

    /// Open a writer for a new artifact and return it with the artifact reference.
    fn create(
        &self,
        export_id: Uuid,
        format: ExportFormat,
    ) -> impl Future<Output = Result<(Self::Writer, String), AppError>> + Send;

    /// Delete an artifact. Missing artifacts are not an error.
    fn remove(&self, artifact_ref: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}
