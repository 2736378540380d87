//! Bounded, paged extraction of CV records into CSV or JSON Lines artifacts.
//!
//! Small exports are written inline; anything above the synchronous threshold
//! is returned as `processing` and finished on a background task that pages
//! through the record store and reports progress after every chunk.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::audit::{AuditEvent, SharedAuditSink};
use crate::clock::SharedClock;
use crate::error::AppError;
use crate::job_registry::SYSTEM_ACTOR;
use crate::record::{CvRecord, RecordCursor, RecordQuery};
use crate::traits::{ArtifactSink, ExportStore, RecordStore};

const STALLED_ERROR: &str = "export stopped making progress before completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Jsonl,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Jsonl => "jsonl",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "jsonl" => Ok(ExportFormat::Jsonl),
            _ => Err(format!("Unknown export format: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Processing,
    Completed,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Processing => "processing",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ExportStatus::Processing),
            "completed" => Ok(ExportStatus::Completed),
            "failed" => Ok(ExportStatus::Failed),
            _ => Err(format!("Unknown export status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportProgress {
    pub rows_written: u64,
    pub total_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub filter: RecordQuery,
    pub format: ExportFormat,
    pub status: ExportStatus,
    pub artifact_ref: Option<String>,
    pub progress: ExportProgress,
    pub retriable: bool,
    pub error: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Exports at or below this many rows complete before `create_export` returns.
    pub sync_threshold: u64,
    pub chunk_size: usize,
    /// A `processing` export with no progress for this long is considered dead.
    pub stall_timeout: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            sync_threshold: 1000,
            chunk_size: 500,
            stall_timeout: Duration::from_secs(900),
        }
    }
}

/// Flat row written to the artifact.
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    id: Uuid,
    source_id: Uuid,
    job_id: Option<Uuid>,
    status: &'static str,
    quality_score: f64,
    full_name: Option<&'a str>,
    email: Option<&'a str>,
    phone: Option<&'a str>,
    location: Option<&'a str>,
    headline: Option<&'a str>,
    skills: String,
    experience_years: Option<f64>,
    summary: Option<&'a str>,
    duplicate_of: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl<'a> From<&'a CvRecord> for ExportRow<'a> {
    fn from(r: &'a CvRecord) -> Self {
        Self {
            id: r.id,
            source_id: r.source_id,
            job_id: r.job_id,
            status: r.status.as_str(),
            quality_score: r.quality_score,
            full_name: r.fields.full_name.as_deref(),
            email: r.fields.email.as_deref(),
            phone: r.fields.phone.as_deref(),
            location: r.fields.location.as_deref(),
            headline: r.fields.headline.as_deref(),
            skills: r.fields.skills.join(";"),
            experience_years: r.fields.experience_years,
            summary: r.fields.summary.as_deref(),
            duplicate_of: r.duplicate_of,
            created_at: r.created_at,
        }
    }
}

/// Serializes chunks of records for one artifact. Only the first CSV chunk
/// carries the header row.
struct ChunkEncoder {
    format: ExportFormat,
    header_written: bool,
}

impl ChunkEncoder {
    fn new(format: ExportFormat) -> Self {
        Self {
            format,
            header_written: false,
        }
    }

    fn encode(&mut self, records: &[CvRecord]) -> Result<Vec<u8>, AppError> {
        match self.format {
            ExportFormat::Csv => {
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(!self.header_written)
                    .from_writer(Vec::new());
                for record in records {
                    writer.serialize(ExportRow::from(record))?;
                }
                self.header_written = true;
                writer
                    .into_inner()
                    .map_err(|e| AppError::ExportError(e.to_string()))
            }
            ExportFormat::Jsonl => {
                let mut buf = Vec::new();
                for record in records {
                    serde_json::to_writer(&mut buf, &ExportRow::from(record))?;
                    buf.push(b'\n');
                }
                Ok(buf)
            }
        }
    }
}

/// Writes artifacts as `<dir>/<id>.<ext>` files.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    dir: PathBuf,
}

impl FsArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactSink for FsArtifactSink {
    type Writer = BufWriter<File>;

    async fn create(
        &self,
        export_id: Uuid,
        format: ExportFormat,
    ) -> Result<(Self::Writer, String), AppError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("{export_id}.{}", format.extension()));
        let file = File::create(&path).await?;
        Ok((BufWriter::new(file), path.to_string_lossy().into_owned()))
    }

    async fn remove(&self, artifact_ref: &str) -> Result<(), AppError> {
        match tokio::fs::remove_file(artifact_ref).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone)]
pub struct ExportService<E, R, A> {
    exports: E,
    records: R,
    sink: A,
    clock: SharedClock,
    audit: SharedAuditSink,
    config: ExportConfig,
}

impl<E, R, A> ExportService<E, R, A>
where
    E: ExportStore + 'static,
    R: RecordStore + 'static,
    A: ArtifactSink,
{
    pub fn new(
        exports: E,
        records: R,
        sink: A,
        clock: SharedClock,
        audit: SharedAuditSink,
        config: ExportConfig,
    ) -> Self {
        Self {
            exports,
            records,
            sink,
            clock,
            audit,
            config,
        }
    }

    /// Start an export of every record matching `filter`.
    ///
    /// Returns the finished export when the match count is within the
    /// synchronous threshold, otherwise a `processing` export that completes
    /// in the background.
    pub async fn create_export(
        &self,
        filter: RecordQuery,
        format: ExportFormat,
        actor: &str,
    ) -> Result<ExportJob, AppError> {
        let now = self.clock.now();
        let total_rows = self.records.count(&filter).await?;
        let export = ExportJob {
            id: Uuid::new_v4(),
            filter,
            format,
            status: ExportStatus::Processing,
            artifact_ref: None,
            progress: ExportProgress {
                rows_written: 0,
                total_rows,
            },
            retriable: false,
            error: None,
            created_by: actor.to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.exports.insert(&export).await?;
        self.audit
            .emit(AuditEvent::new(actor, "export.create", "export", export.id, now).after(&export));

        tracing::info!(export_id = %export.id, %format, total_rows, "Export created");
        self.launch(export).await
    }

    pub async fn get_export_status(&self, id: Uuid) -> Result<ExportJob, AppError> {
        self.exports
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("export", id))
    }

    pub async fn list_exports(&self, limit: usize) -> Result<Vec<ExportJob>, AppError> {
        self.exports.list(limit).await
    }

    /// Remove the artifact and the registry entry. Running exports cannot be deleted.
    pub async fn delete_export(&self, id: Uuid, actor: &str) -> Result<(), AppError> {
        let export = self.get_export_status(id).await?;
        if export.status == ExportStatus::Processing {
            return Err(AppError::InvalidTransition {
                entity: "export",
                id: id.to_string(),
                from: export.status.to_string(),
                action: "delete",
            });
        }
        if let Some(artifact) = &export.artifact_ref {
            self.sink.remove(artifact).await?;
        }
        self.exports.delete(id).await?;
        self.audit.emit(
            AuditEvent::new(actor, "export.delete", "export", id, self.clock.now()).before(&export),
        );
        Ok(())
    }

    /// Run a failed, retriable export again from the start.
    pub async fn retry_export(&self, id: Uuid, actor: &str) -> Result<ExportJob, AppError> {
        let mut export = self.get_export_status(id).await?;
        if export.status != ExportStatus::Failed || !export.retriable {
            return Err(AppError::InvalidTransition {
                entity: "export",
                id: id.to_string(),
                from: export.status.to_string(),
                action: "retry",
            });
        }

        let now = self.clock.now();
        let before = export.clone();
        export.status = ExportStatus::Processing;
        export.progress = ExportProgress {
            rows_written: 0,
            total_rows: self.records.count(&export.filter).await?,
        };
        export.error = None;
        export.retriable = false;
        export.artifact_ref = None;
        export.updated_at = now;
        self.exports.update(&export).await?;
        self.audit.emit(
            AuditEvent::new(actor, "export.retry", "export", id, now)
                .before(&before)
                .after(&export),
        );
        self.launch(export).await
    }

    /// Fail exports left `processing` with no progress for the stall timeout,
    /// such as those whose process stopped mid-run. They become retriable.
    pub async fn recover_stalled(&self) -> Result<Vec<ExportJob>, AppError> {
        let now = self.clock.now();
        let timeout = TimeDelta::from_std(self.config.stall_timeout)
            .map_err(|e| AppError::ConfigError(format!("Invalid export stall timeout: {e}")))?;
        let stalled = self
            .exports
            .fail_stalled(now - timeout, STALLED_ERROR, now)
            .await?;
        for export in &stalled {
            tracing::warn!(
                export_id = %export.id,
                rows_written = export.progress.rows_written,
                "Stalled export marked failed"
            );
            self.audit.emit(
                AuditEvent::new(SYSTEM_ACTOR, "export.recover", "export", export.id, now)
                    .after(export),
            );
        }
        Ok(stalled)
    }

    async fn launch(&self, export: ExportJob) -> Result<ExportJob, AppError> {
        if export.progress.total_rows <= self.config.sync_threshold {
            return self.run(export).await;
        }

        let service = self.clone();
        let pending = export.clone();
        tokio::spawn(async move {
            let id = pending.id;
            if let Err(e) = service.run(pending).await {
                tracing::error!(export_id = %id, error = %e, "Failed to record export outcome");
            }
        });
        Ok(export)
    }

    /// Write the artifact and persist the final state.
    async fn run(&self, mut export: ExportJob) -> Result<ExportJob, AppError> {
        match self.write_artifact(&mut export).await {
            Ok(artifact_ref) => {
                let now = self.clock.now();
                export.status = ExportStatus::Completed;
                export.artifact_ref = Some(artifact_ref);
                export.completed_at = Some(now);
                export.updated_at = now;
                tracing::info!(
                    export_id = %export.id,
                    rows = export.progress.rows_written,
                    "Export completed"
                );
            }
            Err(e) => {
                export.status = ExportStatus::Failed;
                export.error = Some(e.to_string());
                export.retriable = true;
                export.updated_at = self.clock.now();
                tracing::warn!(export_id = %export.id, error = %e, "Export failed");
            }
        }
        self.exports.update(&export).await?;
        Ok(export)
    }

    async fn write_artifact(&self, export: &mut ExportJob) -> Result<String, AppError> {
        let (writer, artifact_ref) = self.sink.create(export.id, export.format).await?;
        match self.write_rows(writer, export).await {
            Ok(()) => Ok(artifact_ref),
            Err(e) => {
                if let Err(cleanup) = self.sink.remove(&artifact_ref).await {
                    tracing::warn!(%artifact_ref, error = %cleanup, "Failed to remove partial artifact");
                }
                Err(e)
            }
        }
    }

    async fn write_rows(
        &self,
        mut writer: A::Writer,
        export: &mut ExportJob,
    ) -> Result<(), AppError> {
        let mut encoder = ChunkEncoder::new(export.format);
        let mut cursor: Option<RecordCursor> = None;
        let chunk_size = self.config.chunk_size.max(1);

        loop {
            let chunk = self
                .records
                .scan(&export.filter, cursor, chunk_size)
                .await?;
            let Some(last) = chunk.last() else {
                break;
            };
            cursor = Some(last.cursor());

            writer.write_all(&encoder.encode(&chunk)?).await?;
            export.progress.rows_written += chunk.len() as u64;
            export.updated_at = self.clock.now();
            self.exports.update(export).await?;

            if chunk.len() < chunk_size {
                break;
            }
        }

        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::tracing_audit_sink;
    use crate::clock::system_clock;
    use crate::memory::{MemoryExportStore, MemoryRecordStore};
    use crate::record::{CvFields, RecordStatus};
    use crate::testutil::MockAuditSink;

    fn service(
        records: MemoryRecordStore,
        dir: &std::path::Path,
    ) -> ExportService<MemoryExportStore, MemoryRecordStore, FsArtifactSink> {
        ExportService::new(
            MemoryExportStore::default(),
            records,
            FsArtifactSink::new(dir),
            system_clock(),
            tracing_audit_sink(),
            ExportConfig::default(),
        )
    }

    async fn seed(records: &MemoryRecordStore, n: usize, source_id: Uuid) {
        let base = Utc::now();
        for i in 0..n {
            let mut record = CvRecord::new(
                source_id,
                None,
                CvFields {
                    full_name: Some(format!("Candidate {i}")),
                    email: Some(format!("c{i}@example.com")),
                    skills: vec!["rust".into(), "sql".into()],
                    ..Default::default()
                },
                base + chrono::TimeDelta::milliseconds(i as i64 % 7),
            );
            record.status = RecordStatus::Validated;
            records.insert(&record).await.unwrap();
        }
    }

    async fn wait_for_completion<E: ExportStore + 'static, R: RecordStore + 'static, A: ArtifactSink>(
        service: &ExportService<E, R, A>,
        id: Uuid,
    ) -> ExportJob {
        for _ in 0..600 {
            let export = service.get_export_status(id).await.unwrap();
            if export.status != ExportStatus::Processing {
                return export;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("export {id} did not finish");
    }

    #[tokio::test]
    async fn test_small_export_completes_inline() {
        let dir = tempfile::tempdir().unwrap();
        let records = MemoryRecordStore::default();
        seed(&records, 10, Uuid::new_v4()).await;
        let service = service(records, dir.path());

        let export = service
            .create_export(RecordQuery::default(), ExportFormat::Csv, "admin")
            .await
            .unwrap();

        assert_eq!(export.status, ExportStatus::Completed);
        assert_eq!(export.progress.rows_written, 10);
        let path = export.artifact_ref.unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.records().count(), 10);
    }

    #[tokio::test]
    async fn test_large_export_writes_exact_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let records = MemoryRecordStore::default();
        let wanted = Uuid::new_v4();
        seed(&records, 50_000, wanted).await;
        seed(&records, 100, Uuid::new_v4()).await;
        let service = service(records, dir.path());

        let filter = RecordQuery {
            source_id: Some(wanted),
            ..Default::default()
        };
        let export = service
            .create_export(filter, ExportFormat::Jsonl, "admin")
            .await
            .unwrap();
        assert_eq!(export.status, ExportStatus::Processing);
        assert_eq!(export.progress.total_rows, 50_000);

        let done = wait_for_completion(&service, export.id).await;
        assert_eq!(done.status, ExportStatus::Completed);
        assert_eq!(done.progress.rows_written, 50_000);

        let content = std::fs::read_to_string(done.artifact_ref.unwrap()).unwrap();
        assert_eq!(content.lines().count(), 50_000);
    }

    #[derive(Clone)]
    struct FailingSink;

    impl ArtifactSink for FailingSink {
        type Writer = Vec<u8>;

        async fn create(&self, _: Uuid, _: ExportFormat) -> Result<(Vec<u8>, String), AppError> {
            Err(AppError::ExportError("disk full".into()))
        }

        async fn remove(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_export_is_retriable() {
        let records = MemoryRecordStore::default();
        seed(&records, 3, Uuid::new_v4()).await;
        let exports = MemoryExportStore::default();
        let audit = MockAuditSink::new();
        let failing = ExportService::new(
            exports.clone(),
            records.clone(),
            FailingSink,
            system_clock(),
            audit.shared(),
            ExportConfig::default(),
        );

        let export = failing
            .create_export(RecordQuery::default(), ExportFormat::Csv, "admin")
            .await
            .unwrap();
        assert_eq!(export.status, ExportStatus::Failed);
        assert!(export.retriable);
        assert!(export.error.as_deref().unwrap().contains("disk full"));

        let dir = tempfile::tempdir().unwrap();
        let working = ExportService::new(
            exports,
            records,
            FsArtifactSink::new(dir.path()),
            system_clock(),
            audit.shared(),
            ExportConfig::default(),
        );
        let retried = working.retry_export(export.id, "admin").await.unwrap();
        assert_eq!(retried.status, ExportStatus::Completed);
        assert_eq!(retried.progress.rows_written, 3);

        let err = working.retry_export(export.id, "admin").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(audit.actions(), vec!["export.create", "export.retry"]);
    }

    fn processing_export(now: DateTime<Utc>) -> ExportJob {
        ExportJob {
            id: Uuid::new_v4(),
            filter: RecordQuery::default(),
            format: ExportFormat::Csv,
            status: ExportStatus::Processing,
            artifact_ref: None,
            progress: ExportProgress {
                rows_written: 500,
                total_rows: 2_000,
            },
            retriable: false,
            error: None,
            created_by: "admin".into(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_stalled_export_becomes_retriable() {
        use crate::clock::{Clock, ManualClock};

        let dir = tempfile::tempdir().unwrap();
        let records = MemoryRecordStore::default();
        seed(&records, 4, Uuid::new_v4()).await;
        let exports = MemoryExportStore::default();
        let clock = ManualClock::new(Utc::now());
        let audit = MockAuditSink::new();
        let service = ExportService::new(
            exports.clone(),
            records,
            FsArtifactSink::new(dir.path()),
            clock.shared(),
            audit.shared(),
            ExportConfig::default(),
        );

        let abandoned = processing_export(clock.now());
        exports.insert(&abandoned).await.unwrap();
        clock.advance(chrono::TimeDelta::minutes(20));
        let active = processing_export(clock.now());
        exports.insert(&active).await.unwrap();

        let err = service.delete_export(abandoned.id, "admin").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let recovered = service.recover_stalled().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, abandoned.id);
        let failed = service.get_export_status(abandoned.id).await.unwrap();
        assert_eq!(failed.status, ExportStatus::Failed);
        assert!(failed.retriable);
        assert_eq!(
            service.get_export_status(active.id).await.unwrap().status,
            ExportStatus::Processing
        );
        assert_eq!(audit.actions(), vec!["export.recover"]);

        let retried = service.retry_export(abandoned.id, "admin").await.unwrap();
        assert_eq!(retried.status, ExportStatus::Completed);
        assert_eq!(retried.progress.rows_written, 4);
        assert!(service.recover_stalled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_export_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let records = MemoryRecordStore::default();
        seed(&records, 2, Uuid::new_v4()).await;
        let service = service(records, dir.path());

        let export = service
            .create_export(RecordQuery::default(), ExportFormat::Csv, "admin")
            .await
            .unwrap();
        let path = PathBuf::from(export.artifact_ref.clone().unwrap());
        assert!(path.exists());

        service.delete_export(export.id, "admin").await.unwrap();
        assert!(!path.exists());
        assert!(matches!(
            service.get_export_status(export.id).await.unwrap_err(),
            AppError::NotFound { .. }
        ));
        assert!(service.list_exports(10).await.unwrap().is_empty());
    }
}
