use anyhow::{Context, Result};

use harvester_client::{HttpFetcher, HttpProber};
use harvester_core::audit::tracing_audit_sink;
use harvester_core::clock::system_clock;
use harvester_core::dedup::DedupPolicy;
use harvester_core::source_registry::SourceRegistryConfig;
use harvester_core::{
    AnalyticsService, ExportService, FsArtifactSink, HarvesterConfig, JobRegistry, QueueManager,
    SharedClock, SourceRegistry, ValidationEngine,
};
use harvester_db::{
    Database, DatabaseConfig, PgExportStore, PgJobStore, PgQueue, PgRecordStore, PgSourceStore,
};

pub type Jobs = JobRegistry<PgJobStore, PgSourceStore>;
pub type Sources = SourceRegistry<PgSourceStore, PgJobStore, HttpProber>;
pub type Exports = ExportService<PgExportStore, PgRecordStore, FsArtifactSink>;
pub type Analytics = AnalyticsService<PgJobStore, PgSourceStore, PgRecordStore, PgQueue>;

/// Every service, wired onto one PostgreSQL database.
pub struct App {
    pub db: Database,
    pub config: HarvesterConfig,
    pub clock: SharedClock,
    pub allow_private_urls: bool,
    pub jobs: Jobs,
    pub sources: Sources,
    pub queues: QueueManager<PgQueue, PgJobStore>,
    pub engine: ValidationEngine<PgRecordStore>,
    pub exports: Exports,
    pub analytics: Analytics,
}

impl App {
    pub async fn connect(allow_private_urls: bool) -> Result<Self> {
        let config = HarvesterConfig::from_env().context("Invalid harvester configuration")?;
        let db_config = DatabaseConfig::from_env().context("Invalid database configuration")?;
        let db = Database::connect(&db_config)
            .await
            .context("Failed to connect to database")?;
        db.migrate().await.context("Failed to run migrations")?;

        let clock = system_clock();
        let audit = tracing_audit_sink();

        let registry_config = SourceRegistryConfig::default();
        let mut prober =
            HttpProber::new(registry_config.probe_timeout).context("Failed to build HTTP prober")?;
        if allow_private_urls {
            prober = prober.allow_private_urls();
        }

        let jobs = JobRegistry::new(db.job_store(), db.source_store(), clock.clone(), audit.clone());
        let sources = SourceRegistry::new(
            db.source_store(),
            db.job_store(),
            prober,
            clock.clone(),
            audit.clone(),
            registry_config,
        );
        let queues = QueueManager::new(db.queue(), db.job_store(), clock.clone(), audit.clone());
        let engine = ValidationEngine::new(
            db.record_store(),
            clock.clone(),
            audit.clone(),
            DedupPolicy::default(),
        );
        let exports = ExportService::new(
            db.export_store(),
            db.record_store(),
            FsArtifactSink::new(config.export_dir.clone()),
            clock.clone(),
            audit.clone(),
            config.export_config(),
        );
        let stalled = exports
            .recover_stalled()
            .await
            .context("Failed to recover stalled exports")?;
        if !stalled.is_empty() {
            tracing::warn!(count = stalled.len(), "Stalled exports marked failed");
        }

        let analytics = AnalyticsService::new(
            db.job_store(),
            db.source_store(),
            db.record_store(),
            db.queue(),
            clock.clone(),
            config.analytics_refresh,
        );

        Ok(Self {
            db,
            config,
            clock,
            allow_private_urls,
            jobs,
            sources,
            queues,
            engine,
            exports,
            analytics,
        })
    }

    pub fn fetcher(&self) -> Result<HttpFetcher> {
        let fetcher = HttpFetcher::new(self.config.fetch_timeout)
            .context("Failed to build HTTP fetcher")?;
        Ok(if self.allow_private_urls {
            fetcher.allow_private_urls()
        } else {
            fetcher
        })
    }
}
