pub mod config;
pub mod database;
pub mod export_store;
pub mod job_store;
pub mod queue;
pub mod record_store;
pub mod source_store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use export_store::PgExportStore;
pub use job_store::PgJobStore;
pub use queue::PgQueue;
pub use record_store::PgRecordStore;
pub use source_store::PgSourceStore;
