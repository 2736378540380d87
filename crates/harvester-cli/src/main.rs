mod app;
mod commands;
mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use harvester_core::export::ExportFormat;
use harvester_core::job::{BulkAction, JobStatus, JobType};
use harvester_core::queue::TaskState;
use harvester_core::record::RecordStatus;
use harvester_core::source::SourceCategory;

use crate::app::App;

#[derive(Parser)]
#[command(name = "harvester", version, about = "Scraping job orchestrator")]
struct Cli {
    /// Allow fetches and probes of private and loopback addresses
    #[arg(long, global = true, env = "HARVESTER_ALLOW_PRIVATE_URLS")]
    allow_private_urls: bool,

    /// Name recorded as the actor of admin changes
    #[arg(long, global = true, env = "HARVESTER_ACTOR", default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, dispatchers and worker pool until Ctrl-C
    Run,

    /// Apply database migrations and exit
    Migrate,

    /// Manage scraping sources and their proxies
    #[command(subcommand)]
    Source(SourceCommand),

    /// Manage scraping jobs
    #[command(subcommand)]
    Job(JobCommand),

    /// Inspect and administer the task queues
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Validate, deduplicate and report on candidate records
    #[command(subcommand)]
    Record(RecordCommand),

    /// Export candidate records
    #[command(subcommand)]
    Export(ExportCommand),

    /// Dashboard figures
    #[command(subcommand)]
    Analytics(AnalyticsCommand),
}

#[derive(Subcommand)]
pub enum SourceCommand {
    /// Create a source from a JSON definition
    Add {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Apply a partial JSON update to a source
    Update {
        id: Uuid,
        #[arg(short, long)]
        file: PathBuf,
    },
    List {
        #[arg(long)]
        category: Option<SourceCategory>,
        #[arg(long)]
        active: Option<bool>,
    },
    Show { id: Uuid },
    Delete { id: Uuid },
    /// Enable or disable a source
    Toggle { id: Uuid },
    /// Probe a source's base URL
    Test { id: Uuid },
    /// Add a proxy from a JSON definition
    AddProxy {
        id: Uuid,
        #[arg(short, long)]
        file: PathBuf,
    },
    RemoveProxy { id: Uuid, proxy_id: Uuid },
    TestProxy { id: Uuid, proxy_id: Uuid },
    /// List supported source kinds and categories
    Types,
}

#[derive(Subcommand)]
pub enum JobCommand {
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        source: Uuid,
        #[arg(long, default_value_t = 1)]
        pages: u32,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long = "type")]
        job_type: Option<JobType>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Start the job right away
        #[arg(long)]
        start: bool,
    },
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        source: Option<Uuid>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Show { id: Uuid },
    Start { id: Uuid },
    Pause {
        id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    Resume { id: Uuid },
    Cancel { id: Uuid },
    Retry { id: Uuid },
    Clone { id: Uuid },
    Delete { id: Uuid },
    /// Apply one action to several jobs
    Bulk {
        action: BulkAction,
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    Logs {
        id: Uuid,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Stats,
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Task counts of every queue
    Status,
    Health,
    Tasks {
        queue: String,
        #[arg(long)]
        state: Option<TaskState>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Retry { task_id: Uuid },
    RetryFailed { queue: String },
    Remove { task_id: Uuid },
    /// Remove finished tasks older than the grace period
    Clean {
        queue: String,
        #[arg(long, default_value = "completed")]
        state: TaskState,
        #[arg(long, default_value_t = 3_600_000)]
        grace_ms: u64,
    },
    Pause { queue: String },
    Resume { queue: String },
    /// Remove every waiting and delayed task
    Empty { queue: String },
    Metrics {
        queue: String,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    Failures {
        queue: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum RecordCommand {
    Show { id: Uuid },
    Validate { id: Uuid },
    /// Re-validate every record matching the filter
    ValidateAll {
        #[command(flatten)]
        filter: RecordFilterArgs,
        #[arg(long)]
        dry_run: bool,
    },
    Duplicates {
        #[arg(long)]
        record: Option<Uuid>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[command(flatten)]
        filter: RecordFilterArgs,
    },
    Merge {
        primary: Uuid,
        #[arg(required = true)]
        duplicates: Vec<Uuid>,
    },
    MergeLog { id: Uuid },
    Quality {
        #[command(flatten)]
        filter: RecordFilterArgs,
    },
}

#[derive(clap::Args, Clone, Default)]
pub struct RecordFilterArgs {
    #[arg(long)]
    pub source: Option<Uuid>,
    #[arg(long)]
    pub job: Option<Uuid>,
    #[arg(long)]
    pub status: Option<RecordStatus>,
    #[arg(long)]
    pub min_score: Option<f64>,
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Subcommand)]
pub enum ExportCommand {
    Create {
        #[arg(long, default_value = "csv")]
        format: ExportFormat,
        #[command(flatten)]
        filter: RecordFilterArgs,
    },
    Status { id: Uuid },
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Retry { id: Uuid },
    Delete { id: Uuid },
}

#[derive(Subcommand)]
pub enum AnalyticsCommand {
    Overview {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    Job { id: Uuid },
    Source {
        id: Uuid,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    Errors {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    QualityTrend {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvester=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::connect(cli.allow_private_urls).await?;
    let actor = cli.actor.as_str();

    match cli.command {
        Commands::Run => run::run(&app).await,
        Commands::Migrate => {
            tracing::info!("Migrations applied");
            Ok(())
        }
        Commands::Source(command) => commands::source(&app, command, actor).await,
        Commands::Job(command) => commands::job(&app, command, actor).await,
        Commands::Queue(command) => commands::queue(&app, command, actor).await,
        Commands::Record(command) => commands::record(&app, command, actor).await,
        Commands::Export(command) => commands::export(&app, command, actor).await,
        Commands::Analytics(command) => commands::analytics(&app, command).await,
    }
}
