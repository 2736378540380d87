//! Admin subcommands. Each prints its result as JSON on stdout.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use harvester_core::analytics::DateRange;
use harvester_core::export::{ExportJob, ExportStatus};
use harvester_core::job::{CreateJobRequest, JobFilter};
use harvester_core::job_registry::JobPage;
use harvester_core::record::RecordQuery;
use harvester_core::source::{CreateSourceRequest, ProxyRequest, SourceFilter, UpdateSourceRequest};
use harvester_core::source_registry::{source_categories, source_types};
use harvester_core::validation_engine::{BulkValidateOptions, DuplicateSearch};

use crate::app::App;
use crate::{
    AnalyticsCommand, ExportCommand, JobCommand, QueueCommand, RecordCommand, RecordFilterArgs,
    SourceCommand,
};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

const EXPORT_POLL: Duration = Duration::from_millis(500);

/// Background exports run on this process's runtime, so stay until they settle.
async fn await_export(app: &App, mut export: ExportJob) -> Result<ExportJob> {
    while export.status == ExportStatus::Processing {
        tokio::time::sleep(EXPORT_POLL).await;
        export = app.exports.get_export_status(export.id).await?;
        tracing::debug!(
            export_id = %export.id,
            rows_written = export.progress.rows_written,
            total_rows = export.progress.total_rows,
            "Export in progress"
        );
    }
    Ok(export)
}

fn last_hours(hours: i64) -> Result<DateRange> {
    Ok(DateRange::last_hours(Utc::now(), hours)?)
}

impl From<RecordFilterArgs> for RecordQuery {
    fn from(args: RecordFilterArgs) -> Self {
        RecordQuery {
            source_id: args.source,
            job_id: args.job,
            status: args.status,
            min_score: args.min_score,
            name_contains: args.name,
            ..Default::default()
        }
    }
}

pub async fn source(app: &App, command: SourceCommand, actor: &str) -> Result<()> {
    let sources = &app.sources;
    match command {
        SourceCommand::Add { file } => {
            let request: CreateSourceRequest = read_json(&file)?;
            print_json(&sources.create_source(request, actor).await?)
        }
        SourceCommand::Update { id, file } => {
            let request: UpdateSourceRequest = read_json(&file)?;
            print_json(&sources.update_source(id, request, actor).await?)
        }
        SourceCommand::List { category, active } => {
            let filter = SourceFilter {
                category,
                is_active: active,
                ..Default::default()
            };
            print_json(&sources.list_sources(&filter).await?)
        }
        SourceCommand::Show { id } => print_json(&sources.get_source(id).await?),
        SourceCommand::Delete { id } => {
            sources.delete_source(id, actor).await?;
            tracing::info!(source_id = %id, "Source deleted");
            Ok(())
        }
        SourceCommand::Toggle { id } => print_json(&sources.toggle_source_status(id, actor).await?),
        SourceCommand::Test { id } => print_json(&sources.test_source(id).await?),
        SourceCommand::AddProxy { id, file } => {
            let request: ProxyRequest = read_json(&file)?;
            print_json(&sources.add_proxy(id, request, actor).await?)
        }
        SourceCommand::RemoveProxy { id, proxy_id } => {
            sources.remove_proxy(id, proxy_id, actor).await?;
            tracing::info!(source_id = %id, %proxy_id, "Proxy removed");
            Ok(())
        }
        SourceCommand::TestProxy { id, proxy_id } => {
            print_json(&sources.test_proxy(id, proxy_id).await?)
        }
        SourceCommand::Types => print_json(&serde_json::json!({
            "types": source_types(),
            "categories": source_categories(),
        })),
    }
}

pub async fn job(app: &App, command: JobCommand, actor: &str) -> Result<()> {
    let jobs = &app.jobs;
    match command {
        JobCommand::Create {
            name,
            source,
            pages,
            priority,
            job_type,
            tags,
            max_retries,
            start,
        } => {
            let mut request = CreateJobRequest::new(name, source, actor)
                .with_pages(pages)
                .with_priority(priority)
                .with_tags(tags);
            if let Some(job_type) = job_type {
                request = request.with_type(job_type);
            }
            if let Some(max) = max_retries {
                request = request.with_max_retries(max);
            }
            let mut job = jobs.create_job(request).await?;
            if start {
                job = jobs.start_job(job.id, actor).await?;
            }
            print_json(&job)
        }
        JobCommand::List {
            status,
            source,
            tag,
            offset,
            limit,
        } => {
            let filter = JobFilter {
                status,
                source_id: source,
                tag,
                offset,
                limit: Some(limit),
                ..Default::default()
            };
            let page: JobPage = jobs.list_jobs(&filter).await?;
            print_json(&page)
        }
        JobCommand::Show { id } => print_json(&jobs.get_job(id).await?),
        JobCommand::Start { id } => print_json(&jobs.start_job(id, actor).await?),
        JobCommand::Pause { id, reason } => print_json(&jobs.pause_job(id, reason, actor).await?),
        JobCommand::Resume { id } => print_json(&jobs.resume_job(id, actor).await?),
        JobCommand::Cancel { id } => print_json(&jobs.cancel_job(id, actor).await?),
        JobCommand::Retry { id } => print_json(&jobs.retry_job(id, actor).await?),
        JobCommand::Clone { id } => print_json(&jobs.clone_job(id, actor).await?),
        JobCommand::Delete { id } => {
            jobs.delete_job(id, actor).await?;
            tracing::info!(job_id = %id, "Job deleted");
            Ok(())
        }
        JobCommand::Bulk { action, ids } => {
            print_json(&jobs.bulk_operation(action, &ids, actor).await)
        }
        JobCommand::Logs { id, limit } => print_json(&jobs.job_logs(id, limit).await?),
        JobCommand::Stats => print_json(&jobs.job_stats().await?),
    }
}

pub async fn queue(app: &App, command: QueueCommand, actor: &str) -> Result<()> {
    let queues = &app.queues;
    match command {
        QueueCommand::Status => print_json(&queues.all_queue_status().await?),
        QueueCommand::Health => print_json(&queues.queue_health().await?),
        QueueCommand::Tasks {
            queue,
            state,
            offset,
            limit,
        } => print_json(&queues.list_tasks(&queue, state, offset, limit).await?),
        QueueCommand::Retry { task_id } => print_json(&queues.retry_task(task_id, actor).await?),
        QueueCommand::RetryFailed { queue } => {
            let retried = queues.retry_all_failed(&queue, actor).await?;
            print_json(&serde_json::json!({ "queue": queue, "retried": retried }))
        }
        QueueCommand::Remove { task_id } => {
            queues.remove_task(task_id, actor).await?;
            tracing::info!(%task_id, "Task removed");
            Ok(())
        }
        QueueCommand::Clean {
            queue,
            state,
            grace_ms,
        } => {
            let removed = queues.clean_queue(&queue, state, grace_ms, actor).await?;
            print_json(&serde_json::json!({ "queue": queue, "removed": removed }))
        }
        QueueCommand::Pause { queue } => {
            queues.pause_queue(&queue, actor).await?;
            print_json(&queues.queue_status(&queue).await?)
        }
        QueueCommand::Resume { queue } => {
            queues.resume_queue(&queue, actor).await?;
            print_json(&queues.queue_status(&queue).await?)
        }
        QueueCommand::Empty { queue } => {
            let removed = queues.empty_queue(&queue, actor).await?;
            print_json(&serde_json::json!({ "queue": queue, "removed": removed }))
        }
        QueueCommand::Metrics { queue, hours } => {
            print_json(&queues.queue_metrics(&queue, last_hours(hours)?).await?)
        }
        QueueCommand::Failures { queue, limit } => {
            print_json(&queues.failed_reasons(queue.as_deref(), limit).await?)
        }
    }
}

pub async fn record(app: &App, command: RecordCommand, actor: &str) -> Result<()> {
    let engine = &app.engine;
    match command {
        RecordCommand::Show { id } => print_json(&engine.get_record(id).await?),
        RecordCommand::Validate { id } => print_json(&engine.validate_cv(id).await?),
        RecordCommand::ValidateAll { filter, dry_run } => {
            let report = engine
                .bulk_validate(&filter.into(), BulkValidateOptions { dry_run })
                .await?;
            print_json(&report)
        }
        RecordCommand::Duplicates {
            record,
            threshold,
            limit,
            filter,
        } => {
            let search = DuplicateSearch {
                query: filter.into(),
                record_id: record,
                threshold,
                limit: Some(limit),
            };
            print_json(&engine.find_duplicates(&search).await?)
        }
        RecordCommand::Merge {
            primary,
            duplicates,
        } => print_json(&engine.merge_duplicates(primary, &duplicates, actor).await?),
        RecordCommand::MergeLog { id } => print_json(&engine.merge_log(id).await?),
        RecordCommand::Quality { filter } => {
            print_json(&engine.generate_quality_report(&filter.into()).await?)
        }
    }
}

pub async fn export(app: &App, command: ExportCommand, actor: &str) -> Result<()> {
    let exports = &app.exports;
    match command {
        ExportCommand::Create { format, filter } => {
            let export = exports.create_export(filter.into(), format, actor).await?;
            print_json(&await_export(app, export).await?)
        }
        ExportCommand::Status { id } => print_json(&exports.get_export_status(id).await?),
        ExportCommand::List { limit } => print_json(&exports.list_exports(limit).await?),
        ExportCommand::Retry { id } => {
            let export = exports.retry_export(id, actor).await?;
            print_json(&await_export(app, export).await?)
        }
        ExportCommand::Delete { id } => {
            exports.delete_export(id, actor).await?;
            tracing::info!(export_id = %id, "Export deleted");
            Ok(())
        }
    }
}

pub async fn analytics(app: &App, command: AnalyticsCommand) -> Result<()> {
    let analytics = &app.analytics;
    match command {
        AnalyticsCommand::Overview { hours } => {
            print_json(&analytics.dashboard_overview(last_hours(hours)?).await?)
        }
        AnalyticsCommand::Job { id } => print_json(&analytics.job_statistics(id).await?),
        AnalyticsCommand::Source { id, hours } => {
            print_json(&analytics.source_statistics(id, last_hours(hours)?).await?)
        }
        AnalyticsCommand::Errors { hours } => {
            print_json(&analytics.error_breakdown(last_hours(hours)?).await?)
        }
        AnalyticsCommand::QualityTrend { days } => {
            print_json(&analytics.quality_trend(days).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use harvester_core::record::RecordStatus;

    use super::*;
    use crate::{Cli, Commands};

    #[test]
    fn test_record_filter_converts_to_query() {
        let args = RecordFilterArgs {
            status: Some(RecordStatus::Validated),
            min_score: Some(0.7),
            name: Some("lovelace".into()),
            ..Default::default()
        };
        let query: RecordQuery = args.into();
        assert_eq!(query.status, Some(RecordStatus::Validated));
        assert_eq!(query.min_score, Some(0.7));
        assert_eq!(query.name_contains.as_deref(), Some("lovelace"));
        assert!(query.job_id.is_none());
    }

    #[test]
    fn test_parses_job_bulk() {
        let cli = Cli::try_parse_from([
            "harvester",
            "job",
            "bulk",
            "cancel",
            "7d444840-9dc0-11d1-b245-5ffdce74fad2",
            "7d444840-9dc0-11d1-b245-5ffdce74fad3",
        ])
        .unwrap();
        let Commands::Job(JobCommand::Bulk { ids, .. }) = cli.command else {
            panic!("expected job bulk");
        };
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_parses_export_filters() {
        let cli = Cli::try_parse_from([
            "harvester",
            "--actor",
            "ops",
            "export",
            "create",
            "--format",
            "jsonl",
            "--status",
            "validated",
            "--min-score",
            "0.5",
        ])
        .unwrap();
        assert_eq!(cli.actor, "ops");
        let Commands::Export(ExportCommand::Create { filter, .. }) = cli.command else {
            panic!("expected export create");
        };
        assert_eq!(filter.status, Some(RecordStatus::Validated));
        assert_eq!(filter.min_score, Some(0.5));
    }

    #[test]
    fn test_rejects_unknown_task_state() {
        let result = Cli::try_parse_from(["harvester", "queue", "clean", "listing_api", "--state", "zombie"]);
        assert!(result.is_err());
    }
}
