//! The worker fleet: scheduler, one dispatcher per queue, and a worker pool
//! sharing the dispatch channel.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use harvester_core::dispatcher::Dispatched;
use harvester_core::source::QUEUE_NAMES;
use harvester_core::worker::SharedReceiver;
use harvester_core::{Dispatcher, Scheduler, TracingWorkerReporter, WorkerService, spawn_gate};

use crate::app::App;

pub async fn run(app: &App) -> Result<()> {
    let config = &app.config;
    let cancel = CancellationToken::new();
    let gate = spawn_gate(app.clock.clone(), config.gate_config());
    let (tx, rx) = mpsc::channel::<Dispatched>(config.workers);
    let rx: SharedReceiver = Arc::new(Mutex::new(rx));
    let mut tasks = JoinSet::new();

    let scheduler = Scheduler::new(
        app.jobs.clone(),
        app.db.job_store(),
        app.db.source_store(),
        app.db.queue(),
        app.clock.clone(),
    );
    let interval = config.dispatch_interval;
    let token = cancel.clone();
    tasks.spawn(async move { scheduler.run(token, interval).await });

    for queue in QUEUE_NAMES {
        let dispatcher = Dispatcher::new(
            app.jobs.clone(),
            app.sources.clone(),
            app.db.job_store(),
            app.db.source_store(),
            app.db.queue(),
            gate.clone(),
            tx.clone(),
            app.clock.clone(),
            config.dispatcher_config(),
        );
        let token = cancel.clone();
        tasks.spawn(async move { dispatcher.run(queue, token, interval).await });
    }
    drop(tx);

    let fetcher = app.fetcher()?;
    for index in 0..config.workers {
        let worker = WorkerService::new(
            fetcher.clone(),
            app.jobs.clone(),
            app.sources.clone(),
            app.db.job_store(),
            app.db.queue(),
            app.engine.clone(),
            gate.clone(),
            app.clock.clone(),
            config.worker_config(index),
        );
        let rx = rx.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = worker.run(rx, token, &TracingWorkerReporter).await {
                tracing::error!(worker = index, error = %e, "Worker exited with error");
            }
        });
    }

    tracing::info!(
        workers = config.workers,
        queues = QUEUE_NAMES.len(),
        "Harvester running, press Ctrl-C to stop"
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown signal received");
        }
        Some(joined) = tasks.join_next() => {
            tracing::error!(?joined, "Fleet task stopped unexpectedly");
        }
    }

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Fleet task panicked");
        }
    }
    tracing::info!("Harvester stopped");
    Ok(())
}
