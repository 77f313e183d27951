//! Daemon assembly: recovery, worker pool, sync loop, webhook server, and
//! signal-driven shutdown, all under one cancellation token.

use crate::pid;
use anyhow::{Context, Result};
use mender_api::ApiState;
use mender_core::config::Config;
use mender_db::Store;
use mender_runner::git::RepoLocks;
use mender_runner::pipeline::Runner;
use mender_runner::pool::{self, JOB_QUEUE_CAPACITY};
use mender_runner::provider::provider_from_config;
use mender_runner::sync::Syncer;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub async fn run(cfg: Config) -> Result<()> {
    let pid_file = cfg.daemon.pid_file.clone();
    pid::write_pid(Path::new(&pid_file))?;
    let result = run_inner(Arc::new(cfg)).await;
    pid::remove_pid(Path::new(&pid_file));
    result
}

async fn run_inner(cfg: Arc<Config>) -> Result<()> {
    let store = Arc::new(Store::open(Path::new(&cfg.db_path)).context("open store")?);
    let provider = provider_from_config(&cfg.llm)?;
    let locks = Arc::new(RepoLocks::new());
    let runner = Arc::new(Runner::new(
        Arc::clone(&store),
        provider,
        Arc::clone(&cfg),
        locks,
    ));

    // The store is authoritative; the channel only carries wake-ups.
    let (job_tx, job_rx) = mpsc::channel::<String>(JOB_QUEUE_CAPACITY);

    let recovered = store.recover_in_flight()?;
    if recovered > 0 {
        tracing::info!(recovered, "recovered in-flight jobs from previous run");
    }
    let enqueued = pool::enqueue_queued_jobs(&store, &job_tx);
    if enqueued > 0 {
        tracing::info!(enqueued, "enqueued queued jobs at startup");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(handle_signals(shutdown.clone()));

    // Binding the webhook port is a startup requirement, not a background
    // failure.
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.daemon.webhook_port))
        .await
        .with_context(|| format!("bind webhook port {}", cfg.daemon.webhook_port))?;
    let api_state = Arc::new(ApiState::new(
        Arc::clone(&cfg),
        Arc::clone(&store),
        job_tx.clone(),
    ));

    let syncer = Syncer::new(Arc::clone(&cfg), Arc::clone(&store), job_tx.clone())?;
    let sync_interval = cfg.sync_interval();

    let mut tasks = JoinSet::new();
    {
        let shutdown = shutdown.clone();
        let store = Arc::clone(&store);
        let workers = cfg.daemon.max_workers;
        tasks.spawn(async move {
            pool::run_pool(runner, store, job_rx, workers, shutdown).await;
        });
    }
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            syncer.run_loop(shutdown, sync_interval).await;
        });
    }
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = mender_api::serve_with_shutdown(api_state, listener, shutdown).await {
                tracing::error!(error = %format!("{e:#}"), "webhook server failed");
            }
        });
    }

    tracing::info!(
        workers = cfg.daemon.max_workers,
        webhook_port = cfg.daemon.webhook_port,
        sync_interval = %cfg.daemon.sync_interval,
        "daemon started"
    );

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "daemon task panicked");
        }
    }
    tracing::info!("daemon stopped");
    Ok(())
}

async fn handle_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
