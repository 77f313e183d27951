//! Bounded worker pool draining the in-memory job queue.
//!
//! Channel messages are advisory wake-ups only: a worker always claims
//! through the store, so lost or duplicate messages are harmless and the
//! store stays the single source of truth.

use crate::pipeline::Runner;
use mender_db::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capacity of the job wake-up channel. Overflow is dropped and repaired by
/// the next sync pass.
pub const JOB_QUEUE_CAPACITY: usize = 100;

/// Run `workers` consumers until shutdown is requested and in-flight jobs
/// have drained.
pub async fn run_pool(
    runner: Arc<Runner>,
    store: Arc<Store>,
    rx: mpsc::Receiver<String>,
    workers: usize,
    shutdown: CancellationToken,
) {
    tracing::info!(workers, "worker pool started");
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut join_set = JoinSet::new();
    for worker_id in 0..workers {
        let runner = Arc::clone(&runner);
        let store = Arc::clone(&store);
        let rx = Arc::clone(&rx);
        let shutdown = shutdown.clone();
        join_set.spawn(async move {
            worker_loop(worker_id, runner, store, rx, shutdown).await;
        });
    }

    while let Some(result) = join_set.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
    tracing::info!("worker pool stopped");
}

async fn worker_loop(
    worker_id: usize,
    runner: Arc<Runner>,
    store: Arc<Store>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
) {
    loop {
        let message = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                message = rx.recv() => message,
            }
        };
        if message.is_none() {
            // Channel closed: ingest is gone, nothing more will arrive.
            return;
        }

        match store.claim_job() {
            Ok(Some(job_id)) => {
                tracing::info!(worker = worker_id, job = %job_id, "claimed job");
                if let Err(e) = runner.run(&shutdown, &job_id).await {
                    tracing::error!(
                        worker = worker_id,
                        job = %job_id,
                        error = %format!("{e:#}"),
                        "job run failed"
                    );
                }
            }
            // Another worker won the race; go back to waiting.
            Ok(None) => {}
            Err(e) => tracing::error!(worker = worker_id, error = %e, "claim job"),
        }
    }
}

/// Non-blocking enqueue of every `queued` job id. Called at daemon startup
/// (after the recovery sweep) and on every sync pass, so jobs whose wake-up
/// was dropped always get another one.
pub fn enqueue_queued_jobs(store: &Store, tx: &mpsc::Sender<String>) -> usize {
    let ids = match store.list_queued_job_ids() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "list queued jobs");
            return 0;
        }
    };
    let mut sent = 0;
    for id in ids {
        match tx.try_send(id) {
            Ok(()) => sent += 1,
            Err(mpsc::error::TrySendError::Full(id)) => {
                tracing::warn!(job = %id, "job channel full, enqueue dropped");
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return sent,
        }
    }
    sent
}
