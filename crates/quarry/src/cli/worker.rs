//! Worker command and in-process draining of the task queue.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use quarry_jobs::lifecycle::{self, JobKind};
use quarry_jobs::{CancellationToken, JobContext, SqliteTaskQueue, Worker};
use quarry_protocol::Phase;
use tracing::{info, warn};

use crate::cli::context::{self, GlobalArgs};
use crate::cli::output::{print_fields, print_json};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Queues to serve (default: query and download)
    #[arg(long = "queue")]
    pub queues: Vec<String>,

    /// Print task queue statistics and exit
    #[arg(long)]
    pub stats: bool,

    /// Output as JSON (with --stats)
    #[arg(long)]
    pub json: bool,
}

fn build_worker(ctx: &JobContext, queues: &[String]) -> Worker {
    let worker = Worker::new(
        SqliteTaskQueue::new(ctx.store.pool().clone()),
        ctx.executor.clone(),
    );
    if queues.is_empty() {
        worker
    } else {
        worker.with_queues(queues.to_vec())
    }
}

pub fn run(global: &GlobalArgs, args: WorkerArgs) -> Result<()> {
    let rt = context::runtime()?;
    rt.block_on(async {
        let ctx = context::open(global).await?;
        if args.stats {
            return print_stats(&ctx, args.json).await;
        }

        let mut worker = build_worker(&ctx, &args.queues);
        let token = CancellationToken::new();
        let signal_token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received interrupt, finishing the current task");
                    signal_token.cancel();
                }
                Err(err) => warn!("Failed to listen for interrupt: {}", err),
            }
        });

        worker.run(token).await.context("Worker stopped with an error")?;
        Ok(())
    })
}

async fn print_stats(ctx: &JobContext, json: bool) -> Result<()> {
    let stats = SqliteTaskQueue::new(ctx.store.pool().clone()).stats().await?;
    if json {
        return print_json(&serde_json::json!({
            "queued": stats.queued,
            "running": stats.running,
            "completed": stats.completed,
            "failed": stats.failed,
            "revoked": stats.revoked,
        }));
    }
    print_fields(&[
        ("Queued", stats.queued.to_string()),
        ("Running", stats.running.to_string()),
        ("Completed", stats.completed.to_string()),
        ("Failed", stats.failed.to_string()),
        ("Revoked", stats.revoked.to_string()),
    ]);
    Ok(())
}

/// Wait for `job` to finish. In async mode the task queue is drained by a
/// worker in this process while waiting, so no separate worker is needed.
pub async fn wait_for<J: JobKind>(ctx: &JobContext, job: &mut J, timeout: Duration) -> Result<Phase> {
    if ctx.is_sync() {
        return Ok(job.record().phase);
    }

    let mut worker = build_worker(ctx, &[]);
    let token = CancellationToken::new();
    let worker_token = token.clone();
    let handle = tokio::spawn(async move { worker.run(worker_token).await });

    let waited = lifecycle::wait(job, &ctx.store, WAIT_POLL_INTERVAL, timeout).await;
    token.cancel();
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("In-process worker failed: {}", err),
        Err(err) => warn!("In-process worker panicked: {}", err),
    }
    Ok(waited?)
}
