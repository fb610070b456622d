//! Integration tests for async dispatch through the SQLite task queue and
//! the worker loop.

mod common;

use std::time::Duration;

use common::*;
use quarry_db::{MemoryAdapter, RowFilter};
use quarry_jobs::{CancellationToken, DispatchMode, DownloadJob, QueryJob, SqliteTaskQueue, Worker};
use quarry_protocol::Phase;

async fn queue_harness() -> Harness {
    harness_with(DispatchMode::Async, MemoryAdapter::new(), Backend::Default, |_| {}).await
}

fn worker(h: &Harness) -> Worker {
    Worker::new(
        SqliteTaskQueue::new(h.ctx.store.pool().clone()),
        h.ctx.executor.clone(),
    )
}

#[tokio::test]
async fn test_worker_executes_a_queued_query() {
    let h = queue_harness().await;
    let mut job = h.processed_job("t1").await;
    job.run(&h.ctx).await.unwrap();
    assert_eq!(job.phase(), Phase::Queued);

    let queue = SqliteTaskQueue::new(h.ctx.store.pool().clone());
    assert_eq!(
        queue.task_status(job.id().as_str()).await.unwrap().as_deref(),
        Some("QUEUED")
    );

    let worker = worker(&h);
    assert!(worker.run_once().await.unwrap());
    assert!(!worker.run_once().await.unwrap());

    assert_eq!(h.stored_phase(&job).await, Phase::Completed);
    assert_eq!(
        queue.task_status(job.id().as_str()).await.unwrap().as_deref(),
        Some("COMPLETED")
    );
    assert!(h.adapter.has_table(ALICE_SCHEMA, "t1"));
}

#[tokio::test]
async fn test_rename_after_the_worker_finished() {
    let h = queue_harness().await;
    let mut job = h.processed_job("t1").await;
    job.run(&h.ctx).await.unwrap();

    let err = job.rename_table(&h.ctx, "t2").await.unwrap_err();
    assert!(err.is_validation_on("phase"));
    assert_eq!(job.phase(), Phase::Queued);

    assert!(worker(&h).run_once().await.unwrap());
    // the handle still says QUEUED, the store knows better
    job.rename_table(&h.ctx, "t2").await.unwrap();
    assert_eq!(job.phase(), Phase::Completed);
    assert!(h.adapter.has_table(ALICE_SCHEMA, "t2"));
    assert!(!h.adapter.has_table(ALICE_SCHEMA, "t1"));

    let stored = QueryJob::load(&h.ctx.store, job.id()).await.unwrap();
    assert_eq!(stored.details.table_name, "t2");
    assert_eq!(stored.details.metadata.name.as_deref(), Some("t2"));
    assert_eq!(stored.column_names(), vec!["source_id", "ra", "path"]);
    let (count, _) = stored
        .rows(&h.ctx, &[], None, 1, 0, &RowFilter::default())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_abort_revokes_the_queued_task() {
    let h = queue_harness().await;
    let mut job = h.processed_job("t1").await;
    job.run(&h.ctx).await.unwrap();
    job.abort(&h.ctx).await.unwrap();

    let queue = SqliteTaskQueue::new(h.ctx.store.pool().clone());
    assert_eq!(
        queue.task_status(job.id().as_str()).await.unwrap().as_deref(),
        Some("REVOKED")
    );
    assert!(!worker(&h).run_once().await.unwrap());
    assert_eq!(h.stored_phase(&job).await, Phase::Aborted);
    assert!(h.adapter.executed().is_empty());
}

#[tokio::test]
async fn test_worker_serves_only_its_queues() {
    let h = queue_harness().await;
    let mut query = h.processed_job("t1").await;
    query.run(&h.ctx).await.unwrap();
    assert!(worker(&h).run_once().await.unwrap());
    let query = QueryJob::load(&h.ctx.store, query.id()).await.unwrap();

    let mut download = DownloadJob::new(&query.job, "csv");
    download.process(&h.ctx).await.unwrap();
    download.run(&h.ctx).await.unwrap();

    let query_only = worker(&h).with_queues(vec!["query".to_string()]);
    assert!(!query_only.run_once().await.unwrap());

    assert!(worker(&h).run_once().await.unwrap());
    let download = DownloadJob::load(&h.ctx.store, download.id()).await.unwrap();
    assert_eq!(download.phase(), Phase::Completed);
    assert!(download.file_path(&h.ctx.config).unwrap().exists());
}

#[tokio::test]
async fn test_failed_task_is_recorded() {
    let h = queue_harness().await;
    let mut job = h.processed_job("t1").await;
    job.run(&h.ctx).await.unwrap();
    h.ctx.store.delete_job(job.id()).await.unwrap();

    let queue = SqliteTaskQueue::new(h.ctx.store.pool().clone());
    assert!(worker(&h).run_once().await.unwrap());
    assert_eq!(
        queue.task_status(job.id().as_str()).await.unwrap().as_deref(),
        Some("FAILED")
    );
    assert_eq!(queue.stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_worker_loop_stops_on_cancel() {
    let h = queue_harness().await;
    let mut job = h.processed_job("t1").await;
    job.run(&h.ctx).await.unwrap();

    let token = CancellationToken::new();
    let mut worker = worker(&h);
    let loop_token = token.clone();
    let handle = tokio::spawn(async move { worker.run(loop_token).await });

    let phase = quarry_jobs::lifecycle::wait(
        &mut job,
        &h.ctx.store,
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(phase, Phase::Completed);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
