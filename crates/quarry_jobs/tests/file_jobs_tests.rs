//! Integration tests for download, archive and upload jobs and for deleting
//! query jobs together with their files.

mod common;

use std::fs::File;

use common::*;
use quarry_db::MemoryAdapter;
use quarry_jobs::archive_job::FILES_NOT_FOUND;
use quarry_jobs::config::Limit;
use quarry_jobs::{ArchiveJob, DispatchMode, DownloadJob, JobError, QueryJob};
use quarry_protocol::Phase;

#[tokio::test]
async fn test_download_writes_the_result_file() {
    let h = harness(DispatchMode::Sync).await;
    let query = h.completed_job("t1").await;

    let mut download = DownloadJob::new(&query.job, "csv");
    download.process(&h.ctx).await.unwrap();
    download.run(&h.ctx).await.unwrap();
    assert_eq!(download.phase(), Phase::Completed);

    let path = download.file_path(&h.ctx.config).unwrap();
    assert_eq!(path, h.dir.path().join("downloads/alice/t1.csv"));
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 4);
    assert!(content.starts_with("source_id,ra,path\n"));
    assert!(!path.with_extension("csv.part").exists());

    let stored = DownloadJob::load(&h.ctx.store, download.id()).await.unwrap();
    assert_eq!(stored.job.parent_id.as_ref(), Some(query.id()));
    assert_eq!(stored.job.owner_name(), "alice");
    assert_eq!(stored.file_path(&h.ctx.config), Some(path));
}

#[tokio::test]
async fn test_download_requires_a_completed_query_and_a_known_format() {
    let h = harness(DispatchMode::Async).await;
    let mut query = h.processed_job("t1").await;
    query.run(&h.ctx).await.unwrap();

    let mut download = DownloadJob::new(&query.job, "csv");
    let err = download.process(&h.ctx).await.unwrap_err();
    assert!(err.is_validation_on("phase"));

    let s = harness(DispatchMode::Sync).await;
    let completed = s.completed_job("t1").await;
    let mut download = DownloadJob::new(&completed.job, "fits");
    let err = download.process(&s.ctx).await.unwrap_err();
    assert!(err.is_validation_on("format_key"));
}

#[tokio::test]
async fn test_download_is_queued_on_the_download_queue() {
    let h = harness(DispatchMode::Async).await;
    let mut parent = h.processed_job("t1").await;
    parent.run(&h.ctx).await.unwrap();
    h.ctx.executor.run_query(parent.id()).await.unwrap();
    let parent = QueryJob::load(&h.ctx.store, parent.id()).await.unwrap();
    assert_eq!(parent.phase(), Phase::Completed);

    let mut download = DownloadJob::new(&parent.job, "votable");
    download.process(&h.ctx).await.unwrap();
    download.run(&h.ctx).await.unwrap();
    assert_eq!(download.phase(), Phase::Queued);

    let submitted = h.backend.submitted();
    let (task, queue, priority) = submitted.last().unwrap();
    assert_eq!(task.task_id(), download.id().as_str());
    assert_eq!(queue, "download");
    assert_eq!(*priority, None);
}

#[tokio::test]
async fn test_archive_bundles_the_referenced_files() {
    let h = harness(DispatchMode::Sync).await;
    for name in ["a.fits", "b.fits", "c.fits"] {
        h.write_file(name, name);
    }
    let query = h.completed_job("t1").await;

    let mut archive = ArchiveJob::new(&query.job, "path");
    archive.process(&h.ctx).await.unwrap();
    assert_eq!(archive.details.files, vec!["a.fits", "b.fits", "c.fits"]);
    archive.run(&h.ctx).await.unwrap();
    assert_eq!(archive.phase(), Phase::Completed);

    let path = archive.file_path(&h.ctx.config).unwrap();
    assert_eq!(path, h.dir.path().join("downloads/alice/t1.path.zip"));
    let zip = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
    assert_eq!(zip.len(), 3);
}

#[tokio::test]
async fn test_archive_validation() {
    let h = harness(DispatchMode::Sync).await;
    h.write_file("a.fits", "a");
    h.write_file("b.fits", "b");
    let query = h.completed_job("t1").await;

    let mut blank = ArchiveJob::new(&query.job, " ");
    let err = blank.process(&h.ctx).await.unwrap_err();
    assert_eq!(
        err.validation_errors().unwrap().get("column_name").unwrap().to_vec(),
        vec!["This field may not be blank.".to_string()]
    );

    let mut unknown = ArchiveJob::new(&query.job, "nope");
    let err = unknown.process(&h.ctx).await.unwrap_err();
    assert_eq!(
        err.validation_errors().unwrap().get("column_name").unwrap().to_vec(),
        vec!["Unknown column \"nope\".".to_string()]
    );

    // c.fits is missing
    let mut missing = ArchiveJob::new(&query.job, "path");
    let err = missing.process(&h.ctx).await.unwrap_err();
    assert_eq!(
        err.validation_errors().unwrap().get("files").unwrap().to_vec(),
        vec![FILES_NOT_FOUND.to_string()]
    );
    let err = missing.run(&h.ctx).await.unwrap_err();
    assert!(matches!(err, JobError::Contract(_)));
}

#[tokio::test]
async fn test_archive_fails_when_files_disappear_before_execution() {
    let h = harness(DispatchMode::Async).await;
    for name in ["a.fits", "b.fits", "c.fits"] {
        h.write_file(name, name);
    }
    let mut query = h.processed_job("t1").await;
    query.run(&h.ctx).await.unwrap();
    h.ctx.executor.run_query(query.id()).await.unwrap();
    let query = QueryJob::load(&h.ctx.store, query.id()).await.unwrap();

    let mut archive = ArchiveJob::new(&query.job, "path");
    archive.process(&h.ctx).await.unwrap();
    archive.run(&h.ctx).await.unwrap();

    std::fs::remove_file(h.dir.path().join("files/b.fits")).unwrap();
    h.ctx.executor.create_archive_file(archive.id()).await.unwrap();

    let stored = ArchiveJob::load(&h.ctx.store, archive.id()).await.unwrap();
    assert_eq!(stored.phase(), Phase::Error);
    assert!(!stored.file_path(&h.ctx.config).unwrap().exists());
}

#[tokio::test]
async fn test_delete_removes_children_and_their_files() {
    let h = harness(DispatchMode::Sync).await;
    for name in ["a.fits", "b.fits", "c.fits"] {
        h.write_file(name, name);
    }
    let query = h.completed_job("t1").await;

    let mut download = DownloadJob::new(&query.job, "csv");
    download.process(&h.ctx).await.unwrap();
    download.run(&h.ctx).await.unwrap();
    let mut archive = ArchiveJob::new(&query.job, "path");
    archive.process(&h.ctx).await.unwrap();
    archive.run(&h.ctx).await.unwrap();

    let download_path = download.file_path(&h.ctx.config).unwrap();
    let archive_path = archive.file_path(&h.ctx.config).unwrap();
    assert!(download_path.exists());
    assert!(archive_path.exists());

    let query_id = query.id().clone();
    query.delete(&h.ctx).await.unwrap();

    assert!(!download_path.exists());
    assert!(!archive_path.exists());
    assert!(!h.adapter.has_table(ALICE_SCHEMA, "t1"));
    assert!(h.ctx.store.load_job(&query_id).await.unwrap().is_none());
    assert!(h.ctx.store.load_job(download.id()).await.unwrap().is_none());
    assert!(h.ctx.store.load_job(archive.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ingest_loads_a_csv_file() {
    let h = harness(DispatchMode::Sync).await;
    let path = h.write_file("upload.csv", "ra,name\n1.5,x\n,y\n");

    let mut upload = QueryJob::for_upload(Some(alice()), "uploaded");
    upload.process(&h.ctx).await.unwrap();
    assert!(upload.details.query.is_empty());
    assert!(upload.details.queue.is_empty());
    assert_eq!(upload.job.execution_duration, 0.0);

    upload.ingest(&h.ctx, &path).await.unwrap();
    assert_eq!(upload.phase(), Phase::Completed);
    assert_eq!(upload.details.nrows, Some(2));
    assert_eq!(upload.column_names(), vec!["ra", "name"]);
    assert_eq!(h.adapter.table_rows(ALICE_SCHEMA, "uploaded").unwrap().len(), 2);

    let err = upload.run(&h.ctx).await.unwrap_err();
    assert!(matches!(err, JobError::Contract(_)));
}

#[tokio::test]
async fn test_ingest_respects_the_upload_limit() {
    let h = harness_with(
        DispatchMode::Async,
        MemoryAdapter::new(),
        Backend::Recording,
        |config| config.upload_limit.user = Limit(4),
    )
    .await;
    let path = h.write_file("upload.csv", "ra,name\n1.5,x\n");

    let mut upload = QueryJob::for_upload(Some(alice()), "uploaded");
    upload.process(&h.ctx).await.unwrap();
    let err = upload.ingest(&h.ctx, &path).await.unwrap_err();
    assert!(err.is_validation_on("file"));
    assert!(h.backend.submitted().is_empty());

    let mut query = h.processed_job("t1").await;
    let err = query.ingest(&h.ctx, &path).await.unwrap_err();
    assert!(matches!(err, JobError::Contract(_)));
}

#[tokio::test]
async fn test_ingest_is_dispatched_to_the_download_queue() {
    let h = harness(DispatchMode::Async).await;
    let path = h.write_file("upload.csv", "ra\n1\n");

    let mut upload = QueryJob::for_upload(Some(alice()), "uploaded");
    upload.process(&h.ctx).await.unwrap();
    upload.ingest(&h.ctx, &path).await.unwrap();

    let submitted = h.backend.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].0.name(), "run_ingest");
    assert_eq!(submitted[0].1, "download");
    // uploads are not query executions
    assert!(h.ctx.store.records(10).await.unwrap().is_empty());
}
