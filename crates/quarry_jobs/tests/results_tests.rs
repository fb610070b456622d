//! Integration tests for reading results: row pages, streamed downloads and
//! synchronous queries.

mod common;

use common::*;
use quarry_db::memory::CannedResult;
use quarry_db::{AdapterError, DatabaseAdapter, DbValue, RowFilter};
use quarry_jobs::{DispatchMode, JobError, QueryJob, RowPage, StreamError};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_rows_of_a_single_column_are_flattened() {
    let h = harness(DispatchMode::Sync).await;
    let job = h.completed_job("t1").await;

    let (count, page) = job
        .rows(&h.ctx, &names(&["source_id"]), Some("-source_id"), 1, 2, &RowFilter::default())
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(
        page,
        RowPage::Values(vec![DbValue::from(3i64), DbValue::from(2i64)])
    );
}

#[tokio::test]
async fn test_rows_of_several_columns_are_tuples() {
    let h = harness(DispatchMode::Sync).await;
    let job = h.completed_job("t1").await;

    let (count, page) = job
        .rows(&h.ctx, &names(&["source_id", "path"]), None, 2, 2, &RowFilter::default())
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(
        page,
        RowPage::Rows(vec![vec![DbValue::from(3i64), DbValue::from("c.fits")]])
    );

    let (count, page) = job
        .rows(&h.ctx, &[], None, 1, 0, &RowFilter::search("b.fi"))
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(page, RowPage::Rows(vec![gaia_rows()[1].clone()]));
}

#[tokio::test]
async fn test_rows_reports_every_unknown_column() {
    let h = harness(DispatchMode::Sync).await;
    let job = h.completed_job("t1").await;

    let err = job
        .rows(&h.ctx, &names(&["nope", "ra", "zip"]), None, 1, 10, &RowFilter::default())
        .await
        .unwrap_err();
    let errors = err.validation_errors().unwrap();
    assert_eq!(errors.get("nope").unwrap().to_vec(), vec!["Column not found.".to_string()]);
    assert!(errors.contains("zip"));
    assert!(!errors.contains("ra"));
}

#[tokio::test]
async fn test_rows_requires_a_completed_job() {
    let h = harness(DispatchMode::Async).await;
    let mut job = h.processed_job("t1").await;
    job.run(&h.ctx).await.unwrap();

    let err = job
        .rows(&h.ctx, &[], None, 1, 10, &RowFilter::default())
        .await
        .unwrap_err();
    assert!(err.is_validation_on("phase"));
}

#[tokio::test]
async fn test_rows_of_a_vanished_table_are_empty() {
    let h = harness(DispatchMode::Sync).await;
    let job = h.completed_job("t1").await;
    h.adapter.drop_table(ALICE_SCHEMA, "t1").await.unwrap();

    let (count, page) = job
        .rows(&h.ctx, &names(&["ra"]), None, 1, 10, &RowFilter::default())
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert!(page.is_empty());
    assert!(matches!(page, RowPage::Values(_)));
}

#[tokio::test]
async fn test_stream_csv() {
    let h = harness(DispatchMode::Sync).await;
    let job = h.completed_job("t1").await;

    let bytes = job.stream(&h.ctx, "csv").unwrap().collect_bytes().await.unwrap();
    let csv = String::from_utf8(bytes).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "source_id,ra,path");
    assert_eq!(lines[1], "1,10.5,a.fits");
}

#[tokio::test]
async fn test_stream_votable_carries_provenance() {
    let h = harness_with(
        DispatchMode::Sync,
        quarry_db::MemoryAdapter::new(),
        Backend::Default,
        |config| config.metadata_base_url = Some("https://data.example.org/meta".into()),
    )
    .await;
    let job = h.completed_job("t1").await;

    let bytes = job.stream(&h.ctx, "votable").unwrap().collect_bytes().await.unwrap();
    let xml = String::from_utf8(bytes).unwrap();
    assert!(xml.contains("<INFO name=\"QUERY_STATUS\" value=\"OK\"/>"));
    assert!(xml.contains("<INFO name=\"QUERY\" value=\"SELECT * FROM gaia.dr3\"/>"));
    assert!(xml.contains("<INFO name=\"SOURCE\" value=\"gaia.dr3\"/>"));
    assert!(xml.contains("href=\"https://data.example.org/meta/gaia/dr3/\""));
    assert!(xml.contains("<TABLE name=\"quarry_user_alice.t1\">"));
    assert_eq!(xml.matches("<TR>").count(), 3);
}

#[tokio::test]
async fn test_stream_rejects_unknown_formats_and_unfinished_jobs() {
    let h = harness(DispatchMode::Sync).await;
    let job = h.completed_job("t1").await;
    let err = job.stream(&h.ctx, "fits").unwrap_err();
    assert!(err.is_validation_on("format_key"));

    let pending = h.processed_job("t2").await;
    let err = pending.stream(&h.ctx, "csv").unwrap_err();
    assert!(err.is_validation_on("phase"));
}

#[tokio::test]
async fn test_run_sync_streams_without_a_result_table() {
    let h = harness(DispatchMode::Sync).await;
    let mut job = h.processed_job("t1").await;

    let bytes = job.run_sync(&h.ctx).await.unwrap().collect_bytes().await.unwrap();
    let xml = String::from_utf8(bytes).unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<TR><TD>1</TD><TD>10.5</TD><TD>a.fits</TD></TR>"));
    assert!(xml.trim_end().ends_with("</VOTABLE>"));

    assert!(!h.adapter.has_table(ALICE_SCHEMA, "t1"));
    assert!(job.details.actual_query.contains("timeout 5"));

    let records = h.ctx.store.records(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].resource["job_id"].is_null());
    assert_eq!(records[0].resource["query"], GAIA_QUERY);
}

#[tokio::test]
async fn test_run_sync_failure_is_an_error_item() {
    let h = harness(DispatchMode::Sync).await;
    h.adapter.set_result(
        GAIA_QUERY,
        CannedResult::Fail(AdapterError::operational("canceling statement due to statement timeout")),
    );
    let mut job = h.processed_job("t1").await;

    let mut stream = job.run_sync(&h.ctx).await.unwrap();
    assert!(matches!(
        stream.next().await,
        Some(Err(StreamError::Backend(_)))
    ));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_run_sync_requires_process() {
    let h = harness(DispatchMode::Sync).await;
    let mut job = QueryJob::new(Some(alice()), GAIA_QUERY);
    let err = job.run_sync(&h.ctx).await.unwrap_err();
    assert!(matches!(err, JobError::Contract(_)));
}
