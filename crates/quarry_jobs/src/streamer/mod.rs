//! Lazy, single-pass result streaming.
//!
//! A producer task reads the result in batches and pushes encoded chunks into
//! a bounded channel; the consumer pulls them with [`ResultStream::next`].
//! Closing or dropping the stream stops the producer. Backend failures arrive
//! as a [`StreamError`] item and end the stream.

pub mod formats;

use std::sync::Arc;

use quarry_db::{AdapterError, ColumnInfo, DatabaseAdapter, Row};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use formats::{encoder_for, Encoder};

/// Rows fetched from the backend per chunk.
pub const BATCH_SIZE: u64 = 1000;
const CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Unknown download format: {0}")]
    UnknownFormat(String),

    #[error("Backend error: {0}")]
    Backend(#[from] AdapterError),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub value: String,
}

impl Info {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub content_role: String,
    pub title: String,
    pub href: String,
}

/// Everything an encoder writes before the first row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    pub infos: Vec<Info>,
    pub links: Vec<Link>,
}

/// Provenance shared by every download format.
#[derive(Debug, Clone, Default)]
pub struct DownloadFormatter {
    metadata_base_url: Option<String>,
}

impl DownloadFormatter {
    pub fn new(metadata_base_url: Option<String>) -> Self {
        Self { metadata_base_url }
    }

    pub fn table_name(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", schema, table)
    }

    pub fn infos(&self, status: &str, query: &str, language: &str, sources: &[String]) -> Vec<Info> {
        let mut infos = vec![
            Info::new("QUERY_STATUS", status),
            Info::new("QUERY", query),
            Info::new("QUERY_LANGUAGE", language),
        ];
        infos.extend(sources.iter().map(|s| Info::new("SOURCE", s.as_str())));
        infos
    }

    /// Documentation links for `schema.table` sources; none without a base URL.
    pub fn links(&self, sources: &[String]) -> Vec<Link> {
        let Some(base) = self.metadata_base_url.as_deref() else {
            return Vec::new();
        };
        let base = base.trim_end_matches('/');
        sources
            .iter()
            .map(|source| Link {
                content_role: "doc".to_string(),
                title: source.clone(),
                href: format!("{}/{}/", base, source.replace('.', "/")),
            })
            .collect()
    }
}

/// Where the producer reads rows from.
pub enum RowSource {
    /// A materialized result table, read in batches from one snapshot.
    Table {
        adapter: Arc<dyn DatabaseAdapter>,
        schema: String,
        table: String,
        column_names: Vec<String>,
    },
    /// Rows of a synchronous statement, fetched in one go.
    Statement {
        adapter: Arc<dyn DatabaseAdapter>,
        sql: String,
    },
}

type Chunk = Result<Vec<u8>, StreamError>;

#[derive(Debug)]
pub struct ResultStream {
    rx: mpsc::Receiver<Chunk>,
    producer: Option<JoinHandle<()>>,
}

impl ResultStream {
    /// Start producing `format_key` chunks of `source`.
    pub fn spawn(format_key: &str, meta: TableMeta, source: RowSource) -> Result<Self, StreamError> {
        let encoder =
            encoder_for(format_key).ok_or_else(|| StreamError::UnknownFormat(format_key.to_string()))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let producer = tokio::spawn(produce(encoder, meta, source, tx));
        Ok(Self {
            rx,
            producer: Some(producer),
        })
    }

    /// Next chunk; `None` once the stream is exhausted or closed.
    pub async fn next(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Stop the producer. Chunks already buffered are discarded.
    pub fn close(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    /// Drain the stream into one buffer, stopping at the first error.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend(chunk?);
        }
        Ok(out)
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

async fn produce(
    mut encoder: Box<dyn Encoder>,
    meta: TableMeta,
    source: RowSource,
    tx: mpsc::Sender<Chunk>,
) {
    if let Err(err) = produce_inner(encoder.as_mut(), &meta, source, &tx).await {
        debug!(table = %meta.table_name, error = %err, "Result stream failed");
        // the consumer may already be gone
        let _ = tx.send(Err(err)).await;
    }
}

async fn produce_inner(
    encoder: &mut dyn Encoder,
    meta: &TableMeta,
    source: RowSource,
    tx: &mpsc::Sender<Chunk>,
) -> Result<(), StreamError> {
    // Fetch before the header so a failing statement yields no partial document.
    let mut pending: Option<Vec<Row>> = match &source {
        RowSource::Statement { adapter, sql } => Some(adapter.fetch_all(sql).await?.rows),
        RowSource::Table { .. } => None,
    };

    if tx.send(encoder.header(meta)).await.is_err() {
        return Ok(());
    }

    match source {
        RowSource::Statement { .. } => {
            let rows = pending.take().unwrap_or_default();
            for batch in rows.chunks(BATCH_SIZE as usize) {
                if tx.send(encoder.rows(batch)).await.is_err() {
                    return Ok(());
                }
            }
        }
        RowSource::Table {
            adapter,
            schema,
            table,
            column_names,
        } => {
            let mut scan = adapter
                .scan_table(&schema, &table, &column_names, BATCH_SIZE)
                .await?;
            loop {
                let rows = scan.next_batch().await?;
                if rows.is_empty() {
                    break;
                }
                let last = (rows.len() as u64) < BATCH_SIZE;
                if tx.send(encoder.rows(&rows)).await.is_err() {
                    return Ok(());
                }
                if last {
                    break;
                }
            }
        }
    }

    let _ = tx.send(encoder.footer()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_db::memory::CannedResult;
    use quarry_db::{DbValue, MemoryAdapter};

    fn meta() -> TableMeta {
        TableMeta {
            table_name: "s.t".into(),
            columns: vec![ColumnInfo::new("id", "long")],
            infos: vec![],
            links: vec![],
        }
    }

    fn table_source(adapter: &MemoryAdapter) -> RowSource {
        RowSource::Table {
            adapter: Arc::new(adapter.clone()),
            schema: "s".into(),
            table: "t".into(),
            column_names: vec![],
        }
    }

    #[tokio::test]
    async fn test_streams_all_pages() {
        let adapter = MemoryAdapter::new();
        let rows: Vec<Row> = (0..2500).map(|i| vec![DbValue::from(i as i64)]).collect();
        adapter.add_table("s", "t", vec![ColumnInfo::new("id", "long")], rows);

        let stream = ResultStream::spawn("csv", meta(), table_source(&adapter)).unwrap();
        let csv = String::from_utf8(stream.collect_bytes().await.unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2501);
        assert_eq!(lines[0], "id");
        assert_eq!(lines[2500], "2499");
    }

    #[tokio::test]
    async fn test_table_changes_after_the_first_batch_are_not_seen() {
        let adapter = MemoryAdapter::new();
        let rows: Vec<Row> = (0..2500).map(|i| vec![DbValue::from(i as i64)]).collect();
        adapter.add_table("s", "t", vec![ColumnInfo::new("id", "long")], rows);

        let mut stream = ResultStream::spawn("csv", meta(), table_source(&adapter)).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"id\n");
        let first = stream.next().await.unwrap().unwrap();
        adapter
            .insert_rows("s", "t", &[], &[vec![DbValue::from(-1i64)]])
            .await
            .unwrap();
        adapter.drop_table("s", "t").await.unwrap();

        let mut csv = first;
        while let Some(chunk) = stream.next().await {
            csv.extend(chunk.unwrap());
        }
        let csv = String::from_utf8(csv).unwrap();
        let ids: Vec<i64> = csv.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(ids, (0..2500).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_missing_table_yields_error_item() {
        let adapter = MemoryAdapter::new();
        let mut stream = ResultStream::spawn("csv", meta(), table_source(&adapter)).unwrap();

        let header = stream.next().await.unwrap().unwrap();
        assert_eq!(header, b"id\n");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Backend(ref e) if e.is_programming()));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_statement_yields_only_the_error() {
        let adapter = MemoryAdapter::new();
        adapter.set_result(
            "SELECT 1",
            CannedResult::Fail(AdapterError::operational("connection reset")),
        );
        let sql = adapter.build_sync_query("SELECT 1", 5.0, None);
        let source = RowSource::Statement {
            adapter: Arc::new(adapter),
            sql,
        };

        let mut stream = ResultStream::spawn("votable", meta(), source).unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(StreamError::Backend(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_stops_production() {
        let adapter = MemoryAdapter::new();
        let rows: Vec<Row> = (0..50_000).map(|i| vec![DbValue::from(i as i64)]).collect();
        adapter.add_table("s", "t", vec![ColumnInfo::new("id", "long")], rows);

        let mut stream = ResultStream::spawn("csv", meta(), table_source(&adapter)).unwrap();
        assert!(stream.next().await.is_some());
        stream.close();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let adapter = MemoryAdapter::new();
        let err = ResultStream::spawn("fits", meta(), table_source(&adapter));
        assert!(matches!(err, Err(StreamError::UnknownFormat(_))));
    }

    #[test]
    fn test_formatter_links_and_infos() {
        let formatter = DownloadFormatter::new(Some("https://example.org/metadata/".into()));
        let sources = vec!["gaia.dr3".to_string()];
        let links = formatter.links(&sources);
        assert_eq!(links[0].href, "https://example.org/metadata/gaia/dr3/");
        let infos = formatter.infos("OK", "SELECT 1", "adql-2.0", &sources);
        assert_eq!(infos.len(), 4);
        assert!(DownloadFormatter::default().links(&sources).is_empty());
    }
}
