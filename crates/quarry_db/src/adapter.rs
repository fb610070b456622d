//! The backend contract used by query jobs and workers.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ColumnInfo, QueryResult, Row, RowFilter, TableStats};

/// A connection dedicated to one query, identified by the backend process id.
///
/// The id is what [`DatabaseAdapter::abort_query`] kills; a killed session
/// returns [`crate::AdapterError::Cancelled`] from `execute`.
#[async_trait]
pub trait QuerySession: Send {
    fn pid(&self) -> i64;

    async fn execute(&mut self, sql: &str) -> Result<()>;
}

/// A single pass over a result table. All batches come from the snapshot
/// taken when the scan was opened, in the table's stored order.
#[async_trait]
pub trait TableScan: Send {
    /// Up to the scan's batch size of rows; empty once the table is exhausted.
    async fn next_batch(&mut self) -> Result<Vec<Row>>;
}

/// Relational backend that stores query results.
///
/// All table operations take the schema explicitly. `drop_table` must have
/// drop-if-exists semantics so that repeated archival is harmless.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// SQL that materializes `query` into `schema.table`, bounded by
    /// `timeout_secs` (0 = none) and `max_records`.
    fn build_query(
        &self,
        schema: &str,
        table: &str,
        query: &str,
        timeout_secs: f64,
        max_records: Option<i64>,
    ) -> String;

    /// SQL that returns the rows of `query` directly (synchronous path).
    fn build_sync_query(&self, query: &str, timeout_secs: f64, max_records: Option<i64>)
        -> String;

    /// Open a session whose process id is known before execution starts.
    async fn begin_query(&self) -> Result<Box<dyn QuerySession>>;

    async fn fetch_all(&self, sql: &str) -> Result<QueryResult>;

    async fn count_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        filter: &RowFilter,
    ) -> Result<u64>;

    /// One page of rows; `page` starts at 1 and `page_size == 0` means all rows.
    /// `ordering` is a column name, prefixed with `-` for descending order.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        ordering: Option<&str>,
        page: u64,
        page_size: u64,
        filter: &RowFilter,
    ) -> Result<Vec<Row>>;

    /// Open a [`TableScan`] over `column_names` (all columns when empty).
    async fn scan_table(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        batch_size: u64,
    ) -> Result<Box<dyn TableScan>>;

    async fn fetch_stats(&self, schema: &str, table: &str) -> Result<TableStats>;

    async fn fetch_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn create_schema_if_not_exists(&self, schema: &str) -> Result<()>;

    async fn create_table(&self, schema: &str, table: &str, columns: &[ColumnInfo]) -> Result<()>;

    async fn insert_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        rows: &[Row],
    ) -> Result<()>;

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()>;

    async fn rename_table(&self, schema: &str, table: &str, new_table: &str) -> Result<()>;

    /// Kill the backend process `pid`. Unknown or finished processes are ignored.
    async fn abort_query(&self, pid: i64) -> Result<()>;
}
