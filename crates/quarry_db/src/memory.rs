//! In-process result backend.
//!
//! Keeps result tables in memory and answers queries from canned results
//! registered per native query text. Used by the test suites and by the CLI
//! when no PostgreSQL URL is configured.
//!
//! A query registered as [`CannedResult::Blocking`] parks its session until
//! [`DatabaseAdapter::abort_query`] is called with the session pid, after
//! which `execute` returns [`AdapterError::Cancelled`], the same way a
//! terminated PostgreSQL backend does.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use crate::adapter::{DatabaseAdapter, QuerySession, TableScan};
use crate::error::{AdapterError, Result};
use crate::sql::{apply_row_limit, parse_ordering, qualified_table};
use crate::types::{ColumnInfo, DbValue, QueryResult, Row, RowFilter, TableStats};

/// What executing a native query produces.
#[derive(Debug, Clone)]
pub enum CannedResult {
    Rows {
        columns: Vec<ColumnInfo>,
        rows: Vec<Row>,
    },
    /// Never finishes on its own; only an abort ends it.
    Blocking,
    Fail(AdapterError),
}

impl CannedResult {
    pub fn rows(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self::Rows { columns, rows }
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
}

/// What a statement produced by `build_query` / `build_sync_query` refers to.
#[derive(Debug, Clone)]
struct BuiltStatement {
    target: Option<(String, String)>,
    native: String,
    max_records: Option<i64>,
}

#[derive(Default)]
struct MemoryState {
    schemas: BTreeSet<String>,
    tables: BTreeMap<(String, String), MemoryTable>,
    canned: HashMap<String, CannedResult>,
    built: HashMap<String, BuiltStatement>,
    next_pid: i64,
    running: HashMap<i64, Arc<Notify>>,
    killed: Vec<i64>,
    dropped: Vec<(String, String)>,
    executed: Vec<String>,
}

/// In-memory [`DatabaseAdapter`].
#[derive(Clone)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::with_first_pid(1000)
    }

    /// Sessions get consecutive pids starting at `pid`.
    pub fn with_first_pid(pid: i64) -> Self {
        let state = MemoryState {
            next_pid: pid,
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    /// Register the outcome of executing `native_query`.
    pub fn set_result(&self, native_query: impl Into<String>, result: CannedResult) {
        self.state().canned.insert(native_query.into(), result);
    }

    /// Create (or replace) a table directly.
    pub fn add_table(&self, schema: &str, table: &str, columns: Vec<ColumnInfo>, rows: Vec<Row>) {
        let mut state = self.state();
        state.schemas.insert(schema.to_string());
        state.tables.insert(
            (schema.to_string(), table.to_string()),
            MemoryTable { columns, rows },
        );
    }

    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.state()
            .tables
            .contains_key(&(schema.to_string(), table.to_string()))
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.state().schemas.contains(schema)
    }

    /// All rows of a table, in table column order.
    pub fn table_rows(&self, schema: &str, table: &str) -> Option<Vec<Row>> {
        self.state()
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.rows.clone())
    }

    /// Pids passed to `abort_query`, in call order.
    pub fn killed_pids(&self) -> Vec<i64> {
        self.state().killed.clone()
    }

    /// Every `drop_table` call, whether or not the table existed.
    pub fn dropped_tables(&self) -> Vec<(String, String)> {
        self.state().dropped.clone()
    }

    /// Statements passed to `QuerySession::execute`.
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Pids of sessions currently parked in a blocking query.
    pub fn running_pids(&self) -> Vec<i64> {
        let mut pids: Vec<i64> = self.state().running.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn record(&self, sql: String, statement: BuiltStatement) -> String {
        self.state().built.insert(sql.clone(), statement);
        sql
    }

    fn with_table<T>(
        &self,
        schema: &str,
        table: &str,
        f: impl FnOnce(&MemoryTable) -> Result<T>,
    ) -> Result<T> {
        let state = self.state();
        let found = state
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| missing_table(schema, table))?;
        f(found)
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn missing_table(schema: &str, table: &str) -> AdapterError {
    AdapterError::programming(format!(
        "relation {} does not exist",
        qualified_table(schema, table)
    ))
}

fn truncate(mut rows: Vec<Row>, max_records: Option<i64>) -> Vec<Row> {
    if let Some(max) = max_records.filter(|m| *m >= 0) {
        rows.truncate(max as usize);
    }
    rows
}

/// Bytes a row would take on disk, roughly.
pub fn estimated_size(rows: &[Row]) -> i64 {
    rows.iter()
        .flatten()
        .map(|value| match value {
            DbValue::Null => 0,
            DbValue::Boolean(_) => 1,
            DbValue::Integer(_) | DbValue::Real(_) | DbValue::Timestamp(_) => 8,
            DbValue::Text(v) => v.len() as i64,
            DbValue::Blob(v) => v.len() as i64,
        })
        .sum()
}

fn compare_values(a: &DbValue, b: &DbValue) -> Ordering {
    use DbValue::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Integer(x), Integer(y)) => x.cmp(y),
        (Integer(x), Real(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Real(x), Integer(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Real(x), Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        _ => a.to_text().cmp(&b.to_text()),
    }
}

/// Index of each requested column; all columns when none are requested.
fn column_indices(table: &MemoryTable, column_names: &[String]) -> Result<Vec<usize>> {
    if column_names.is_empty() {
        return Ok((0..table.columns.len()).collect());
    }
    column_names
        .iter()
        .map(|name| {
            table
                .columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| AdapterError::programming(format!("column \"{}\" does not exist", name)))
        })
        .collect()
}

fn select_rows<'a>(
    table: &'a MemoryTable,
    indices: &[usize],
    filter: &RowFilter,
) -> Result<Vec<&'a Row>> {
    let search = filter
        .search
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);

    let mut filters = Vec::with_capacity(filter.filters.len());
    for (column, values) in &filter.filters {
        let index = column_indices(table, std::slice::from_ref(column))?[0];
        filters.push((index, values));
    }

    Ok(table
        .rows
        .iter()
        .filter(|row| {
            let matches_search = search.as_ref().map_or(true, |term| {
                indices.iter().any(|&i| {
                    row.get(i)
                        .and_then(DbValue::to_text)
                        .map_or(false, |text| text.to_lowercase().contains(term.as_str()))
                })
            });
            let matches_filters = filters.iter().all(|(i, values)| {
                let text = row.get(*i).and_then(DbValue::to_text);
                values.iter().any(|v| text.as_deref() == Some(v.as_str()))
            });
            matches_search && matches_filters
        })
        .collect())
}

/// Rows copied out when the scan was opened.
struct MemoryScan {
    rows: std::vec::IntoIter<Row>,
    batch_size: usize,
}

#[async_trait]
impl TableScan for MemoryScan {
    async fn next_batch(&mut self) -> Result<Vec<Row>> {
        Ok(self.rows.by_ref().take(self.batch_size).collect())
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    pid: i64,
}

impl MemorySession {
    fn finish(&self) {
        lock(&self.state).running.remove(&self.pid);
    }
}

#[async_trait]
impl QuerySession for MemorySession {
    fn pid(&self) -> i64 {
        self.pid
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let (statement, canned, notify) = {
            let mut state = lock(&self.state);
            state.executed.push(sql.to_string());
            let statement = state
                .built
                .get(sql)
                .cloned()
                .ok_or_else(|| AdapterError::programming(format!("syntax error in \"{}\"", sql)))?;
            let canned = state.canned.get(&statement.native).cloned().ok_or_else(|| {
                AdapterError::programming(format!("no result for \"{}\"", statement.native))
            })?;
            let notify = state.running.get(&self.pid).cloned();
            (statement, canned, notify)
        };

        let result = match canned {
            CannedResult::Fail(err) => Err(err),
            CannedResult::Blocking => {
                if let Some(notify) = notify {
                    debug!(pid = self.pid, "Query blocked until aborted");
                    notify.notified().await;
                }
                Err(AdapterError::cancelled(
                    "terminating connection due to administrator command",
                ))
            }
            CannedResult::Rows { columns, rows } => {
                let rows = truncate(rows, statement.max_records);
                let mut state = lock(&self.state);
                match statement.target {
                    Some((schema, table)) => {
                        let key = (schema.clone(), table.clone());
                        if state.tables.contains_key(&key) {
                            Err(AdapterError::programming(format!(
                                "relation {} already exists",
                                qualified_table(&schema, &table)
                            )))
                        } else {
                            state.schemas.insert(schema);
                            state.tables.insert(key, MemoryTable { columns, rows });
                            Ok(())
                        }
                    }
                    None => Ok(()),
                }
            }
        };
        self.finish();
        result
    }
}

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    fn build_query(
        &self,
        schema: &str,
        table: &str,
        query: &str,
        timeout_secs: f64,
        max_records: Option<i64>,
    ) -> String {
        let sql = format!(
            "/* timeout {} */ CREATE TABLE {} AS {}",
            timeout_secs,
            qualified_table(schema, table),
            apply_row_limit(query, max_records)
        );
        self.record(
            sql,
            BuiltStatement {
                target: Some((schema.to_string(), table.to_string())),
                native: query.to_string(),
                max_records,
            },
        )
    }

    fn build_sync_query(&self, query: &str, timeout_secs: f64, max_records: Option<i64>) -> String {
        let sql = format!(
            "/* timeout {} */ {}",
            timeout_secs,
            apply_row_limit(query, max_records)
        );
        self.record(
            sql,
            BuiltStatement {
                target: None,
                native: query.to_string(),
                max_records,
            },
        )
    }

    async fn begin_query(&self) -> Result<Box<dyn QuerySession>> {
        let mut state = self.state();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.running.insert(pid, Arc::new(Notify::new()));
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            pid,
        }))
    }

    async fn fetch_all(&self, sql: &str) -> Result<QueryResult> {
        let state = self.state();
        let statement = state
            .built
            .get(sql)
            .ok_or_else(|| AdapterError::programming(format!("syntax error in \"{}\"", sql)))?;
        match state.canned.get(&statement.native) {
            Some(CannedResult::Rows { columns, rows }) => Ok(QueryResult {
                columns: columns.iter().map(|c| c.name.clone()).collect(),
                rows: truncate(rows.clone(), statement.max_records),
            }),
            Some(CannedResult::Blocking) => Err(AdapterError::operational(
                "canceling statement due to statement timeout",
            )),
            Some(CannedResult::Fail(err)) => Err(err.clone()),
            None => Err(AdapterError::programming(format!(
                "no result for \"{}\"",
                statement.native
            ))),
        }
    }

    async fn count_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        filter: &RowFilter,
    ) -> Result<u64> {
        self.with_table(schema, table, |t| {
            let indices = column_indices(t, column_names)?;
            Ok(select_rows(t, &indices, filter)?.len() as u64)
        })
    }

    async fn fetch_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        ordering: Option<&str>,
        page: u64,
        page_size: u64,
        filter: &RowFilter,
    ) -> Result<Vec<Row>> {
        self.with_table(schema, table, |t| {
            let indices = column_indices(t, column_names)?;
            let mut rows = select_rows(t, &indices, filter)?;

            if let Some(ordering) = ordering.filter(|o| !o.is_empty()) {
                let (column, descending) = parse_ordering(ordering);
                let known = column_names.is_empty() || column_names.iter().any(|c| c == column);
                if let Some(index) = t.columns.iter().position(|c| c.name == column).filter(|_| known) {
                    rows.sort_by(|a, b| {
                        let ord = compare_values(&a[index], &b[index]);
                        if descending {
                            ord.reverse()
                        } else {
                            ord
                        }
                    });
                }
            }

            let rows = rows.into_iter().map(|row| {
                indices
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(DbValue::Null))
                    .collect::<Row>()
            });

            Ok(if page_size > 0 {
                let offset = page.max(1).saturating_sub(1).saturating_mul(page_size);
                rows.skip(offset as usize).take(page_size as usize).collect()
            } else {
                rows.collect()
            })
        })
    }

    async fn scan_table(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        batch_size: u64,
    ) -> Result<Box<dyn TableScan>> {
        let rows = self.with_table(schema, table, |t| {
            let indices = column_indices(t, column_names)?;
            Ok(t.rows
                .iter()
                .map(|row| {
                    indices
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or(DbValue::Null))
                        .collect::<Row>()
                })
                .collect::<Vec<Row>>())
        })?;
        Ok(Box::new(MemoryScan {
            rows: rows.into_iter(),
            batch_size: batch_size.max(1) as usize,
        }))
    }

    async fn fetch_stats(&self, schema: &str, table: &str) -> Result<TableStats> {
        self.with_table(schema, table, |t| {
            Ok(TableStats {
                nrows: t.rows.len() as i64,
                size: estimated_size(&t.rows),
            })
        })
    }

    async fn fetch_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        self.with_table(schema, table, |t| Ok(t.columns.clone()))
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> Result<()> {
        self.state().schemas.insert(schema.to_string());
        Ok(())
    }

    async fn create_table(&self, schema: &str, table: &str, columns: &[ColumnInfo]) -> Result<()> {
        let mut state = self.state();
        let key = (schema.to_string(), table.to_string());
        if state.tables.contains_key(&key) {
            return Err(AdapterError::programming(format!(
                "relation {} already exists",
                qualified_table(schema, table)
            )));
        }
        state.schemas.insert(schema.to_string());
        state.tables.insert(
            key,
            MemoryTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn insert_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        rows: &[Row],
    ) -> Result<()> {
        let mut state = self.state();
        let target = state
            .tables
            .get_mut(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| missing_table(schema, table))?;
        let indices = column_indices(target, column_names)?;
        let width = target.columns.len();

        for row in rows {
            let mut stored = vec![DbValue::Null; width];
            for (value, &i) in row.iter().zip(&indices) {
                stored[i] = value.clone();
            }
            target.rows.push(stored);
        }
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let mut state = self.state();
        let key = (schema.to_string(), table.to_string());
        state.tables.remove(&key);
        state.dropped.push(key);
        Ok(())
    }

    async fn rename_table(&self, schema: &str, table: &str, new_table: &str) -> Result<()> {
        let mut state = self.state();
        let existing = state
            .tables
            .remove(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| missing_table(schema, table))?;
        state
            .tables
            .insert((schema.to_string(), new_table.to_string()), existing);
        Ok(())
    }

    async fn abort_query(&self, pid: i64) -> Result<()> {
        let mut state = self.state();
        state.killed.push(pid);
        if let Some(notify) = state.running.remove(&pid) {
            notify.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_columns() -> Vec<ColumnInfo> {
        vec![ColumnInfo::new("id", "long"), ColumnInfo::new("name", "char")]
    }

    fn sample_rows() -> Vec<Row> {
        vec![
            vec![DbValue::from(1i64), DbValue::from("Andromeda")],
            vec![DbValue::from(2i64), DbValue::from("Triangulum")],
            vec![DbValue::from(3i64), DbValue::from("Sombrero")],
        ]
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_execute_materializes_canned_rows() {
        let adapter = MemoryAdapter::with_first_pid(42);
        adapter.set_result("SELECT * FROM g", CannedResult::rows(sample_columns(), sample_rows()));

        let sql = adapter.build_query("u", "t", "SELECT * FROM g", 10.0, Some(2));
        let mut session = adapter.begin_query().await.unwrap();
        assert_eq!(session.pid(), 42);
        session.execute(&sql).await.unwrap();

        let stats = adapter.fetch_stats("u", "t").await.unwrap();
        assert_eq!(stats.nrows, 2);
        assert!(adapter.running_pids().is_empty());
    }

    #[tokio::test]
    async fn test_blocking_query_ends_on_abort() {
        let adapter = MemoryAdapter::with_first_pid(42);
        adapter.set_result("SELECT pg_sleep(100)", CannedResult::Blocking);
        let sql = adapter.build_query("u", "t", "SELECT pg_sleep(100)", 0.0, None);
        let mut session = adapter.begin_query().await.unwrap();

        let handle = tokio::spawn(async move { session.execute(&sql).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        adapter.abort_query(42).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_cancellation());
        assert_eq!(adapter.killed_pids(), vec![42]);
        assert!(!adapter.has_table("u", "t"));
    }

    #[tokio::test]
    async fn test_abort_unknown_pid_is_noop() {
        let adapter = MemoryAdapter::new();
        adapter.abort_query(7).await.unwrap();
        assert_eq!(adapter.killed_pids(), vec![7]);
    }

    #[tokio::test]
    async fn test_fetch_rows_search_order_and_page() {
        let adapter = MemoryAdapter::new();
        adapter.add_table("u", "t", sample_columns(), sample_rows());
        let cols = names(&["id", "name"]);

        let rows = adapter
            .fetch_rows("u", "t", &cols, Some("-id"), 1, 2, &RowFilter::default())
            .await
            .unwrap();
        assert_eq!(rows[0][0], DbValue::from(3i64));
        assert_eq!(rows.len(), 2);

        let filter = RowFilter::search("OM");
        assert_eq!(adapter.count_rows("u", "t", &cols, &filter).await.unwrap(), 2);

        let filter = RowFilter::default().with_filter("id", vec!["2".to_string()]);
        let rows = adapter
            .fetch_rows("u", "t", &names(&["name"]), None, 1, 0, &filter)
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![DbValue::from("Triangulum")]]);
    }

    #[tokio::test]
    async fn test_scan_reads_a_snapshot_in_batches() {
        let adapter = MemoryAdapter::new();
        adapter.add_table("u", "t", sample_columns(), sample_rows());

        let mut scan = adapter.scan_table("u", "t", &names(&["name"]), 2).await.unwrap();
        let first = scan.next_batch().await.unwrap();
        assert_eq!(
            first,
            vec![vec![DbValue::from("Andromeda")], vec![DbValue::from("Triangulum")]]
        );

        adapter
            .insert_rows("u", "t", &names(&["id", "name"]), &[vec![DbValue::from(0i64), DbValue::from("Pinwheel")]])
            .await
            .unwrap();
        adapter.drop_table("u", "t").await.unwrap();

        assert_eq!(scan.next_batch().await.unwrap(), vec![vec![DbValue::from("Sombrero")]]);
        assert!(scan.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_column_is_programming_error() {
        let adapter = MemoryAdapter::new();
        adapter.add_table("u", "t", sample_columns(), sample_rows());
        let err = adapter
            .count_rows("u", "t", &names(&["nope"]), &RowFilter::default())
            .await
            .unwrap_err();
        assert!(err.is_programming());
        let err = adapter.fetch_columns("u", "missing").await.unwrap_err();
        assert!(err.is_programming());
    }

    #[tokio::test]
    async fn test_drop_is_idempotent_and_recorded() {
        let adapter = MemoryAdapter::new();
        adapter.add_table("u", "t", sample_columns(), vec![]);
        adapter.drop_table("u", "t").await.unwrap();
        adapter.drop_table("u", "t").await.unwrap();
        assert!(!adapter.has_table("u", "t"));
        assert_eq!(adapter.dropped_tables().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_rows_maps_columns() {
        let adapter = MemoryAdapter::new();
        adapter.create_table("up", "csv", &sample_columns()).await.unwrap();
        adapter
            .insert_rows("up", "csv", &names(&["name"]), &[vec![DbValue::from("M87")]])
            .await
            .unwrap();
        assert_eq!(
            adapter.table_rows("up", "csv").unwrap(),
            vec![vec![DbValue::Null, DbValue::from("M87")]]
        );
    }
}
