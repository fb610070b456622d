//! PostgreSQL result backend.
//!
//! Query results live in per-user schemas. Each running query holds its own
//! pooled connection so that `pg_backend_pid()` identifies it; aborting
//! terminates that backend, which the running session observes as SQLSTATE
//! `57P01` and reports as [`AdapterError::Cancelled`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, Row as _, TypeInfo};
use tracing::{debug, info, warn};

use crate::adapter::{DatabaseAdapter, QuerySession, TableScan};
use crate::error::{AdapterError, Result};
use crate::sql::{
    apply_row_limit, count_rows_sql, escape_identifier, fetch_rows_sql, qualified_table,
    strip_trailing_semicolon, BoundSql,
};
use crate::types::{ColumnInfo, DbValue, QueryResult, Row, RowFilter, TableStats};

/// admin_shutdown: raised in a backend killed by `pg_terminate_backend`.
const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";

/// Cursor name of a [`PgTableScan`]; each scan owns its connection.
const SCAN_CURSOR: &str = "quarry_scan";

/// Upper bound of bind parameters per INSERT statement.
const MAX_BIND_PARAMS: usize = 60_000;

#[derive(Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(map_pg_error)?;
        info!("Connected to result backend");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn execute_bound(&self, bound: &BoundSql) -> Result<Vec<PgRow>> {
        let mut query = sqlx::query(&bound.sql);
        for arg in &bound.args {
            query = query.bind(arg);
        }
        query.fetch_all(&self.pool).await.map_err(map_pg_error)
    }

    async fn execute_plain(&self, sql: &str) -> Result<()> {
        debug!(sql, "Executing statement");
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_pg_error)
    }
}

/// `BEGIN; SET LOCAL statement_timeout ...; <sql>; COMMIT;`
fn with_timeout(sql: &str, timeout_secs: f64) -> String {
    let timeout_ms = (timeout_secs.max(0.0) * 1000.0) as i64;
    format!(
        "BEGIN; SET LOCAL statement_timeout = {}; {}; COMMIT;",
        timeout_ms,
        strip_trailing_semicolon(sql)
    )
}

struct PgSession {
    conn: PoolConnection<Postgres>,
    pid: i64,
}

#[async_trait]
impl QuerySession for PgSession {
    fn pid(&self) -> i64 {
        self.pid
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let result = sqlx::Executor::execute(self.conn.as_mut(), sqlx::raw_sql(sql)).await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = map_pg_error(err);
                if !err.is_cancellation() {
                    // The statement ran inside an explicit transaction.
                    if let Err(rollback) = sqlx::Executor::execute(self.conn.as_mut(), sqlx::raw_sql("ROLLBACK")).await {
                        warn!(pid = self.pid, "Rollback after failed query failed: {}", rollback);
                    }
                }
                Err(err)
            }
        }
    }
}

/// A read-only transaction holding a cursor over one table.
struct PgTableScan {
    conn: PoolConnection<Postgres>,
    batch_size: u64,
    done: bool,
}

#[async_trait]
impl TableScan for PgTableScan {
    async fn next_batch(&mut self) -> Result<Vec<Row>> {
        if self.done {
            return Ok(Vec::new());
        }
        let fetch = format!("FETCH FORWARD {} FROM {}", self.batch_size, SCAN_CURSOR);
        let rows = sqlx::Executor::fetch_all(self.conn.as_mut(), sqlx::raw_sql(&fetch))
            .await
            .map_err(map_pg_error)?;
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;

        if (rows.len() as u64) < self.batch_size {
            self.done = true;
            let close = format!("CLOSE {}; COMMIT", SCAN_CURSOR);
            sqlx::Executor::execute(self.conn.as_mut(), sqlx::raw_sql(&close))
                .await
                .map_err(map_pg_error)?;
        }
        Ok(rows)
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn build_query(
        &self,
        schema: &str,
        table: &str,
        query: &str,
        timeout_secs: f64,
        max_records: Option<i64>,
    ) -> String {
        let create = format!(
            "CREATE TABLE {} AS {}",
            qualified_table(schema, table),
            apply_row_limit(query, max_records)
        );
        with_timeout(&create, timeout_secs)
    }

    fn build_sync_query(&self, query: &str, timeout_secs: f64, max_records: Option<i64>) -> String {
        with_timeout(&apply_row_limit(query, max_records), timeout_secs)
    }

    async fn begin_query(&self) -> Result<Box<dyn QuerySession>> {
        let mut conn = self.pool.acquire().await.map_err(map_pg_error)?;
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(conn.as_mut())
            .await
            .map_err(map_pg_error)?;
        Ok(Box::new(PgSession {
            conn,
            pid: i64::from(pid),
        }))
    }

    async fn fetch_all(&self, sql: &str) -> Result<QueryResult> {
        let mut conn = self.pool.acquire().await.map_err(map_pg_error)?;
        let rows = match sqlx::Executor::fetch_all(conn.as_mut(), sqlx::raw_sql(sql)).await {
            Ok(rows) => rows,
            Err(err) => {
                if let Err(rollback) = sqlx::Executor::execute(conn.as_mut(), sqlx::raw_sql("ROLLBACK")).await {
                    warn!("Rollback after failed fetch failed: {}", rollback);
                }
                return Err(map_pg_error(err));
            }
        };

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        Ok(QueryResult { columns, rows })
    }

    async fn count_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        filter: &RowFilter,
    ) -> Result<u64> {
        let bound = count_rows_sql(schema, table, column_names, filter);
        let rows = self.execute_bound(&bound).await?;
        let count: i64 = rows
            .first()
            .ok_or_else(|| AdapterError::programming("COUNT returned no row"))?
            .try_get(0)
            .map_err(map_pg_error)?;
        Ok(count.max(0) as u64)
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
        let bound = fetch_rows_sql(schema, table, column_names, ordering, page, page_size, filter);
        let rows = self.execute_bound(&bound).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn scan_table(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        batch_size: u64,
    ) -> Result<Box<dyn TableScan>> {
        let select = fetch_rows_sql(schema, table, column_names, None, 1, 0, &RowFilter::default());
        let mut conn = self.pool.acquire().await.map_err(map_pg_error)?;
        // an abandoned scan leaves its transaction open
        conn.close_on_drop();
        let declare = format!(
            "BEGIN READ ONLY; DECLARE {} NO SCROLL CURSOR FOR {}",
            SCAN_CURSOR, select.sql
        );
        sqlx::Executor::execute(conn.as_mut(), sqlx::raw_sql(&declare))
            .await
            .map_err(map_pg_error)?;
        debug!(schema, table, "Opened table scan");
        Ok(Box::new(PgTableScan {
            conn,
            batch_size: batch_size.max(1),
            done: false,
        }))
    }

    async fn fetch_stats(&self, schema: &str, table: &str) -> Result<TableStats> {
        let qualified = qualified_table(schema, table);
        let sql = format!(
            "SELECT (SELECT COUNT(*) FROM {}) AS nrows, pg_total_relation_size($1::regclass) AS size",
            qualified
        );
        let row = sqlx::query(&sql)
            .bind(&qualified)
            .fetch_one(&self.pool)
            .await
            .map_err(map_pg_error)?;
        Ok(TableStats {
            nrows: row.try_get("nrows").map_err(map_pg_error)?,
            size: row.try_get("size").map_err(map_pg_error)?,
        })
    }

    async fn fetch_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS name,
                   data_type::text AS data_type,
                   character_maximum_length::int4 AS max_length
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(map_pg_error)?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name").map_err(map_pg_error)?;
                let data_type: String = row.try_get("data_type").map_err(map_pg_error)?;
                let max_length: Option<i32> = row.try_get("max_length").map_err(map_pg_error)?;
                let (datatype, arraysize) = convert_datatype(&data_type, max_length);
                let mut column = ColumnInfo::new(name, datatype);
                column.arraysize = arraysize;
                Ok(column)
            })
            .collect()
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> Result<()> {
        self.execute_plain(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            escape_identifier(schema)
        ))
        .await
    }

    async fn create_table(&self, schema: &str, table: &str, columns: &[ColumnInfo]) -> Result<()> {
        let definitions = columns
            .iter()
            .map(|c| format!("{} {}", escape_identifier(&c.name), native_datatype(&c.datatype)))
            .collect::<Vec<_>>()
            .join(", ");
        self.execute_plain(&format!(
            "CREATE TABLE {} ({})",
            qualified_table(schema, table),
            definitions
        ))
        .await
    }

    async fn insert_rows(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        rows: &[Row],
    ) -> Result<()> {
        if column_names.is_empty() || rows.is_empty() {
            return Ok(());
        }
        let columns = column_names
            .iter()
            .map(|c| escape_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / column_names.len()).max(1);

        for chunk in rows.chunks(rows_per_statement) {
            let mut placeholder = 0;
            let values = chunk
                .iter()
                .map(|row| {
                    let cells = row
                        .iter()
                        .map(|_| {
                            placeholder += 1;
                            format!("${}", placeholder)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({})", cells)
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                qualified_table(schema, table),
                columns,
                values
            );

            let mut query = sqlx::query(&sql);
            for value in chunk.iter().flatten() {
                query = match value {
                    DbValue::Null => query.bind(Option::<String>::None),
                    DbValue::Boolean(v) => query.bind(*v),
                    DbValue::Integer(v) => query.bind(*v),
                    DbValue::Real(v) => query.bind(*v),
                    DbValue::Timestamp(v) => query.bind(*v),
                    DbValue::Text(v) => query.bind(v.clone()),
                    DbValue::Blob(v) => query.bind(v.clone()),
                };
            }
            query.execute(&self.pool).await.map_err(map_pg_error)?;
        }
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        self.execute_plain(&format!(
            "DROP TABLE IF EXISTS {}",
            qualified_table(schema, table)
        ))
        .await
    }

    async fn rename_table(&self, schema: &str, table: &str, new_table: &str) -> Result<()> {
        self.execute_plain(&format!(
            "ALTER TABLE {} RENAME TO {}",
            qualified_table(schema, table),
            escape_identifier(new_table)
        ))
        .await
    }

    async fn abort_query(&self, pid: i64) -> Result<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| AdapterError::programming(format!("Invalid backend pid {}", pid)))?;
        let terminated: bool = sqlx::query_scalar("SELECT pg_terminate_backend($1)")
            .bind(pid)
            .fetch_one(&self.pool)
            .await
            .map_err(map_pg_error)?;
        if terminated {
            info!(pid, "Terminated backend");
        } else {
            debug!(pid, "Backend already gone");
        }
        Ok(())
    }
}

/// Classify a sqlx error by SQLSTATE.
pub fn map_pg_error(err: sqlx::Error) -> AdapterError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(SQLSTATE_ADMIN_SHUTDOWN) => AdapterError::cancelled(db.message()),
            // class 42: syntax error or access rule violation, class 22: data exception
            Some(code) if code.starts_with("42") || code.starts_with("22") => {
                AdapterError::programming(db.message())
            }
            _ => AdapterError::operational(db.message()),
        },
        sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. } => AdapterError::programming(err.to_string()),
        _ => AdapterError::operational(err.to_string()),
    }
}

fn decode_row(row: &PgRow) -> Result<Row> {
    row.columns()
        .iter()
        .map(|column| decode_value(row, column.ordinal(), column.type_info().name()))
        .collect()
}

fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<DbValue> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map(DbValue::from),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| DbValue::from(v.map(i64::from))),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| DbValue::from(v.map(i64::from))),
        "INT8" => row.try_get::<Option<i64>, _>(index).map(DbValue::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| DbValue::from(v.map(f64::from))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(DbValue::from),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Timestamp)),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |v| DbValue::Timestamp(v.and_utc()))),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Blob)),
        _ => row.try_get::<Option<String>, _>(index).map(DbValue::from),
    };
    value.map_err(|e| {
        AdapterError::programming(format!(
            "Cannot decode column {} of type {}: {}",
            index, type_name, e
        ))
    })
}

/// Map an information_schema type to a VOTable datatype and arraysize.
fn convert_datatype(data_type: &str, max_length: Option<i32>) -> (String, Option<u32>) {
    let datatype = match data_type {
        "smallint" => "short",
        "integer" => "int",
        "bigint" => "long",
        "real" => "float",
        "double precision" | "numeric" => "double",
        "boolean" => "boolean",
        "character varying" | "character" | "text" => "char",
        "timestamp without time zone" | "timestamp with time zone" => "timestamp",
        other => return (other.to_string(), None),
    };
    let arraysize = if datatype == "char" {
        max_length.and_then(|len| u32::try_from(len).ok())
    } else {
        None
    };
    (datatype.to_string(), arraysize)
}

/// Inverse of `convert_datatype`, used when creating upload tables.
fn native_datatype(datatype: &str) -> &'static str {
    match datatype {
        "short" => "SMALLINT",
        "int" => "INTEGER",
        "long" => "BIGINT",
        "float" => "REAL",
        "double" => "DOUBLE PRECISION",
        "boolean" => "BOOLEAN",
        "timestamp" => "TIMESTAMP",
        _ => "TEXT",
    }
}
