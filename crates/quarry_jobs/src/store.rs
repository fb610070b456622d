//! Durable job state (SQLite).
//!
//! Submitters and workers coordinate only through this store. Every phase
//! change is a conditional `UPDATE ... WHERE phase IN (...)` whose affected
//! row count tells the caller whether it won the transition.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use quarry_protocol::{Identity, JobId, JobType, Phase};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use tracing::{debug, info};

use crate::error::{JobError, Result};
use crate::models::{
    ArchiveDetails, DownloadDetails, JobRecord, QueryDetails, QueryMetadata, StatsRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS qj_jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    parent_id TEXT REFERENCES qj_jobs(id) ON DELETE CASCADE,
    owner TEXT,
    owner_groups TEXT NOT NULL DEFAULT '[]',
    phase TEXT NOT NULL DEFAULT 'PENDING',
    creation_time TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    execution_duration REAL NOT NULL DEFAULT 0,
    client_ip TEXT,
    response_format TEXT,
    max_records INTEGER,
    error_summary TEXT
);
CREATE INDEX IF NOT EXISTS ix_qj_jobs_owner_phase ON qj_jobs(owner, phase);
CREATE INDEX IF NOT EXISTS ix_qj_jobs_parent ON qj_jobs(parent_id);

CREATE TABLE IF NOT EXISTS qj_query_jobs (
    id TEXT PRIMARY KEY REFERENCES qj_jobs(id) ON DELETE CASCADE,
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    queue TEXT NOT NULL DEFAULT '',
    query_language TEXT NOT NULL DEFAULT '',
    query TEXT NOT NULL DEFAULT '',
    native_query TEXT NOT NULL DEFAULT '',
    actual_query TEXT NOT NULL DEFAULT '',
    nrows INTEGER,
    size INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    uploads TEXT NOT NULL DEFAULT '{}',
    pid INTEGER
);
CREATE INDEX IF NOT EXISTS ix_qj_query_jobs_table ON qj_query_jobs(schema_name, table_name);

CREATE TABLE IF NOT EXISTS qj_download_jobs (
    id TEXT PRIMARY KEY REFERENCES qj_jobs(id) ON DELETE CASCADE,
    format_key TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS qj_archive_jobs (
    id TEXT PRIMARY KEY REFERENCES qj_jobs(id) ON DELETE CASCADE,
    column_name TEXT NOT NULL,
    files TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS qj_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    time TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource TEXT NOT NULL,
    client_ip TEXT,
    user TEXT
);

CREATE TABLE IF NOT EXISTS qj_tasks (
    task_id TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'QUEUED',
    enqueued_at TEXT NOT NULL,
    claimed_at TEXT,
    finished_at TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS ix_qj_tasks_claim ON qj_tasks(queue, status, priority);
"#;

const JOB_COLUMNS: &str = "j.id, j.job_type, j.parent_id, j.owner, j.owner_groups, j.phase, \
     j.creation_time, j.start_time, j.end_time, j.execution_duration, j.client_ip, \
     j.response_format, j.max_records, j.error_summary";

/// Phases whose result table is gone or never existed.
const FINISHED_WITHOUT_TABLE: [Phase; 3] = [Phase::Error, Phase::Aborted, Phase::Archived];

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    parent_id: Option<String>,
    owner: Option<String>,
    owner_groups: String,
    phase: String,
    creation_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    execution_duration: f64,
    client_ip: Option<String>,
    response_format: Option<String>,
    max_records: Option<i64>,
    error_summary: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self> {
        let owner = match row.owner {
            Some(username) => {
                let groups: Vec<String> = serde_json::from_str(&row.owner_groups)?;
                Some(Identity::new(username).with_groups(groups))
            }
            None => None,
        };
        Ok(JobRecord {
            id: parse_id(&row.id)?,
            job_type: JobType::from_str(&row.job_type).map_err(JobError::Corrupt)?,
            parent_id: row.parent_id.as_deref().map(parse_id).transpose()?,
            owner,
            phase: Phase::from_str(&row.phase).map_err(JobError::Corrupt)?,
            creation_time: row.creation_time,
            start_time: row.start_time,
            end_time: row.end_time,
            execution_duration: row.execution_duration,
            client_ip: row.client_ip,
            response_format: row.response_format,
            max_records: row.max_records,
            error_summary: row.error_summary,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QueryRow {
    #[sqlx(flatten)]
    job: JobRow,
    schema_name: String,
    table_name: String,
    queue: String,
    query_language: String,
    query: String,
    native_query: String,
    actual_query: String,
    nrows: Option<i64>,
    size: Option<i64>,
    metadata: String,
    uploads: String,
    pid: Option<i64>,
}

impl QueryRow {
    fn into_parts(self) -> Result<(JobRecord, QueryDetails)> {
        let details = QueryDetails {
            schema_name: self.schema_name,
            table_name: self.table_name,
            queue: self.queue,
            query_language: self.query_language,
            query: self.query,
            native_query: self.native_query,
            actual_query: self.actual_query,
            nrows: self.nrows,
            size: self.size,
            metadata: serde_json::from_str(&self.metadata)?,
            uploads: serde_json::from_str(&self.uploads)?,
            pid: self.pid,
        };
        Ok((self.job.try_into()?, details))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DownloadRow {
    #[sqlx(flatten)]
    job: JobRow,
    format_key: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ArchiveRow {
    #[sqlx(flatten)]
    job: JobRow,
    column_name: String,
    files: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    time: DateTime<Utc>,
    resource_type: String,
    resource: String,
    client_ip: Option<String>,
    user: Option<String>,
}

fn parse_id(value: &str) -> Result<JobId> {
    JobId::parse(value).map_err(|e| JobError::Corrupt(e.to_string()))
}

fn owner_name(job: &JobRecord) -> Option<&str> {
    job.owner.as_ref().map(|o| o.username.as_str())
}

fn push_phases(builder: &mut QueryBuilder<'_, Sqlite>, phases: &[Phase]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for phase in phases {
        separated.push_bind(phase.as_str());
    }
    separated.push_unseparated(")");
}

/// SQLite-backed job store. Cheap to clone (shares the pool).
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "Opened job store");
        Ok(store)
    }

    /// Private in-memory store. The single connection is kept open for the
    /// lifetime of the pool, otherwise the database would vanish.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// A job may be (re)written only while it is unknown or still PENDING.
    /// Once queued, its stored fields belong to the worker.
    async fn is_writable(&self, conn: &mut sqlx::SqliteConnection, id: &JobId) -> Result<bool> {
        let phase: Option<String> = sqlx::query_scalar("SELECT phase FROM qj_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        Ok(phase.map_or(true, |phase| phase == Phase::Pending.as_str()))
    }

    async fn upsert_job(
        &self,
        conn: &mut sqlx::SqliteConnection,
        job: &JobRecord,
    ) -> Result<()> {
        let groups = serde_json::to_string(
            &job.owner
                .as_ref()
                .map(|o| o.groups.clone())
                .unwrap_or_default(),
        )?;
        sqlx::query(
            r#"
            INSERT INTO qj_jobs (id, job_type, parent_id, owner, owner_groups, phase,
                creation_time, start_time, end_time, execution_duration, client_ip,
                response_format, max_records, error_summary)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                owner_groups = excluded.owner_groups,
                execution_duration = excluded.execution_duration,
                client_ip = excluded.client_ip,
                response_format = excluded.response_format,
                max_records = excluded.max_records
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.job_type.as_str())
        .bind(job.parent_id.as_ref().map(|p| p.as_str()))
        .bind(owner_name(job))
        .bind(groups)
        .bind(job.phase.as_str())
        .bind(job.creation_time)
        .bind(job.start_time)
        .bind(job.end_time)
        .bind(job.execution_duration)
        .bind(job.client_ip.as_deref())
        .bind(job.response_format.as_deref())
        .bind(job.max_records)
        .bind(job.error_summary.as_deref())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query jobs
    // ------------------------------------------------------------------

    /// Insert a query job, or update its prepared fields if it is still
    /// PENDING. Returns false, writing nothing, once the job has left PENDING.
    /// The phase is never changed here; see [`JobStore::transition`].
    pub async fn save_query_job(&self, job: &JobRecord, details: &QueryDetails) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !self.is_writable(&mut *tx, &job.id).await? {
            debug!(job_id = %job.id, "Query job is no longer pending, not saved");
            return Ok(false);
        }
        self.upsert_job(&mut *tx, job).await?;
        sqlx::query(
            r#"
            INSERT INTO qj_query_jobs (id, schema_name, table_name, queue, query_language,
                query, native_query, actual_query, nrows, size, metadata, uploads, pid)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                schema_name = excluded.schema_name,
                table_name = excluded.table_name,
                queue = excluded.queue,
                query_language = excluded.query_language,
                query = excluded.query,
                native_query = excluded.native_query,
                metadata = excluded.metadata,
                uploads = excluded.uploads
            "#,
        )
        .bind(job.id.as_str())
        .bind(&details.schema_name)
        .bind(&details.table_name)
        .bind(&details.queue)
        .bind(&details.query_language)
        .bind(&details.query)
        .bind(&details.native_query)
        .bind(&details.actual_query)
        .bind(details.nrows)
        .bind(details.size)
        .bind(serde_json::to_string(&details.metadata)?)
        .bind(serde_json::to_string(&details.uploads)?)
        .bind(details.pid)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(job_id = %job.id, "Saved query job");
        Ok(true)
    }

    pub async fn load_query_job(&self, id: &JobId) -> Result<Option<(JobRecord, QueryDetails)>> {
        let sql = format!(
            "SELECT {}, q.schema_name, q.table_name, q.queue, q.query_language, q.query, \
             q.native_query, q.actual_query, q.nrows, q.size, q.metadata, q.uploads, q.pid \
             FROM qj_jobs j JOIN qj_query_jobs q ON q.id = j.id WHERE j.id = ?",
            JOB_COLUMNS
        );
        let row: Option<QueryRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(QueryRow::into_parts).transpose()
    }

    /// Query jobs of `owner` (`None` = anonymous), newest first.
    pub async fn list_query_jobs(
        &self,
        owner: Option<&str>,
        limit: i64,
    ) -> Result<Vec<(JobRecord, QueryDetails)>> {
        let sql = format!(
            "SELECT {}, q.schema_name, q.table_name, q.queue, q.query_language, q.query, \
             q.native_query, q.actual_query, q.nrows, q.size, q.metadata, q.uploads, q.pid \
             FROM qj_jobs j JOIN qj_query_jobs q ON q.id = j.id \
             WHERE j.owner IS ? ORDER BY j.creation_time DESC LIMIT ?",
            JOB_COLUMNS
        );
        let rows: Vec<QueryRow> = sqlx::query_as(&sql)
            .bind(owner)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(QueryRow::into_parts).collect()
    }

    /// Record the statement and backend pid of an executing query.
    /// Returns false when the job is no longer EXECUTING.
    pub async fn set_execution(&self, id: &JobId, actual_query: &str, pid: i64) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE qj_query_jobs SET actual_query = ?, pid = ?
            WHERE id = ? AND EXISTS (
                SELECT 1 FROM qj_jobs WHERE id = ? AND phase = 'EXECUTING'
            )
            "#,
        )
        .bind(actual_query)
        .bind(pid)
        .bind(id.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn clear_pid(&self, id: &JobId) -> Result<()> {
        sqlx::query("UPDATE qj_query_jobs SET pid = NULL WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn phase_and_pid(&self, id: &JobId) -> Result<Option<(Phase, Option<i64>)>> {
        let row: Option<(String, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT j.phase, q.pid FROM qj_jobs j
            LEFT JOIN qj_query_jobs q ON q.id = j.id
            WHERE j.id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(phase, pid)| {
            Phase::from_str(&phase)
                .map(|phase| (phase, pid))
                .map_err(JobError::Corrupt)
        })
        .transpose()
    }

    /// EXECUTING -> COMPLETED together with the result statistics.
    pub async fn complete_query_job(
        &self,
        id: &JobId,
        nrows: i64,
        size: i64,
        metadata: &QueryMetadata,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            r#"
            UPDATE qj_jobs SET phase = 'COMPLETED', end_time = ?
            WHERE id = ? AND phase = 'EXECUTING'
            "#,
        )
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE qj_query_jobs SET nrows = ?, size = ?, metadata = ? WHERE id = ?")
            .bind(nrows)
            .bind(size)
            .bind(serde_json::to_string(metadata)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Set ARCHIVED and forget the result size.
    pub async fn archive_query_job(&self, id: &JobId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE qj_jobs SET phase = 'ARCHIVED', end_time = COALESCE(end_time, ?) WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE qj_query_jobs SET nrows = NULL, size = NULL WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_metadata(&self, id: &JobId, metadata: &QueryMetadata) -> Result<()> {
        sqlx::query("UPDATE qj_query_jobs SET metadata = ? WHERE id = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Point a query job at a new result table, provided it is still in
    /// `expected`. Only the table name and the metadata name are written.
    pub async fn rename_query_table(
        &self,
        id: &JobId,
        expected: Phase,
        table_name: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT j.phase, q.metadata FROM qj_jobs j JOIN qj_query_jobs q ON q.id = j.id WHERE j.id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some((phase, metadata)) = row else {
            return Err(JobError::NotFound(id.to_string()));
        };
        if phase != expected.as_str() {
            return Ok(false);
        }

        let mut metadata: QueryMetadata = serde_json::from_str(&metadata)?;
        metadata.name = Some(table_name.to_string());
        sqlx::query("UPDATE qj_query_jobs SET table_name = ?, metadata = ? WHERE id = ?")
            .bind(table_name)
            .bind(serde_json::to_string(&metadata)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Total result bytes of the owner's COMPLETED query jobs.
    pub async fn owner_result_size(&self, owner: Option<&str>) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(q.size) FROM qj_jobs j JOIN qj_query_jobs q ON q.id = j.id
            WHERE j.owner IS ? AND j.phase = 'COMPLETED'
            "#,
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0))
    }

    /// Number of the owner's query jobs in QUEUED or EXECUTING.
    pub async fn count_active_jobs(&self, owner: Option<&str>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM qj_jobs
            WHERE owner IS ? AND job_type = 'QUERY' AND phase IN ('QUEUED', 'EXECUTING')
            "#,
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Whether a live job (other than `except`) already owns `schema.table`.
    pub async fn table_name_in_use(
        &self,
        schema: &str,
        table: &str,
        except: Option<&JobId>,
    ) -> Result<bool> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM qj_jobs j JOIN qj_query_jobs q ON q.id = j.id WHERE q.schema_name = ",
        );
        builder.push_bind(schema);
        builder.push(" AND q.table_name = ");
        builder.push_bind(table);
        builder.push(" AND j.id != ");
        builder.push_bind(except.map(|id| id.as_str()).unwrap_or(""));
        builder.push(" AND j.phase NOT IN ");
        push_phases(&mut builder, &FINISHED_WITHOUT_TABLE);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Download and archive jobs
    // ------------------------------------------------------------------

    pub async fn save_download_job(&self, job: &JobRecord, details: &DownloadDetails) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !self.is_writable(&mut *tx, &job.id).await? {
            return Ok(false);
        }
        self.upsert_job(&mut *tx, job).await?;
        sqlx::query(
            "INSERT INTO qj_download_jobs (id, format_key) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET format_key = excluded.format_key",
        )
        .bind(job.id.as_str())
        .bind(&details.format_key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn load_download_job(
        &self,
        id: &JobId,
    ) -> Result<Option<(JobRecord, DownloadDetails)>> {
        let sql = format!(
            "SELECT {}, d.format_key FROM qj_jobs j JOIN qj_download_jobs d ON d.id = j.id WHERE j.id = ?",
            JOB_COLUMNS
        );
        let row: Option<DownloadRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<(JobRecord, DownloadDetails)> {
            Ok((
                row.job.try_into()?,
                DownloadDetails {
                    format_key: row.format_key,
                },
            ))
        })
        .transpose()
    }

    pub async fn save_archive_job(&self, job: &JobRecord, details: &ArchiveDetails) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !self.is_writable(&mut *tx, &job.id).await? {
            return Ok(false);
        }
        self.upsert_job(&mut *tx, job).await?;
        sqlx::query(
            "INSERT INTO qj_archive_jobs (id, column_name, files) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET column_name = excluded.column_name, files = excluded.files",
        )
        .bind(job.id.as_str())
        .bind(&details.column_name)
        .bind(serde_json::to_string(&details.files)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn load_archive_job(&self, id: &JobId) -> Result<Option<(JobRecord, ArchiveDetails)>> {
        let sql = format!(
            "SELECT {}, a.column_name, a.files FROM qj_jobs j JOIN qj_archive_jobs a ON a.id = j.id WHERE j.id = ?",
            JOB_COLUMNS
        );
        let row: Option<ArchiveRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<(JobRecord, ArchiveDetails)> {
            Ok((
                row.job.try_into()?,
                ArchiveDetails {
                    column_name: row.column_name,
                    files: serde_json::from_str(&row.files)?,
                },
            ))
        })
        .transpose()
    }

    // ------------------------------------------------------------------
    // Shared
    // ------------------------------------------------------------------

    pub async fn phase(&self, id: &JobId) -> Result<Option<Phase>> {
        Ok(self.phase_and_pid(id).await?.map(|(phase, _)| phase))
    }

    pub async fn load_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {} FROM qj_jobs j WHERE j.id = ?", JOB_COLUMNS);
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    /// Compare-and-swap the phase of a job.
    ///
    /// Entering EXECUTING stamps `start_time`; entering a terminal phase
    /// stamps `end_time`. Returns whether this call made the change.
    pub async fn transition(&self, id: &JobId, from: &[Phase], to: Phase) -> Result<bool> {
        self.transition_with_summary(id, from, to, None).await
    }

    pub async fn transition_with_summary(
        &self,
        id: &JobId,
        from: &[Phase],
        to: Phase,
        error_summary: Option<&str>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let now = Utc::now();
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE qj_jobs SET phase = ");
        builder.push_bind(to.as_str());
        if to == Phase::Executing {
            builder.push(", start_time = ");
            builder.push_bind(now);
        }
        if to.is_terminal() {
            builder.push(", end_time = ");
            builder.push_bind(now);
        }
        if let Some(summary) = error_summary {
            builder.push(", error_summary = ");
            builder.push_bind(summary);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id.as_str());
        builder.push(" AND phase IN ");
        push_phases(&mut builder, from);

        let affected = builder
            .build()
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            debug!(job_id = %id, to = %to, "Phase transition");
        }
        Ok(affected > 0)
    }

    /// Ids and kinds of the download/archive jobs of a query job.
    pub async fn children(&self, parent_id: &JobId) -> Result<Vec<(JobId, JobType)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, job_type FROM qj_jobs WHERE parent_id = ? ORDER BY creation_time")
                .bind(parent_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id, job_type)| -> Result<(JobId, JobType)> {
                Ok((
                    parse_id(&id)?,
                    JobType::from_str(&job_type).map_err(JobError::Corrupt)?,
                ))
            })
            .collect()
    }

    /// Delete a job; children and kind rows cascade.
    pub async fn delete_job(&self, id: &JobId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM qj_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn insert_record(&self, record: &StatsRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO qj_records (time, resource_type, resource, client_ip, user) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.time)
        .bind(&record.resource_type)
        .bind(serde_json::to_string(&record.resource)?)
        .bind(record.client_ip.as_deref())
        .bind(record.user.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent records first.
    pub async fn records(&self, limit: i64) -> Result<Vec<StatsRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT time, resource_type, resource, client_ip, user FROM qj_records ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| -> Result<StatsRecord> {
                Ok(StatsRecord {
                    time: row.time,
                    resource_type: row.resource_type,
                    resource: serde_json::from_str(&row.resource)?,
                    client_ip: row.client_ip,
                    user: row.user,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn saved_job(store: &JobStore, owner: Option<Identity>) -> (JobRecord, QueryDetails) {
        let job = JobRecord::new(JobType::Query, owner);
        let details = QueryDetails {
            schema_name: "quarry_user_alice".to_string(),
            table_name: format!("t_{}", &job.id.as_str()[..8]),
            ..QueryDetails::default()
        };
        store.save_query_job(&job, &details).await.unwrap();
        (job, details)
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = JobStore::open_in_memory().await.unwrap();
        let alice = Identity::new("alice").with_groups(["astro"]);
        let (job, details) = saved_job(&store, Some(alice.clone())).await;

        let (loaded, loaded_details) = store.load_query_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.owner, Some(alice));
        assert_eq!(loaded.phase, Phase::Pending);
        assert_eq!(loaded_details, details);
        assert!(store.load_query_job(&JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = JobStore::open_in_memory().await.unwrap();
        let (job, _) = saved_job(&store, None).await;

        assert!(store.transition(&job.id, &[Phase::Pending], Phase::Queued).await.unwrap());
        assert!(!store.transition(&job.id, &[Phase::Pending], Phase::Queued).await.unwrap());
        assert!(store
            .transition(&job.id, &[Phase::Queued], Phase::Executing)
            .await
            .unwrap());

        let loaded = store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Executing);
        assert!(loaded.start_time.is_some());
        assert!(loaded.end_time.is_none());
    }

    #[tokio::test]
    async fn test_set_execution_requires_executing() {
        let store = JobStore::open_in_memory().await.unwrap();
        let (job, _) = saved_job(&store, None).await;
        assert!(!store.set_execution(&job.id, "SELECT 1", 42).await.unwrap());

        store.transition(&job.id, &[Phase::Pending], Phase::Executing).await.unwrap();
        assert!(store.set_execution(&job.id, "SELECT 1", 42).await.unwrap());
        assert_eq!(
            store.phase_and_pid(&job.id).await.unwrap(),
            Some((Phase::Executing, Some(42)))
        );
    }

    #[tokio::test]
    async fn test_save_leaves_submitted_jobs_alone() {
        let store = JobStore::open_in_memory().await.unwrap();
        let (job, mut details) = saved_job(&store, None).await;
        details.query = "SELECT 2".to_string();
        assert!(store.save_query_job(&job, &details).await.unwrap());

        store.transition(&job.id, &[Phase::Pending], Phase::Executing).await.unwrap();
        let metadata = QueryMetadata {
            columns: vec![quarry_db::ColumnInfo::new("ra", "double")],
            ..QueryMetadata::default()
        };
        store.complete_query_job(&job.id, 1, 8, &metadata).await.unwrap();

        details.query = "SELECT 3".to_string();
        assert!(!store.save_query_job(&job, &details).await.unwrap());
        let (_, stored) = store.load_query_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.query, "SELECT 2");
        assert_eq!(stored.metadata.columns.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_query_table_checks_the_phase() {
        let store = JobStore::open_in_memory().await.unwrap();
        let (job, _) = saved_job(&store, None).await;
        store.transition(&job.id, &[Phase::Pending], Phase::Executing).await.unwrap();
        let metadata = QueryMetadata {
            columns: vec![quarry_db::ColumnInfo::new("ra", "double")],
            ..QueryMetadata::default()
        };
        store.complete_query_job(&job.id, 1, 8, &metadata).await.unwrap();

        assert!(!store.rename_query_table(&job.id, Phase::Pending, "t2").await.unwrap());
        assert!(store.rename_query_table(&job.id, Phase::Completed, "t2").await.unwrap());
        let (_, stored) = store.load_query_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.table_name, "t2");
        assert_eq!(stored.metadata.name.as_deref(), Some("t2"));
        assert_eq!(stored.metadata.columns, metadata.columns);
        assert_eq!(stored.nrows, Some(1));

        let err = store.rename_query_table(&JobId::new(), Phase::Completed, "t3").await;
        assert!(matches!(err, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_pid() {
        let store = JobStore::open_in_memory().await.unwrap();
        let (job, _) = saved_job(&store, None).await;
        store.transition(&job.id, &[Phase::Pending], Phase::Executing).await.unwrap();
        store.set_execution(&job.id, "SELECT 1", 42).await.unwrap();
        store.clear_pid(&job.id).await.unwrap();
        assert_eq!(
            store.phase_and_pid(&job.id).await.unwrap(),
            Some((Phase::Executing, None))
        );
    }

    #[tokio::test]
    async fn test_owner_size_and_active_counts() {
        let store = JobStore::open_in_memory().await.unwrap();
        let alice = Identity::new("alice");
        let (a, _) = saved_job(&store, Some(alice.clone())).await;
        let (b, _) = saved_job(&store, Some(alice.clone())).await;
        let (anon, _) = saved_job(&store, None).await;

        store.transition(&a.id, &[Phase::Pending], Phase::Executing).await.unwrap();
        store
            .complete_query_job(&a.id, 10, 2048, &QueryMetadata::default())
            .await
            .unwrap();
        store.transition(&b.id, &[Phase::Pending], Phase::Queued).await.unwrap();
        store.transition(&anon.id, &[Phase::Pending], Phase::Queued).await.unwrap();

        assert_eq!(store.owner_result_size(Some("alice")).await.unwrap(), 2048);
        assert_eq!(store.owner_result_size(None).await.unwrap(), 0);
        assert_eq!(store.count_active_jobs(Some("alice")).await.unwrap(), 1);
        assert_eq!(store.count_active_jobs(None).await.unwrap(), 1);

        store.archive_query_job(&a.id).await.unwrap();
        let (_, details) = store.load_query_job(&a.id).await.unwrap().unwrap();
        assert_eq!(details.size, None);
        assert_eq!(store.owner_result_size(Some("alice")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_table_name_in_use_ignores_finished_jobs() {
        let store = JobStore::open_in_memory().await.unwrap();
        let (job, details) = saved_job(&store, None).await;
        let schema = details.schema_name.as_str();
        let table = details.table_name.as_str();

        assert!(store.table_name_in_use(schema, table, None).await.unwrap());
        assert!(!store.table_name_in_use(schema, table, Some(&job.id)).await.unwrap());

        store.transition(&job.id, &[Phase::Pending], Phase::Error).await.unwrap();
        assert!(!store.table_name_in_use(schema, table, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_children() {
        let store = JobStore::open_in_memory().await.unwrap();
        let (parent, _) = saved_job(&store, None).await;
        let mut child = JobRecord::new(JobType::Download, None);
        child.parent_id = Some(parent.id.clone());
        store
            .save_download_job(&child, &DownloadDetails { format_key: "csv".into() })
            .await
            .unwrap();

        assert_eq!(store.children(&parent.id).await.unwrap().len(), 1);
        assert!(store.delete_job(&parent.id).await.unwrap());
        assert!(store.load_download_job(&child.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_roundtrip() {
        let store = JobStore::open_in_memory().await.unwrap();
        store
            .insert_record(&StatsRecord {
                time: Utc::now(),
                resource_type: "QUERY".to_string(),
                resource: serde_json::json!({"job_id": null, "query": "SELECT 1"}),
                client_ip: Some("127.0.0.1".to_string()),
                user: None,
            })
            .await
            .unwrap();
        let records = store.records(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource["query"], "SELECT 1");
    }
}
