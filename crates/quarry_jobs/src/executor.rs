//! Worker side of the lifecycle.
//!
//! The executor owns QUEUED -> EXECUTING -> {COMPLETED | ERROR | ABORTED}.
//! A job that is no longer QUEUED when its task arrives (revoked, aborted or
//! already picked up) is skipped.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use quarry_db::{ColumnInfo, DatabaseAdapter, DbValue, Row, TableStats};
use quarry_protocol::defaults::GENERIC_ERROR_SUMMARY;
use quarry_protocol::{JobId, Phase};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::archive_job::{archive_file_path, FILES_NOT_FOUND};
use crate::config::QueryConfig;
use crate::dispatch::{Task, TaskExecutor};
use crate::download_job::download_file_path;
use crate::error::{JobError, Result};
use crate::files::FileAccess;
use crate::models::{JobRecord, QueryDetails};
use crate::packager::{self, ArchiveEntry};
use crate::query_job::result_table_meta;
use crate::store::JobStore;
use crate::streamer::{ResultStream, RowSource};

/// A finished materialization, or `None` when the job was aborted before
/// the statement started.
type Materialized = Option<(TableStats, Vec<ColumnInfo>)>;

pub struct JobExecutor {
    config: Arc<QueryConfig>,
    store: JobStore,
    adapter: Arc<dyn DatabaseAdapter>,
    files: Arc<dyn FileAccess>,
}

fn join_error(err: tokio::task::JoinError) -> JobError {
    JobError::Io(io::Error::new(io::ErrorKind::Other, err))
}

impl JobExecutor {
    pub fn new(
        config: Arc<QueryConfig>,
        store: JobStore,
        adapter: Arc<dyn DatabaseAdapter>,
        files: Arc<dyn FileAccess>,
    ) -> Self {
        Self {
            config,
            store,
            adapter,
            files,
        }
    }

    async fn start(&self, id: &JobId) -> Result<bool> {
        let started = self
            .store
            .transition(id, &[Phase::Queued], Phase::Executing)
            .await?;
        if !started {
            info!(job_id = %id, "Job is no longer QUEUED, skipping");
        }
        Ok(started)
    }

    async fn load_query(&self, id: &JobId) -> Result<(JobRecord, QueryDetails)> {
        self.store
            .load_query_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    // ------------------------------------------------------------------
    // Query execution and ingest
    // ------------------------------------------------------------------

    pub async fn run_query(&self, id: &JobId) -> Result<()> {
        let (job, details) = self.load_query(id).await?;
        if !self.start(id).await? {
            return Ok(());
        }
        info!(job_id = %id, table = %details.table_name, "Query started");

        let outcome = self.materialize(&job, &details).await;
        let result = self.finish_query(&job, &details, outcome).await;
        self.drop_uploads(&details).await;
        result
    }

    async fn materialize(&self, job: &JobRecord, details: &QueryDetails) -> Result<Materialized> {
        let adapter = &self.adapter;
        adapter
            .create_schema_if_not_exists(&details.schema_name)
            .await?;
        let sql = adapter.build_query(
            &details.schema_name,
            &details.table_name,
            &details.native_query,
            job.execution_duration,
            job.max_records,
        );

        let mut session = adapter.begin_query().await?;
        let pid = session.pid();
        if !self.store.set_execution(&job.id, &sql, pid).await? {
            return Ok(None);
        }
        debug!(job_id = %job.id, pid, "Executing");
        let executed = session.execute(&sql).await;
        // once the session is back in the pool its pid belongs to someone else
        self.store.clear_pid(&job.id).await?;
        drop(session);
        executed?;

        self.result_stats(&details.schema_name, &details.table_name)
            .await
            .map(Some)
    }

    async fn result_stats(&self, schema: &str, table: &str) -> Result<(TableStats, Vec<ColumnInfo>)> {
        let stats = self.adapter.fetch_stats(schema, table).await?;
        let columns = self.adapter.fetch_columns(schema, table).await?;
        Ok((stats, columns))
    }

    async fn finish_query(
        &self,
        job: &JobRecord,
        details: &QueryDetails,
        outcome: Result<Materialized>,
    ) -> Result<()> {
        match outcome {
            Ok(Some((stats, columns))) => {
                let mut metadata = details.metadata.clone();
                metadata.columns = columns;
                if self
                    .store
                    .complete_query_job(&job.id, stats.nrows, stats.size, &metadata)
                    .await?
                {
                    info!(job_id = %job.id, nrows = stats.nrows, size = stats.size, "Query completed");
                } else {
                    // aborted after the table was written
                    self.drop_result_table(details).await;
                }
                Ok(())
            }
            Ok(None) => {
                debug!(job_id = %job.id, "Aborted before execution");
                Ok(())
            }
            Err(JobError::Adapter(err)) if err.is_cancellation() => {
                self.store
                    .transition(&job.id, &[Phase::Executing], Phase::Aborted)
                    .await?;
                info!(job_id = %job.id, "Query aborted");
                Ok(())
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Query failed");
                self.store
                    .transition_with_summary(
                        &job.id,
                        &[Phase::Executing],
                        Phase::Error,
                        Some(GENERIC_ERROR_SUMMARY),
                    )
                    .await?;
                match err {
                    JobError::Adapter(_) => Ok(()),
                    other => Err(other),
                }
            }
        }
    }

    async fn drop_result_table(&self, details: &QueryDetails) {
        if let Err(err) = self
            .adapter
            .drop_table(&details.schema_name, &details.table_name)
            .await
        {
            warn!(table = %details.table_name, error = %err, "Could not drop result table");
        }
    }

    async fn drop_uploads(&self, details: &QueryDetails) {
        for table in details.uploads.keys() {
            if let Err(err) = self.adapter.drop_table(&self.config.upload_schema, table).await {
                warn!(table = %table, error = %err, "Could not drop upload table");
            }
        }
    }

    pub async fn run_ingest(&self, id: &JobId, file_path: &Path) -> Result<()> {
        let (job, details) = self.load_query(id).await?;
        if !self.start(id).await? {
            return Ok(());
        }
        info!(job_id = %id, file = %file_path.display(), "Ingest started");

        let outcome = self.ingest(&details, file_path).await;
        self.finish_query(&job, &details, outcome).await
    }

    async fn ingest(&self, details: &QueryDetails, file_path: &Path) -> Result<Materialized> {
        let path = file_path.to_path_buf();
        let (columns, rows) = tokio::task::spawn_blocking(move || read_csv(&path))
            .await
            .map_err(join_error)??;

        let schema = &details.schema_name;
        let table = &details.table_name;
        self.adapter.create_schema_if_not_exists(schema).await?;
        self.adapter.create_table(schema, table, &columns).await?;
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        self.adapter.insert_rows(schema, table, &names, &rows).await?;

        self.result_stats(schema, table).await.map(Some)
    }

    // ------------------------------------------------------------------
    // Download and archive files
    // ------------------------------------------------------------------

    async fn load_parent(&self, job: &JobRecord) -> Result<(JobRecord, QueryDetails)> {
        let parent_id = job
            .parent_id
            .as_ref()
            .ok_or_else(|| JobError::Corrupt(format!("job {} has no query job", job.id)))?;
        self.load_query(parent_id).await
    }

    pub async fn create_download_file(&self, id: &JobId) -> Result<()> {
        let (job, details) = self
            .store
            .load_download_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let (query_job, query_details) = self.load_parent(&job).await?;
        if !self.start(id).await? {
            return Ok(());
        }

        let outcome = self
            .write_download(&job, &details.format_key, &query_job, &query_details)
            .await;
        self.finish_file(&job, outcome).await
    }

    async fn write_download(
        &self,
        job: &JobRecord,
        format_key: &str,
        query_job: &JobRecord,
        query_details: &QueryDetails,
    ) -> Result<PathBuf> {
        let format = self
            .config
            .format(format_key)
            .ok_or_else(|| JobError::Corrupt(format!("unknown download format '{}'", format_key)))?;
        let path = download_file_path(&self.config, job.owner(), &query_details.table_name, format);

        let stream = ResultStream::spawn(
            &format.key,
            result_table_meta(&self.config, query_job, query_details),
            RowSource::Table {
                adapter: Arc::clone(&self.adapter),
                schema: query_details.schema_name.clone(),
                table: query_details.table_name.clone(),
                column_names: Vec::new(),
            },
        )?;
        write_stream(&path, stream).await?;
        Ok(path)
    }

    pub async fn create_archive_file(&self, id: &JobId) -> Result<()> {
        let (job, details) = self
            .store
            .load_archive_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let (_, query_details) = self.load_parent(&job).await?;
        if !self.start(id).await? {
            return Ok(());
        }

        let path = archive_file_path(
            &self.config,
            job.owner(),
            &query_details.table_name,
            &details.column_name,
        );
        let outcome = self.write_archive(&job, &details.files, path).await;
        self.finish_file(&job, outcome).await
    }

    async fn write_archive(&self, job: &JobRecord, files: &[String], path: PathBuf) -> Result<PathBuf> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            // files can disappear between process() and now
            let resolved = self
                .files
                .check_file(job.owner(), file)
                .ok_or_else(|| JobError::validation("files", FILES_NOT_FOUND))?;
            entries.push(ArchiveEntry::new(file, resolved));
        }

        let target = path.clone();
        tokio::task::spawn_blocking(move || packager::write_archive(&target, &entries))
            .await
            .map_err(join_error)??;
        Ok(path)
    }

    async fn finish_file(&self, job: &JobRecord, outcome: Result<PathBuf>) -> Result<()> {
        match outcome {
            Ok(path) => {
                self.store
                    .transition(&job.id, &[Phase::Executing], Phase::Completed)
                    .await?;
                info!(job_id = %job.id, kind = %job.job_type, path = %path.display(), "File written");
                Ok(())
            }
            Err(err) => {
                error!(job_id = %job.id, kind = %job.job_type, error = %err, "File job failed");
                self.store
                    .transition_with_summary(
                        &job.id,
                        &[Phase::Executing],
                        Phase::Error,
                        Some(GENERIC_ERROR_SUMMARY),
                    )
                    .await?;
                match err {
                    JobError::Adapter(_) | JobError::Stream(_) | JobError::Validation(_) => Ok(()),
                    other => Err(other),
                }
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for JobExecutor {
    async fn execute(&self, task: &Task) -> Result<()> {
        match task {
            Task::RunQuery { job_id } => self.run_query(job_id).await,
            Task::RunIngest { job_id, file_path } => {
                self.run_ingest(job_id, Path::new(file_path)).await
            }
            Task::CreateDownloadFile { job_id } => self.create_download_file(job_id).await,
            Task::CreateArchiveFile { job_id } => self.create_archive_file(job_id).await,
        }
    }
}

/// Header row as text columns, empty fields as NULL.
fn read_csv(path: &Path) -> io::Result<(Vec<ColumnInfo>, Vec<Row>)> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns: Vec<ColumnInfo> = reader
        .headers()?
        .iter()
        .map(|name| ColumnInfo::new(name.trim(), "char"))
        .collect();
    if columns.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "CSV file has no header"));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|value| {
                    if value.is_empty() {
                        DbValue::Null
                    } else {
                        DbValue::from(value)
                    }
                })
                .collect(),
        );
    }
    Ok((columns, rows))
}

/// Write the stream to `path` via a `.part` file renamed on success.
async fn write_stream(path: &Path, mut stream: ResultStream) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let written: Result<()> = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    match written {
        Ok(()) => {
            tokio::fs::rename(&partial, path).await?;
            Ok(())
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_csv_header_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.csv");
        std::fs::write(&path, "id, name\n1,alpha\n2,\n").unwrap();

        let (columns, rows) = read_csv(&path).unwrap();
        assert_eq!(columns[1].name, "name");
        assert_eq!(columns[1].datatype, "char");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], DbValue::from("alpha"));
        assert_eq!(rows[1][1], DbValue::Null);
    }

    #[test]
    fn test_read_csv_rejects_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "a,b\n1,2,3\n").unwrap();
        assert!(read_csv(&path).is_err());
    }
}
