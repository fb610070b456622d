//! Query jobs: preparation, submission, results and cleanup.

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use quarry_db::{DbValue, Row, RowFilter};
use quarry_protocol::defaults::{DEFAULT_TIMEOUT_SECS, DOWNLOAD_TASK_QUEUE, QUERY_TASK_QUEUE};
use quarry_protocol::{Identity, JobId, JobType, Phase};
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::admission::{check_active_jobs, check_quota};
use crate::archive_job::archive_file_path;
use crate::config::QueryConfig;
use crate::context::JobContext;
use crate::dispatch::{DispatchTarget, Task};
use crate::download_job::download_file_path;
use crate::error::{JobError, Result, ValidationErrors};
use crate::lifecycle::{self, JobKind, NOT_COMPLETED, NOT_PENDING};
use crate::models::{JobRecord, QueryDetails, QueryMetadata, StatsRecord};
use crate::store::JobStore;
use crate::streamer::{DownloadFormatter, ResultStream, RowSource, StreamError, TableMeta};

const TABLE_NAME_MAX_LEN: usize = 256;
const TABLE_NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Terminal phases of query jobs.
pub const QUERY_TERMINAL_PHASES: &[Phase] =
    &[Phase::Completed, Phase::Error, Phase::Aborted, Phase::Archived];

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("table name pattern is valid"))
}

/// `OK`, or `OVERFLOW` when the result was capped by `max_records`.
pub fn result_status(job: &JobRecord) -> &'static str {
    if job.max_records.is_none() {
        "OK"
    } else {
        "OVERFLOW"
    }
}

/// Header information of a stored result table.
pub(crate) fn result_table_meta(config: &QueryConfig, job: &JobRecord, details: &QueryDetails) -> TableMeta {
    let formatter = DownloadFormatter::new(config.metadata_base_url.clone());
    let sources = details.metadata.sources();
    TableMeta {
        table_name: formatter.table_name(&details.schema_name, &details.table_name),
        columns: details.metadata.columns.clone(),
        infos: formatter.infos(
            result_status(job),
            &details.query,
            &details.query_language,
            &sources,
        ),
        links: formatter.links(&sources),
    }
}

/// Result of [`QueryJob::rows`].
#[derive(Debug, Clone, PartialEq)]
pub enum RowPage {
    /// One requested column: its values.
    Values(Vec<DbValue>),
    /// Several columns: one tuple per row.
    Rows(Vec<Row>),
}

impl RowPage {
    pub fn len(&self) -> usize {
        match self {
            RowPage::Values(values) => values.len(),
            RowPage::Rows(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct QueryJob {
    pub job: JobRecord,
    pub details: QueryDetails,
    upload: bool,
    ingest_file: Option<String>,
    ready: bool,
}

impl QueryJob {
    /// A new PENDING query job. Empty `query_language`, `queue`, and
    /// `table_name` are filled in by [`QueryJob::process`].
    pub fn new(owner: Option<Identity>, query: impl Into<String>) -> Self {
        let details = QueryDetails {
            query: query.into(),
            ..QueryDetails::default()
        };
        Self {
            job: JobRecord::new(JobType::Query, owner),
            details,
            upload: false,
            ingest_file: None,
            ready: false,
        }
    }

    /// A job whose result table is loaded from a file by [`QueryJob::ingest`].
    pub fn for_upload(owner: Option<Identity>, table_name: impl Into<String>) -> Self {
        let mut job = Self::new(owner, "");
        job.details.table_name = table_name.into();
        job.upload = true;
        job
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.details.query_language = language.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.details.queue = queue.into();
        self
    }

    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.details.schema_name = schema_name.into();
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.details.table_name = table_name.into();
        self
    }

    pub fn with_response_format(mut self, format_key: impl Into<String>) -> Self {
        self.job.response_format = Some(format_key.into());
        self
    }

    pub fn with_max_records(mut self, max_records: i64) -> Self {
        self.job.max_records = Some(max_records);
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.job.client_ip = Some(client_ip.into());
        self
    }

    /// Upload tables (in the upload schema) the query reads from.
    pub fn with_uploads(mut self, uploads: impl IntoIterator<Item = (String, String)>) -> Self {
        self.details.uploads = uploads.into_iter().collect();
        self
    }

    pub async fn load(store: &JobStore, id: &JobId) -> Result<Self> {
        let (job, details) = store
            .load_query_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok(Self {
            job,
            details,
            upload: false,
            ingest_file: None,
            ready: false,
        })
    }

    /// The owner's query jobs, newest first.
    pub async fn list(store: &JobStore, owner: Option<&Identity>, limit: i64) -> Result<Vec<Self>> {
        let jobs = store
            .list_query_jobs(owner.map(|o| o.username.as_str()), limit)
            .await?;
        Ok(jobs
            .into_iter()
            .map(|(job, details)| Self {
                job,
                details,
                upload: false,
                ingest_file: None,
                ready: false,
            })
            .collect())
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn phase(&self) -> Phase {
        self.job.phase
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.details.metadata.column_names()
    }

    pub fn columns(&self) -> &[quarry_db::ColumnInfo] {
        &self.details.metadata.columns
    }

    /// Execution budget of the job's queue, the default without a queue.
    pub fn timeout(&self, config: &QueryConfig) -> f64 {
        config
            .queue(&self.details.queue)
            .map(|q| q.timeout)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    pub fn priority(&self, config: &QueryConfig) -> Option<i64> {
        config.queue(&self.details.queue).map(|q| q.priority)
    }

    pub fn result_status(&self) -> &'static str {
        result_status(&self.job)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn process(&mut self, ctx: &JobContext) -> Result<()> {
        lifecycle::process(self, ctx).await
    }

    pub async fn save(&self, store: &JobStore) -> Result<bool> {
        store.save_query_job(&self.job, &self.details).await
    }

    pub async fn run(&mut self, ctx: &JobContext) -> Result<()> {
        if self.upload {
            return Err(JobError::Contract(
                "upload jobs are submitted with ingest()".to_string(),
            ));
        }
        lifecycle::run(self, ctx).await
    }

    /// Submit an upload job: `file_path` is loaded into the result table.
    pub async fn ingest(&mut self, ctx: &JobContext, file_path: &Path) -> Result<()> {
        if !self.upload {
            return Err(JobError::Contract(
                "only upload jobs can ingest files".to_string(),
            ));
        }
        if self.job.phase != Phase::Pending {
            return Err(JobError::validation("phase", NOT_PENDING));
        }

        let limit = ctx.config.upload_limit_for(self.job.owner());
        let size = tokio::fs::metadata(file_path).await?.len();
        if !limit.is_unlimited() && size > limit.get() {
            return Err(JobError::validation(
                "file",
                "The file exceeds the upload limit.",
            ));
        }

        self.ingest_file = Some(file_path.to_string_lossy().into_owned());
        lifecycle::run(self, ctx).await
    }

    pub async fn abort(&mut self, ctx: &JobContext) -> Result<()> {
        lifecycle::abort(self, ctx).await
    }

    /// Abort, drop the result and upload tables, and forget the result size.
    /// Safe to call repeatedly.
    pub async fn archive(&mut self, ctx: &JobContext) -> Result<()> {
        self.abort(ctx).await?;
        ctx.adapter
            .drop_table(&self.details.schema_name, &self.details.table_name)
            .await?;
        self.drop_uploads(ctx).await?;
        ctx.store.archive_query_job(&self.job.id).await?;

        self.job.phase = Phase::Archived;
        self.details.nrows = None;
        self.details.size = None;
        info!(job_id = %self.job.id, "Job archived");
        Ok(())
    }

    pub async fn drop_uploads(&self, ctx: &JobContext) -> Result<()> {
        for table in self.details.uploads.keys() {
            ctx.adapter.drop_table(&ctx.config.upload_schema, table).await?;
        }
        Ok(())
    }

    /// Rename the result table.
    pub async fn rename_table(&mut self, ctx: &JobContext, new_table_name: &str) -> Result<()> {
        if self.details.table_name == new_table_name {
            return Ok(());
        }
        validate_table_name(new_table_name)?;
        if ctx
            .store
            .table_name_in_use(&self.details.schema_name, new_table_name, Some(&self.job.id))
            .await?
        {
            return Err(JobError::validation("table_name", TABLE_NAME_IN_USE));
        }

        let Some(phase) = ctx.store.phase(&self.job.id).await? else {
            // not stored yet, run() writes the new name
            self.details.table_name = new_table_name.to_string();
            self.details.metadata.name = Some(new_table_name.to_string());
            return Ok(());
        };
        self.job.phase = phase;
        if matches!(phase, Phase::Queued | Phase::Executing) {
            return Err(JobError::validation("phase", RENAME_WHILE_ACTIVE));
        }

        if phase == Phase::Completed {
            ctx.adapter
                .rename_table(&self.details.schema_name, &self.details.table_name, new_table_name)
                .await?;
        }
        if !ctx
            .store
            .rename_query_table(&self.job.id, phase, new_table_name)
            .await?
        {
            return Err(JobError::validation("phase", RENAME_WHILE_ACTIVE));
        }
        info!(job_id = %self.job.id, from = %self.details.table_name, to = new_table_name, "Table renamed");
        self.details.table_name = new_table_name.to_string();
        self.details.metadata.name = Some(new_table_name.to_string());
        Ok(())
    }

    /// Archive the job, then delete it with its download and archive jobs.
    /// Files of those jobs are removed when present.
    pub async fn delete(mut self, ctx: &JobContext) -> Result<()> {
        if self.job.phase != Phase::Archived {
            self.archive(ctx).await?;
        }

        for (child_id, job_type) in ctx.store.children(&self.job.id).await? {
            let path = match job_type {
                JobType::Download => ctx
                    .store
                    .load_download_job(&child_id)
                    .await?
                    .and_then(|(child, details)| {
                        ctx.config.format(&details.format_key).map(|format| {
                            download_file_path(
                                &ctx.config,
                                child.owner(),
                                &self.details.table_name,
                                format,
                            )
                        })
                    }),
                JobType::Archive => ctx.store.load_archive_job(&child_id).await?.map(
                    |(child, details)| {
                        archive_file_path(
                            &ctx.config,
                            child.owner(),
                            &self.details.table_name,
                            &details.column_name,
                        )
                    },
                ),
                JobType::Query => None,
            };
            if let Some(path) = path {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %err, "File not removed");
                }
            }
        }

        ctx.store.delete_job(&self.job.id).await?;
        info!(job_id = %self.job.id, "Job deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    fn require_completed(&self) -> Result<()> {
        if self.job.phase != Phase::Completed {
            return Err(JobError::validation("phase", NOT_COMPLETED));
        }
        Ok(())
    }

    /// Total row count and one page of the result table.
    ///
    /// Every unknown column is reported, keyed by its name. A result table
    /// that vanished from the backend reads as empty.
    pub async fn rows(
        &self,
        ctx: &JobContext,
        column_names: &[String],
        ordering: Option<&str>,
        page: u64,
        page_size: u64,
        filter: &RowFilter,
    ) -> Result<(u64, RowPage)> {
        self.require_completed()?;

        let mut errors = ValidationErrors::new();
        for name in column_names {
            if !self.details.metadata.has_column(name) {
                errors.add(name.as_str(), "Column not found.");
            }
        }
        errors.into_result()?;

        let column_names: Vec<String> = if column_names.is_empty() {
            self.column_names().into_iter().map(str::to_string).collect()
        } else {
            column_names.to_vec()
        };
        let flatten = column_names.len() == 1;
        let empty = || {
            if flatten {
                RowPage::Values(Vec::new())
            } else {
                RowPage::Rows(Vec::new())
            }
        };

        let schema = &self.details.schema_name;
        let table = &self.details.table_name;
        let count = match ctx.adapter.count_rows(schema, table, &column_names, filter).await {
            Ok(count) => count,
            Err(err) if err.is_programming() => return Ok((0, empty())),
            Err(err) => return Err(err.into()),
        };
        let rows = match ctx
            .adapter
            .fetch_rows(schema, table, &column_names, ordering, page, page_size, filter)
            .await
        {
            Ok(rows) => rows,
            Err(err) if err.is_programming() => return Ok((0, empty())),
            Err(err) => return Err(err.into()),
        };

        let page = if flatten {
            RowPage::Values(rows.into_iter().flatten().collect())
        } else {
            RowPage::Rows(rows)
        };
        Ok((count, page))
    }

    /// Lazily encode the result table in `format_key`.
    pub fn stream(&self, ctx: &JobContext, format_key: &str) -> Result<ResultStream> {
        self.require_completed()?;
        if ctx.config.format(format_key).is_none() {
            return Err(JobError::validation(
                "format_key",
                format!("Unknown format \"{}\".", format_key),
            ));
        }

        ResultStream::spawn(
            format_key,
            result_table_meta(&ctx.config, &self.job, &self.details),
            RowSource::Table {
                adapter: ctx.adapter.clone(),
                schema: self.details.schema_name.clone(),
                table: self.details.table_name.clone(),
                column_names: Vec::new(),
            },
        )
        .map_err(|err| match err {
            StreamError::UnknownFormat(key) => {
                JobError::validation("format_key", format!("Unknown format \"{}\".", key))
            }
            other => other.into(),
        })
    }

    /// Execute the query synchronously and stream its rows without creating
    /// a result table. Backend failures arrive as an error item in the stream.
    pub async fn run_sync(&mut self, ctx: &JobContext) -> Result<ResultStream> {
        if !self.ready {
            return Err(JobError::not_processed(self.kind()));
        }

        self.details.actual_query = ctx.adapter.build_sync_query(
            &self.details.native_query,
            ctx.config.sync_timeout,
            self.job.max_records,
        );
        self.record_stats(ctx, None).await?;

        let format_key = self
            .job
            .response_format
            .clone()
            .unwrap_or_else(|| ctx.config.default_download_format.clone());
        let stream = ResultStream::spawn(
            &format_key,
            result_table_meta(&ctx.config, &self.job, &self.details),
            RowSource::Statement {
                adapter: ctx.adapter.clone(),
                sql: self.details.actual_query.clone(),
            },
        )?;
        Ok(stream)
    }

    async fn record_stats(&self, ctx: &JobContext, job_id: Option<&JobId>) -> Result<()> {
        let record = StatsRecord {
            time: Utc::now(),
            resource_type: "QUERY".to_string(),
            resource: json!({
                "job_id": job_id.map(|id| id.as_str()),
                "job_type": self.job.job_type.as_str(),
                "query": self.details.query,
                "query_language": self.details.query_language,
                "sources": self.details.metadata.sources(),
            }),
            client_ip: self.job.client_ip.clone(),
            user: self.job.owner.as_ref().map(|o| o.username.clone()),
        };
        ctx.store.insert_record(&record).await
    }

    // ------------------------------------------------------------------
    // Preparation steps
    // ------------------------------------------------------------------

    fn process_schema_name(&mut self, config: &QueryConfig) -> Result<()> {
        let user_schema = config.user_schema(self.job.owner());
        if !self.details.schema_name.is_empty() && self.details.schema_name != user_schema {
            return Err(JobError::validation(
                "schema_name",
                format!("Only the schema \"{}\" can be used.", user_schema),
            ));
        }
        self.details.schema_name = user_schema;
        Ok(())
    }

    async fn process_table_name(&mut self, store: &JobStore) -> Result<()> {
        let schema = &self.details.schema_name;
        if self.details.table_name.is_empty() {
            let base = Utc::now().format(TABLE_NAME_FORMAT).to_string();
            let mut candidate = base.clone();
            let mut suffix = 1;
            while store
                .table_name_in_use(schema, &candidate, Some(&self.job.id))
                .await?
            {
                suffix += 1;
                candidate = format!("{}_{}", base, suffix);
            }
            self.details.table_name = candidate;
            return Ok(());
        }

        validate_table_name(&self.details.table_name)?;
        if store
            .table_name_in_use(schema, &self.details.table_name, Some(&self.job.id))
            .await?
        {
            return Err(JobError::validation("table_name", TABLE_NAME_IN_USE));
        }
        Ok(())
    }

    fn process_response_format(&self, config: &QueryConfig) -> Result<()> {
        match self.job.response_format.as_deref() {
            Some(key) if config.format(key).is_none() => Err(JobError::validation(
                "response_format",
                format!("Unknown response format \"{}\".", key),
            )),
            _ => Ok(()),
        }
    }

    fn process_queue(&mut self, config: &QueryConfig) -> Result<()> {
        let permitted = config.permitted_queues(self.job.owner());
        let queue = if self.details.queue.is_empty() {
            permitted.first().copied()
        } else {
            permitted
                .iter()
                .copied()
                .find(|q| q.key == self.details.queue)
        };
        let queue = queue.ok_or_else(|| {
            JobError::validation(
                "queue",
                format!("Queue \"{}\" is not available.", self.details.queue),
            )
        })?;

        self.details.queue = queue.key.clone();
        self.job.execution_duration = queue.timeout;
        Ok(())
    }

    fn process_query_language(&mut self, config: &QueryConfig) -> Result<()> {
        let language = if self.details.query_language.is_empty() {
            config.languages.first()
        } else {
            config.language(&self.details.query_language)
        };
        let language = language.ok_or_else(|| {
            JobError::validation(
                "query_language",
                format!(
                    "Query language \"{}\" is not supported.",
                    self.details.query_language
                ),
            )
        })?;

        self.details.query_language = match &language.version {
            Some(version) => format!("{}-{}", language.key, version),
            None => language.key.clone(),
        };
        Ok(())
    }
}

const TABLE_NAME_IN_USE: &str = "A job with this table name already exists.";
const RENAME_WHILE_ACTIVE: &str = "The table of a queued or running job cannot be renamed.";

fn validate_table_name(table_name: &str) -> Result<()> {
    if table_name.len() > TABLE_NAME_MAX_LEN {
        return Err(JobError::validation(
            "table_name",
            format!("Ensure this field has no more than {} characters.", TABLE_NAME_MAX_LEN),
        ));
    }
    if !table_name_pattern().is_match(table_name) {
        return Err(JobError::validation(
            "table_name",
            "Only letters, digits, hyphens and underscores are allowed.",
        ));
    }
    Ok(())
}

#[async_trait]
impl JobKind for QueryJob {
    fn kind(&self) -> &'static str {
        "QueryJob"
    }

    fn record(&self) -> &JobRecord {
        &self.job
    }

    fn record_mut(&mut self) -> &mut JobRecord {
        &mut self.job
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    async fn prepare(&mut self, ctx: &JobContext) -> Result<()> {
        info!(
            target: "query",
            "\"{}\" {} {}",
            self.details.query,
            self.details.query_language,
            self.job.owner_name()
        );

        check_quota(&ctx.config, &ctx.store, self.job.owner()).await?;
        check_active_jobs(&ctx.config, &ctx.store, self.job.owner()).await?;

        self.process_schema_name(&ctx.config)?;
        self.process_table_name(&ctx.store).await?;
        self.process_response_format(&ctx.config)?;

        if self.upload {
            self.details.query.clear();
            self.details.query_language.clear();
            self.details.queue.clear();
            self.job.execution_duration = 0.0;
            return Ok(());
        }

        self.process_query_language(&ctx.config)?;
        self.process_queue(&ctx.config)?;

        debug!(query = %self.details.query, "Translating");
        let translated = ctx
            .processor
            .translate(&self.details.query_language, &self.details.query)
            .map_err(ValidationErrors::from)?;
        debug!(translated_query = %translated);

        let processed = ctx
            .processor
            .process(&translated)
            .map_err(ValidationErrors::from)?;
        debug!(
            native_query = %processed.query,
            keywords = ?processed.keywords,
            tables = ?processed.tables,
            columns = ?processed.columns,
            functions = ?processed.functions,
            "Processed query"
        );

        let messages = ctx.permissions.check(
            self.job.owner(),
            &processed.keywords,
            &processed.tables,
            &processed.columns,
            &processed.functions,
        );
        if !messages.is_empty() {
            let mut errors = ValidationErrors::new();
            errors.extend("query", messages);
            return Err(errors.into());
        }

        self.details.metadata = QueryMetadata {
            display_columns: processed.display_columns,
            tables: processed.tables,
            ..QueryMetadata::default()
        };
        self.details.native_query = processed.query.trim_end_matches(';').to_string();
        Ok(())
    }

    async fn save(&self, store: &JobStore) -> Result<bool> {
        QueryJob::save(self, store).await
    }

    async fn reload(&mut self, store: &JobStore) -> Result<()> {
        if let Some((job, details)) = store.load_query_job(&self.job.id).await? {
            self.job = job;
            self.details = details;
        }
        Ok(())
    }

    fn task(&self) -> Task {
        let job_id = self.job.id.clone();
        match &self.ingest_file {
            Some(file_path) => Task::RunIngest {
                job_id,
                file_path: file_path.clone(),
            },
            None => Task::RunQuery { job_id },
        }
    }

    fn dispatch_target(&self, ctx: &JobContext) -> DispatchTarget {
        if self.upload {
            DispatchTarget::new(DOWNLOAD_TASK_QUEUE, None)
        } else {
            DispatchTarget::new(QUERY_TASK_QUEUE, self.priority(&ctx.config))
        }
    }

    fn terminal_phases(&self) -> &'static [Phase] {
        QUERY_TERMINAL_PHASES
    }

    async fn before_dispatch(&self, ctx: &JobContext) -> Result<()> {
        if self.upload {
            return Ok(());
        }
        info!(
            job_id = %self.job.id,
            queue = %self.details.queue,
            priority = ?self.priority(&ctx.config),
            "Query job submitted"
        );
        if let Err(err) = self.record_stats(ctx, Some(&self.job.id)).await {
            warn!(job_id = %self.job.id, error = %err, "Could not write stats record");
        }
        Ok(())
    }
}
