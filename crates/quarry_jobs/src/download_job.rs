//! Download jobs: a query result written to a file in a download format.

use std::path::PathBuf;

use async_trait::async_trait;
use quarry_protocol::defaults::DOWNLOAD_TASK_QUEUE;
use quarry_protocol::{display_name, Identity, JobId, JobType, Phase};
use tracing::debug;

use crate::config::{FormatConfig, QueryConfig};
use crate::context::JobContext;
use crate::dispatch::{DispatchTarget, Task};
use crate::error::{JobError, Result};
use crate::lifecycle::{self, JobKind, NOT_COMPLETED};
use crate::models::{DownloadDetails, JobRecord, QueryDetails};
use crate::store::JobStore;

/// `<download_dir>/<owner>/<table>.<extension>`
pub fn download_file_path(
    config: &QueryConfig,
    owner: Option<&Identity>,
    table_name: &str,
    format: &FormatConfig,
) -> PathBuf {
    config
        .download_dir
        .join(display_name(owner))
        .join(format!("{}.{}", table_name, format.extension))
}

/// Load the parent query job and require it to be COMPLETED.
pub(crate) async fn completed_parent(
    store: &JobStore,
    parent_id: &JobId,
) -> Result<(JobRecord, QueryDetails)> {
    let (parent, details) = store
        .load_query_job(parent_id)
        .await?
        .ok_or_else(|| JobError::NotFound(parent_id.to_string()))?;
    if parent.phase != Phase::Completed {
        return Err(JobError::validation("phase", NOT_COMPLETED));
    }
    Ok((parent, details))
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub job: JobRecord,
    pub details: DownloadDetails,
    /// Result table of the query job, known after `process()`
    table_name: Option<String>,
    ready: bool,
}

impl DownloadJob {
    /// A download of `query_job`'s result. The owner is the query job's owner.
    pub fn new(query_job: &JobRecord, format_key: impl Into<String>) -> Self {
        let mut job = JobRecord::new(JobType::Download, query_job.owner.clone());
        job.parent_id = Some(query_job.id.clone());
        job.client_ip = query_job.client_ip.clone();
        Self {
            job,
            details: DownloadDetails {
                format_key: format_key.into(),
            },
            table_name: None,
            ready: false,
        }
    }

    pub async fn load(store: &JobStore, id: &JobId) -> Result<Self> {
        let (job, details) = store
            .load_download_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let table_name = match &job.parent_id {
            Some(parent_id) => store
                .load_query_job(parent_id)
                .await?
                .map(|(_, parent)| parent.table_name),
            None => None,
        };
        Ok(Self {
            job,
            details,
            table_name,
            ready: false,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn phase(&self) -> Phase {
        self.job.phase
    }

    /// Where the file is (or will be) written.
    pub fn file_path(&self, config: &QueryConfig) -> Option<PathBuf> {
        let format = config.format(&self.details.format_key)?;
        let table_name = self.table_name.as_deref()?;
        Some(download_file_path(config, self.job.owner(), table_name, format))
    }

    /// Remove the written file if there is one.
    pub async fn delete_file(&self, config: &QueryConfig) {
        if let Some(path) = self.file_path(config) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %err, "Download file not removed");
            }
        }
    }

    pub async fn process(&mut self, ctx: &JobContext) -> Result<()> {
        lifecycle::process(self, ctx).await
    }

    pub async fn run(&mut self, ctx: &JobContext) -> Result<()> {
        lifecycle::run(self, ctx).await
    }

    pub async fn abort(&mut self, ctx: &JobContext) -> Result<()> {
        lifecycle::abort(self, ctx).await
    }
}

#[async_trait]
impl JobKind for DownloadJob {
    fn kind(&self) -> &'static str {
        "DownloadJob"
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
        let parent_id = self
            .job
            .parent_id
            .clone()
            .ok_or_else(|| JobError::Contract("download job without a query job".to_string()))?;
        let (parent, details) = completed_parent(&ctx.store, &parent_id).await?;

        if ctx.config.format(&self.details.format_key).is_none() {
            return Err(JobError::validation(
                "format_key",
                format!("Unknown format \"{}\".", self.details.format_key),
            ));
        }

        self.job.owner = parent.owner;
        self.table_name = Some(details.table_name);
        Ok(())
    }

    async fn save(&self, store: &JobStore) -> Result<bool> {
        store.save_download_job(&self.job, &self.details).await
    }

    async fn reload(&mut self, store: &JobStore) -> Result<()> {
        if let Some((job, details)) = store.load_download_job(&self.job.id).await? {
            self.job = job;
            self.details = details;
        }
        Ok(())
    }

    fn task(&self) -> Task {
        Task::CreateDownloadFile {
            job_id: self.job.id.clone(),
        }
    }

    fn dispatch_target(&self, _ctx: &JobContext) -> DispatchTarget {
        DispatchTarget::new(DOWNLOAD_TASK_QUEUE, None)
    }
}
