//! Archive jobs: the files referenced by one result column, bundled as a zip.

use std::path::PathBuf;

use async_trait::async_trait;
use quarry_db::RowFilter;
use quarry_protocol::defaults::DOWNLOAD_TASK_QUEUE;
use quarry_protocol::{display_name, Identity, JobId, JobType, Phase};
use tracing::debug;

use crate::config::QueryConfig;
use crate::context::JobContext;
use crate::dispatch::{DispatchTarget, Task};
use crate::download_job::completed_parent;
use crate::error::{JobError, Result};
use crate::lifecycle::{self, JobKind};
use crate::models::{ArchiveDetails, JobRecord};
use crate::store::JobStore;

pub const FILES_NOT_FOUND: &str = "One or more of the files cannot be found.";

/// `<download_dir>/<owner>/<table>.<column>.zip`
pub fn archive_file_path(
    config: &QueryConfig,
    owner: Option<&Identity>,
    table_name: &str,
    column_name: &str,
) -> PathBuf {
    config
        .download_dir
        .join(display_name(owner))
        .join(format!("{}.{}.zip", table_name, column_name))
}

#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub job: JobRecord,
    pub details: ArchiveDetails,
    table_name: Option<String>,
    ready: bool,
}

impl ArchiveJob {
    pub fn new(query_job: &JobRecord, column_name: impl Into<String>) -> Self {
        let mut job = JobRecord::new(JobType::Archive, query_job.owner.clone());
        job.parent_id = Some(query_job.id.clone());
        job.client_ip = query_job.client_ip.clone();
        Self {
            job,
            details: ArchiveDetails {
                column_name: column_name.into(),
                files: Vec::new(),
            },
            table_name: None,
            ready: false,
        }
    }

    pub async fn load(store: &JobStore, id: &JobId) -> Result<Self> {
        let (job, details) = store
            .load_archive_job(id)
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

    pub fn file_path(&self, config: &QueryConfig) -> Option<PathBuf> {
        let table_name = self.table_name.as_deref()?;
        Some(archive_file_path(
            config,
            self.job.owner(),
            table_name,
            &self.details.column_name,
        ))
    }

    pub async fn delete_file(&self, config: &QueryConfig) {
        if let Some(path) = self.file_path(config) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %err, "Archive file not removed");
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
impl JobKind for ArchiveJob {
    fn kind(&self) -> &'static str {
        "ArchiveJob"
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
            .ok_or_else(|| JobError::Contract("archive job without a query job".to_string()))?;
        let (parent, query) = completed_parent(&ctx.store, &parent_id).await?;

        let column_name = self.details.column_name.trim();
        if column_name.is_empty() {
            return Err(JobError::validation(
                "column_name",
                "This field may not be blank.",
            ));
        }
        if !query.metadata.has_column(column_name) {
            return Err(JobError::validation(
                "column_name",
                format!("Unknown column \"{}\".", column_name),
            ));
        }
        let column_name = column_name.to_string();

        let rows = ctx
            .adapter
            .fetch_rows(
                &query.schema_name,
                &query.table_name,
                std::slice::from_ref(&column_name),
                None,
                1,
                0,
                &RowFilter::default(),
            )
            .await?;

        let mut files = Vec::with_capacity(rows.len());
        for value in rows.into_iter().flatten() {
            let file = value
                .as_str()
                .map(str::to_string)
                .filter(|f| ctx.files.check_file(parent.owner(), f).is_some())
                .ok_or_else(|| JobError::validation("files", FILES_NOT_FOUND))?;
            files.push(file);
        }

        self.job.owner = parent.owner;
        self.details.column_name = column_name;
        self.details.files = files;
        self.table_name = Some(query.table_name);
        Ok(())
    }

    async fn save(&self, store: &JobStore) -> Result<bool> {
        store.save_archive_job(&self.job, &self.details).await
    }

    async fn reload(&mut self, store: &JobStore) -> Result<()> {
        if let Some((job, details)) = store.load_archive_job(&self.job.id).await? {
            self.job = job;
            self.details = details;
        }
        Ok(())
    }

    fn task(&self) -> Task {
        Task::CreateArchiveFile {
            job_id: self.job.id.clone(),
        }
    }

    fn dispatch_target(&self, _ctx: &JobContext) -> DispatchTarget {
        DispatchTarget::new(DOWNLOAD_TASK_QUEUE, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_file_path() {
        let config = QueryConfig::default();
        assert_eq!(
            archive_file_path(&config, Some(&Identity::new("alice")), "t1", "path"),
            PathBuf::from("downloads/alice/t1.path.zip")
        );
    }
}
