//! Shared setup for the integration tests: an in-memory result backend, an
//! in-memory job store and a task backend that only records what it gets.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quarry_db::memory::CannedResult;
use quarry_db::{ColumnInfo, DbValue, MemoryAdapter, Row};
use quarry_jobs::config::DirectoryConfig;
use quarry_jobs::dispatch::{DispatchError, Task, TaskBackend};
use quarry_jobs::{DispatchMode, JobContext, JobStore, QueryConfig, QueryJob};
use quarry_protocol::{AccessLevel, Identity, Phase};
use tempfile::TempDir;

pub const GAIA_QUERY: &str = "SELECT * FROM gaia.dr3";

pub fn gaia_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("source_id", "long"),
        ColumnInfo::new("ra", "double"),
        ColumnInfo::new("path", "char"),
    ]
}

pub fn gaia_rows() -> Vec<Row> {
    vec![
        vec![DbValue::from(1i64), DbValue::Real(10.5), DbValue::from("a.fits")],
        vec![DbValue::from(2i64), DbValue::Real(20.25), DbValue::from("b.fits")],
        vec![DbValue::from(3i64), DbValue::Real(30.0), DbValue::from("c.fits")],
    ]
}

pub fn alice() -> Identity {
    Identity::new("alice")
}

pub const ALICE_SCHEMA: &str = "quarry_user_alice";

#[derive(Default)]
pub struct RecordingBackend {
    submitted: Mutex<Vec<(Task, String, Option<i64>)>>,
    revoked: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn submitted(&self) -> Vec<(Task, String, Option<i64>)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskBackend for RecordingBackend {
    async fn submit_async(
        &self,
        task: &Task,
        queue: &str,
        priority: Option<i64>,
    ) -> Result<(), DispatchError> {
        self.submitted
            .lock()
            .unwrap()
            .push((task.clone(), queue.to_string(), priority));
        Ok(())
    }

    async fn revoke(&self, task_id: &str) -> Result<(), DispatchError> {
        self.revoked.lock().unwrap().push(task_id.to_string());
        Ok(())
    }
}

/// How async tasks leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Nothing (sync mode) or the built-in SQLite task queue (async mode)
    Default,
    Recording,
}

pub struct Harness {
    pub ctx: JobContext,
    pub adapter: MemoryAdapter,
    pub backend: Arc<RecordingBackend>,
    pub dir: TempDir,
}

pub fn base_config(mode: DispatchMode, dir: &Path) -> QueryConfig {
    let mut config = QueryConfig::default();
    config.dispatch.mode = mode;
    config.permissions.public_schemas = vec!["gaia".to_string()];
    config.download_dir = dir.join("downloads");
    config.directories = vec![DirectoryConfig {
        path: dir.join("files"),
        access_level: AccessLevel::Public,
        groups: vec![],
    }];
    config
}

pub async fn harness(mode: DispatchMode) -> Harness {
    let backend = match mode {
        DispatchMode::Sync => Backend::Default,
        DispatchMode::Async => Backend::Recording,
    };
    harness_with(mode, MemoryAdapter::new(), backend, |_| {}).await
}

pub async fn harness_with(
    mode: DispatchMode,
    adapter: MemoryAdapter,
    backend: Backend,
    configure: impl FnOnce(&mut QueryConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("files")).unwrap();
    let mut config = base_config(mode, dir.path());
    configure(&mut config);

    adapter.set_result(GAIA_QUERY, CannedResult::rows(gaia_columns(), gaia_rows()));

    let store = JobStore::open_in_memory().await.unwrap();
    let recording = Arc::new(RecordingBackend::default());
    let mut builder = JobContext::builder(config, store, Arc::new(adapter.clone()));
    if backend == Backend::Recording {
        builder = builder.backend(recording.clone());
    }

    Harness {
        ctx: builder.build(),
        adapter,
        backend: recording,
        dir,
    }
}

impl Harness {
    /// A processed job for alice over the gaia table.
    pub async fn processed_job(&self, table_name: &str) -> QueryJob {
        let mut job = QueryJob::new(Some(alice()), GAIA_QUERY)
            .with_language("postgresql")
            .with_table_name(table_name);
        job.process(&self.ctx).await.unwrap();
        job
    }

    /// A job that ran to completion (sync harnesses only).
    pub async fn completed_job(&self, table_name: &str) -> QueryJob {
        let mut job = self.processed_job(table_name).await;
        job.run(&self.ctx).await.unwrap();
        assert_eq!(job.phase(), Phase::Completed);
        job
    }

    pub async fn stored_phase(&self, job: &QueryJob) -> Phase {
        self.ctx.store.phase(job.id()).await.unwrap().unwrap()
    }

    pub fn write_file(&self, name: &str, content: &str) -> std::path::PathBuf {
        let path = self.dir.path().join("files").join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}
