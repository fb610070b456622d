//! Task dispatch.
//!
//! A [`TaskDispatcher`] either runs a task inline through a [`TaskExecutor`]
//! (sync mode, errors propagate to the caller) or hands it to a
//! [`TaskBackend`] under a task id equal to the job id, on a named queue and
//! with an optional priority (async mode).

pub mod queue;

use std::sync::Arc;

use async_trait::async_trait;
use quarry_protocol::JobId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DispatchMode;
use crate::error::JobError;

pub use queue::{ClaimedTask, SqliteTaskQueue, TaskQueueStats};

/// A unit of work for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    RunQuery { job_id: JobId },
    RunIngest { job_id: JobId, file_path: String },
    CreateDownloadFile { job_id: JobId },
    CreateArchiveFile { job_id: JobId },
}

impl Task {
    pub fn job_id(&self) -> &JobId {
        match self {
            Task::RunQuery { job_id }
            | Task::RunIngest { job_id, .. }
            | Task::CreateDownloadFile { job_id }
            | Task::CreateArchiveFile { job_id } => job_id,
        }
    }

    /// Task ids equal job ids, so a job can revoke its own task.
    pub fn task_id(&self) -> &str {
        self.job_id().as_str()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::RunQuery { .. } => "run_query",
            Task::RunIngest { .. } => "run_ingest",
            Task::CreateDownloadFile { .. } => "create_download_file",
            Task::CreateArchiveFile { .. } => "create_archive_file",
        }
    }
}

/// Where an async task goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub queue: String,
    pub priority: Option<i64>,
}

impl DispatchTarget {
    pub fn new(queue: impl Into<String>, priority: Option<i64>) -> Self {
        Self {
            queue: queue.into(),
            priority,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Task queue error: {0}")]
    Queue(#[from] sqlx::Error),

    #[error("Invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Task backend error: {0}")]
    Backend(String),

    #[error("No task backend configured")]
    NoBackend,

    #[error("No task executor configured")]
    NoExecutor,
}

/// Asynchronous task transport.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn submit_async(
        &self,
        task: &Task,
        queue: &str,
        priority: Option<i64>,
    ) -> Result<(), DispatchError>;

    /// Must succeed for unknown and already finished task ids.
    async fn revoke(&self, task_id: &str) -> Result<(), DispatchError>;
}

/// Runs tasks; used inline in sync mode and by workers.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<(), JobError>;
}

pub struct TaskDispatcher {
    mode: DispatchMode,
    backend: Option<Arc<dyn TaskBackend>>,
    executor: Option<Arc<dyn TaskExecutor>>,
}

impl TaskDispatcher {
    pub fn new(
        mode: DispatchMode,
        backend: Option<Arc<dyn TaskBackend>>,
        executor: Option<Arc<dyn TaskExecutor>>,
    ) -> Self {
        Self {
            mode,
            backend,
            executor,
        }
    }

    pub fn sync(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::new(DispatchMode::Sync, None, Some(executor))
    }

    pub fn asynchronous(backend: Arc<dyn TaskBackend>) -> Self {
        Self::new(DispatchMode::Async, Some(backend), None)
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub async fn submit(&self, task: Task, target: &DispatchTarget) -> Result<(), JobError> {
        match self.mode {
            DispatchMode::Sync => {
                info!(task = task.name(), task_id = task.task_id(), "Task submitted (sync)");
                self.submit_sync(&task).await
            }
            DispatchMode::Async => {
                info!(
                    task = task.name(),
                    task_id = task.task_id(),
                    queue = %target.queue,
                    priority = ?target.priority,
                    "Task submitted (async)"
                );
                let backend = self.backend.as_ref().ok_or(DispatchError::NoBackend)?;
                backend
                    .submit_async(&task, &target.queue, target.priority)
                    .await?;
                Ok(())
            }
        }
    }

    /// Run `task` inline; its errors are returned to the caller.
    pub async fn submit_sync(&self, task: &Task) -> Result<(), JobError> {
        let executor = self.executor.as_ref().ok_or(DispatchError::NoExecutor)?;
        executor.execute(task).await
    }

    /// Revoke by task id. Without a backend there is nothing queued to revoke.
    pub async fn revoke(&self, task_id: &str) -> Result<(), JobError> {
        match &self.backend {
            Some(backend) => {
                backend.revoke(task_id).await?;
                debug!(task_id, "Task revoked");
            }
            None => debug!(task_id, "No task backend, nothing to revoke"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        submitted: Mutex<Vec<(Task, String, Option<i64>)>>,
        revoked: Mutex<Vec<String>>,
        executed: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskBackend for Recording {
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

    #[async_trait]
    impl TaskExecutor for Recording {
        async fn execute(&self, task: &Task) -> Result<(), JobError> {
            self.executed.lock().unwrap().push(task.clone());
            match task {
                Task::RunIngest { .. } => Err(JobError::NotFound("upload".into())),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_task_id_is_job_id_and_payload_is_tagged() {
        let job_id = JobId::new();
        let task = Task::RunQuery {
            job_id: job_id.clone(),
        };
        assert_eq!(task.task_id(), job_id.as_str());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "run_query");
        assert_eq!(serde_json::from_value::<Task>(json).unwrap(), task);
    }

    #[tokio::test]
    async fn test_async_submit_uses_queue_and_priority() {
        let backend = Arc::new(Recording::default());
        let dispatcher = TaskDispatcher::asynchronous(backend.clone());
        let task = Task::RunQuery { job_id: JobId::new() };

        dispatcher
            .submit(task.clone(), &DispatchTarget::new("query", Some(1)))
            .await
            .unwrap();
        dispatcher.revoke(task.task_id()).await.unwrap();

        let submitted = backend.submitted.lock().unwrap().clone();
        assert_eq!(submitted, vec![(task.clone(), "query".to_string(), Some(1))]);
        assert_eq!(*backend.revoked.lock().unwrap(), vec![task.task_id().to_string()]);
    }

    #[tokio::test]
    async fn test_sync_submit_propagates_task_errors() {
        let executor = Arc::new(Recording::default());
        let dispatcher = TaskDispatcher::sync(executor.clone());

        let ok = Task::CreateDownloadFile { job_id: JobId::new() };
        dispatcher.submit(ok, &DispatchTarget::new("download", None)).await.unwrap();

        let failing = Task::RunIngest {
            job_id: JobId::new(),
            file_path: "missing.csv".into(),
        };
        let err = dispatcher
            .submit(failing, &DispatchTarget::new("download", None))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
        assert_eq!(executor.executed.lock().unwrap().len(), 2);

        // revoke without a backend is a no-op
        dispatcher.revoke("unknown").await.unwrap();
    }
}
