//! Process-wide collaborators handed to every job operation.

use std::sync::Arc;

use quarry_db::DatabaseAdapter;

use crate::config::{DispatchMode, QueryConfig};
use crate::dispatch::{SqliteTaskQueue, TaskBackend, TaskDispatcher, TaskExecutor};
use crate::executor::JobExecutor;
use crate::files::{DirectoryFileAccess, FileAccess};
use crate::permissions::{GrantChecker, PermissionChecker};
use crate::processor::{NativeSqlProcessor, QueryProcessor};
use crate::store::JobStore;

#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<QueryConfig>,
    pub store: JobStore,
    pub adapter: Arc<dyn DatabaseAdapter>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub executor: Arc<JobExecutor>,
    pub processor: Arc<dyn QueryProcessor>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub files: Arc<dyn FileAccess>,
}

impl JobContext {
    /// Context with the stock processor, permission checker and file access,
    /// dispatching in the configured mode. Async mode uses the SQLite task
    /// queue in `store`.
    pub fn new(config: QueryConfig, store: JobStore, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        JobContextBuilder::new(config, store, adapter).build()
    }

    pub fn builder(
        config: QueryConfig,
        store: JobStore,
        adapter: Arc<dyn DatabaseAdapter>,
    ) -> JobContextBuilder {
        JobContextBuilder::new(config, store, adapter)
    }

    pub fn is_sync(&self) -> bool {
        self.dispatcher.mode() == DispatchMode::Sync
    }
}

pub struct JobContextBuilder {
    config: QueryConfig,
    store: JobStore,
    adapter: Arc<dyn DatabaseAdapter>,
    backend: Option<Arc<dyn TaskBackend>>,
    processor: Option<Arc<dyn QueryProcessor>>,
    permissions: Option<Arc<dyn PermissionChecker>>,
    files: Option<Arc<dyn FileAccess>>,
}

impl JobContextBuilder {
    pub fn new(config: QueryConfig, store: JobStore, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            config,
            store,
            adapter,
            backend: None,
            processor: None,
            permissions: None,
            files: None,
        }
    }

    pub fn backend(mut self, backend: Arc<dyn TaskBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn QueryProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn file_access(mut self, files: Arc<dyn FileAccess>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn build(self) -> JobContext {
        let config = Arc::new(self.config);
        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(NativeSqlProcessor::new()));
        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(GrantChecker::from_config(&config)));
        let files = self
            .files
            .unwrap_or_else(|| Arc::new(DirectoryFileAccess::from_config(&config)));

        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&config),
            self.store.clone(),
            Arc::clone(&self.adapter),
            Arc::clone(&files),
        ));

        let mode = config.dispatch.mode;
        let backend = match (mode, self.backend) {
            (_, Some(backend)) => Some(backend),
            (DispatchMode::Async, None) => {
                Some(Arc::new(SqliteTaskQueue::new(self.store.pool().clone())) as Arc<dyn TaskBackend>)
            }
            (DispatchMode::Sync, None) => None,
        };
        let dispatcher = Arc::new(TaskDispatcher::new(
            mode,
            backend,
            Some(Arc::clone(&executor) as Arc<dyn TaskExecutor>),
        ));

        JobContext {
            config,
            store: self.store,
            adapter: self.adapter,
            dispatcher,
            executor,
            processor,
            permissions,
            files,
        }
    }
}
