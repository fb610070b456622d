//! Shared setup for commands: configuration, the job store, the result
//! backend and the identity the command acts for.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use quarry_db::{DatabaseAdapter, MemoryAdapter};
use quarry_jobs::{JobContext, JobStore, QueryConfig};
use quarry_protocol::Identity;
use tracing::{info, warn};

/// Global options every command understands.
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub user: Option<String>,
    pub groups: Vec<String>,
}

impl GlobalArgs {
    /// `None` acts as the anonymous user.
    pub fn identity(&self) -> Option<Identity> {
        self.user
            .as_ref()
            .map(|user| Identity::new(user.as_str()).with_groups(self.groups.iter().cloned()))
    }
}

/// Load the configuration file, or the defaults when none was given.
pub fn load_config(path: Option<&Path>) -> Result<QueryConfig> {
    match path {
        Some(path) => QueryConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(QueryConfig::default()),
    }
}

/// Relative store paths live next to the configuration file, or under the
/// Quarry home directory.
fn resolve_store_path(config: &QueryConfig, config_path: Option<&Path>) -> PathBuf {
    let store_path = PathBuf::from(&config.store_path);
    if store_path.is_absolute() {
        return store_path;
    }
    match config_path.and_then(Path::parent) {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(store_path),
        _ => quarry_logging::quarry_home().join(store_path),
    }
}

async fn connect_adapter(config: &QueryConfig) -> Result<Arc<dyn DatabaseAdapter>> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let adapter = quarry_db::PostgresAdapter::connect(url)
                .await
                .context("Failed to connect to the result database")?;
            Ok(Arc::new(adapter))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("database_url is set but PostgreSQL support is not compiled in"),
        None => {
            warn!("No database_url configured, results are kept in memory for this process only");
            Ok(Arc::new(MemoryAdapter::new()))
        }
    }
}

/// Everything a command needs to work with jobs.
pub async fn open(args: &GlobalArgs) -> Result<JobContext> {
    let config = load_config(args.config.as_deref())?;
    let store_path = resolve_store_path(&config, args.config.as_deref());
    if let Some(parent) = store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = JobStore::open(&store_path)
        .await
        .with_context(|| format!("Failed to open job store at {}", store_path.display()))?;
    let adapter = connect_adapter(&config).await?;
    info!(mode = config.dispatch.mode.as_str(), "Job context ready");
    Ok(JobContext::new(config, store, adapter))
}

/// Multi-threaded runtime for a single command.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}
