//! Logging setup for Quarry binaries.
//!
//! Three sinks: the application log, a query audit log and stderr. The audit
//! log only receives events whose tracing target is [`QUERY_LOG_TARGET`],
//! which query jobs use for every query they prepare.
//!
//! Both files roll daily and are written from a background thread. Keep the
//! returned [`LogGuard`] alive until the process exits or buffered lines are
//! lost.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Tracing target of the query audit log.
pub const QUERY_LOG_TARGET: &str = "query";

const DEFAULT_LOG_FILTER: &str = "quarry=info,quarry_jobs=info,quarry_db=info";
const QUERY_LOG_PREFIX: &str = "query";
/// Days of history kept per log.
const KEEP_LOG_FILES: usize = 14;

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Overrides `logs_dir()`.
    pub log_dir: Option<PathBuf>,
}

/// Flushes both log files when dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _app: WorkerGuard,
    _query: WorkerGuard,
}

struct FileWriters {
    app: NonBlocking,
    query: NonBlocking,
    guard: LogGuard,
}

fn daily_appender(dir: &Path, prefix: &str) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(KEEP_LOG_FILES)
        .build(dir)
        .with_context(|| format!("Failed to open {} log in {}", prefix, dir.display()))
}

fn file_writers(dir: &Path, app_name: &str) -> Result<FileWriters> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let (app, app_guard) = tracing_appender::non_blocking(daily_appender(dir, &sanitize_name(app_name))?);
    let (query, query_guard) = tracing_appender::non_blocking(daily_appender(dir, QUERY_LOG_PREFIX)?);
    Ok(FileWriters {
        app,
        query,
        guard: LogGuard {
            _app: app_guard,
            _query: query_guard,
        },
    })
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// The two file layers. Audit events go only to the query log.
fn file_layers<S>(app: NonBlocking, query: NonBlocking) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    let audit_only = Targets::new().with_target(QUERY_LOG_TARGET, tracing::Level::INFO);
    let app_layer = tracing_subscriber::fmt::layer()
        .with_writer(app)
        .with_ansi(false)
        .with_filter(env_filter());
    let query_layer = tracing_subscriber::fmt::layer()
        .with_writer(query)
        .with_ansi(false)
        .with_target(false)
        .with_filter(audit_only);
    app_layer.and_then(query_layer)
}

/// Install the global subscriber.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogGuard> {
    let dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir(),
    };
    let writers = file_writers(&dir, config.app_name)?;

    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        env_filter()
    };
    tracing_subscriber::registry()
        .with(file_layers(writers.app, writers.query))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(writers.guard)
}

/// Get the Quarry home directory: ~/.quarry
pub fn quarry_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("QUARRY_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".quarry"))
        .unwrap_or_else(|| PathBuf::from(".quarry"))
}

pub fn logs_dir() -> PathBuf {
    quarry_home().join("logs")
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
