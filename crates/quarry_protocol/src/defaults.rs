//! Canonical default values shared by the scheduler, the worker and the CLI.

/// Queue that query execution tasks are sent to.
pub const QUERY_TASK_QUEUE: &str = "query";
/// Queue for download, archive and ingest tasks.
pub const DOWNLOAD_TASK_QUEUE: &str = "download";

pub const DEFAULT_STORE_PATH: &str = "quarry.sqlite3";
pub const DEFAULT_USER_SCHEMA_PREFIX: &str = "quarry_user_";
pub const DEFAULT_UPLOAD_SCHEMA: &str = "quarry_upload";
pub const DEFAULT_DOWNLOAD_FORMAT: &str = "votable";

/// Execution budget (seconds) when a job has no queue.
pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_SYNC_TIMEOUT_SECS: f64 = 5.0;

/// Shown to users for any backend failure; details go to the log only.
pub const GENERIC_ERROR_SUMMARY: &str = "Query execution failed.";
pub const ABORTED_BY_USER_MESSAGE: &str = "Aborted by user";
