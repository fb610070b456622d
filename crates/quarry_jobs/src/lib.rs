//! Query job scheduling for Quarry
//!
//! A query job moves through PENDING -> QUEUED -> EXECUTING and ends in
//! COMPLETED, ERROR or ABORTED; completed results can later be ARCHIVED.
//! [`QueryJob::process`] validates and translates the submission,
//! [`QueryJob::run`] hands it to the [`TaskDispatcher`], and a [`Worker`]
//! (or the caller itself, in sync mode) executes it through the
//! [`JobExecutor`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use quarry_jobs::{JobContext, QueryConfig, QueryJob};
//!
//! let ctx = JobContext::new(config, store, adapter);
//! let mut job = QueryJob::new(Some(identity), "SELECT * FROM gaia.dr3");
//! job.process(&ctx).await?;
//! job.run(&ctx).await?;
//! ```

pub mod admission;
pub mod archive_job;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod download_job;
pub mod error;
pub mod executor;
pub mod files;
pub mod lifecycle;
pub mod models;
pub mod packager;
pub mod permissions;
pub mod processor;
pub mod query_job;
pub mod store;
pub mod streamer;
pub mod worker;

pub use archive_job::ArchiveJob;
pub use config::{DispatchMode, Example, QueryConfig};
pub use context::{JobContext, JobContextBuilder};
pub use dispatch::{DispatchTarget, SqliteTaskQueue, Task, TaskBackend, TaskDispatcher};
pub use download_job::DownloadJob;
pub use error::{JobError, Result, ValidationErrors};
pub use executor::JobExecutor;
pub use models::{JobRecord, QueryDetails, StatsRecord};
pub use query_job::{QueryJob, RowPage};
pub use store::JobStore;
pub use streamer::{ResultStream, StreamError};
pub use worker::{CancellationToken, Worker};
