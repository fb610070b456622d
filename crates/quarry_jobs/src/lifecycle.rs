//! Phase state machine shared by query, download and archive jobs.
//!
//! ```text
//! PENDING --run()--> QUEUED --worker--> EXECUTING --> COMPLETED | ERROR
//!                       \                    \
//!                        +----abort()---------+--> ABORTED
//! COMPLETED | ERROR | ABORTED --archive()--> ARCHIVED   (query jobs only)
//! ```
//!
//! Every durable transition is a compare-and-swap in the [`JobStore`]; the
//! in-memory [`JobRecord`] only mirrors what the store accepted.

use std::time::Duration;

use async_trait::async_trait;
use quarry_protocol::defaults::{ABORTED_BY_USER_MESSAGE, GENERIC_ERROR_SUMMARY};
use quarry_protocol::Phase;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::dispatch::{DispatchTarget, Task};
use crate::error::{JobError, Result};
use crate::models::JobRecord;
use crate::store::JobStore;

pub const NOT_PENDING: &str = "Job is not PENDING.";
pub const NOT_COMPLETED: &str = "Job is not COMPLETED.";

/// Terminal phases of download and archive jobs.
pub const TERMINAL_PHASES: &[Phase] = &[Phase::Completed, Phase::Error, Phase::Aborted];

/// What a job kind contributes to the shared state machine.
#[async_trait]
pub trait JobKind: Send + Sync {
    /// Label used in log lines and contract errors.
    fn kind(&self) -> &'static str;

    fn record(&self) -> &JobRecord;

    fn record_mut(&mut self) -> &mut JobRecord;

    fn is_ready(&self) -> bool;

    fn set_ready(&mut self, ready: bool);

    /// Validate and fill in the job. Must not touch the phase.
    async fn prepare(&mut self, ctx: &JobContext) -> Result<()>;

    /// Persist the prepared job without changing its phase. Returns false
    /// when the stored job has already left PENDING and nothing was written.
    async fn save(&self, store: &JobStore) -> Result<bool>;

    /// Refresh from the store after a worker ran.
    async fn reload(&mut self, store: &JobStore) -> Result<()>;

    fn task(&self) -> Task;

    fn dispatch_target(&self, ctx: &JobContext) -> DispatchTarget;

    fn terminal_phases(&self) -> &'static [Phase] {
        TERMINAL_PHASES
    }

    /// Called between PENDING -> QUEUED and the dispatch.
    async fn before_dispatch(&self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }
}

/// Run `prepare`; the job is ready only when it succeeds.
pub async fn process<J: JobKind + ?Sized>(job: &mut J, ctx: &JobContext) -> Result<()> {
    job.set_ready(false);
    job.prepare(ctx).await?;
    job.set_ready(true);
    Ok(())
}

/// PENDING -> QUEUED, then dispatch.
///
/// In sync mode the task has already run when this returns and the job is
/// reloaded from the store.
pub async fn run<J: JobKind + ?Sized>(job: &mut J, ctx: &JobContext) -> Result<()> {
    if !job.is_ready() {
        return Err(JobError::not_processed(job.kind()));
    }
    if job.record().phase != Phase::Pending {
        return Err(JobError::validation("phase", NOT_PENDING));
    }

    let id = job.record().id.clone();
    let saved = job.save(&ctx.store).await?;
    if !saved || !ctx.store.transition(&id, &[Phase::Pending], Phase::Queued).await? {
        // somebody else already submitted this job
        if let Some(phase) = ctx.store.phase(&id).await? {
            job.record_mut().phase = phase;
        }
        return Err(JobError::validation("phase", NOT_PENDING));
    }
    job.record_mut().phase = Phase::Queued;

    job.before_dispatch(ctx).await?;
    dispatch(job, ctx).await
}

/// Send the job's task to the dispatcher. A failed dispatch leaves the job in
/// ERROR rather than stuck in an active phase.
pub(crate) async fn dispatch<J: JobKind + ?Sized>(job: &mut J, ctx: &JobContext) -> Result<()> {
    let task = job.task();
    let target = job.dispatch_target(ctx);
    let dispatched = ctx.dispatcher.submit(task, &target).await;

    if let Err(err) = &dispatched {
        let id = &job.record().id;
        warn!(job_id = %id, kind = job.kind(), error = %err, "Dispatch failed");
        ctx.store
            .transition_with_summary(
                id,
                &Phase::ACTIVE,
                Phase::Error,
                Some(GENERIC_ERROR_SUMMARY),
            )
            .await?;
    }

    if ctx.is_sync() || dispatched.is_err() {
        job.reload(&ctx.store).await?;
    }
    dispatched
}

/// Revoke the task, kill the backend process if the job is executing, and
/// move an active job to ABORTED. Inactive jobs are left alone.
pub async fn abort<J: JobKind + ?Sized>(job: &mut J, ctx: &JobContext) -> Result<()> {
    let id = job.record().id.clone();
    ctx.dispatcher.revoke(job.task().task_id()).await?;

    loop {
        let Some((phase, pid)) = ctx.store.phase_and_pid(&id).await? else {
            // never submitted
            return Ok(());
        };
        if !phase.is_active() {
            job.record_mut().phase = phase;
            return Ok(());
        }

        if phase == Phase::Executing {
            if let Some(pid) = pid {
                ctx.adapter.abort_query(pid).await?;
            }
        }

        if ctx
            .store
            .transition_with_summary(&id, &[phase], Phase::Aborted, Some(ABORTED_BY_USER_MESSAGE))
            .await?
        {
            info!(job_id = %id, kind = job.kind(), from = %phase, "Job aborted");
            job.record_mut().phase = Phase::Aborted;
            job.record_mut().error_summary = Some(ABORTED_BY_USER_MESSAGE.to_string());
            return Ok(());
        }
        // the phase moved underneath us; look again
    }
}

/// Poll the store until the job reaches one of its terminal phases.
pub async fn wait<J: JobKind + ?Sized>(
    job: &mut J,
    store: &JobStore,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Phase> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        job.reload(store).await?;
        let phase = job.record().phase;
        if job.terminal_phases().contains(&phase) || phase == Phase::Archived {
            return Ok(phase);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(phase);
        }
        tokio::time::sleep(poll_interval).await;
    }
}
