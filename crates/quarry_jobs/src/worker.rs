//! Worker loop for the durable task queue.
//!
//! A worker claims tasks from its queues, runs them through a
//! [`TaskExecutor`] and records the outcome on the task row. Idle polls back
//! off exponentially with a little jitter so several workers do not poll in
//! lockstep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quarry_protocol::defaults::{DOWNLOAD_TASK_QUEUE, QUERY_TASK_QUEUE};
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchError, SqliteTaskQueue, TaskExecutor};

/// Idle backoff base (ms)
const POLL_BACKOFF_BASE_MS: u64 = 50;
/// Idle backoff max (ms)
const POLL_BACKOFF_MAX_MS: u64 = 1_000;
/// Idle backoff jitter cap (ms)
const POLL_BACKOFF_JITTER_MS: u64 = 50;

/// Token for cooperative shutdown of a worker loop.
///
/// Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

pub struct Worker {
    queue: SqliteTaskQueue,
    executor: Arc<dyn TaskExecutor>,
    queues: Vec<String>,
    backoff_ms: u64,
}

impl Worker {
    /// A worker serving both the query and the download queue.
    pub fn new(queue: SqliteTaskQueue, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            queue,
            executor,
            queues: vec![QUERY_TASK_QUEUE.to_string(), DOWNLOAD_TASK_QUEUE.to_string()],
            backoff_ms: 0,
        }
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Poll until `token` is cancelled. The task in flight is finished first.
    pub async fn run(&mut self, token: CancellationToken) -> Result<(), DispatchError> {
        info!(queues = ?self.queues, "Worker started");
        while !token.is_cancelled() {
            match self.run_once().await {
                Ok(true) => self.backoff_ms = 0,
                Ok(false) => self.idle().await,
                Err(err) => {
                    warn!(error = %err, "Polling the task queue failed");
                    self.idle().await;
                }
            }
        }
        info!("Worker stopped");
        Ok(())
    }

    /// Claim and execute one task. Returns false when no task was queued.
    pub async fn run_once(&self) -> Result<bool, DispatchError> {
        let Some(claimed) = self.queue.pop_task(&self.queues).await? else {
            return Ok(false);
        };
        debug!(
            task_id = %claimed.task_id,
            task = claimed.task.name(),
            queue = %claimed.queue,
            "Task claimed"
        );

        match self.executor.execute(&claimed.task).await {
            Ok(()) => self.queue.complete_task(&claimed.task_id).await?,
            Err(err) => {
                error!(task_id = %claimed.task_id, task = claimed.task.name(), error = %err, "Task failed");
                self.queue
                    .fail_task(&claimed.task_id, &err.to_string())
                    .await?;
            }
        }
        Ok(true)
    }

    async fn idle(&mut self) {
        let next = if self.backoff_ms == 0 {
            POLL_BACKOFF_BASE_MS
        } else {
            (self.backoff_ms * 2).min(POLL_BACKOFF_MAX_MS)
        };
        self.backoff_ms = next;

        let jitter_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 % POLL_BACKOFF_JITTER_MS)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(next + jitter_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
