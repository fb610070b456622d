//! Durable task queue in the job store.
//!
//! Claims are atomic via `UPDATE ... WHERE status = 'QUEUED'`, so any number
//! of workers can poll the same queues.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, QueryBuilder, Sqlite};
use tracing::info;

use super::{DispatchError, Task, TaskBackend};

/// A task claimed by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task_id: String,
    pub queue: String,
    pub priority: i64,
    pub task: Task,
}

#[derive(Debug, Default, sqlx::FromRow)]
pub struct TaskQueueStats {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub revoked: i64,
}

#[derive(Debug, Clone)]
pub struct SqliteTaskQueue {
    pool: Pool<Sqlite>,
}

impl SqliteTaskQueue {
    /// Uses the `qj_tasks` table created by [`crate::store::JobStore`].
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Enqueue (or re-enqueue) a task under its task id.
    pub async fn enqueue(
        &self,
        task: &Task,
        queue: &str,
        priority: Option<i64>,
    ) -> Result<(), DispatchError> {
        let payload = serde_json::to_string(task)?;
        sqlx::query(
            r#"
            INSERT INTO qj_tasks (task_id, queue, priority, payload, status, enqueued_at)
            VALUES (?, ?, ?, ?, 'QUEUED', ?)
            ON CONFLICT(task_id) DO UPDATE SET
                queue = excluded.queue,
                priority = excluded.priority,
                payload = excluded.payload,
                status = 'QUEUED',
                enqueued_at = excluded.enqueued_at,
                claimed_at = NULL,
                finished_at = NULL,
                error_message = NULL
            "#,
        )
        .bind(task.task_id())
        .bind(queue)
        .bind(priority.unwrap_or(0))
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claim the highest priority task on any of `queues`.
    pub async fn pop_task(&self, queues: &[String]) -> Result<Option<ClaimedTask>, DispatchError> {
        if queues.is_empty() {
            return Ok(None);
        }
        let mut tx = self.pool.begin().await?;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT task_id FROM qj_tasks WHERE status = 'QUEUED' AND queue IN (",
        );
        let mut separated = builder.separated(", ");
        for queue in queues {
            separated.push_bind(queue.as_str());
        }
        separated.push_unseparated(")");
        builder.push(" ORDER BY priority DESC, enqueued_at ASC, rowid ASC LIMIT 1");

        let task_id: Option<String> = builder
            .build_query_scalar()
            .fetch_optional(&mut *tx)
            .await?;
        let Some(task_id) = task_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE qj_tasks SET status = 'RUNNING', claimed_at = ?
            WHERE task_id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(Utc::now())
        .bind(&task_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // claimed by another worker
            tx.commit().await?;
            return Ok(None);
        }

        let (queue, priority, payload): (String, i64, String) =
            sqlx::query_as("SELECT queue, priority, payload FROM qj_tasks WHERE task_id = ?")
                .bind(&task_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        let task: Task = serde_json::from_str(&payload)?;
        info!(task_id = %task_id, task = task.name(), queue = %queue, "Claimed task");
        Ok(Some(ClaimedTask {
            task_id,
            queue,
            priority,
            task,
        }))
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<(), DispatchError> {
        sqlx::query(
            "UPDATE qj_tasks SET status = 'COMPLETED', finished_at = ? WHERE task_id = ?",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<(), DispatchError> {
        sqlx::query(
            "UPDATE qj_tasks SET status = 'FAILED', finished_at = ?, error_message = ? WHERE task_id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        info!(task_id, error, "Task failed");
        Ok(())
    }

    /// Status of a task, `None` when it was never enqueued.
    pub async fn task_status(&self, task_id: &str) -> Result<Option<String>, DispatchError> {
        let status = sqlx::query_scalar("SELECT status FROM qj_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    pub async fn stats(&self) -> Result<TaskQueueStats, DispatchError> {
        let stats: TaskQueueStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'QUEUED') AS queued,
                COUNT(*) FILTER (WHERE status = 'RUNNING') AS running,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                COUNT(*) FILTER (WHERE status = 'REVOKED') AS revoked
            FROM qj_tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}

#[async_trait]
impl TaskBackend for SqliteTaskQueue {
    async fn submit_async(
        &self,
        task: &Task,
        queue: &str,
        priority: Option<i64>,
    ) -> Result<(), DispatchError> {
        self.enqueue(task, queue, priority).await
    }

    /// Only a task that has not been claimed yet can be revoked.
    async fn revoke(&self, task_id: &str) -> Result<(), DispatchError> {
        let revoked = sqlx::query(
            r#"
            UPDATE qj_tasks SET status = 'REVOKED', finished_at = ?
            WHERE task_id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if revoked > 0 {
            info!(task_id, "Revoked task");
        }
        Ok(())
    }
}
