//! Postgres-backed task queue and dead-letter storage.
//!
//! The queue is a plain relational table; there is no broker. Correctness
//! under horizontal scale-out rests on the batch claim: `SELECT ... FOR
//! UPDATE SKIP LOCKED` hands each concurrent claimer a disjoint subset of
//! the due, unclaimed rows without blocking on rows another claimer holds.
//! The claim's row locks live for the lifetime of the batch transaction, so
//! completes, reschedules and quarantines issued through the batch become
//! visible atomically at commit, and a crashed worker's claim simply
//! evaporates with its connection (the rows become claimable again —
//! at-least-once delivery).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use openshelf_core::{DeadLetterId, TargetId, TaskId};
use openshelf_projection::{
    ClaimedBatch, DeadLetterEntry, DeadLetterStore, EnqueueTaskPort, NewTask, ProjectionTask,
    TaskStatus, TaskStore, TaskStoreError, truncate_error,
};

const TASK_COLUMNS: &str = "id, target_id, delta_comment, delta_like, delta_view, \
     delta_download, set_deleted, status, retry_count, last_error, next_run_at, created_at";

/// Durable task queue backed by Postgres.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the queue schema migrations.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), TaskStoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| TaskStoreError::storage("migrate", e.to_string()))
    }
}

#[async_trait]
impl EnqueueTaskPort for PostgresTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, TaskStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO projection_tasks (
                target_id,
                delta_comment,
                delta_like,
                delta_view,
                delta_download,
                set_deleted,
                status,
                retry_count,
                next_run_at,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(task.target_id.as_uuid())
        .bind(task.delta_comment)
        .bind(task.delta_like)
        .bind(task.delta_view)
        .bind(task.delta_download)
        .bind(task.set_deleted)
        .bind(TaskStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(TaskId::new(id))
    }

    async fn enqueue_view_delta_batch(
        &self,
        updates: &[(TargetId, i64)],
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO projection_tasks \
             (target_id, delta_view, status, retry_count, next_run_at, created_at) ",
        );
        builder.push_values(updates, |mut b, (target_id, delta)| {
            b.push_bind(*target_id.as_uuid());
            b.push_bind(*delta);
            b.push_bind(TaskStatus::Pending.as_str());
            b.push_bind(0_i32);
            b.push("NOW()");
            b.push("NOW()");
        });
        builder.push(" RETURNING id");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue_view_delta_batch", e))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("enqueue_view_delta_batch", e))?;
            ids.push(TaskId::new(id));
        }
        Ok(ids)
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    type Batch = PostgresClaimedBatch;

    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Self::Batch, TaskStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_batch", e))?;

        let status_params: Vec<String> =
            statuses.iter().map(|s| s.as_str().to_string()).collect();

        let query = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM projection_tasks
            WHERE status = ANY($1) AND next_run_at <= $2
            ORDER BY id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#
        );

        let rows = sqlx::query(&query)
            .bind(&status_params)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("find_batch_for_work", e))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(decode_task(&row)?);
        }

        debug!(claimed = tasks.len(), "claimed projection task batch");
        Ok(PostgresClaimedBatch { tx, tasks })
    }
}

/// A batch of rows locked by one claim transaction.
pub struct PostgresClaimedBatch {
    tx: Transaction<'static, Postgres>,
    tasks: Vec<ProjectionTask>,
}

#[async_trait]
impl ClaimedBatch for PostgresClaimedBatch {
    fn tasks(&self) -> &[ProjectionTask] {
        &self.tasks
    }

    async fn complete(&mut self, id: TaskId) -> Result<(), TaskStoreError> {
        let result = sqlx::query("DELETE FROM projection_tasks WHERE id = $1")
            .bind(id.value())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(id));
        }
        Ok(())
    }

    async fn reschedule(&mut self, task: &ProjectionTask) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE projection_tasks
            SET status = $2, retry_count = $3, next_run_at = $4, last_error = $5
            WHERE id = $1
            "#,
        )
        .bind(task.id.value())
        .bind(task.status.as_str())
        .bind(task.retry_count as i32)
        .bind(task.next_run_at)
        .bind(task.last_error.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task.id));
        }
        Ok(())
    }

    async fn quarantine(
        &mut self,
        task: &ProjectionTask,
        error: &str,
    ) -> Result<(), TaskStoreError> {
        sqlx::query(
            r#"
            INSERT INTO projection_dead_letters (
                target_id,
                delta_comment,
                delta_like,
                delta_view,
                delta_download,
                set_deleted,
                last_error,
                recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(task.target_id.as_uuid())
        .bind(task.delta_comment)
        .bind(task.delta_like)
        .bind(task.delta_view)
        .bind(task.delta_download)
        .bind(task.set_deleted)
        .bind(truncate_error(error))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("quarantine", e))?;

        let result = sqlx::query("DELETE FROM projection_tasks WHERE id = $1")
            .bind(task.id.value())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("quarantine", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task.id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), TaskStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_batch", e))
    }
}

/// Read side of the quarantine table.
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, target_id, delta_comment, delta_like, delta_view,
                   delta_download, set_deleted, last_error, recorded_at
            FROM projection_dead_letters
            ORDER BY recorded_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(decode_dead_letter(&row)?);
        }
        Ok(entries)
    }
}

fn decode_task(row: &sqlx::postgres::PgRow) -> Result<ProjectionTask, TaskStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_task", e);

    let status_raw: String = row.try_get("status").map_err(decode)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        TaskStoreError::storage("decode_task", format!("unknown status '{status_raw}'"))
    })?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;

    Ok(ProjectionTask {
        id: TaskId::new(row.try_get("id").map_err(decode)?),
        target_id: TargetId::from_uuid(row.try_get("target_id").map_err(decode)?),
        delta_comment: row.try_get("delta_comment").map_err(decode)?,
        delta_like: row.try_get("delta_like").map_err(decode)?,
        delta_view: row.try_get("delta_view").map_err(decode)?,
        delta_download: row.try_get("delta_download").map_err(decode)?,
        set_deleted: row.try_get("set_deleted").map_err(decode)?,
        status,
        retry_count: retry_count.max(0) as u32,
        next_run_at: row.try_get("next_run_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
    })
}

fn decode_dead_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, TaskStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_dead_letter", e);

    Ok(DeadLetterEntry {
        id: DeadLetterId::new(row.try_get("id").map_err(decode)?),
        target_id: TargetId::from_uuid(row.try_get("target_id").map_err(decode)?),
        delta_comment: row.try_get("delta_comment").map_err(decode)?,
        delta_like: row.try_get("delta_like").map_err(decode)?,
        delta_view: row.try_get("delta_view").map_err(decode)?,
        delta_download: row.try_get("delta_download").map_err(decode)?,
        set_deleted: row.try_get("set_deleted").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        recorded_at: row.try_get("recorded_at").map_err(decode)?,
    })
}

/// Map SQLx errors to `TaskStoreError` with the failing operation's name.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    let message = match err {
        sqlx::Error::Database(db_err) => db_err.message().to_string(),
        sqlx::Error::PoolClosed => "connection pool closed".to_string(),
        other => other.to_string(),
    };
    TaskStoreError::storage(operation, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_errors_carry_the_operation_label() {
        let err = map_sqlx_error("enqueue", sqlx::Error::PoolClosed);
        let rendered = err.to_string();
        assert!(rendered.contains("enqueue"));
        assert!(rendered.contains("connection pool closed"));
    }
}
