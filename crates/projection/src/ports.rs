//! Ports at the pipeline's seams: queue storage, batch claims, and the
//! search-index apply surface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use openshelf_core::{TargetId, TaskId};

use crate::task::{DeadLetterEntry, NewTask, ProjectionTask, TaskStatus};

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("storage error in {operation}: {message}")]
    Storage { operation: String, message: String },
}

impl TaskStoreError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Failure reported by the search index while applying a task.
///
/// The worker does not branch on the variant: every apply failure is
/// retryable until the ceiling, after which the task is quarantined. The
/// variants exist for log/dead-letter diagnostics only.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApplyError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),
    #[error("search index rejected update: {0}")]
    Rejected(String),
    #[error("target document missing: {0}")]
    TargetMissing(TargetId),
}

/// Write-only enqueue surface used synchronously by domain services at the
/// point a count-affecting or delete/restore event commits.
///
/// Every operation inserts exactly one new row (`pending`, `retry_count = 0`,
/// due immediately) and never reads or merges existing rows, keeping the
/// write O(1) and contention-free. Target existence is the caller's problem.
#[async_trait]
pub trait EnqueueTaskPort: Send + Sync {
    /// Append one task row; returns the store-assigned id.
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, TaskStoreError>;

    async fn enqueue_comment_delta(
        &self,
        target_id: TargetId,
        delta: i64,
    ) -> Result<TaskId, TaskStoreError> {
        self.enqueue(NewTask::comment_delta(target_id, delta)).await
    }

    async fn enqueue_like_delta(
        &self,
        target_id: TargetId,
        delta: i64,
    ) -> Result<TaskId, TaskStoreError> {
        self.enqueue(NewTask::like_delta(target_id, delta)).await
    }

    async fn enqueue_view_delta(
        &self,
        target_id: TargetId,
        delta: i64,
    ) -> Result<TaskId, TaskStoreError> {
        self.enqueue(NewTask::view_delta(target_id, delta)).await
    }

    async fn enqueue_download_delta(
        &self,
        target_id: TargetId,
        delta: i64,
    ) -> Result<TaskId, TaskStoreError> {
        self.enqueue(NewTask::download_delta(target_id, delta)).await
    }

    async fn enqueue_set_deleted(
        &self,
        target_id: TargetId,
        deleted: bool,
    ) -> Result<TaskId, TaskStoreError> {
        self.enqueue(NewTask::set_deleted(target_id, deleted)).await
    }

    /// Flush a buffered view-count batch: one row per entry, no merging.
    async fn enqueue_view_delta_batch(
        &self,
        updates: &[(TargetId, i64)],
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut ids = Vec::with_capacity(updates.len());
        for (target_id, delta) in updates {
            ids.push(self.enqueue(NewTask::view_delta(*target_id, *delta)).await?);
        }
        Ok(ids)
    }
}

/// Durable task queue.
#[async_trait]
pub trait TaskStore: EnqueueTaskPort {
    type Batch: ClaimedBatch;

    /// Claim up to `limit` due tasks (`status IN statuses`,
    /// `next_run_at <= now`), in ascending id order.
    ///
    /// The claim is a non-blocking row-level write lock: rows already claimed
    /// by a concurrent caller are skipped, not waited on, so concurrent
    /// workers obtain disjoint subsets without a central coordinator. The
    /// claim is held until the returned batch is committed or dropped.
    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Self::Batch, TaskStoreError>;
}

/// A claimed, lock-protected batch of tasks.
///
/// All mutations of claimed rows flow through the batch so that they share
/// the claim's transaction: a quarantine (dead-letter insert + row delete) is
/// atomic from any other observer's perspective, and dropping the batch
/// without committing releases the claim along with any unflushed changes.
#[async_trait]
pub trait ClaimedBatch: Send {
    /// The claimed tasks, in ascending id order.
    fn tasks(&self) -> &[ProjectionTask];

    /// Delete a task row after its effect was applied. Row removal is the
    /// only completion signal; there is no separate acknowledgement.
    async fn complete(&mut self, id: TaskId) -> Result<(), TaskStoreError>;

    /// Persist a failed task's updated `status`, `retry_count`,
    /// `next_run_at` and `last_error`; the row stays queued.
    async fn reschedule(&mut self, task: &ProjectionTask) -> Result<(), TaskStoreError>;

    /// Quarantine a task that exhausted its retries: write the dead-letter
    /// record and delete the task row in one step.
    async fn quarantine(
        &mut self,
        task: &ProjectionTask,
        error: &str,
    ) -> Result<(), TaskStoreError>;

    /// Commit the batch's changes and release the claim.
    async fn commit(self) -> Result<(), TaskStoreError>;
}

/// Read side of the quarantine, for operator tooling.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Most recent entries first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskStoreError>;
}

/// Apply surface of the search projection: one call per target document.
///
/// Comment and like counters move by one per call (each queue row represents
/// a single event); view and download counters move by an explicit amount.
/// Delete/restore are set operations and tolerate replay.
#[async_trait]
pub trait ProjectionApplyPort: Send + Sync {
    async fn increase_comment_count(&self, target_id: TargetId) -> Result<(), ApplyError>;
    async fn decrease_comment_count(&self, target_id: TargetId) -> Result<(), ApplyError>;
    async fn increase_like_count(&self, target_id: TargetId) -> Result<(), ApplyError>;
    async fn decrease_like_count(&self, target_id: TargetId) -> Result<(), ApplyError>;
    async fn increase_view_count(&self, target_id: TargetId, by: i64) -> Result<(), ApplyError>;
    async fn increase_download_count(&self, target_id: TargetId, by: i64)
        -> Result<(), ApplyError>;
    async fn mark_deleted(&self, target_id: TargetId) -> Result<(), ApplyError>;
    async fn mark_restored(&self, target_id: TargetId) -> Result<(), ApplyError>;
}
