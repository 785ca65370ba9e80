//! Projection worker: drains claimed batches and applies them to the index.

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::ports::{ApplyError, ClaimedBatch, ProjectionApplyPort, TaskStore, TaskStoreError};
use crate::retry::RetryPolicy;
use crate::task::{truncate_error, ProjectionTask, TaskStatus};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum tasks claimed per run; the primary latency/throughput knob,
    /// since each task costs one synchronous round trip to the index.
    pub batch_size: usize,
    /// Failure count at which a task is quarantined instead of rescheduled.
    pub max_retries: u32,
    /// Backoff schedule for rescheduled tasks.
    pub retry: RetryPolicy,
    /// Name for logging.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 7,
            retry: RetryPolicy::default(),
            name: "projection-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Counters for one completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchOutcome {
    pub processed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

/// What became of one processed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Completed,
    Rescheduled,
    DeadLettered,
}

/// Polling worker that reconciles the task queue against the search index.
///
/// Each run claims one batch of due tasks and processes them sequentially in
/// claimed id order. Apply failures are absorbed per task (reschedule with
/// backoff, or quarantine past the retry ceiling) and never abort the batch;
/// only queue-storage failures propagate.
///
/// Safe to run from any number of processes at once: batches are disjoint by
/// construction ([`TaskStore::find_batch_for_work`]), and overlap of the run
/// cadence across instances needs no further coordination.
pub struct ProjectionWorker<S, P> {
    store: S,
    index: P,
    config: WorkerConfig,
}

impl<S, P> ProjectionWorker<S, P>
where
    S: TaskStore,
    P: ProjectionApplyPort,
{
    pub fn new(store: S, index: P, config: WorkerConfig) -> Self {
        Self {
            store,
            index,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim and process one batch, stamping retries relative to `now()`.
    pub async fn run(&self) -> Result<BatchOutcome, TaskStoreError> {
        self.run_once(Utc::now()).await
    }

    /// Claim and process one batch, stamping retries relative to `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<BatchOutcome, TaskStoreError> {
        let statuses = [TaskStatus::Pending, TaskStatus::Retrying];
        let mut batch = self
            .store
            .find_batch_for_work(now, &statuses, self.config.batch_size)
            .await?;

        let tasks = batch.tasks().to_vec();
        debug!(
            worker = %self.config.name,
            claimed = tasks.len(),
            "claimed projection batch"
        );

        let mut outcome = BatchOutcome::default();
        for task in &tasks {
            match self.process_task(&mut batch, task, now).await? {
                Disposition::Completed => outcome.completed += 1,
                Disposition::Rescheduled => outcome.rescheduled += 1,
                Disposition::DeadLettered => outcome.dead_lettered += 1,
            }
            outcome.processed += 1;
        }

        batch.commit().await?;
        Ok(outcome)
    }

    /// Apply one task and settle its row: delete on success, reschedule with
    /// backoff on failure, quarantine once `retry_count` reaches the ceiling.
    ///
    /// Every apply error is treated as retryable; a permanently broken task
    /// burns its full retry budget before quarantine.
    async fn process_task(
        &self,
        batch: &mut S::Batch,
        task: &ProjectionTask,
        now: DateTime<Utc>,
    ) -> Result<Disposition, TaskStoreError> {
        match self.apply(task).await {
            Ok(()) => {
                batch.complete(task.id).await?;
                debug!(
                    worker = %self.config.name,
                    task_id = %task.id,
                    target_id = %task.target_id,
                    "projection task applied"
                );
                Ok(Disposition::Completed)
            }
            Err(err) => {
                let retry_count = task.retry_count + 1;
                let message = truncate_error(&err.to_string());

                if retry_count >= self.config.max_retries {
                    batch.quarantine(task, &message).await?;
                    error!(
                        worker = %self.config.name,
                        task_id = %task.id,
                        target_id = %task.target_id,
                        retry_count,
                        error = %message,
                        "projection task dead-lettered"
                    );
                    Ok(Disposition::DeadLettered)
                } else {
                    let delay = self.config.retry.delay_for_attempt(retry_count);
                    let mut updated = task.clone();
                    updated.status = TaskStatus::Retrying;
                    updated.retry_count = retry_count;
                    updated.next_run_at =
                        now + chrono::Duration::from_std(delay).unwrap_or_default();
                    updated.last_error = Some(message.clone());
                    batch.reschedule(&updated).await?;
                    warn!(
                        worker = %self.config.name,
                        task_id = %task.id,
                        target_id = %task.target_id,
                        retry_count,
                        delay_secs = delay.as_secs(),
                        error = %message,
                        "projection task rescheduled"
                    );
                    Ok(Disposition::Rescheduled)
                }
            }
        }
    }

    /// Route one task's effect to the apply port.
    ///
    /// A set-deleted task carries only the flag flip; otherwise every present
    /// delta is applied. Comment and like deltas map to a single unit call
    /// per row; view and download deltas are ignored unless positive, since
    /// the index only exposes increments for them.
    async fn apply(&self, task: &ProjectionTask) -> Result<(), ApplyError> {
        if let Some(deleted) = task.set_deleted {
            return if deleted {
                self.index.mark_deleted(task.target_id).await
            } else {
                self.index.mark_restored(task.target_id).await
            };
        }

        if let Some(delta) = task.delta_comment {
            if delta > 0 {
                self.index.increase_comment_count(task.target_id).await?;
            } else if delta < 0 {
                self.index.decrease_comment_count(task.target_id).await?;
            }
        }

        if let Some(delta) = task.delta_like {
            if delta > 0 {
                self.index.increase_like_count(task.target_id).await?;
            } else if delta < 0 {
                self.index.decrease_like_count(task.target_id).await?;
            }
        }

        if let Some(delta) = task.delta_view {
            if delta > 0 {
                self.index.increase_view_count(task.target_id, delta).await?;
            }
        }

        if let Some(delta) = task.delta_download {
            if delta > 0 {
                self.index
                    .increase_download_count(task.target_id, delta)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryProjectionIndex, InMemoryTaskStore, IndexCall};
    use crate::ports::{DeadLetterStore, EnqueueTaskPort};
    use openshelf_core::TargetId;

    fn worker(
        store: InMemoryTaskStore,
        index: InMemoryProjectionIndex,
    ) -> ProjectionWorker<InMemoryTaskStore, InMemoryProjectionIndex> {
        ProjectionWorker::new(store, index, WorkerConfig::default())
    }

    fn target() -> TargetId {
        TargetId::new()
    }

    #[tokio::test]
    async fn healthy_like_delta_is_applied_once_and_deleted() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = worker(store.clone(), index.clone());
        let t = target();

        store.enqueue_like_delta(t, 1).await.unwrap();
        let outcome = w.run().await.unwrap();

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.completed, 1);
        assert_eq!(index.calls(), vec![IndexCall::IncreaseLike(t)]);
        assert_eq!(index.document(t).like_count, 1);
        assert!(store.is_empty());
        assert!(store.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanently_failing_task_is_dead_lettered_after_the_ceiling() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = worker(store.clone(), index.clone());
        let t = target();

        index.fail_with(ApplyError::Unavailable("connection refused".into()));
        let id = store.enqueue_comment_delta(t, 1).await.unwrap();

        let mut now = Utc::now();
        // Six failures: rescheduled each time with a strictly increasing
        // retry count.
        for attempt in 1..=6u32 {
            let outcome = w.run_once(now).await.unwrap();
            assert_eq!(outcome.rescheduled, 1, "attempt {attempt}");

            let task = store.task(id).unwrap();
            assert_eq!(task.status, TaskStatus::Retrying);
            assert_eq!(task.retry_count, attempt);
            assert!(task.next_run_at > now);
            assert!(task.last_error.is_some());

            // Jump past any backoff the policy could have produced.
            now += chrono::Duration::seconds(200);
        }

        // Seventh failure hits the ceiling: quarantined, row gone.
        let outcome = w.run_once(now).await.unwrap();
        assert_eq!(outcome.dead_lettered, 1);
        assert!(store.task(id).is_none());

        let entries = store.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target_id, t);
        assert_eq!(entries[0].delta_comment, Some(1));
        assert!(entries[0].last_error.contains("connection refused"));

        // No further retries: subsequent runs find nothing.
        now += chrono::Duration::seconds(200);
        let outcome = w.run_once(now).await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert_eq!(index.call_count(), 7);
    }

    #[tokio::test]
    async fn rescheduled_task_is_not_due_before_its_backoff() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = worker(store.clone(), index.clone());

        index.fail_with(ApplyError::Rejected("mapping conflict".into()));
        store.enqueue_like_delta(target(), 1).await.unwrap();

        let now = Utc::now();
        w.run_once(now).await.unwrap();

        // Immediately after the failure the task is backing off.
        let outcome = w.run_once(now).await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert_eq!(index.call_count(), 1);

        // Once healed and due, it completes.
        index.heal();
        let outcome = w
            .run_once(now + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(outcome.completed, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn opposing_comment_deltas_net_to_zero_without_merging() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = worker(store.clone(), index.clone());
        let t = target();

        store.enqueue_comment_delta(t, 1).await.unwrap();
        store.enqueue_comment_delta(t, -1).await.unwrap();

        let outcome = w.run().await.unwrap();
        assert_eq!(outcome.completed, 2);
        assert_eq!(
            index.calls(),
            vec![IndexCall::IncreaseComment(t), IndexCall::DecreaseComment(t)]
        );
        assert_eq!(index.document(t).comment_count, 0);
    }

    #[tokio::test]
    async fn set_deleted_is_idempotent_counter_deltas_are_not() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = worker(store.clone(), index.clone());
        let t = target();

        // Marking deleted twice leaves the same state as once.
        store.enqueue_set_deleted(t, true).await.unwrap();
        w.run().await.unwrap();
        let once = index.document(t);
        store.enqueue_set_deleted(t, true).await.unwrap();
        w.run().await.unwrap();
        assert_eq!(index.document(t), once);
        assert!(index.document(t).deleted);

        // Replaying a like delta is observable: the counter moves twice.
        store.enqueue_like_delta(t, 1).await.unwrap();
        store.enqueue_like_delta(t, 1).await.unwrap();
        w.run().await.unwrap();
        assert_eq!(index.document(t).like_count, 2);
    }

    #[tokio::test]
    async fn set_deleted_and_restore_route_to_the_flag_calls() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = worker(store.clone(), index.clone());
        let t = target();

        store.enqueue_set_deleted(t, true).await.unwrap();
        store.enqueue_set_deleted(t, false).await.unwrap();
        w.run().await.unwrap();

        assert_eq!(
            index.calls(),
            vec![IndexCall::MarkDeleted(t), IndexCall::MarkRestored(t)]
        );
        assert!(!index.document(t).deleted);
    }

    #[tokio::test]
    async fn view_and_download_deltas_carry_their_amount() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = worker(store.clone(), index.clone());
        let t = target();

        store.enqueue_view_delta(t, 25).await.unwrap();
        store.enqueue_download_delta(t, 3).await.unwrap();
        // Non-positive view deltas have no index operation and complete as
        // a no-op.
        store.enqueue_view_delta(t, 0).await.unwrap();

        let outcome = w.run().await.unwrap();
        assert_eq!(outcome.completed, 3);
        assert_eq!(index.document(t).view_count, 25);
        assert_eq!(index.document(t).download_count, 3);
        assert_eq!(index.call_count(), 2);
    }

    #[tokio::test]
    async fn one_bad_task_does_not_halt_the_batch() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let bad = target();
        let good = target();

        // The first task fails (and quarantines at ceiling 1); the second
        // succeeds in the same batch.
        store.enqueue_like_delta(bad, 1).await.unwrap();
        store.enqueue_like_delta(good, 1).await.unwrap();

        struct FlakyIndex {
            inner: InMemoryProjectionIndex,
            poison: TargetId,
        }

        #[async_trait::async_trait]
        impl ProjectionApplyPort for FlakyIndex {
            async fn increase_comment_count(&self, t: TargetId) -> Result<(), ApplyError> {
                self.inner.increase_comment_count(t).await
            }
            async fn decrease_comment_count(&self, t: TargetId) -> Result<(), ApplyError> {
                self.inner.decrease_comment_count(t).await
            }
            async fn increase_like_count(&self, t: TargetId) -> Result<(), ApplyError> {
                if t == self.poison {
                    return Err(ApplyError::TargetMissing(t));
                }
                self.inner.increase_like_count(t).await
            }
            async fn decrease_like_count(&self, t: TargetId) -> Result<(), ApplyError> {
                self.inner.decrease_like_count(t).await
            }
            async fn increase_view_count(&self, t: TargetId, by: i64) -> Result<(), ApplyError> {
                self.inner.increase_view_count(t, by).await
            }
            async fn increase_download_count(
                &self,
                t: TargetId,
                by: i64,
            ) -> Result<(), ApplyError> {
                self.inner.increase_download_count(t, by).await
            }
            async fn mark_deleted(&self, t: TargetId) -> Result<(), ApplyError> {
                self.inner.mark_deleted(t).await
            }
            async fn mark_restored(&self, t: TargetId) -> Result<(), ApplyError> {
                self.inner.mark_restored(t).await
            }
        }

        let flaky = FlakyIndex {
            inner: index.clone(),
            poison: bad,
        };
        let w = ProjectionWorker::new(
            store.clone(),
            flaky,
            WorkerConfig::default().with_max_retries(1),
        );

        let outcome = w.run().await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(outcome.completed, 1);
        assert_eq!(index.document(good).like_count, 1);
        assert_eq!(store.list(10).await.unwrap().len(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn dead_letter_error_summary_is_truncated() {
        let store = InMemoryTaskStore::new();
        let index = InMemoryProjectionIndex::new();
        let w = ProjectionWorker::new(
            store.clone(),
            index.clone(),
            WorkerConfig::default().with_max_retries(1),
        );

        index.fail_with(ApplyError::Rejected("e".repeat(5000)));
        store.enqueue_like_delta(target(), 1).await.unwrap();
        w.run().await.unwrap();

        let entries = store.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].last_error.len() <= crate::task::MAX_ERROR_LEN);
    }
}
