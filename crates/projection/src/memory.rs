//! In-memory queue and index implementations for tests and local dev.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use openshelf_core::{DeadLetterId, TargetId, TaskId};

use crate::ports::{
    ApplyError, ClaimedBatch, DeadLetterStore, EnqueueTaskPort, ProjectionApplyPort, TaskStore,
    TaskStoreError,
};
use crate::task::{DeadLetterEntry, NewTask, ProjectionTask, TaskStatus};

/// In-memory task store.
///
/// Claims are tracked in a shared set instead of row locks; rows in the set
/// are invisible to other claimers until the owning batch commits or drops.
/// Unlike the Postgres store, mutations apply immediately — commit only
/// releases the claim.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_task_id: i64,
    next_dead_letter_id: i64,
    tasks: BTreeMap<TaskId, ProjectionTask>,
    claimed: HashSet<TaskId>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, id: TaskId) -> Option<ProjectionTask> {
        self.inner.lock().unwrap().tasks.get(&id).cloned()
    }

    /// All queued rows, in ascending id order.
    pub fn tasks(&self) -> Vec<ProjectionTask> {
        self.inner.lock().unwrap().tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().unwrap().dead_letters.clone()
    }
}

#[async_trait]
impl EnqueueTaskPort for InMemoryTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, TaskStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_task_id += 1;
        let id = TaskId::new(inner.next_task_id);
        let row = ProjectionTask::from_seed(id, task, Utc::now());
        inner.tasks.insert(id, row);
        Ok(id)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    type Batch = InMemoryClaimedBatch;

    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Self::Batch, TaskStoreError> {
        let mut inner = self.inner.lock().unwrap();

        let tasks: Vec<ProjectionTask> = inner
            .tasks
            .values()
            .filter(|t| {
                statuses.contains(&t.status) && t.is_due(now) && !inner.claimed.contains(&t.id)
            })
            .take(limit)
            .cloned()
            .collect();

        let claimed_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        inner.claimed.extend(claimed_ids.iter().copied());

        Ok(InMemoryClaimedBatch {
            inner: Arc::clone(&self.inner),
            tasks,
            claimed_ids,
        })
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryTaskStore {
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.dead_letters.iter().rev().take(limit).cloned().collect())
    }
}

/// Batch of claimed in-memory rows; dropping it releases the claim.
#[derive(Debug)]
pub struct InMemoryClaimedBatch {
    inner: Arc<Mutex<StoreInner>>,
    tasks: Vec<ProjectionTask>,
    claimed_ids: Vec<TaskId>,
}

#[async_trait]
impl ClaimedBatch for InMemoryClaimedBatch {
    fn tasks(&self) -> &[ProjectionTask] {
        &self.tasks
    }

    async fn complete(&mut self, id: TaskId) -> Result<(), TaskStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tasks
            .remove(&id)
            .ok_or(TaskStoreError::NotFound(id))?;
        inner.claimed.remove(&id);
        Ok(())
    }

    async fn reschedule(&mut self, task: &ProjectionTask) -> Result<(), TaskStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .tasks
            .get_mut(&task.id)
            .ok_or(TaskStoreError::NotFound(task.id))?;
        row.status = task.status;
        row.retry_count = task.retry_count;
        row.next_run_at = task.next_run_at;
        row.last_error = task.last_error.clone();
        Ok(())
    }

    async fn quarantine(
        &mut self,
        task: &ProjectionTask,
        error: &str,
    ) -> Result<(), TaskStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tasks
            .remove(&task.id)
            .ok_or(TaskStoreError::NotFound(task.id))?;
        inner.claimed.remove(&task.id);
        inner.next_dead_letter_id += 1;
        let id = DeadLetterId::new(inner.next_dead_letter_id);
        let entry = DeadLetterEntry::from_task(id, task, error, Utc::now());
        inner.dead_letters.push(entry);
        Ok(())
    }

    async fn commit(self) -> Result<(), TaskStoreError> {
        // Mutations were applied eagerly; Drop releases the claim.
        Ok(())
    }
}

impl Drop for InMemoryClaimedBatch {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        for id in &self.claimed_ids {
            inner.claimed.remove(id);
        }
    }
}

/// Snapshot of one target's denormalized search document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentState {
    pub comment_count: i64,
    pub like_count: i64,
    pub view_count: i64,
    pub download_count: i64,
    pub deleted: bool,
}

/// One recorded apply call, for asserting call counts and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCall {
    IncreaseComment(TargetId),
    DecreaseComment(TargetId),
    IncreaseLike(TargetId),
    DecreaseLike(TargetId),
    IncreaseView(TargetId, i64),
    IncreaseDownload(TargetId, i64),
    MarkDeleted(TargetId),
    MarkRestored(TargetId),
}

/// In-memory stand-in for the search index.
///
/// Records every apply call (including failed attempts) and can be switched
/// into a failing mode to exercise the retry path. Decrements clamp at zero,
/// like the real index scripts. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectionIndex {
    inner: Arc<Mutex<IndexInner>>,
}

#[derive(Debug, Default)]
struct IndexInner {
    docs: HashMap<TargetId, DocumentState>,
    calls: Vec<IndexCall>,
    failure: Option<ApplyError>,
}

impl InMemoryProjectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent apply call fail with `error`.
    pub fn fail_with(&self, error: ApplyError) {
        self.inner.lock().unwrap().failure = Some(error);
    }

    /// Clear a previously injected failure.
    pub fn heal(&self) {
        self.inner.lock().unwrap().failure = None;
    }

    pub fn calls(&self) -> Vec<IndexCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    pub fn document(&self, target_id: TargetId) -> DocumentState {
        self.inner
            .lock()
            .unwrap()
            .docs
            .get(&target_id)
            .copied()
            .unwrap_or_default()
    }

    fn record(
        &self,
        call: IndexCall,
        mutate: impl FnOnce(&mut DocumentState),
    ) -> Result<(), ApplyError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        if let Some(failure) = &inner.failure {
            return Err(failure.clone());
        }
        let target_id = match call {
            IndexCall::IncreaseComment(t)
            | IndexCall::DecreaseComment(t)
            | IndexCall::IncreaseLike(t)
            | IndexCall::DecreaseLike(t)
            | IndexCall::IncreaseView(t, _)
            | IndexCall::IncreaseDownload(t, _)
            | IndexCall::MarkDeleted(t)
            | IndexCall::MarkRestored(t) => t,
        };
        mutate(inner.docs.entry(target_id).or_default());
        Ok(())
    }
}

#[async_trait]
impl ProjectionApplyPort for InMemoryProjectionIndex {
    async fn increase_comment_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.record(IndexCall::IncreaseComment(target_id), |d| {
            d.comment_count += 1;
        })
    }

    async fn decrease_comment_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.record(IndexCall::DecreaseComment(target_id), |d| {
            d.comment_count = (d.comment_count - 1).max(0);
        })
    }

    async fn increase_like_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.record(IndexCall::IncreaseLike(target_id), |d| {
            d.like_count += 1;
        })
    }

    async fn decrease_like_count(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.record(IndexCall::DecreaseLike(target_id), |d| {
            d.like_count = (d.like_count - 1).max(0);
        })
    }

    async fn increase_view_count(&self, target_id: TargetId, by: i64) -> Result<(), ApplyError> {
        self.record(IndexCall::IncreaseView(target_id, by), |d| {
            d.view_count += by;
        })
    }

    async fn increase_download_count(
        &self,
        target_id: TargetId,
        by: i64,
    ) -> Result<(), ApplyError> {
        self.record(IndexCall::IncreaseDownload(target_id, by), |d| {
            d.download_count += by;
        })
    }

    async fn mark_deleted(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.record(IndexCall::MarkDeleted(target_id), |d| {
            d.deleted = true;
        })
    }

    async fn mark_restored(&self, target_id: TargetId) -> Result<(), ApplyError> {
        self.record(IndexCall::MarkRestored(target_id), |d| {
            d.deleted = false;
        })
    }
}
