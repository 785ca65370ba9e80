//! Task and dead-letter data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use openshelf_core::{DeadLetterId, TargetId, TaskId};

/// Longest error summary persisted on a task or dead-letter row.
pub const MAX_ERROR_LEN: usize = 2000;

/// Queue status of a projection task.
///
/// There is no "running" state: ownership while a task is being processed is
/// expressed by the row lock held by the claiming batch, not by a status flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Freshly enqueued, never attempted.
    Pending,
    /// Failed at least once, waiting for its backoff to elapse.
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "retrying" => Some(TaskStatus::Retrying),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of one pending mutation to a target's search document.
///
/// Delta fields are independent and not mutually exclusive; a row carries the
/// exact shape of the event it was enqueued for. Rows are never merged:
/// bursts of events on the same target produce one row each, processed in
/// ascending `id` order.
///
/// After insert only `status`, `retry_count`, `next_run_at` and `last_error`
/// change; the target and delta fields are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionTask {
    /// Store-assigned, monotonically increasing; the global FIFO tiebreaker.
    pub id: TaskId,
    /// Aggregate whose search document must change.
    pub target_id: TargetId,
    pub delta_comment: Option<i64>,
    pub delta_like: Option<i64>,
    pub delta_view: Option<i64>,
    pub delta_download: Option<i64>,
    /// Set operation (not a counter): `Some(true)` marks the document
    /// deleted, `Some(false)` restores it.
    pub set_deleted: Option<bool>,
    pub status: TaskStatus,
    /// Number of failed attempts so far; starts at 0.
    pub retry_count: u32,
    /// The task is eligible for claiming only once `next_run_at <= now`.
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Truncated summary of the most recent failure, for diagnostics.
    pub last_error: Option<String>,
}

impl ProjectionTask {
    /// Materialize a stored row from its seed. Used by store implementations
    /// when inserting; `id` comes from the store's sequence.
    pub fn from_seed(id: TaskId, seed: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            target_id: seed.target_id,
            delta_comment: seed.delta_comment,
            delta_like: seed.delta_like,
            delta_view: seed.delta_view,
            delta_download: seed.delta_download,
            set_deleted: seed.set_deleted,
            status: TaskStatus::Pending,
            retry_count: 0,
            next_run_at: now,
            created_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }
}

/// Seed of a task row before the store assigns it an id.
///
/// One constructor per event shape; each produces exactly one row with
/// `status = pending`, `retry_count = 0` and `next_run_at = now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub target_id: TargetId,
    pub delta_comment: Option<i64>,
    pub delta_like: Option<i64>,
    pub delta_view: Option<i64>,
    pub delta_download: Option<i64>,
    pub set_deleted: Option<bool>,
}

impl NewTask {
    fn empty(target_id: TargetId) -> Self {
        Self {
            target_id,
            delta_comment: None,
            delta_like: None,
            delta_view: None,
            delta_download: None,
            set_deleted: None,
        }
    }

    pub fn comment_delta(target_id: TargetId, delta: i64) -> Self {
        Self {
            delta_comment: Some(delta),
            ..Self::empty(target_id)
        }
    }

    pub fn like_delta(target_id: TargetId, delta: i64) -> Self {
        Self {
            delta_like: Some(delta),
            ..Self::empty(target_id)
        }
    }

    pub fn view_delta(target_id: TargetId, delta: i64) -> Self {
        Self {
            delta_view: Some(delta),
            ..Self::empty(target_id)
        }
    }

    pub fn download_delta(target_id: TargetId, delta: i64) -> Self {
        Self {
            delta_download: Some(delta),
            ..Self::empty(target_id)
        }
    }

    pub fn set_deleted(target_id: TargetId, deleted: bool) -> Self {
        Self {
            set_deleted: Some(deleted),
            ..Self::empty(target_id)
        }
    }
}

/// Quarantine record for a task that exhausted its retry budget.
///
/// Carries the failed task's target and delta fields verbatim so an operator
/// tool can inspect (and manually replay) the lost mutation. Written in the
/// same step that deletes the task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub target_id: TargetId,
    pub delta_comment: Option<i64>,
    pub delta_like: Option<i64>,
    pub delta_view: Option<i64>,
    pub delta_download: Option<i64>,
    pub set_deleted: Option<bool>,
    pub last_error: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Build the quarantine record for a failed task. `id` comes from the
    /// dead-letter store's own sequence.
    pub fn from_task(
        id: DeadLetterId,
        task: &ProjectionTask,
        error: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            target_id: task.target_id,
            delta_comment: task.delta_comment,
            delta_like: task.delta_like,
            delta_view: task.delta_view,
            delta_download: task.delta_download,
            set_deleted: task.set_deleted,
            last_error: truncate_error(error),
            recorded_at: now,
        }
    }
}

/// Clip an error summary to [`MAX_ERROR_LEN`], respecting char boundaries.
pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= MAX_ERROR_LEN {
        return msg.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetId {
        TargetId::new()
    }

    #[test]
    fn seed_materializes_as_pending_and_due() {
        let now = Utc::now();
        let task = ProjectionTask::from_seed(TaskId::new(1), NewTask::like_delta(target(), 1), now);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.delta_like, Some(1));
        assert_eq!(task.delta_comment, None);
        assert!(task.is_due(now));
        assert!(!task.is_due(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn each_constructor_sets_exactly_one_field() {
        let t = target();
        assert_eq!(NewTask::comment_delta(t, -1).delta_comment, Some(-1));
        assert_eq!(NewTask::view_delta(t, 5).delta_view, Some(5));
        assert_eq!(NewTask::download_delta(t, 2).delta_download, Some(2));

        let del = NewTask::set_deleted(t, true);
        assert_eq!(del.set_deleted, Some(true));
        assert_eq!(del.delta_comment, None);
        assert_eq!(del.delta_like, None);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [TaskStatus::Pending, TaskStatus::Retrying] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("running"), None);
    }

    #[test]
    fn dead_letter_carries_the_task_fields() {
        let now = Utc::now();
        let task =
            ProjectionTask::from_seed(TaskId::new(7), NewTask::comment_delta(target(), 1), now);
        let entry = DeadLetterEntry::from_task(DeadLetterId::new(1), &task, "index down", now);

        assert_eq!(entry.target_id, task.target_id);
        assert_eq!(entry.delta_comment, Some(1));
        assert_eq!(entry.set_deleted, None);
        assert_eq!(entry.last_error, "index down");
    }

    #[test]
    fn long_errors_are_clipped() {
        let long = "x".repeat(MAX_ERROR_LEN + 100);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut long = "y".repeat(MAX_ERROR_LEN - 1);
        long.push('é');
        long.push_str("tail");
        let clipped = truncate_error(&long);
        assert!(clipped.len() <= MAX_ERROR_LEN);
        assert!(clipped.starts_with('y'));
    }
}
