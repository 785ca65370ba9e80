//! Asynchronous search-projection reconciliation pipeline.
//!
//! Count-affecting domain events (comments, likes, views, downloads) and
//! soft-delete/restore flips are not pushed to the search index inline.
//! Instead, each event appends one durable task row, and a polling worker
//! drains due tasks and applies their effect against the index.
//!
//! ## Components
//!
//! - [`ProjectionTask`]: one pending mutation of a target's search document
//! - [`EnqueueTaskPort`] / [`TaskStore`]: durable queue over a relational table
//! - [`ClaimedBatch`]: a locked, disjoint batch of due tasks
//! - [`ProjectionWorker`]: applies tasks, reschedules failures with backoff,
//!   quarantines tasks that exhaust their retry budget
//! - [`DeadLetterEntry`]: quarantine record for operator inspection
//!
//! Delivery is at-least-once: a crash between apply and row deletion replays
//! the task. Set-style operations (`set_deleted`) tolerate replay; counter
//! deltas do not, and no deduplication layer hides that.

pub mod memory;
pub mod ports;
pub mod retry;
pub mod task;
pub mod worker;

pub use memory::{InMemoryProjectionIndex, InMemoryTaskStore};
pub use ports::{
    ApplyError, ClaimedBatch, DeadLetterStore, EnqueueTaskPort, ProjectionApplyPort, TaskStore,
    TaskStoreError,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use task::{truncate_error, DeadLetterEntry, NewTask, ProjectionTask, TaskStatus};
pub use worker::{BatchOutcome, ProjectionWorker, WorkerConfig};
