//! Crate-wide error taxonomy.
//!
//! Every fallible operation against the shared store, scheduler, coordinator,
//! or worker funnels through [`MeshError`]. Long-running loops never let an
//! error unwind past a single tick — each tick's body returns a [`MeshResult`]
//! that the loop logs and swallows, per the "no exception escapes a loop
//! iteration" rule.

use thiserror::Error;

use crate::model::TaskId;

#[derive(Error, Debug)]
pub enum MeshError {
    /// The shared store round trip failed (connection, timeout, protocol).
    ///
    /// Treated as transient: the caller retries on the next tick rather than
    /// dropping the task. No task is ever removed from its last consistent
    /// location because of a store error alone.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// A task's bytes could not be deserialized back into a [`crate::model::Task`].
    ///
    /// This is a poison pill: the raw entry is moved straight to
    /// `FailedTasks` without a retry.
    #[error("poison task {0}: {1}")]
    PoisonTask(TaskId, String),

    /// Serialization failure on the way into the store.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A task referenced a dependency, worker, or result that isn't present.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// `retry_count >= max_retries`; the task is terminal.
    #[error("task {0} exceeded max retries ({1})")]
    MaxRetriesExceeded(TaskId, u32),

    /// An atomic create-if-absent lost a race (assignment or steal); the
    /// caller abandons this one task and moves to the next.
    #[error("assignment race on task {0}")]
    AssignmentRace(TaskId),

    /// Priority outside 1..=10, or another input shape violation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Executor handoff channel closed or full past the bounded wait.
    #[error("executor handoff failed: {0}")]
    Handoff(String),

    /// Catch-all for conditions that should be rare and indicate a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type MeshResult<T> = Result<T, MeshError>;
