//! The shared store abstraction.
//!
//! [`Store`] names every logical-collection operation the coordinator,
//! worker, scheduler, and stealer need, without committing to a backend.
//! [`redis_store::RedisStore`] is the production implementation;
//! [`memory_store::MemoryStore`] is an in-process double used by tests so
//! scheduling and lifecycle logic can be exercised without a live Redis.
//!
//! Every multi-step transfer (`Q[p]` → `Inbox[w]`, `Inbox[w]` → `Inbox[w']`)
//! is a write-then-delete, never a single atomic move — the store offers
//! only single-key atomicity. Correctness relies on the uniqueness check
//! `inbox_put_if_absent` performs on the destination key.

pub mod memory_store;
pub mod redis_store;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::MeshResult;
use crate::model::{Task, TaskId, TaskResult, WorkerId};

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

/// A single entry read off a priority queue: its sort score and the task
/// it carries. Score ordering is ascending — lower pops first.
pub type QueueEntry = (f64, Task);

#[async_trait]
pub trait Store: Send + Sync {
    // -- Q[p]: per-priority ready queues -----------------------------------
    async fn queue_push(&self, priority: u8, score: f64, task: &Task) -> MeshResult<()>;
    async fn queue_pop_front(&self, priority: u8, limit: usize) -> MeshResult<Vec<QueueEntry>>;
    async fn queue_remove(&self, priority: u8, task_id: &str) -> MeshResult<()>;
    async fn queue_len(&self, priority: u8) -> MeshResult<u64>;

    // -- Waiting / DepWaiters: dependency gate ------------------------------
    async fn waiting_put(&self, task: &Task) -> MeshResult<()>;
    async fn waiting_take(&self, task_id: &str) -> MeshResult<Option<Task>>;
    async fn dep_waiters_add(&self, dep_id: &str, waiter_id: &str) -> MeshResult<()>;
    async fn dep_waiters_take(&self, dep_id: &str) -> MeshResult<Vec<TaskId>>;

    // -- Workers: liveness registry -----------------------------------------
    async fn worker_heartbeat(&self, worker_id: &str, now: i64) -> MeshResult<()>;
    async fn worker_list(&self) -> MeshResult<HashMap<WorkerId, i64>>;
    async fn worker_remove(&self, worker_id: &str) -> MeshResult<()>;

    // -- Inbox[w]: assigned, not yet picked up ------------------------------
    async fn inbox_put(&self, worker_id: &str, task: &Task) -> MeshResult<()>;
    /// Create-if-absent. Returns `false` if the task id was already present
    /// (an assignment race or a steal that lost to the coordinator).
    async fn inbox_put_if_absent(&self, worker_id: &str, task: &Task) -> MeshResult<bool>;
    async fn inbox_remove(&self, worker_id: &str, task_id: &str) -> MeshResult<Option<Task>>;
    async fn inbox_all(&self, worker_id: &str) -> MeshResult<Vec<Task>>;
    async fn inbox_len(&self, worker_id: &str) -> MeshResult<u64>;

    // -- Processing[w]: executing ---------------------------------------
    async fn processing_put(&self, worker_id: &str, task: &Task) -> MeshResult<()>;
    async fn processing_remove(&self, worker_id: &str, task_id: &str) -> MeshResult<Option<Task>>;
    async fn processing_all(&self, worker_id: &str) -> MeshResult<Vec<Task>>;

    // -- Outbox[w]: awaiting reap -----------------------------------------
    async fn outbox_put(&self, worker_id: &str, result: &TaskResult) -> MeshResult<()>;
    async fn outbox_drain(&self, worker_id: &str) -> MeshResult<Vec<TaskResult>>;

    // -- Results / FailedTasks: terminal state ------------------------------
    async fn results_put(&self, result: &TaskResult) -> MeshResult<()>;
    async fn results_get(&self, task_id: &str) -> MeshResult<Option<TaskResult>>;
    async fn results_contains(&self, task_id: &str) -> MeshResult<bool>;
    async fn results_count(&self) -> MeshResult<u64>;
    /// Every terminal success record, for per-worker aggregation (metrics).
    async fn results_all(&self) -> MeshResult<Vec<TaskResult>>;

    async fn failed_put(&self, result: &TaskResult) -> MeshResult<()>;
    async fn failed_get(&self, task_id: &str) -> MeshResult<Option<TaskResult>>;
    async fn failed_count(&self) -> MeshResult<u64>;
    /// Every terminal failure record, for per-worker aggregation (metrics).
    async fn failed_all(&self) -> MeshResult<Vec<TaskResult>>;

    /// One-shot startup cleanup: clears `Q[*]`, `Workers`, `Results`,
    /// `FailedTasks`, and every per-worker bucket. Only called when
    /// `MeshConfig.durable` is `false`.
    async fn clear_all(&self) -> MeshResult<()>;

    /// Discover per-worker buckets whose owning worker id is no longer in
    /// `Workers` — used to resume an interrupted salvage after a crash.
    async fn orphaned_worker_ids(&self) -> MeshResult<Vec<WorkerId>>;
}
