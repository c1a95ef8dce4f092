//! Placement, dependency resolution, and retry backoff.
//!
//! The scheduler never talks to a worker or a channel — its whole surface is
//! three operations against the [`Store`]: [`Scheduler::enqueue`],
//! [`Scheduler::on_complete`], and [`Scheduler::retry`]. The coordinator and
//! worker call into it; it never calls out.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::model::{now_secs, Task, TaskId, TaskStatus};
use crate::store::Store;

/// A dependency that resolved by appearing in `FailedTasks` rather than
/// `Results`. Dependents still run — the task body decides whether to
/// fail fast — but they're stamped so a poison upstream isn't silently
/// invisible downstream.
pub const INELIGIBLE_DEPENDENCY_FLAG: &str = "ineligible_dependency";

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Score bonus applied to a task whose deadline has already passed, so
    /// it preempts everything else within its priority.
    pub overdue_bonus: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            overdue_bonus: 1_000_000.0,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// `score = nowSeconds − deadline_urgency_bonus`, so lower scores pop
    /// first: overdue tasks get the full bonus, imminent deadlines a
    /// partial one, deadline-less tasks none at all.
    pub fn score(&self, task: &Task, now: i64) -> f64 {
        let bonus = match task.deadline {
            Some(deadline) if deadline <= now => self.config.overdue_bonus,
            Some(deadline) => (deadline - now) as f64,
            None => 0.0,
        };
        now as f64 - bonus
    }

    /// Places `task` onto `Q[priority]` if every dependency is already
    /// resolved, or parks it under `Waiting` and registers it against each
    /// unresolved dependency's `DepWaiters` set otherwise.
    pub async fn enqueue(&self, mut task: Task) -> MeshResult<()> {
        task.validate()?;

        let mut unresolved = Vec::new();
        for dep in &task.dependencies {
            if !self.store.results_contains(dep).await? && !self.store.failed_get(dep).await?.is_some() {
                unresolved.push(dep.clone());
            }
        }

        if !unresolved.is_empty() {
            debug!(task_id = %task.id, unresolved = unresolved.len(), "parking task on dependency gate");
            task.status = TaskStatus::Pending;
            self.store.waiting_put(&task).await?;
            for dep in &unresolved {
                self.store.dep_waiters_add(dep, &task.id).await?;
            }
            return Ok(());
        }

        self.flag_if_dependency_failed(&mut task).await?;
        self.place(task).await
    }

    async fn flag_if_dependency_failed(&self, task: &mut Task) -> MeshResult<()> {
        for dep in &task.dependencies {
            if self.store.failed_get(dep).await?.is_some() {
                task.metadata
                    .insert(INELIGIBLE_DEPENDENCY_FLAG.to_string(), dep.clone());
            }
        }
        Ok(())
    }

    async fn place(&self, mut task: Task) -> MeshResult<()> {
        task.status = TaskStatus::Pending;
        task.touch();
        let now = now_secs();
        let score = self.score(&task, now);
        self.store.queue_push(task.priority, score, &task).await?;
        Ok(())
    }

    /// Called by the coordinator's reap loop once `taskId`'s result has
    /// landed in `Results` or `FailedTasks`: re-checks every waiter's
    /// dependency set and enqueues those now fully resolved.
    pub async fn on_complete(&self, task_id: &str) -> MeshResult<()> {
        let waiters = self.store.dep_waiters_take(task_id).await?;
        for waiter_id in waiters {
            let Some(mut waiting_task) = self.store.waiting_take(&waiter_id).await? else {
                continue;
            };

            let mut still_unresolved = false;
            for dep in &waiting_task.dependencies {
                let resolved =
                    self.store.results_contains(dep).await? || self.store.failed_get(dep).await?.is_some();
                if !resolved {
                    still_unresolved = true;
                    break;
                }
            }

            if still_unresolved {
                self.store.waiting_put(&waiting_task).await?;
                continue;
            }

            self.flag_if_dependency_failed(&mut waiting_task).await?;
            self.place(waiting_task).await?;
        }
        Ok(())
    }

    /// Exponential backoff with no jitter in the base design: `next_eligible_at
    /// = now + 2^retry_count`. Fails terminally once `retry_count >= max_retries`.
    pub async fn retry(&self, mut task: Task) -> MeshResult<()> {
        if task.retry_count >= task.max_retries {
            warn!(task_id = %task.id, retries = task.retry_count, "max retries exceeded");
            return Err(MeshError::MaxRetriesExceeded(task.id, task.max_retries));
        }
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.next_eligible_at = now_secs() + 2i64.pow(task.retry_count);
        task.touch();
        self.place(task).await
    }

    pub async fn pull_batch(&self, priority: u8, limit: usize) -> MeshResult<Vec<(f64, Task)>> {
        self.store.queue_pop_front(priority, limit).await
    }

    pub async fn queue_len(&self, priority: u8) -> MeshResult<u64> {
        self.store.queue_len(priority).await
    }

    /// Re-injects a task with a fresh score, used by the coordinator's
    /// salvage path and the work stealer's failure rollback.
    pub async fn requeue(&self, task: Task) -> MeshResult<()> {
        self.place(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::store::MemoryStore;

    fn scheduler() -> (Scheduler, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        (Scheduler::new(store.clone(), SchedulerConfig::default()), store)
    }

    #[tokio::test]
    async fn dependency_free_task_lands_straight_on_its_queue() {
        let (sched, store) = scheduler();
        let mut task = Task::new("t", vec![]);
        task.priority = 7;
        sched.enqueue(task).await.unwrap();
        assert_eq!(store.queue_len(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dependent_task_parks_until_dependency_resolves() {
        let (sched, store) = scheduler();
        let mut dependent = Task::new("b", vec![]);
        dependent.dependencies = vec!["a1".to_string()];
        sched.enqueue(dependent.clone()).await.unwrap();
        assert_eq!(store.queue_len(dependent.priority).await.unwrap(), 0);

        let result = crate::model::TaskResult {
            task_id: "a1".to_string(),
            status: TaskStatus::Completed,
            output: None,
            error: None,
            started_at: 0,
            ended_at: 0,
            retry_count: 0,
            worker_id: "w".to_string(),
            metrics: None,
            source_task: Task::new("a", vec![]),
        };
        store.results_put(&result).await.unwrap();
        sched.on_complete("a1").await.unwrap();

        assert_eq!(store.queue_len(dependent.priority).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overdue_deadline_scores_lower_than_distant_one() {
        let (sched, _store) = scheduler();
        let now = now_secs();
        let mut overdue = Task::new("b", vec![]);
        overdue.deadline = Some(now - 1);
        let mut distant = Task::new("a", vec![]);
        distant.deadline = Some(now + 60);

        assert!(sched.score(&overdue, now) < sched.score(&distant, now));
    }

    #[tokio::test]
    async fn retry_applies_exponential_backoff_and_terminal_error() {
        let (sched, store) = scheduler();
        let mut task = Task::new("t", vec![]);
        task.max_retries = 2;
        let before = now_secs();

        sched.retry(task.clone()).await.unwrap();
        let queued = store.queue_pop_front(task.priority, 1).await.unwrap();
        let (_, requeued) = &queued[0];
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.next_eligible_at >= before + 2);

        task.retry_count = 2;
        let err = sched.retry(task).await.unwrap_err();
        assert!(matches!(err, MeshError::MaxRetriesExceeded(_, 2)));
    }
}
