//! In-process [`Store`] double backed by `tokio::sync::Mutex`-guarded maps.
//!
//! Used by the unit and property tests in this crate so scheduler,
//! coordinator, and worker logic can be exercised without a live Redis
//! instance.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::MeshResult;
use crate::model::{Task, TaskId, TaskResult, WorkerId};

use super::{QueueEntry, Store};

#[derive(Default)]
struct Inner {
    queues: HashMap<u8, Vec<(f64, Task)>>,
    waiting: HashMap<TaskId, Task>,
    dep_waiters: HashMap<TaskId, HashSet<TaskId>>,
    workers: HashMap<WorkerId, i64>,
    inbox: HashMap<WorkerId, HashMap<TaskId, Task>>,
    processing: HashMap<WorkerId, HashMap<TaskId, Task>>,
    outbox: HashMap<WorkerId, HashMap<TaskId, TaskResult>>,
    results: HashMap<TaskId, TaskResult>,
    failed: HashMap<TaskId, TaskResult>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn queue_push(&self, priority: u8, score: f64, task: &Task) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        let q = inner.queues.entry(priority).or_default();
        q.retain(|(_, t)| t.id != task.id);
        q.push((score, task.clone()));
        q.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        Ok(())
    }

    async fn queue_pop_front(&self, priority: u8, limit: usize) -> MeshResult<Vec<QueueEntry>> {
        let mut inner = self.inner.lock().await;
        let q = inner.queues.entry(priority).or_default();
        let take = limit.min(q.len());
        Ok(q.drain(0..take).collect())
    }

    async fn queue_remove(&self, priority: u8, task_id: &str) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(q) = inner.queues.get_mut(&priority) {
            q.retain(|(_, t)| t.id != task_id);
        }
        Ok(())
    }

    async fn queue_len(&self, priority: u8) -> MeshResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(&priority).map(|q| q.len()).unwrap_or(0) as u64)
    }

    async fn waiting_put(&self, task: &Task) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner.waiting.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn waiting_take(&self, task_id: &str) -> MeshResult<Option<Task>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.waiting.remove(task_id))
    }

    async fn dep_waiters_add(&self, dep_id: &str, waiter_id: &str) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .dep_waiters
            .entry(dep_id.to_string())
            .or_default()
            .insert(waiter_id.to_string());
        Ok(())
    }

    async fn dep_waiters_take(&self, dep_id: &str) -> MeshResult<Vec<TaskId>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .dep_waiters
            .remove(dep_id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default())
    }

    async fn worker_heartbeat(&self, worker_id: &str, now: i64) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(worker_id.to_string(), now);
        Ok(())
    }

    async fn worker_list(&self) -> MeshResult<HashMap<WorkerId, i64>> {
        let inner = self.inner.lock().await;
        Ok(inner.workers.clone())
    }

    async fn worker_remove(&self, worker_id: &str) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner.workers.remove(worker_id);
        Ok(())
    }

    async fn inbox_put(&self, worker_id: &str, task: &Task) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .inbox
            .entry(worker_id.to_string())
            .or_default()
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn inbox_put_if_absent(&self, worker_id: &str, task: &Task) -> MeshResult<bool> {
        let mut inner = self.inner.lock().await;
        let bucket = inner.inbox.entry(worker_id.to_string()).or_default();
        if bucket.contains_key(&task.id) {
            return Ok(false);
        }
        bucket.insert(task.id.clone(), task.clone());
        Ok(true)
    }

    async fn inbox_remove(&self, worker_id: &str, task_id: &str) -> MeshResult<Option<Task>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .inbox
            .get_mut(worker_id)
            .and_then(|b| b.remove(task_id)))
    }

    async fn inbox_all(&self, worker_id: &str) -> MeshResult<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .inbox
            .get(worker_id)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn inbox_len(&self, worker_id: &str) -> MeshResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.inbox.get(worker_id).map(|b| b.len()).unwrap_or(0) as u64)
    }

    async fn processing_put(&self, worker_id: &str, task: &Task) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .processing
            .entry(worker_id.to_string())
            .or_default()
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn processing_remove(
        &self,
        worker_id: &str,
        task_id: &str,
    ) -> MeshResult<Option<Task>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .processing
            .get_mut(worker_id)
            .and_then(|b| b.remove(task_id)))
    }

    async fn processing_all(&self, worker_id: &str) -> MeshResult<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .processing
            .get(worker_id)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn outbox_put(&self, worker_id: &str, result: &TaskResult) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .outbox
            .entry(worker_id.to_string())
            .or_default()
            .insert(result.task_id.clone(), result.clone());
        Ok(())
    }

    async fn outbox_drain(&self, worker_id: &str) -> MeshResult<Vec<TaskResult>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .outbox
            .get_mut(worker_id)
            .map(|b| b.drain().map(|(_, v)| v).collect())
            .unwrap_or_default())
    }

    async fn results_put(&self, result: &TaskResult) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .results
            .insert(result.task_id.clone(), result.clone());
        Ok(())
    }

    async fn results_get(&self, task_id: &str) -> MeshResult<Option<TaskResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.results.get(task_id).cloned())
    }

    async fn results_contains(&self, task_id: &str) -> MeshResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.results.contains_key(task_id))
    }

    async fn results_count(&self) -> MeshResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.results.len() as u64)
    }

    async fn results_all(&self) -> MeshResult<Vec<TaskResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.results.values().cloned().collect())
    }

    async fn failed_put(&self, result: &TaskResult) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        inner.failed.insert(result.task_id.clone(), result.clone());
        Ok(())
    }

    async fn failed_get(&self, task_id: &str) -> MeshResult<Option<TaskResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.failed.get(task_id).cloned())
    }

    async fn failed_count(&self) -> MeshResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.failed.len() as u64)
    }

    async fn failed_all(&self) -> MeshResult<Vec<TaskResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.failed.values().cloned().collect())
    }

    async fn clear_all(&self) -> MeshResult<()> {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
        Ok(())
    }

    async fn orphaned_worker_ids(&self) -> MeshResult<Vec<WorkerId>> {
        let inner = self.inner.lock().await;
        let mut ids: HashSet<WorkerId> = HashSet::new();
        ids.extend(inner.inbox.keys().cloned());
        ids.extend(inner.processing.keys().cloned());
        ids.retain(|id| !inner.workers.contains_key(id));
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    #[tokio::test]
    async fn queue_pops_in_ascending_score_order() {
        let store = MemoryStore::new();
        let a = Task::new("a", vec![]);
        let b = Task::new("b", vec![]);
        store.queue_push(5, 20.0, &a).await.unwrap();
        store.queue_push(5, 10.0, &b).await.unwrap();

        let popped = store.queue_pop_front(5, 10).await.unwrap();
        assert_eq!(popped[0].1.id, b.id);
        assert_eq!(popped[1].1.id, a.id);
    }

    #[tokio::test]
    async fn inbox_put_if_absent_is_one_shot() {
        let store = MemoryStore::new();
        let task = Task::new("a", vec![]);
        assert!(store.inbox_put_if_absent("w1", &task).await.unwrap());
        assert!(!store.inbox_put_if_absent("w1", &task).await.unwrap());
    }

    #[tokio::test]
    async fn orphaned_workers_are_those_with_buckets_but_no_heartbeat() {
        let store = MemoryStore::new();
        let task = Task::new("a", vec![]);
        store.inbox_put("ghost", &task).await.unwrap();
        store.worker_heartbeat("alive", 1).await.unwrap();

        let orphans = store.orphaned_worker_ids().await.unwrap();
        assert_eq!(orphans, vec!["ghost".to_string()]);
    }
}
