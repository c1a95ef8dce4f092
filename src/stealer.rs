//! Work stealer: a per-worker, opt-in policy that rebalances queue depth
//! between siblings' inboxes. Active only while the host worker has at
//! least one idle executor.
//!
//! Safety: each move is a create-if-absent on the destination inbox, so
//! a task can never land in two workers' inboxes at once —
//! `inbox_put_if_absent` serializes against the coordinator's own
//! assignment writes through key uniqueness.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::worker::Worker;

const STEAL_THRESHOLD: u64 = 2;

#[derive(Debug, Clone, Copy)]
pub struct StealerConfig {
    pub tick: Duration,
}

impl Default for StealerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
        }
    }
}

pub struct Stealer {
    worker: Arc<Worker>,
    config: StealerConfig,
}

impl Stealer {
    pub fn new(worker: Arc<Worker>, config: StealerConfig) -> Self {
        Self { worker, config }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        if self.worker.idle_executor_count() == 0 {
            return;
        }

        let siblings = match self.worker.store().worker_list().await {
            Ok(map) => map,
            Err(err) => {
                warn!(error = %err, "worker list read failed, skipping steal tick");
                return;
            }
        };

        let self_id = self.worker.id().to_string();
        let mut candidates = Vec::new();
        for worker_id in siblings.keys() {
            if worker_id == &self_id {
                continue;
            }
            match self.worker.store().inbox_len(worker_id).await {
                Ok(len) if len > STEAL_THRESHOLD => candidates.push((worker_id.clone(), len)),
                Ok(_) => {}
                Err(err) => warn!(sibling = %worker_id, error = %err, "inbox length read failed"),
            }
        }

        // Steal from the deepest sibling queue first.
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        if let Some((candidate, size)) = candidates.into_iter().next() {
            self.steal_from(&candidate, (size / 2) as usize).await;
        }
    }

    async fn steal_from(&self, source: &str, take: usize) {
        if take == 0 {
            return;
        }
        let tasks = match self.worker.store().inbox_all(source).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(sibling = %source, error = %err, "inbox read failed during steal");
                return;
            }
        };

        let mut moved = 0usize;
        for task in tasks.into_iter().take(take) {
            match self.worker.store().inbox_put_if_absent(self.worker.id(), &task).await {
                Ok(true) => {
                    if let Err(err) = self.worker.store().inbox_remove(source, &task.id).await {
                        warn!(task_id = %task.id, error = %err, "failed to remove stolen task from source inbox");
                    }
                    moved += 1;
                }
                Ok(false) => {
                    // Lost the race to the coordinator's own assignment; abandon
                    // this one task and continue with the rest of the batch.
                    debug!(task_id = %task.id, "steal lost race to assignment, abandoning");
                }
                Err(err) => warn!(task_id = %task.id, error = %err, "steal write failed"),
            }
        }

        if moved > 0 {
            info!(from = %source, to = %self.worker.id(), moved, "stole tasks to rebalance queue depth");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{now_secs, Task};
    use crate::store::{MemoryStore, Store};
    use crate::worker::{stub_job_fn, WorkerConfig};

    #[tokio::test]
    async fn steals_half_of_a_deep_siblings_inbox() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let w1 = Worker::new(store.clone(), "w1", WorkerConfig::default(), stub_job_fn());
        w1.spawn_executor(CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.worker_heartbeat("w1", now_secs()).await.unwrap();
        store.worker_heartbeat("w2", now_secs()).await.unwrap();
        for _ in 0..4 {
            let task = Task::new("t", vec![]);
            store.inbox_put("w2", &task).await.unwrap();
        }

        let stealer = Stealer::new(w1.clone(), StealerConfig::default());
        stealer.tick().await;

        assert_eq!(store.inbox_len("w1").await.unwrap(), 2);
        assert_eq!(store.inbox_len("w2").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn does_not_steal_below_threshold() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let w1 = Worker::new(store.clone(), "w1", WorkerConfig::default(), stub_job_fn());
        w1.spawn_executor(CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.worker_heartbeat("w1", now_secs()).await.unwrap();
        store.worker_heartbeat("w2", now_secs()).await.unwrap();
        let task = Task::new("t", vec![]);
        store.inbox_put("w2", &task).await.unwrap();

        let stealer = Stealer::new(w1.clone(), StealerConfig::default());
        stealer.tick().await;

        assert_eq!(store.inbox_len("w1").await.unwrap(), 0);
    }
}
