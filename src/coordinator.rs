//! Coordinator: pulls ready tasks onto live workers, garbage-collects
//! dead ones, and reaps finished results.
//!
//! Three independent loops share one [`Store`] and one in-process
//! liveness view. The liveness map is the only intra-process mutable
//! state shared across loops; only [`Coordinator::monitor_loop`] writes
//! it, the other two only read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{now_secs, TaskStatus, WorkerId};
use crate::scheduler::Scheduler;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub distribute_tick: Duration,
    pub reap_tick: Duration,
    pub monitor_tick: Duration,
    pub liveness_secs: i64,
    pub batch_pull: usize,
    /// When `false`, `Coordinator::run` clears the whole key space on
    /// start. Set `true` for a durable deployment, which only resumes
    /// interrupted salvage instead.
    pub durable: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            distribute_tick: Duration::from_millis(100),
            reap_tick: Duration::from_millis(100),
            monitor_tick: Duration::from_secs(5),
            liveness_secs: 30,
            batch_pull: 5,
            durable: false,
        }
    }
}

/// The coordinator's in-process view of which workers are live, built by
/// the monitor loop and read by the distribute loop's round-robin picker.
#[derive(Default)]
struct LiveWorkers {
    order: Vec<WorkerId>,
    next: usize,
}

impl LiveWorkers {
    fn set(&mut self, mut ids: Vec<WorkerId>) {
        ids.sort();
        if ids != self.order {
            self.order = ids;
            self.next = 0;
        }
    }

    fn pick(&mut self) -> Option<WorkerId> {
        if self.order.is_empty() {
            return None;
        }
        let id = self.order[self.next % self.order.len()].clone();
        self.next = self.next.wrapping_add(1);
        Some(id)
    }
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    config: CoordinatorConfig,
    live: Arc<RwLock<LiveWorkers>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<Scheduler>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
            live: Arc::new(RwLock::new(LiveWorkers::default())),
        }
    }

    /// One-shot startup reconciliation. In non-durable mode this clears
    /// the whole key space; in durable mode it only completes a salvage
    /// that an earlier coordinator may have been interrupted mid-way
    /// through.
    pub async fn cleanup(&self) -> Result<()> {
        if !self.config.durable {
            info!("non-durable start: clearing queues, workers, and results");
            self.store.clear_all().await?;
            return Ok(());
        }

        let orphans = self.store.orphaned_worker_ids().await?;
        if orphans.is_empty() {
            return Ok(());
        }
        warn!(count = orphans.len(), "resuming interrupted salvage from prior coordinator");
        for worker_id in orphans {
            self.salvage_worker(&worker_id).await?;
        }
        Ok(())
    }

    /// Runs all three loops until `token` is cancelled, joining every
    /// handle before returning so no task is left mid-transfer.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        self.cleanup().await?;

        let handles: Vec<JoinHandle<()>> = vec![
            spawn_loop(self.clone(), token.clone(), Self::distribute_tick, self.config.distribute_tick),
            spawn_loop(self.clone(), token.clone(), Self::reap_tick, self.config.reap_tick),
            spawn_loop(self.clone(), token.clone(), Self::monitor_tick, self.config.monitor_tick),
        ];

        token.cancelled().await;
        for handle in handles {
            let _ = handle.await;
        }
        info!("coordinator shut down");
        Ok(())
    }

    /// Distribute loop body: strict priority 10 down to 1, up to
    /// `batch_pull` entries per queue, round-robin over the live set.
    async fn distribute_tick(&self) {
        let mut picker = self.live.write().await;
        if picker.order.is_empty() {
            return;
        }

        for priority in (1..=10u8).rev() {
            let batch = match self.scheduler.pull_batch(priority, self.config.batch_pull).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(%priority, error = %err, "queue pull failed, will retry next tick");
                    continue;
                }
            };

            for (score, task) in batch {
                let Some(worker_id) = picker.pick() else {
                    // No live workers after all; put it back.
                    if let Err(err) = self.store.queue_push(priority, score, &task).await {
                        error!(task_id = %task.id, error = %err, "failed to return undeliverable task to queue");
                    }
                    continue;
                };

                let mut assigned = task.clone();
                assigned.status = TaskStatus::Assigned;
                assigned.worker_id = Some(worker_id.clone());
                assigned.touch();

                match self.store.inbox_put_if_absent(&worker_id, &assigned).await {
                    Ok(true) => {
                        debug!(task_id = %task.id, worker = %worker_id, "assigned task");
                    }
                    Ok(false) => {
                        // A steal beat us to the destination inbox. The source
                        // copy is gone; nothing further to do, the task lives
                        // on at the destination.
                        warn!(task_id = %task.id, worker = %worker_id, "assignment race, task already present at destination");
                    }
                    Err(err) => {
                        error!(task_id = %task.id, worker = %worker_id, error = %err, "inbox write failed, returning task to queue");
                        if let Err(err) = self.store.queue_push(priority, score, &task).await {
                            error!(task_id = %task.id, error = %err, "failed to return task to queue after inbox write failure");
                        }
                    }
                }
            }
        }
    }

    /// Reap loop body: drain every live worker's outbox into
    /// `Results`/`FailedTasks`, then resolve dependents.
    async fn reap_tick(&self) {
        let worker_ids: Vec<WorkerId> = self.live.read().await.order.clone();
        for worker_id in worker_ids {
            let results = match self.store.outbox_drain(&worker_id).await {
                Ok(results) => results,
                Err(err) => {
                    error!(worker = %worker_id, error = %err, "outbox drain failed");
                    continue;
                }
            };

            for result in results {
                if result.is_terminal_success() {
                    if let Err(err) = self.store.results_put(&result).await {
                        error!(task_id = %result.task_id, error = %err, "failed to reap result");
                        continue;
                    }
                } else {
                    // A failed execution retries with backoff up to
                    // `max_retries`, then becomes terminal.
                    match self.scheduler.retry(result.source_task.clone()).await {
                        Ok(()) => {
                            debug!(task_id = %result.task_id, retry_count = result.source_task.retry_count + 1, "scheduled retry");
                            continue;
                        }
                        Err(crate::error::MeshError::MaxRetriesExceeded(_, _)) => {
                            if let Err(err) = self.store.failed_put(&result).await {
                                error!(task_id = %result.task_id, error = %err, "failed to reap terminal failure");
                                continue;
                            }
                        }
                        Err(err) => {
                            error!(task_id = %result.task_id, error = %err, "retry scheduling failed, will retry next reap tick");
                            continue;
                        }
                    }
                }
                if let Err(err) = self.scheduler.on_complete(&result.task_id).await {
                    error!(task_id = %result.task_id, error = %err, "dependency resolution failed after reap");
                }
            }
        }
    }

    /// Monitor loop body: refresh the liveness view from `Workers`, and
    /// salvage anything owned by a worker that lapsed.
    async fn monitor_tick(&self) {
        let heartbeats = match self.store.worker_list().await {
            Ok(h) => h,
            Err(err) => {
                error!(error = %err, "worker list read failed");
                return;
            }
        };

        let now = now_secs();
        let mut alive = Vec::new();
        let mut dead = Vec::new();
        for (worker_id, last_seen) in heartbeats {
            if now - last_seen <= self.config.liveness_secs {
                alive.push(worker_id);
            } else {
                dead.push(worker_id);
            }
        }

        self.live.write().await.set(alive);

        for worker_id in dead {
            warn!(worker = %worker_id, "liveness gate lapsed, salvaging");
            if let Err(err) = self.salvage_worker(&worker_id).await {
                error!(worker = %worker_id, error = %err, "salvage failed, will retry on next orphan sweep");
                continue;
            }
            if let Err(err) = self.store.worker_remove(&worker_id).await {
                error!(worker = %worker_id, error = %err, "failed to remove dead worker from registry");
            }
        }
    }

    /// Re-injects every task in `worker_id`'s `Inbox` and `Processing`
    /// buckets back onto its priority queue with a fresh score.
    /// Delete-after-requeue so a crash mid-salvage leaves the task still
    /// readable from its original bucket for the next pass.
    async fn salvage_worker(&self, worker_id: &str) -> Result<()> {
        for task in self.store.inbox_all(worker_id).await? {
            self.scheduler.requeue(task.clone()).await?;
            self.store.inbox_remove(worker_id, &task.id).await?;
        }
        for task in self.store.processing_all(worker_id).await? {
            self.scheduler.requeue(task.clone()).await?;
            self.store.processing_remove(worker_id, &task.id).await?;
        }
        Ok(())
    }

    pub async fn live_worker_count(&self) -> usize {
        self.live.read().await.order.len()
    }
}

fn spawn_loop<F>(coordinator: Arc<Coordinator>, token: CancellationToken, tick_fn: F, interval: Duration) -> JoinHandle<()>
where
    F: for<'a> Fn(&'a Coordinator) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>
        + Send
        + Sync
        + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick_fn(&coordinator).await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::scheduler::SchedulerConfig;
    use crate::store::MemoryStore;

    fn coordinator() -> (Arc<Coordinator>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(Scheduler::new(store.clone(), SchedulerConfig::default()));
        let coordinator = Arc::new(Coordinator::new(store.clone(), scheduler, CoordinatorConfig::default()));
        (coordinator, store)
    }

    #[tokio::test]
    async fn distribute_assigns_highest_priority_first() {
        let (coordinator, store) = coordinator();
        store.worker_heartbeat("w1", now_secs()).await.unwrap();
        coordinator.monitor_tick().await;

        let low = Task::new("t", vec![]);
        let mut high = Task::new("t", vec![]);
        high.priority = 10;
        store.queue_push(5, 100.0, &low).await.unwrap();
        store.queue_push(10, 100.0, &high).await.unwrap();

        coordinator.distribute_tick().await;

        let inbox = store.inbox_all("w1").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, high.id);
    }

    #[tokio::test]
    async fn reap_moves_outbox_results_into_results_table() {
        let (coordinator, store) = coordinator();
        store.worker_heartbeat("w1", now_secs()).await.unwrap();
        coordinator.monitor_tick().await;

        let result = crate::model::TaskResult {
            task_id: "t1".to_string(),
            status: TaskStatus::Completed,
            output: None,
            error: None,
            started_at: 0,
            ended_at: 1,
            retry_count: 0,
            worker_id: "w1".to_string(),
            metrics: None,
            source_task: Task::new("t", vec![]),
        };
        store.outbox_put("w1", &result).await.unwrap();

        coordinator.reap_tick().await;

        assert!(store.results_contains("t1").await.unwrap());
        assert!(store.outbox_drain("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn monitor_salvages_dead_worker_buckets_back_to_queue() {
        let (coordinator, store) = coordinator();
        store.worker_heartbeat("ghost", now_secs() - 100).await.unwrap();
        let task = Task::new("t", vec![]);
        store.inbox_put("ghost", &task).await.unwrap();

        coordinator.monitor_tick().await;

        assert_eq!(store.queue_len(task.priority).await.unwrap(), 1);
        assert!(store.inbox_all("ghost").await.unwrap().is_empty());
        assert!(store.worker_list().await.unwrap().get("ghost").is_none());
    }
}
