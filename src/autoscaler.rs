//! Autoscaler: a per-worker, opt-in policy that adjusts the host
//! worker's live executor count between `minWorkers` and `maxWorkers`,
//! under a cooldown, acting on the same executor handles the worker's
//! pool owns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::model::now_secs;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy)]
pub struct AutoscalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub tick: Duration,
    pub cooldown_secs: i64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            tick: Duration::from_secs(10),
            cooldown_secs: 30,
        }
    }
}

pub struct Autoscaler {
    worker: Arc<Worker>,
    config: AutoscalerConfig,
    last_scaled_at: Mutex<i64>,
}

impl Autoscaler {
    pub fn new(worker: Arc<Worker>, config: AutoscalerConfig) -> Self {
        Self {
            worker,
            config,
            last_scaled_at: Mutex::new(0),
        }
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

    /// `queueLength` here is read from this worker's own inbox depth —
    /// the backlog it can see without a cross-worker query, decided under
    /// a local mutex rather than a cluster-wide lock.
    async fn tick(&self) {
        let mut last_scaled_at = self.last_scaled_at.lock().await;
        let now = now_secs();
        if now - *last_scaled_at < self.config.cooldown_secs {
            return;
        }

        let active = self.worker.executor_count().await;
        let idle = self.worker.idle_executor_count();
        let queue_len = self.worker.store().inbox_len(self.worker.id()).await.unwrap_or(0) as usize;

        if queue_len > 2 * active && active < self.config.max_workers {
            let add = 2.min(self.config.max_workers - active);
            for _ in 0..add {
                self.worker.spawn_executor(CancellationToken::new()).await;
            }
            info!(worker = %self.worker.id(), added = add, active = active + add, "scaled up executor pool");
            *last_scaled_at = now;
            return;
        }

        if idle > self.config.min_workers / 2 && active > self.config.min_workers {
            if self.worker.retire_one_executor().await {
                info!(worker = %self.worker.id(), active = active - 1, "scaled down executor pool");
                *last_scaled_at = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::store::{MemoryStore, Store};
    use crate::worker::{stub_job_fn, WorkerConfig};

    #[tokio::test]
    async fn scales_up_when_queue_outpaces_executors() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = Worker::new(store.clone(), "w1", WorkerConfig::default(), stub_job_fn());
        worker.spawn_executor(CancellationToken::new()).await;
        for _ in 0..5 {
            store.inbox_put("w1", &Task::new("t", vec![])).await.unwrap();
        }

        let autoscaler = Autoscaler::new(
            worker.clone(),
            AutoscalerConfig {
                min_workers: 1,
                max_workers: 10,
                tick: Duration::from_secs(10),
                cooldown_secs: 0,
            },
        );
        autoscaler.tick().await;

        assert_eq!(worker.executor_count().await, 3);
    }

    #[tokio::test]
    async fn never_scales_down_below_min_workers() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = Worker::new(store.clone(), "w1", WorkerConfig::default(), stub_job_fn());
        worker.spawn_executor(CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let autoscaler = Autoscaler::new(
            worker.clone(),
            AutoscalerConfig {
                min_workers: 1,
                max_workers: 10,
                tick: Duration::from_secs(10),
                cooldown_secs: 0,
            },
        );
        autoscaler.tick().await;

        assert_eq!(worker.executor_count().await, 1);
    }
}
