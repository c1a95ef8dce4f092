//! Worker-start control path backing `POST /api/workers/start` / `stop`:
//! the one place the HTTP admin surface touches the core beyond enqueue
//! and read-only queries. Spawns and tracks in-process [`Worker`]
//! instances (plus their optional [`Stealer`]/[`Autoscaler`]) so the
//! admin API can start and stop pools by id.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::autoscaler::AutoscalerConfig;
use crate::store::Store;
use crate::worker::{stub_job_fn, Worker, WorkerConfig};

fn default_pool_size() -> usize {
    5
}
fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkerRequest {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub enable_steal: bool,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for StartWorkerRequest {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            enable_steal: false,
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
        }
    }
}

struct ManagedWorker {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Registry of worker instances this process has started via the admin
/// API, keyed by worker id. Stopping a worker cancels its token and lets
/// the coordinator's monitor loop salvage its buckets once its heartbeat
/// lapses, same as any other worker death.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    workers: Arc<Mutex<HashMap<String, ManagedWorker>>>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a new worker with a fresh generated id, its pool, and its
    /// optional stealer/autoscaler loops, all under one child token.
    pub async fn start(&self, request: StartWorkerRequest) -> String {
        let worker_id = format!("w_{}", Uuid::new_v4().simple());
        let token = CancellationToken::new();

        let mut worker_config = WorkerConfig::default();
        worker_config.pool_size = request.pool_size;
        let worker = Worker::new(self.store.clone(), worker_id.clone(), worker_config, stub_job_fn());

        let run_token = token.clone();
        let enable_steal = request.enable_steal;
        let autoscale_config = AutoscalerConfig {
            min_workers: request.min_workers,
            max_workers: request.max_workers,
            ..AutoscalerConfig::default()
        };

        let handle = tokio::spawn(crate::pool::run(worker.clone(), run_token, enable_steal, autoscale_config));

        self.workers
            .lock()
            .await
            .insert(worker_id.clone(), ManagedWorker { token, handle });
        info!(worker = %worker_id, pool_size = request.pool_size, "started worker via admin API");
        worker_id
    }

    /// Cancels the worker's loops. Returns `false` if no worker with
    /// this id was started by this process (it may still exist in
    /// `Workers` if it was started elsewhere).
    pub async fn stop(&self, worker_id: &str) -> bool {
        let managed = self.workers.lock().await.remove(worker_id);
        match managed {
            Some(managed) => {
                managed.token.cancel();
                let _ = managed.handle.await;
                info!(worker = %worker_id, "stopped worker via admin API");
                true
            }
            None => false,
        }
    }

    pub async fn managed_ids(&self) -> Vec<String> {
        self.workers.lock().await.keys().cloned().collect()
    }
}
