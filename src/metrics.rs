//! Metrics probe: read-only aggregation over
//! the shared store, producing the `SystemMetrics`/`WorkerInfo` JSON
//! shapes the control-plane HTTP surface exposes, plus a Prometheus text
//! exposition for an internal scrape endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::error::MeshResult;
use crate::model::now_secs;
use crate::store::Store;

const LIVENESS_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub last_seen: i64,
    pub tasks_processed: u64,
    pub active_tasks: u64,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub active_workers: u64,
    pub total_tasks: u64,
    pub processed_tasks: u64,
    pub failed_tasks: u64,
    pub queue_lengths: HashMap<u8, u64>,
    pub worker_metrics: HashMap<String, WorkerInfo>,
}

pub struct MetricsProbe {
    store: Arc<dyn Store>,
}

impl MetricsProbe {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Builds the `GET /api/metrics` response by reading `Workers`,
    /// `Q[1..10]`, `Results`, `FailedTasks`, and every live worker's
    /// `Processing` bucket depth. Purely additive reads; never mutates
    /// the store.
    pub async fn snapshot(&self) -> MeshResult<SystemMetrics> {
        let heartbeats = self.store.worker_list().await?;
        let now = now_secs();

        let mut tasks_processed_by_worker: HashMap<String, u64> =
            HashMap::with_capacity(heartbeats.len());
        for result in self.store.results_all().await? {
            *tasks_processed_by_worker.entry(result.worker_id).or_insert(0) += 1;
        }
        for result in self.store.failed_all().await? {
            *tasks_processed_by_worker.entry(result.worker_id).or_insert(0) += 1;
        }

        let mut worker_metrics = HashMap::with_capacity(heartbeats.len());
        let mut active_workers = 0u64;
        for (worker_id, last_seen) in &heartbeats {
            let status = if now - last_seen <= LIVENESS_SECS {
                active_workers += 1;
                WorkerStatus::Active
            } else {
                WorkerStatus::Inactive
            };
            let active_tasks = self.store.processing_all(worker_id).await?.len() as u64
                + self.store.inbox_len(worker_id).await?;
            let tasks_processed = tasks_processed_by_worker
                .get(worker_id)
                .copied()
                .unwrap_or(0);
            worker_metrics.insert(
                worker_id.clone(),
                WorkerInfo {
                    id: worker_id.clone(),
                    last_seen: *last_seen,
                    tasks_processed,
                    active_tasks,
                    status,
                },
            );
        }

        let mut queue_lengths = HashMap::with_capacity(10);
        for priority in 1..=10u8 {
            queue_lengths.insert(priority, self.store.queue_len(priority).await?);
        }

        let processed_tasks = self.store.results_count().await?;
        let failed_tasks = self.store.failed_count().await?;
        let queued: u64 = queue_lengths.values().sum();
        let total_tasks = processed_tasks + failed_tasks + queued;

        Ok(SystemMetrics {
            active_workers,
            total_tasks,
            processed_tasks,
            failed_tasks,
            queue_lengths,
            worker_metrics,
        })
    }
}

/// Process-wide Prometheus registry, in the same gauge style as
/// `telemetry_service`, exported as plain text exposition rather than
/// the JSON shape `snapshot` returns.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static ACTIVE_WORKERS_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("taskmesh_active_workers", "Number of workers within the liveness gate").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static QUEUE_DEPTH_GAUGE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("taskmesh_queue_depth", "Ready tasks waiting per priority"),
        &["priority"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static TASKS_TOTAL_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("taskmesh_tasks_total", "Terminal task outcomes observed by the metrics probe"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

/// Refreshes the process-wide gauges from a freshly taken snapshot, then
/// renders the Prometheus text exposition format for `/internal/metrics`.
pub fn render_prometheus(snapshot: &SystemMetrics) -> String {
    ACTIVE_WORKERS_GAUGE.set(snapshot.active_workers as i64);
    for (priority, len) in &snapshot.queue_lengths {
        QUEUE_DEPTH_GAUGE.with_label_values(&[&priority.to_string()]).set(*len as i64);
    }
    TASKS_TOTAL_COUNTER.with_label_values(&["completed"]).reset();
    TASKS_TOTAL_COUNTER
        .with_label_values(&["completed"])
        .inc_by(snapshot.processed_tasks);
    TASKS_TOTAL_COUNTER.with_label_values(&["failed"]).reset();
    TASKS_TOTAL_COUNTER
        .with_label_values(&["failed"])
        .inc_by(snapshot.failed_tasks);

    let families = REGISTRY.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, TaskResult, TaskStatus};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn snapshot_counts_queued_processed_and_failed_tasks() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.worker_heartbeat("w1", now_secs()).await.unwrap();
        store.queue_push(5, 1.0, &Task::new("t", vec![])).await.unwrap();
        store
            .results_put(&TaskResult {
                task_id: "done".to_string(),
                status: TaskStatus::Completed,
                output: None,
                error: None,
                started_at: 0,
                ended_at: 1,
                retry_count: 0,
                worker_id: "w1".to_string(),
                metrics: None,
                source_task: Task::new("t", vec![]),
            })
            .await
            .unwrap();

        let probe = MetricsProbe::new(store);
        let snapshot = probe.snapshot().await.unwrap();

        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.processed_tasks, 1);
        assert_eq!(snapshot.total_tasks, 2);
        assert_eq!(snapshot.worker_metrics["w1"].status, WorkerStatus::Active);
        assert_eq!(snapshot.worker_metrics["w1"].tasks_processed, 1);
    }

    #[tokio::test]
    async fn stale_worker_reports_inactive_status() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.worker_heartbeat("stale", now_secs() - 3600).await.unwrap();

        let probe = MetricsProbe::new(store);
        let snapshot = probe.snapshot().await.unwrap();

        assert_eq!(snapshot.active_workers, 0);
        assert_eq!(snapshot.worker_metrics["stale"].status, WorkerStatus::Inactive);
    }

    #[tokio::test]
    async fn tasks_processed_counts_results_and_failures_per_worker() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.worker_heartbeat("w1", now_secs()).await.unwrap();
        store
            .results_put(&TaskResult {
                task_id: "done-1".to_string(),
                status: TaskStatus::Completed,
                output: None,
                error: None,
                started_at: 0,
                ended_at: 1,
                retry_count: 0,
                worker_id: "w1".to_string(),
                metrics: None,
                source_task: Task::new("t", vec![]),
            })
            .await
            .unwrap();
        store
            .results_put(&TaskResult {
                task_id: "done-2".to_string(),
                status: TaskStatus::Completed,
                output: None,
                error: None,
                started_at: 0,
                ended_at: 1,
                retry_count: 0,
                worker_id: "w1".to_string(),
                metrics: None,
                source_task: Task::new("t", vec![]),
            })
            .await
            .unwrap();
        store
            .failed_put(&TaskResult {
                task_id: "fail-1".to_string(),
                status: TaskStatus::Failed,
                output: None,
                error: Some("boom".to_string()),
                started_at: 0,
                ended_at: 1,
                retry_count: 3,
                worker_id: "w1".to_string(),
                metrics: None,
                source_task: Task::new("t", vec![]),
            })
            .await
            .unwrap();

        let probe = MetricsProbe::new(store);
        let snapshot = probe.snapshot().await.unwrap();

        assert_eq!(snapshot.worker_metrics["w1"].tasks_processed, 3);
    }
}
