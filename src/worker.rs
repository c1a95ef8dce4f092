//! Worker: registers, heartbeats, pulls assigned tasks, executes them on
//! an in-process executor pool, and submits results.
//!
//! Two bounded channels (`async_channel`, capacity 1000) are the only
//! intra-process handoff: `CheckForWork` feeds the task channel,
//! executors drain it and feed the result channel, `SubmitResults` drains
//! that. [`crate::stealer`] and [`crate::autoscaler`] reach into the same
//! executor pool and task channel this module owns.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{now_secs, Task, TaskResult, TaskStatus, WorkerId};
use crate::store::Store;

const CHANNEL_CAPACITY: usize = 1000;

/// Outcome of running one task's job body: either the output bytes or an
/// error string, matching `TaskResult`'s shape.
pub type JobOutcome = Result<Vec<u8>, String>;

/// The default stand-in execution body sleeps for `complexity` seconds.
/// Real job functions are supplied to [`Worker::new`] in its place.
pub type JobFn = Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = JobOutcome> + Send>> + Send + Sync>;

pub fn stub_job_fn() -> JobFn {
    Arc::new(|task: Task| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(task.complexity as u64)).await;
            Ok(Vec::new())
        })
    })
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub heartbeat_tick: Duration,
    pub check_for_work_tick: Duration,
    pub handoff_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            heartbeat_tick: Duration::from_secs(10),
            check_for_work_tick: Duration::from_millis(100),
            handoff_wait: Duration::from_millis(100),
        }
    }
}

struct ExecutorHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// A worker instance: one `worker_id`, one executor pool, four
/// background loops. Shared via `Arc` with [`crate::stealer::Stealer`]
/// and [`crate::autoscaler::Autoscaler`], which both reach into the pool.
pub struct Worker {
    store: Arc<dyn Store>,
    worker_id: WorkerId,
    config: WorkerConfig,
    job_fn: JobFn,
    task_tx: async_channel::Sender<Task>,
    task_rx: async_channel::Receiver<Task>,
    result_tx: async_channel::Sender<TaskResult>,
    result_rx: async_channel::Receiver<TaskResult>,
    executors: Mutex<Vec<ExecutorHandle>>,
    idle_count: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, worker_id: impl Into<WorkerId>, config: WorkerConfig, job_fn: JobFn) -> Arc<Self> {
        let (task_tx, task_rx) = async_channel::bounded(CHANNEL_CAPACITY);
        let (result_tx, result_rx) = async_channel::bounded(CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            worker_id: worker_id.into(),
            config,
            job_fn,
            task_tx,
            task_rx,
            result_tx,
            result_rx,
            executors: Mutex::new(Vec::new()),
            idle_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    /// Registers the worker and clears any remnants of a previous
    /// instance under the same id.
    pub async fn register(&self) -> Result<()> {
        self.store.worker_heartbeat(&self.worker_id, now_secs()).await?;
        for task in self.store.inbox_all(&self.worker_id).await? {
            self.store.inbox_remove(&self.worker_id, &task.id).await?;
        }
        for task in self.store.processing_all(&self.worker_id).await? {
            self.store.processing_remove(&self.worker_id, &task.id).await?;
        }
        for result in self.store.outbox_drain(&self.worker_id).await? {
            debug!(task_id = %result.task_id, "discarding stale outbox entry from previous instance");
        }
        info!(worker = %self.worker_id, "registered");
        Ok(())
    }

    /// Starts the initial executor pool and the three background loops,
    /// running until `token` is cancelled. In-flight executors are
    /// allowed to drain before the method returns.
    pub async fn run(self: &Arc<Self>, token: CancellationToken) -> Result<()> {
        self.register().await?;

        for _ in 0..self.config.pool_size {
            self.spawn_executor(token.child_token()).await;
        }

        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), token.clone()));
        let check_for_work = tokio::spawn(check_for_work_loop(self.clone(), token.clone()));
        let submit_results = tokio::spawn(submit_results_loop(self.clone(), token.clone()));

        token.cancelled().await;
        let _ = tokio::join!(heartbeat, check_for_work, submit_results);

        let executors = self.executors.lock().await;
        for handle in executors.iter() {
            handle.token.cancel();
        }
        for handle in executors.iter() {
            // Handles are awaited by value elsewhere only when retired;
            // at shutdown we just wait for them to notice cancellation.
            while !handle.join.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        info!(worker = %self.worker_id, "worker shut down");
        Ok(())
    }

    /// Spawns one executor under its own child token so the autoscaler
    /// can retire a single one without affecting its siblings.
    pub(crate) async fn spawn_executor(&self, token: CancellationToken) {
        let join = tokio::spawn(executor_loop(
            self.store.clone(),
            self.worker_id.clone(),
            self.job_fn.clone(),
            self.task_rx.clone(),
            self.result_tx.clone(),
            self.idle_count.clone(),
            token.clone(),
        ));
        self.executors.lock().await.push(ExecutorHandle { token, join });
    }

    /// Signals one executor to exit after its current task and removes
    /// it from the pool. No-op if the pool is empty.
    pub(crate) async fn retire_one_executor(&self) -> bool {
        let mut executors = self.executors.lock().await;
        if let Some(handle) = executors.pop() {
            handle.token.cancel();
            true
        } else {
            false
        }
    }

    pub(crate) async fn executor_count(&self) -> usize {
        self.executors.lock().await.len()
    }

    pub(crate) fn idle_executor_count(&self) -> usize {
        self.idle_count.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

async fn heartbeat_loop(worker: Arc<Worker>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(worker.config.heartbeat_tick);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(err) = worker.store.worker_heartbeat(&worker.worker_id, now_secs()).await {
                    error!(worker = %worker.worker_id, error = %err, "heartbeat refresh failed, will retry next tick");
                }
            }
        }
    }
}

/// CheckForWork loop: drains `Inbox[w]` into the task channel
/// within a bounded wait, leaving entries the coordinator must not
/// re-assign for the next tick if every executor is busy.
async fn check_for_work_loop(worker: Arc<Worker>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(worker.config.check_for_work_tick);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => check_for_work_tick(&worker).await,
        }
    }
}

async fn check_for_work_tick(worker: &Worker) {
    let mut tasks = match worker.store.inbox_all(&worker.worker_id).await {
        Ok(tasks) => tasks,
        Err(err) => {
            // A poison entry fails the whole batch under this store's
            // eager-deserialize contract; the next tick retries, and the
            // coordinator never reassigns inbox-owned work out from
            // under us. See DESIGN.md for the narrower per-entry variant
            // this would need to route single poison tasks to FailedTasks
            // without blocking the rest of the inbox.
            error!(worker = %worker.worker_id, error = %err, "inbox read failed");
            return;
        }
    };

    // The coordinator can land more than one priority's tasks into this
    // inbox within a single distribute tick (it assigns against every
    // non-empty `Q[p]` without regard to this pool's capacity). Handing
    // them to the channel in priority order keeps a single executor's
    // dispatch order consistent with priority even when that happens.
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| deadline_urgency(a).cmp(&deadline_urgency(b))));

    for task in tasks {
        let handoff = tokio::time::timeout(worker.config.handoff_wait, async {
            worker.task_tx.send(task.clone()).await
        })
        .await;

        match handoff {
            Ok(Ok(())) => {
                if let Err(err) = worker.store.inbox_remove(&worker.worker_id, &task.id).await {
                    error!(task_id = %task.id, error = %err, "failed to remove handed-off task from inbox");
                }
            }
            Ok(Err(_)) => {
                warn!(worker = %worker.worker_id, "task channel closed during shutdown");
                return;
            }
            Err(_) => {
                debug!(task_id = %task.id, "executor pool busy, leaving task in inbox for next tick");
            }
        }
    }
}

/// Sort key for same-priority tasks: overdue and near deadlines first,
/// deadline-less tasks last. Mirrors the scheduler's score formula's
/// ordering without needing a `SchedulerConfig` here.
fn deadline_urgency(task: &Task) -> i64 {
    task.deadline.unwrap_or(i64::MAX)
}

/// One executor: blocks on the task channel, defers tasks whose
/// retry backoff hasn't elapsed, and otherwise runs the job body end to
/// end, building the result record.
#[allow(clippy::too_many_arguments)]
async fn executor_loop(
    store: Arc<dyn Store>,
    worker_id: WorkerId,
    job_fn: JobFn,
    task_rx: async_channel::Receiver<Task>,
    result_tx: async_channel::Sender<TaskResult>,
    idle_count: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    idle_count.fetch_add(1, Ordering::Relaxed);
    loop {
        let task = tokio::select! {
            _ = token.cancelled() => break,
            task = task_rx.recv() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        if !task.is_eligible(now_secs()) {
            // Backoff hasn't elapsed; park it back on our own inbox so the
            // coordinator doesn't see it as abandoned, and so CheckForWork
            // picks it up again once eligible.
            if let Err(err) = store.inbox_put(&worker_id, &task).await {
                error!(task_id = %task.id, error = %err, "failed to park ineligible task back in inbox");
            }
            continue;
        }

        idle_count.fetch_sub(1, Ordering::Relaxed);
        let result = run_one(&store, &worker_id, &job_fn, task).await;
        idle_count.fetch_add(1, Ordering::Relaxed);

        if let Some(result) = result {
            if result_tx.send(result).await.is_err() {
                break;
            }
        }
    }
    idle_count.fetch_sub(1, Ordering::Relaxed);
}

async fn run_one(store: &Arc<dyn Store>, worker_id: &str, job_fn: &JobFn, mut task: Task) -> Option<TaskResult> {
    let source_task = task.clone();
    task.status = TaskStatus::Processing;
    task.worker_id = Some(worker_id.to_string());
    task.touch();
    if let Err(err) = store.processing_put(worker_id, &task).await {
        error!(task_id = %task.id, error = %err, "failed to record task as processing");
    }

    let started_at = now_secs();
    let outcome = (job_fn)(task.clone()).await;
    let ended_at = now_secs();

    if let Err(err) = store.processing_remove(worker_id, &task.id).await {
        error!(task_id = %task.id, error = %err, "failed to clear processing entry");
    }

    let (status, output, error_msg) = match outcome {
        Ok(bytes) => (TaskStatus::Completed, Some(bytes), None),
        Err(msg) => (TaskStatus::Failed, None, Some(msg)),
    };

    Some(TaskResult {
        task_id: task.id.clone(),
        status,
        output,
        error: error_msg,
        started_at,
        ended_at,
        retry_count: task.retry_count,
        worker_id: worker_id.to_string(),
        metrics: Some(crate::model::ResultMetrics {
            execution_ms: ((ended_at - started_at).max(0) as u64) * 1000,
            complexity: task.complexity,
        }),
        source_task,
    })
}

/// SubmitResults loop: drains the result channel into
/// `Outbox[w]`, backing off on store errors rather than dropping.
async fn submit_results_loop(worker: Arc<Worker>, token: CancellationToken) {
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = worker.result_rx.recv() => match result {
                Ok(result) => result,
                Err(_) => return,
            },
        };

        let mut attempt = 0u32;
        loop {
            match worker.store.outbox_put(&worker.worker_id, &result).await {
                Ok(()) => break,
                Err(err) => {
                    attempt += 1;
                    error!(task_id = %result.task_id, attempt, error = %err, "outbox submit failed, backing off");
                    tokio::time::sleep(Duration::from_millis(100 * attempt.min(10) as u64)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn worker() -> (Arc<Worker>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = Worker::new(store.clone(), "w1", WorkerConfig::default(), stub_job_fn());
        (worker, store)
    }

    #[tokio::test]
    async fn register_clears_previous_instance_remnants() {
        let (worker, store) = worker();
        let stale = Task::new("t", vec![]);
        store.inbox_put("w1", &stale).await.unwrap();

        worker.register().await.unwrap();

        assert!(store.inbox_all("w1").await.unwrap().is_empty());
        assert!(store.worker_list().await.unwrap().contains_key("w1"));
    }

    #[tokio::test]
    async fn check_for_work_moves_eligible_task_into_processing_after_execution() {
        let (worker, store) = worker();
        worker.spawn_executor(CancellationToken::new()).await;

        let mut task = Task::new("t", vec![]);
        task.complexity = 0;
        store.inbox_put("w1", &task).await.unwrap();

        check_for_work_tick(&worker).await;
        assert!(store.inbox_all("w1").await.unwrap().is_empty());

        // Give the executor a moment to run the zero-duration stub job.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = worker.result_rx.recv().await.unwrap();
        assert_eq!(result.task_id, task.id);
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn ineligible_task_is_parked_back_on_inbox_without_executing() {
        let (worker, store) = worker();
        worker.spawn_executor(CancellationToken::new()).await;

        let mut task = Task::new("t", vec![]);
        task.next_eligible_at = now_secs() + 3600;
        worker.task_tx.send(task.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let parked = store.inbox_all("w1").await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, task.id);
    }
}
