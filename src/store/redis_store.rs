//! Redis-backed [`Store`] implementation.
//!
//! `Q[p]` is a sorted set per priority (`taskmesh:q:{p}`), scored by the
//! scheduler's placement logic.
//! Per-worker buckets are hashes (`taskmesh:inbox:{w}`, `taskmesh:processing:{w}`,
//! `taskmesh:outbox:{w}`) keyed by task id, storing the task/result's JSON
//! bytes as the value. `Workers` is a single hash of worker id to last
//! heartbeat timestamp. `Waiting` is a hash of task id to JSON; `DepWaiters`
//! is one set per dependency id holding waiter task ids.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::MeshResult;
use crate::model::{Task, TaskId, TaskResult, WorkerId};

use super::{QueueEntry, Store};

const NS: &str = "taskmesh";

fn queue_key(priority: u8) -> String {
    format!("{NS}:q:{priority}")
}
fn inbox_key(worker_id: &str) -> String {
    format!("{NS}:inbox:{worker_id}")
}
fn processing_key(worker_id: &str) -> String {
    format!("{NS}:processing:{worker_id}")
}
fn outbox_key(worker_id: &str) -> String {
    format!("{NS}:outbox:{worker_id}")
}
fn dep_waiters_key(dep_id: &str) -> String {
    format!("{NS}:depwaiters:{dep_id}")
}
const WORKERS_KEY: &str = "taskmesh:workers";
const WAITING_KEY: &str = "taskmesh:waiting";
const RESULTS_KEY: &str = "taskmesh:results";
const FAILED_KEY: &str = "taskmesh:failed_tasks";

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Opens a connection manager against `redis_url`, matching the
    /// `Client::open(...).get_connection_manager()` dial sequence used
    /// throughout this codebase's Redis integrations.
    pub async fn connect(redis_url: &str) -> MeshResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn queue_push(&self, priority: u8, score: f64, task: &Task) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        // ZADD keys on the full member string (id + JSON), so a re-push of
        // the same task id with changed fields (e.g. a touched `updated_at`)
        // would otherwise leave a stale second member behind. Drop any
        // existing member for this id first to keep one entry per task id,
        // matching `MemoryStore::queue_push`'s `retain` dedupe.
        self.queue_remove(priority, &task.id).await?;
        let bytes = task.to_bytes()?;
        let member = format!("{}\u{1}{}", task.id, String::from_utf8_lossy(&bytes));
        let _: () = conn.zadd(queue_key(priority), member, score).await?;
        Ok(())
    }

    async fn queue_pop_front(&self, priority: u8, limit: usize) -> MeshResult<Vec<QueueEntry>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = conn
            .zpopmin(queue_key(priority), limit as isize)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for (member, score) in raw {
            let (id, json) = member.split_once('\u{1}').unwrap_or((member.as_str(), ""));
            let task = Task::from_bytes(id, json.as_bytes())?;
            out.push((score, task));
        }
        Ok(out)
    }

    async fn queue_remove(&self, priority: u8, task_id: &str) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(queue_key(priority), 0, -1).await?;
        for member in members {
            if member.split_once('\u{1}').map(|(id, _)| id) == Some(task_id) {
                let _: () = conn.zrem(queue_key(priority), member).await?;
            }
        }
        Ok(())
    }

    async fn queue_len(&self, priority: u8) -> MeshResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(queue_key(priority)).await?)
    }

    async fn waiting_put(&self, task: &Task) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(WAITING_KEY, &task.id, task.to_bytes()?).await?;
        Ok(())
    }

    async fn waiting_take(&self, task_id: &str) -> MeshResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.hget(WAITING_KEY, task_id).await?;
        match bytes {
            Some(b) => {
                let _: () = conn.hdel(WAITING_KEY, task_id).await?;
                Ok(Some(Task::from_bytes(task_id, &b)?))
            }
            None => Ok(None),
        }
    }

    async fn dep_waiters_add(&self, dep_id: &str, waiter_id: &str) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(dep_waiters_key(dep_id), waiter_id).await?;
        Ok(())
    }

    async fn dep_waiters_take(&self, dep_id: &str) -> MeshResult<Vec<TaskId>> {
        let mut conn = self.conn.clone();
        let key = dep_waiters_key(dep_id);
        let waiters: Vec<String> = conn.smembers(&key).await?;
        let _: () = conn.del(&key).await?;
        Ok(waiters)
    }

    async fn worker_heartbeat(&self, worker_id: &str, now: i64) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(WORKERS_KEY, worker_id, now).await?;
        Ok(())
    }

    async fn worker_list(&self) -> MeshResult<HashMap<WorkerId, i64>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(WORKERS_KEY).await?)
    }

    async fn worker_remove(&self, worker_id: &str) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(WORKERS_KEY, worker_id).await?;
        Ok(())
    }

    async fn inbox_put(&self, worker_id: &str, task: &Task) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(inbox_key(worker_id), &task.id, task.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn inbox_put_if_absent(&self, worker_id: &str, task: &Task) -> MeshResult<bool> {
        let mut conn = self.conn.clone();
        let created: bool = conn
            .hset_nx(inbox_key(worker_id), &task.id, task.to_bytes()?)
            .await?;
        Ok(created)
    }

    async fn inbox_remove(&self, worker_id: &str, task_id: &str) -> MeshResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let key = inbox_key(worker_id);
        let bytes: Option<Vec<u8>> = conn.hget(&key, task_id).await?;
        match bytes {
            Some(b) => {
                let _: () = conn.hdel(&key, task_id).await?;
                Ok(Some(Task::from_bytes(task_id, &b)?))
            }
            None => Ok(None),
        }
    }

    async fn inbox_all(&self, worker_id: &str) -> MeshResult<Vec<Task>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, Vec<u8>> = conn.hgetall(inbox_key(worker_id)).await?;
        map.into_iter()
            .map(|(id, bytes)| Task::from_bytes(&id, &bytes))
            .collect()
    }

    async fn inbox_len(&self, worker_id: &str) -> MeshResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(inbox_key(worker_id)).await?)
    }

    async fn processing_put(&self, worker_id: &str, task: &Task) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(processing_key(worker_id), &task.id, task.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn processing_remove(
        &self,
        worker_id: &str,
        task_id: &str,
    ) -> MeshResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let key = processing_key(worker_id);
        let bytes: Option<Vec<u8>> = conn.hget(&key, task_id).await?;
        match bytes {
            Some(b) => {
                let _: () = conn.hdel(&key, task_id).await?;
                Ok(Some(Task::from_bytes(task_id, &b)?))
            }
            None => Ok(None),
        }
    }

    async fn processing_all(&self, worker_id: &str) -> MeshResult<Vec<Task>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, Vec<u8>> = conn.hgetall(processing_key(worker_id)).await?;
        map.into_iter()
            .map(|(id, bytes)| Task::from_bytes(&id, &bytes))
            .collect()
    }

    async fn outbox_put(&self, worker_id: &str, result: &TaskResult) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(outbox_key(worker_id), &result.task_id, result.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn outbox_drain(&self, worker_id: &str) -> MeshResult<Vec<TaskResult>> {
        let mut conn = self.conn.clone();
        let key = outbox_key(worker_id);
        let map: HashMap<String, Vec<u8>> = conn.hgetall(&key).await?;
        if !map.is_empty() {
            let _: () = conn.del(&key).await?;
        }
        map.into_values()
            .map(|bytes| TaskResult::from_bytes(&bytes))
            .collect()
    }

    async fn results_put(&self, result: &TaskResult) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(RESULTS_KEY, &result.task_id, result.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn results_get(&self, task_id: &str) -> MeshResult<Option<TaskResult>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.hget(RESULTS_KEY, task_id).await?;
        bytes.map(|b| TaskResult::from_bytes(&b)).transpose()
    }

    async fn results_contains(&self, task_id: &str) -> MeshResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.hexists(RESULTS_KEY, task_id).await?)
    }

    async fn results_count(&self) -> MeshResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(RESULTS_KEY).await?)
    }

    async fn results_all(&self) -> MeshResult<Vec<TaskResult>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, Vec<u8>> = conn.hgetall(RESULTS_KEY).await?;
        map.into_values()
            .map(|bytes| TaskResult::from_bytes(&bytes))
            .collect()
    }

    async fn failed_put(&self, result: &TaskResult) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(FAILED_KEY, &result.task_id, result.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn failed_get(&self, task_id: &str) -> MeshResult<Option<TaskResult>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.hget(FAILED_KEY, task_id).await?;
        bytes.map(|b| TaskResult::from_bytes(&b)).transpose()
    }

    async fn failed_count(&self) -> MeshResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(FAILED_KEY).await?)
    }

    async fn failed_all(&self) -> MeshResult<Vec<TaskResult>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, Vec<u8>> = conn.hgetall(FAILED_KEY).await?;
        map.into_values()
            .map(|bytes| TaskResult::from_bytes(&bytes))
            .collect()
    }

    async fn clear_all(&self) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{NS}:*");
        let keys: Vec<String> = conn.keys(pattern).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }

    async fn orphaned_worker_ids(&self) -> MeshResult<Vec<WorkerId>> {
        let mut conn = self.conn.clone();
        let alive: HashMap<String, i64> = conn.hgetall(WORKERS_KEY).await?;
        let mut orphans = Vec::new();
        for (prefix, key_fn) in [
            ("inbox", inbox_key as fn(&str) -> String),
            ("processing", processing_key as fn(&str) -> String),
        ] {
            let pattern = format!("{NS}:{prefix}:*");
            let keys: Vec<String> = conn.keys(pattern).await?;
            for key in keys {
                let worker_id = key
                    .strip_prefix(&format!("{NS}:{prefix}:"))
                    .unwrap_or(&key)
                    .to_string();
                let _ = key_fn;
                if !alive.contains_key(&worker_id) && !orphans.contains(&worker_id) {
                    orphans.push(worker_id);
                }
            }
        }
        Ok(orphans)
    }
}
