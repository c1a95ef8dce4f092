//! Task and result records — the core data entities of the platform.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

pub type TaskId = String;
pub type WorkerId = String;

/// Generates an opaque, roughly time-ordered task id: a millisecond
/// timestamp prefix followed by a random suffix, so lexical sort on the id
/// tracks creation order without a store round trip.
pub fn generate_task_id() -> TaskId {
    let millis = now_millis();
    let suffix: u64 = rand::thread_rng().gen();
    format!("t_{millis:013x}_{suffix:016x}")
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Retrying,
}

/// A unit of work moving through the queue / inbox / processing / outbox
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub priority: u8,
    pub complexity: u32,
    pub dependencies: Vec<TaskId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub deadline: Option<i64>,
    pub next_eligible_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = now_secs();
        Self {
            id: generate_task_id(),
            task_type: task_type.into(),
            payload,
            status: TaskStatus::Pending,
            priority: 5,
            complexity: 1,
            dependencies: Vec::new(),
            retry_count: 0,
            max_retries: 0,
            deadline: None,
            next_eligible_at: 0,
            created_at: now,
            updated_at: now,
            worker_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn validate(&self) -> MeshResult<()> {
        if !(1..=10).contains(&self.priority) {
            return Err(MeshError::Configuration(format!(
                "priority {} outside 1..=10",
                self.priority
            )));
        }
        if self.retry_count > self.max_retries {
            return Err(MeshError::Configuration(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }
        Ok(())
    }

    pub fn is_eligible(&self, now: i64) -> bool {
        self.next_eligible_at == 0 || self.next_eligible_at <= now
    }

    pub fn touch(&mut self) {
        self.updated_at = now_secs();
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(id: &str, bytes: &[u8]) -> MeshResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MeshError::PoisonTask(id.to_string(), e.to_string()))
    }
}

/// Terminal outcome of running a task, written to `Outbox[w]` and reaped
/// into `Results`/`FailedTasks`. Carries the task as it stood just
/// before execution so the reaper can decide retry vs. terminal without
/// a second store round-trip for a task already gone from `Processing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(with = "opt_payload_b64")]
    pub output: Option<Vec<u8>>,
    pub error: Option<String>,
    pub started_at: i64,
    pub ended_at: i64,
    pub retry_count: u32,
    pub worker_id: WorkerId,
    pub metrics: Option<ResultMetrics>,
    pub source_task: Task,
}

impl TaskResult {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self.status, TaskStatus::Completed)
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub execution_ms: u64,
    pub complexity: u32,
}

mod payload_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod opt_payload_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        match encoded {
            Some(s) => STANDARD
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut task = Task::new("demo", b"hello world".to_vec());
        task.priority = 7;
        let bytes = task.to_bytes().unwrap();
        let back = Task::from_bytes(&task.id, &bytes).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.payload, task.payload);
        assert_eq!(back.priority, 7);
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let mut task = Task::new("demo", vec![]);
        task.priority = 11;
        assert!(task.validate().is_err());
    }

    #[test]
    fn poison_bytes_surface_as_poison_task_error() {
        let err = Task::from_bytes("t_bad", b"{not json").unwrap_err();
        assert!(matches!(err, MeshError::PoisonTask(id, _) if id == "t_bad"));
    }

    #[test]
    fn eligibility_respects_backoff_window() {
        let mut task = Task::new("demo", vec![]);
        task.next_eligible_at = now_secs() + 60;
        assert!(!task.is_eligible(now_secs()));
        task.next_eligible_at = 0;
        assert!(task.is_eligible(now_secs()));
    }
}
