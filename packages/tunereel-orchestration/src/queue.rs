//! Durable at-least-once stage task delivery.
//!
//! One topic per task kind. Enqueues may carry a deterministic task id; a
//! second enqueue under the same id reports `Duplicate` instead of queuing
//! again. Delivery is claim-then-ack: a dequeued task sits on a processing
//! list until acked, requeued with a delay, or parked for operator
//! inspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::stage::TaskKind;

/// Dedup keys outlive any reasonable pipeline run; they are dropped eagerly
/// on ack.
const DEDUP_TTL_SECS: i64 = 24 * 60 * 60;

/// On-broker task record. The payload proper is just the job id; `task_id`
/// and `attempt` are broker metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub attempt: u32,
}

/// A claimed task, held until the worker settles it.
#[derive(Debug, Clone)]
pub struct DeliveredTask {
    pub kind: TaskKind,
    pub record: TaskRecord,
    /// Exact broker representation, used to release the claim.
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A task with the same deterministic id is already pending or claimed.
    Duplicate,
}

#[derive(Debug, Default, Clone)]
pub struct EnqueueOptions {
    pub task_id: Option<String>,
}

impl EnqueueOptions {
    pub fn with_task_id(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        kind: TaskKind,
        job_id: Uuid,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome>;

    /// Claim the next task on the topic, waiting up to `wait`.
    async fn dequeue(&self, kind: TaskKind, wait: Duration) -> Result<Option<DeliveredTask>>;

    /// Settle a claimed task and release its dedup id.
    async fn ack(&self, task: &DeliveredTask) -> Result<()>;

    /// Put a claimed task back for redelivery after `delay`, bumping its
    /// attempt counter. The dedup id stays held.
    async fn requeue(&self, task: &DeliveredTask, delay: Duration) -> Result<()>;

    /// Park a claimed task on the topic's dead list for operator inspection.
    async fn bury(&self, task: &DeliveredTask) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Redis adapter
// ═══════════════════════════════════════════════════════════════════════════

pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn ready_key(kind: TaskKind) -> String {
        format!("tunereel:ready:{}", kind.topic())
    }

    fn processing_key(kind: TaskKind) -> String {
        format!("tunereel:processing:{}", kind.topic())
    }

    fn delayed_key(kind: TaskKind) -> String {
        format!("tunereel:delayed:{}", kind.topic())
    }

    fn dead_key(kind: TaskKind) -> String {
        format!("tunereel:dead:{}", kind.topic())
    }

    fn dedup_key(task_id: &str) -> String {
        format!("tunereel:dedup:{task_id}")
    }

    /// Move due entries from the delayed set onto the ready list. ZREM is the
    /// winner-takes-it guard against concurrent promoters.
    async fn promote_due(&self, kind: TaskKind) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = chrono::Utc::now().timestamp_millis() as f64;
        let due: Vec<String> = conn
            .zrangebyscore_limit(Self::delayed_key(kind), "-inf", now, 0, 16)
            .await?;
        for raw in due {
            let removed: i64 = conn.zrem(Self::delayed_key(kind), &raw).await?;
            if removed == 1 {
                let _: () = conn.lpush(Self::ready_key(kind), &raw).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(
        &self,
        kind: TaskKind,
        job_id: Uuid,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let mut conn = self.conn.clone();
        if let Some(task_id) = &options.task_id {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(Self::dedup_key(task_id))
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(DEDUP_TTL_SECS)
                .query_async(&mut conn)
                .await?;
            if claimed.is_none() {
                return Ok(EnqueueOutcome::Duplicate);
            }
        }
        let record = TaskRecord {
            job_id,
            task_id: options.task_id,
            attempt: 0,
        };
        let raw = serde_json::to_string(&record).expect("task record serializes");
        let _: () = conn.lpush(Self::ready_key(kind), raw).await?;
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(&self, kind: TaskKind, wait: Duration) -> Result<Option<DeliveredTask>> {
        self.promote_due(kind).await?;
        let mut conn = self.conn.clone();
        let wait_secs = wait.as_secs_f64().max(0.1);
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(Self::ready_key(kind))
            .arg(Self::processing_key(kind))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait_secs)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<TaskRecord>(&raw) {
            Ok(record) => Ok(Some(DeliveredTask { kind, record, raw })),
            Err(e) => {
                // Unreadable payloads are dropped, not retried.
                warn!(topic = kind.topic(), error = %e, "dropping unparseable task payload");
                let _: () = conn.lrem(Self::processing_key(kind), 1, &raw).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, task: &DeliveredTask) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lrem(Self::processing_key(task.kind), 1, &task.raw)
            .await?;
        if let Some(task_id) = &task.record.task_id {
            let _: () = conn.del(Self::dedup_key(task_id)).await?;
        }
        Ok(())
    }

    async fn requeue(&self, task: &DeliveredTask, delay: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let next = TaskRecord {
            attempt: task.record.attempt + 1,
            ..task.record.clone()
        };
        let raw = serde_json::to_string(&next).expect("task record serializes");
        let due_at = chrono::Utc::now().timestamp_millis() as f64 + delay.as_millis() as f64;
        let _: () = conn.zadd(Self::delayed_key(task.kind), raw, due_at).await?;
        let _: () = conn
            .lrem(Self::processing_key(task.kind), 1, &task.raw)
            .await?;
        Ok(())
    }

    async fn bury(&self, task: &DeliveredTask) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(Self::dead_key(task.kind), &task.raw).await?;
        let _: () = conn
            .lrem(Self::processing_key(task.kind), 1, &task.raw)
            .await?;
        if let Some(task_id) = &task.record.task_id {
            let _: () = conn.del(Self::dedup_key(task_id)).await?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory adapter
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryTopic {
    ready: VecDeque<String>,
    delayed: Vec<(Instant, String)>,
    processing: Vec<String>,
    dead: Vec<String>,
}

/// Same contract as [`RedisQueue`], backed by process memory. Used by the
/// workspace tests.
#[derive(Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<TaskKind, MemoryTopic>>,
    dedup: Mutex<HashSet<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn promote_due(topic: &mut MemoryTopic) {
        let now = Instant::now();
        let mut still_waiting = Vec::new();
        for (due_at, raw) in topic.delayed.drain(..) {
            if due_at <= now {
                topic.ready.push_front(raw);
            } else {
                still_waiting.push((due_at, raw));
            }
        }
        topic.delayed = still_waiting;
    }

    /// Number of tasks ready or delayed on a topic. Test helper.
    pub fn pending(&self, kind: TaskKind) -> usize {
        let topics = self.topics.lock().unwrap();
        topics
            .get(&kind)
            .map(|t| t.ready.len() + t.delayed.len())
            .unwrap_or(0)
    }

    /// Number of parked tasks on a topic. Test helper.
    pub fn dead(&self, kind: TaskKind) -> usize {
        let topics = self.topics.lock().unwrap();
        topics.get(&kind).map(|t| t.dead.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(
        &self,
        kind: TaskKind,
        job_id: Uuid,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        if let Some(task_id) = &options.task_id {
            if !self.dedup.lock().unwrap().insert(task_id.clone()) {
                return Ok(EnqueueOutcome::Duplicate);
            }
        }
        let record = TaskRecord {
            job_id,
            task_id: options.task_id,
            attempt: 0,
        };
        let raw = serde_json::to_string(&record).expect("task record serializes");
        self.topics
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .ready
            .push_front(raw);
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(&self, kind: TaskKind, wait: Duration) -> Result<Option<DeliveredTask>> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut topics = self.topics.lock().unwrap();
                let topic = topics.entry(kind).or_default();
                Self::promote_due(topic);
                if let Some(raw) = topic.ready.pop_back() {
                    topic.processing.push(raw.clone());
                    let record: TaskRecord =
                        serde_json::from_str(&raw).expect("task record parses");
                    return Ok(Some(DeliveredTask { kind, record, raw }));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, task: &DeliveredTask) -> Result<()> {
        let mut topics = self.topics.lock().unwrap();
        if let Some(topic) = topics.get_mut(&task.kind) {
            topic.processing.retain(|raw| raw != &task.raw);
        }
        if let Some(task_id) = &task.record.task_id {
            self.dedup.lock().unwrap().remove(task_id);
        }
        Ok(())
    }

    async fn requeue(&self, task: &DeliveredTask, delay: Duration) -> Result<()> {
        let next = TaskRecord {
            attempt: task.record.attempt + 1,
            ..task.record.clone()
        };
        let raw = serde_json::to_string(&next).expect("task record serializes");
        let mut topics = self.topics.lock().unwrap();
        let topic = topics.entry(task.kind).or_default();
        topic.processing.retain(|r| r != &task.raw);
        topic.delayed.push((Instant::now() + delay, raw));
        Ok(())
    }

    async fn bury(&self, task: &DeliveredTask) -> Result<()> {
        let mut topics = self.topics.lock().unwrap();
        let topic = topics.entry(task.kind).or_default();
        topic.processing.retain(|r| r != &task.raw);
        topic.dead.push(task.raw.clone());
        if let Some(task_id) = &task.record.task_id {
            self.dedup.lock().unwrap().remove(task_id);
        }
        Ok(())
    }
}
