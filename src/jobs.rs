use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ArenaConfig;
use crate::entities::RatingSystem;
use crate::error::ArenaResult;
use crate::gate::SingleFlightGate;
use crate::rating::RatingEngine;
use crate::telemetry::TelemetrySink;

pub const TASK_QUEUE_KEY: &str = "arena:tasks";

/// At-least-once task envelope. Headers travel with the task so external
/// operators can stamp provenance when they enqueue runs directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl TaskEnvelope {
    pub fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            enqueued_at: Utc::now(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> ArenaResult<()>;
    async fn dequeue(&self) -> ArenaResult<Option<TaskEnvelope>>;
}

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> ArenaResult<()> {
        let body = serde_json::to_string(envelope).unwrap_or_default();
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(TASK_QUEUE_KEY)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> ArenaResult<Option<TaskEnvelope>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(TASK_QUEUE_KEY)
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => match serde_json::from_str::<TaskEnvelope>(&raw) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unparseable task envelope");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

/// In-process queue for tests.
#[derive(Default)]
pub struct MemoryJobQueue {
    entries: std::sync::Mutex<VecDeque<TaskEnvelope>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> ArenaResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_front(envelope.clone());
        Ok(())
    }

    async fn dequeue(&self) -> ArenaResult<Option<TaskEnvelope>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.pop_back())
    }
}

/// Background worker: drains the task queue and runs the rating engine for
/// each recognized task. Unknown task names are logged and dropped so a
/// poisoned envelope cannot wedge the queue.
pub async fn run_worker(
    cfg: &ArenaConfig,
    engine: RatingEngine,
    queue: Arc<dyn JobQueue>,
    gate: Arc<dyn SingleFlightGate>,
    telemetry: TelemetrySink,
) -> anyhow::Result<()> {
    let poll_interval = Duration::from_millis(cfg.worker_poll_interval_ms.max(10));
    tracing::info!(
        queue = TASK_QUEUE_KEY,
        poll_ms = poll_interval.as_millis() as u64,
        "rating worker started"
    );

    loop {
        tokio::select! {
            _ = crate::server::shutdown_signal() => {
                tracing::info!("rating worker shutting down");
                return Ok(());
            }
            task = queue.dequeue() => {
                match task {
                    Ok(Some(envelope)) => {
                        dispatch_task(cfg, &engine, gate.as_ref(), &telemetry, envelope).await;
                    }
                    Ok(None) => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "task dequeue failed; backing off");
                        tokio::time::sleep(poll_interval.saturating_mul(5)).await;
                    }
                }
            }
        }
    }
}

async fn dispatch_task(
    cfg: &ArenaConfig,
    engine: &RatingEngine,
    gate: &dyn SingleFlightGate,
    telemetry: &TelemetrySink,
    envelope: TaskEnvelope,
) {
    let Some(system) = RatingSystem::from_task_name(&envelope.task) else {
        tracing::warn!(task = %envelope.task, "unknown task name, dropping");
        return;
    };

    let gate_ttl = match system {
        RatingSystem::Elo => cfg.elo_gate_ttl_secs,
        RatingSystem::Glicko => cfg.glicko_gate_ttl_secs,
    };

    telemetry.emit(
        "worker.task_started",
        json!({ "task": envelope.task, "enqueued_at": envelope.enqueued_at.to_rfc3339() }),
    );

    match engine.run(system, gate, gate_ttl).await {
        Ok(summary) => {
            tracing::info!(
                system = %system,
                processed = summary.processed,
                skipped = summary.skipped,
                batches = summary.batches,
                "rating run completed"
            );
            telemetry.emit(
                "worker.task_completed",
                json!({
                    "task": envelope.task,
                    "processed": summary.processed,
                    "skipped": summary.skipped,
                    "batches": summary.batches,
                }),
            );
        }
        Err(err) => {
            tracing::error!(system = %system, error = %err, "rating run failed");
            telemetry.emit(
                "worker.task_failed",
                json!({ "task": envelope.task, "error": format!("{err:#}") }),
            );
        }
    }
}
