use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::config::ArenaConfig;
use crate::entities::RatingSystem;
use crate::error::ArenaResult;
use crate::jobs::{JobQueue, TaskEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enqueued,
    Skipped,
}

/// Keyed set-if-absent lock shared by every worker process. The key expires
/// on its own if the holder crashes; the rating engine deletes it on normal
/// exit.
#[async_trait]
pub trait SingleFlightGate: Send + Sync {
    /// Returns true when this caller acquired the key.
    async fn acquire(&self, system: RatingSystem, ttl_secs: u64) -> ArenaResult<bool>;
    async fn release(&self, system: RatingSystem) -> ArenaResult<()>;
}

#[derive(Clone)]
pub struct RedisGate {
    conn: ConnectionManager,
}

impl RedisGate {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SingleFlightGate for RedisGate {
    async fn acquire(&self, system: RatingSystem, ttl_secs: u64) -> ArenaResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(system.gate_key())
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, system: RatingSystem) -> ArenaResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(system.gate_key())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process gate for tests; expiry is checked lazily on acquire.
#[derive(Default)]
pub struct MemoryGate {
    held: std::sync::Mutex<HashMap<&'static str, Instant>>,
}

impl MemoryGate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SingleFlightGate for MemoryGate {
    async fn acquire(&self, system: RatingSystem, ttl_secs: u64) -> ArenaResult<bool> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match held.get(system.gate_key()) {
            Some(deadline) if now <= *deadline => Ok(false),
            _ => {
                held.insert(system.gate_key(), now + Duration::from_secs(ttl_secs));
                Ok(true)
            }
        }
    }

    async fn release(&self, system: RatingSystem) -> ArenaResult<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(system.gate_key());
        Ok(())
    }
}

/// Gate + queue composition: a successful acquire enqueues exactly one
/// rating task; a held key collapses the trigger into a no-op. Bursts of
/// votes therefore cost a bounded number of engine runs, and the engine
/// draining every pending comparison keeps that correct.
#[derive(Clone)]
pub struct RatingTrigger {
    gate: Arc<dyn SingleFlightGate>,
    queue: Arc<dyn JobQueue>,
    elo_ttl_secs: u64,
    glicko_ttl_secs: u64,
}

impl RatingTrigger {
    pub fn new(gate: Arc<dyn SingleFlightGate>, queue: Arc<dyn JobQueue>, cfg: &ArenaConfig) -> Self {
        Self {
            gate,
            queue,
            elo_ttl_secs: cfg.elo_gate_ttl_secs,
            glicko_ttl_secs: cfg.glicko_gate_ttl_secs,
        }
    }

    pub fn gate_ttl_secs(&self, system: RatingSystem) -> u64 {
        match system {
            RatingSystem::Elo => self.elo_ttl_secs,
            RatingSystem::Glicko => self.glicko_ttl_secs,
        }
    }

    pub async fn trigger(&self, system: RatingSystem) -> ArenaResult<TriggerOutcome> {
        if !self.gate.acquire(system, self.gate_ttl_secs(system)).await? {
            tracing::debug!(system = %system, "rating calculation already in flight, skipping enqueue");
            return Ok(TriggerOutcome::Skipped);
        }

        tracing::info!(system = %system, "enqueuing rating calculation task");
        self.queue
            .enqueue(&TaskEnvelope::new(system.task_name()))
            .await?;
        Ok(TriggerOutcome::Enqueued)
    }
}
