use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::{ArenaError, ArenaResult};

/// What a pair token points at: the metric being voted on and the two
/// comparison-sample ids shown to the voter, in presentation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairPayload {
    pub metric_external_id: Uuid,
    pub sample_1: Uuid,
    pub sample_2: Uuid,
}

impl PairPayload {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            self.metric_external_id, self.sample_1, self.sample_2
        )
    }

    pub fn decode(raw: &str) -> ArenaResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let metric = parts.next().unwrap_or_default();
        let sample_1 = parts.next().unwrap_or_default();
        let sample_2 = parts.next().unwrap_or_default();

        let parse = |s: &str| Uuid::parse_str(s).map_err(|_| ArenaError::MalformedToken);
        Ok(Self {
            metric_external_id: parse(metric)?,
            sample_1: parse(sample_1)?,
            sample_2: parse(sample_2)?,
        })
    }
}

pub fn token_key(token: Uuid) -> String {
    format!("active_comparison:{token}")
}

/// Short-lived pair-token storage. `take_and_delete` is atomic: a token
/// yields its payload to at most one caller.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn put(&self, token: Uuid, payload: &PairPayload, ttl_secs: u64) -> ArenaResult<()>;
    async fn take_and_delete(&self, token: Uuid) -> ArenaResult<Option<PairPayload>>;
}

#[derive(Clone)]
pub struct RedisTokenStore {
    conn: ConnectionManager,
}

impl RedisTokenStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn put(&self, token: Uuid, payload: &PairPayload, ttl_secs: u64) -> ArenaResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(token_key(token))
            .arg(payload.encode())
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn take_and_delete(&self, token: Uuid) -> ArenaResult<Option<PairPayload>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(token_key(token))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(PairPayload::decode(&raw)?)),
            None => Ok(None),
        }
    }
}

/// In-process store for tests; honors TTL against a monotonic clock.
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: std::sync::Mutex<HashMap<Uuid, (String, Instant)>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn put(&self, token: Uuid, payload: &PairPayload, ttl_secs: u64) -> ArenaResult<()> {
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(token, (payload.encode(), deadline));
        Ok(())
    }

    async fn take_and_delete(&self, token: Uuid) -> ArenaResult<Option<PairPayload>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.remove(&token) {
            Some((raw, deadline)) if Instant::now() <= deadline => {
                Ok(Some(PairPayload::decode(&raw)?))
            }
            _ => Ok(None),
        }
    }
}
