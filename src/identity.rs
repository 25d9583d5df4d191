use async_trait::async_trait;
use axum::http::HeaderMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ArenaError, ArenaResult};

/// Pre-authenticated user header set by the fronting gateway; value is the
/// user's external UUID. Transport authentication itself lives upstream.
pub const USER_HEADER: &str = "x-arena-user";
/// Anonymous voter identification token (UUID); minted here when absent.
pub const IDENTIFICATION_HEADER: &str = "x-identification-token";
/// Browser-session UUID; minted when absent.
pub const SESSION_HEADER: &str = "x-arena-session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterCategory {
    Authenticated,
    Anonymous,
}

/// A resolved voter: exactly one of `user_id` / `identification_token_id`
/// is set, mirroring the comparison table's CHECK constraint.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: Option<i64>,
    pub identification_token_id: Option<i64>,
    pub session_id: Uuid,
}

impl Identity {
    pub fn category(&self) -> VoterCategory {
        if self.user_id.is_some() {
            VoterCategory::Authenticated
        } else {
            VoterCategory::Anonymous
        }
    }
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> ArenaResult<Identity>;
}

#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn can_vote(&self, identity: &Identity) -> ArenaResult<bool>;
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

pub struct DbIdentityService {
    pool: PgPool,
}

impl DbIdentityService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityService for DbIdentityService {
    async fn resolve(&self, headers: &HeaderMap) -> ArenaResult<Identity> {
        let session_id = header_uuid(headers, SESSION_HEADER).unwrap_or_else(Uuid::new_v4);

        if headers.contains_key(USER_HEADER) {
            let external_id =
                header_uuid(headers, USER_HEADER).ok_or(ArenaError::UnknownUser)?;
            let user_id: Option<i64> =
                sqlx::query_scalar("SELECT id FROM auth.arena_user WHERE external_id = $1")
                    .bind(external_id)
                    .fetch_optional(&self.pool)
                    .await?;
            let user_id = user_id.ok_or(ArenaError::UnknownUser)?;
            return Ok(Identity {
                user_id: Some(user_id),
                identification_token_id: None,
                session_id,
            });
        }

        // Anonymous voter: bind the vote to a durable identification token,
        // minting one on first contact.
        let token = header_uuid(headers, IDENTIFICATION_HEADER).unwrap_or_else(Uuid::new_v4);
        let token_id: i64 = sqlx::query_scalar(
            "INSERT INTO auth.identification_token (token) VALUES ($1) \
             ON CONFLICT (token) DO UPDATE SET last_seen = now() \
             RETURNING id",
        )
        .bind(token)
        .fetch_one(&self.pool)
        .await?;

        Ok(Identity {
            user_id: None,
            identification_token_id: Some(token_id),
            session_id,
        })
    }
}

pub struct DbPermissionService {
    pool: PgPool,
}

impl DbPermissionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermissionService for DbPermissionService {
    async fn can_vote(&self, identity: &Identity) -> ArenaResult<bool> {
        let Some(user_id) = identity.user_id else {
            // Anonymous identities default to permitted.
            return Ok(true);
        };

        let can_vote: Option<bool> =
            sqlx::query_scalar("SELECT can_vote FROM auth.arena_user WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        can_vote.ok_or(ArenaError::UnknownUser)
    }
}

/// Fixed-answer permission service for tests.
pub struct StaticPermissionService {
    pub allow: bool,
}

#[async_trait]
impl PermissionService for StaticPermissionService {
    async fn can_vote(&self, identity: &Identity) -> ArenaResult<bool> {
        if identity.user_id.is_none() {
            return Ok(true);
        }
        Ok(self.allow)
    }
}
