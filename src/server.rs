use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use uuid::Uuid;

use crate::catalog::SampleCatalog;
use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::gate::{RatingTrigger, RedisGate};
use crate::identity::{DbIdentityService, DbPermissionService, IdentityService};
use crate::jobs::RedisJobQueue;
use crate::leaderboard::{
    LeaderboardParams, LeaderboardResponse, Leaderboards, GlickoLeaderboardResponse, MetricInfo,
    PromptLeaderboardParams, PromptLeaderboardResponse, TagInfo, TestSetInfo,
};
use crate::selection::{PairSelector, SelectedPair};
use crate::telemetry::TelemetrySink;
use crate::token::RedisTokenStore;
use crate::vote::{RankEntry, VoteRecorder};

pub struct ServerState {
    pub cfg: ArenaConfig,
    pub selector: PairSelector,
    pub recorder: VoteRecorder,
    pub leaderboards: Leaderboards,
    pub identity: Arc<dyn IdentityService>,
    pub telemetry: TelemetrySink,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn domain_error(err: ArenaError) -> ApiError {
    (
        err.status(),
        Json(json!({
            "error": err.to_string(),
            "category": err.category().code(),
        })),
    )
}

// ---------------------------------------------------------------------------
// Transport types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonBatchRequest {
    pub metric_id: Uuid,
    pub batch_size: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetFile {
    pub kind: &'static str,
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleAssets {
    pub sample_id: Uuid,
    pub files: Vec<AssetFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonTokenResponse {
    pub token: Uuid,
    pub metric_id: Uuid,
    pub samples: Vec<Uuid>,
    pub build_description: String,
    pub assets: Vec<SampleAssets>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonBatchResponse {
    pub comparisons: Vec<ComparisonTokenResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonDetails {
    pub token: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResultRequest {
    pub comparison_details: ComparisonDetails,
    pub ordered_sample_ids: Vec<RankEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResultResponse {
    pub sample_1_model: String,
    pub sample_2_model: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub profile: String,
}

fn pair_response(pair: SelectedPair, bucket: &str) -> ComparisonTokenResponse {
    ComparisonTokenResponse {
        token: pair.token,
        metric_id: pair.metric_external_id,
        samples: vec![
            pair.sample_1.comparison_sample_id,
            pair.sample_2.comparison_sample_id,
        ],
        build_description: pair.build_specification,
        assets: vec![
            SampleAssets {
                sample_id: pair.sample_1.comparison_sample_id,
                files: vec![AssetFile {
                    kind: "gltf_scene",
                    bucket: bucket.to_string(),
                    key: pair.sample_1.artifact_key,
                }],
            },
            SampleAssets {
                sample_id: pair.sample_2.comparison_sample_id,
                files: vec![AssetFile {
                    kind: "gltf_scene",
                    bucket: bucket.to_string(),
                    key: pair.sample_2.artifact_key,
                }],
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn handle_health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        profile: state.cfg.profile.clone(),
    })
}

pub async fn handle_comparison_batch(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<ComparisonBatchRequest>,
) -> ApiResult<ComparisonBatchResponse> {
    let identity = state
        .identity
        .resolve(&headers)
        .await
        .map_err(domain_error)?;

    let pairs = state
        .selector
        .select_batch(request.metric_id, request.batch_size, identity.category())
        .await
        .map_err(domain_error)?;

    state.telemetry.emit(
        "comparison.batch_issued",
        json!({
            "count": pairs.len(),
            "requested": request.batch_size,
            "authenticated": identity.user_id.is_some(),
        }),
    );

    Ok(Json(ComparisonBatchResponse {
        comparisons: pairs
            .into_iter()
            .map(|pair| pair_response(pair, &state.cfg.object_bucket))
            .collect(),
    }))
}

pub async fn handle_comparison_result(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<ComparisonResultRequest>,
) -> ApiResult<ComparisonResultResponse> {
    let identity = state
        .identity
        .resolve(&headers)
        .await
        .map_err(domain_error)?;

    let outcome = state
        .recorder
        .record_vote(
            request.comparison_details.token,
            &request.ordered_sample_ids,
            &identity,
        )
        .await
        .map_err(domain_error)?;

    Ok(Json(ComparisonResultResponse {
        sample_1_model: outcome.sample_1_model,
        sample_2_model: outcome.sample_2_model,
    }))
}

pub async fn handle_leaderboard(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<LeaderboardParams>,
) -> ApiResult<LeaderboardResponse> {
    let response = state
        .leaderboards
        .model_leaderboard(&params)
        .await
        .map_err(domain_error)?;
    Ok(Json(response))
}

pub async fn handle_glicko_leaderboard(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<LeaderboardParams>,
) -> ApiResult<GlickoLeaderboardResponse> {
    let response = state
        .leaderboards
        .glicko_leaderboard(&params)
        .await
        .map_err(domain_error)?;
    Ok(Json(response))
}

pub async fn handle_model_prompts(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<PromptLeaderboardParams>,
) -> ApiResult<PromptLeaderboardResponse> {
    let response = state
        .leaderboards
        .model_prompt_leaderboard(&params)
        .await
        .map_err(domain_error)?;
    Ok(Json(response))
}

pub async fn handle_metrics(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Vec<MetricInfo>> {
    Ok(Json(state.leaderboards.metrics().await.map_err(domain_error)?))
}

pub async fn handle_test_sets(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Vec<TestSetInfo>> {
    Ok(Json(
        state.leaderboards.test_sets().await.map_err(domain_error)?,
    ))
}

pub async fn handle_tags(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<TagInfo>> {
    Ok(Json(
        state
            .leaderboards
            .scoring_tags()
            .await
            .map_err(domain_error)?,
    ))
}

pub fn build_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_health))
        .route("/comparison/batch", post(handle_comparison_batch))
        .route("/comparison/result", post(handle_comparison_result))
        .route("/leaderboard", get(handle_leaderboard))
        .route("/leaderboard/glicko", get(handle_glicko_leaderboard))
        .route("/leaderboard/metrics", get(handle_metrics))
        .route("/leaderboard/test-sets", get(handle_test_sets))
        .route("/leaderboard/tags", get(handle_tags))
        .route("/leaderboard/model/prompts", get(handle_model_prompts))
        .with_state(state)
}

pub async fn run_server(
    cfg: ArenaConfig,
    pool: PgPool,
    redis: ConnectionManager,
    telemetry: TelemetrySink,
) -> Result<()> {
    let addr = format!("{}:{}", cfg.host, cfg.port)
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", cfg.host, cfg.port))?;

    let catalog = SampleCatalog::new(pool.clone());
    let store = Arc::new(RedisTokenStore::new(redis.clone()));
    let gate = Arc::new(RedisGate::new(redis.clone()));
    let queue = Arc::new(RedisJobQueue::new(redis));
    let trigger = RatingTrigger::new(gate, queue, &cfg);

    let selector = PairSelector::new(catalog.clone(), store.clone(), &cfg);
    let recorder = VoteRecorder::new(
        pool.clone(),
        catalog,
        store,
        Arc::new(DbPermissionService::new(pool.clone())),
        trigger,
        telemetry.clone(),
    );

    let state = Arc::new(ServerState {
        selector,
        recorder,
        leaderboards: Leaderboards::new(pool.clone()),
        identity: Arc::new(DbIdentityService::new(pool)),
        telemetry: telemetry.clone(),
        cfg: cfg.clone(),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": cfg.host,
            "port": cfg.port,
            "profile": cfg.profile,
            "selection_mode": format!("{:?}", cfg.selection_mode),
        }),
    );
    tracing::info!(%addr, "comparison API listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { tracing::info!("received Ctrl+C, shutting down"); }
        _ = terminate => { tracing::info!("received SIGTERM, shutting down"); }
    }
}
