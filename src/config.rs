use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, SelectionMode};

pub const MAX_BATCH_SIZE: u32 = 10;
pub const AUTHENTICATED_TEST_SET: &str = "Authenticated Test Set";
pub const UNAUTHENTICATED_TEST_SET: &str = "Unauthenticated Test Set";
pub const COMPARISON_ARTIFACT_KIND: &str = "RENDERED_MODEL_GLB_COMPARISON_SAMPLE";

/// Fully resolved runtime configuration: CLI flags and ARENA_* environment
/// variables layered over the selected profile's TOML values.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub profile: String,
    pub config_path: String,
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub object_bucket: String,
    pub selection_mode: SelectionMode,
    pub max_batch_size: u32,
    pub rating_batch_size: i64,
    pub token_ttl_secs: u64,
    pub elo_gate_ttl_secs: u64,
    pub glicko_gate_ttl_secs: u64,
    pub leaderboard_min_votes: i64,
    pub worker_poll_interval_ms: u64,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub object_bucket: Option<String>,
    pub selection_mode: Option<SelectionMode>,
    pub max_batch_size: Option<u32>,
    pub rating_batch_size: Option<i64>,
    pub token_ttl_secs: Option<u64>,
    pub elo_gate_ttl_secs: Option<u64>,
    pub glicko_gate_ttl_secs: Option<u64>,
    pub leaderboard_min_votes: Option<i64>,
    pub worker_poll_interval_ms: Option<u64>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    if !Path::new(config_path).exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file '{}'", config_path))?;
    toml::from_str::<ProfilesFile>(&content)
        .with_context(|| format!("invalid profiles config at '{}'", config_path))
}

pub fn resolve_config(cli: &Cli, profiles: &ProfilesFile) -> Result<ArenaConfig> {
    let profile = profiles
        .profiles
        .get(&cli.profile)
        .cloned()
        .unwrap_or_default();

    if cli.profile != "default" && !profiles.profiles.contains_key(&cli.profile) {
        anyhow::bail!(
            "profile '{}' not found in '{}'",
            cli.profile,
            cli.config_path
        );
    }

    let database_url = cli
        .database_url
        .clone()
        .or(profile.database_url)
        .context("database url is required; set --database-url or ARENA_DATABASE_URL")?;
    let redis_url = cli
        .redis_url
        .clone()
        .or(profile.redis_url)
        .unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string());

    Ok(ArenaConfig {
        profile: cli.profile.clone(),
        config_path: cli.config_path.clone(),
        database_url,
        redis_url,
        host: cli
            .host
            .clone()
            .or(profile.host)
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        port: cli.port.or(profile.port).unwrap_or(8080),
        object_bucket: cli
            .object_bucket
            .clone()
            .or(profile.object_bucket)
            .unwrap_or_else(|| "arena-artifacts".to_string()),
        selection_mode: cli
            .selection_mode
            .or(profile.selection_mode)
            .unwrap_or(SelectionMode::Priority),
        max_batch_size: profile.max_batch_size.unwrap_or(MAX_BATCH_SIZE),
        rating_batch_size: profile.rating_batch_size.unwrap_or(1000),
        token_ttl_secs: profile.token_ttl_secs.unwrap_or(3600),
        elo_gate_ttl_secs: profile.elo_gate_ttl_secs.unwrap_or(300),
        glicko_gate_ttl_secs: profile.glicko_gate_ttl_secs.unwrap_or(3600),
        leaderboard_min_votes: profile.leaderboard_min_votes.unwrap_or(10),
        worker_poll_interval_ms: profile.worker_poll_interval_ms.unwrap_or(1000),
        telemetry_enabled: profile.telemetry_enabled.unwrap_or(true),
        telemetry_path: profile
            .telemetry_path
            .unwrap_or_else(|| ".arena/telemetry.jsonl".to_string()),
    })
}
