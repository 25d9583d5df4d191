use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use model_arena::cli::{Cli, Commands};
use model_arena::config::{ArenaConfig, load_profiles, resolve_config};
use model_arena::entities::RatingSystem;
use model_arena::error::format_cli_error;
use model_arena::gate::{RatingTrigger, RedisGate, TriggerOutcome};
use model_arena::jobs::{self, RedisJobQueue};
use model_arena::rating::RatingEngine;
use model_arena::telemetry::TelemetrySink;
use model_arena::{db, server};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_config(&cli, &profiles)?;

    match cli.command {
        Commands::Serve => {
            let telemetry = TelemetrySink::new(&cfg, "serve".to_string());
            let pool = db::connect(&cfg.database_url).await?;
            let redis = redis_manager(&cfg).await?;
            server::run_server(cfg, pool, redis, telemetry).await
        }
        Commands::Worker => {
            let telemetry = TelemetrySink::new(&cfg, "worker".to_string());
            let pool = db::connect(&cfg.database_url).await?;
            let redis = redis_manager(&cfg).await?;
            let engine = RatingEngine::new(pool, &cfg, telemetry.clone());
            let gate = Arc::new(RedisGate::new(redis.clone()));
            let queue = Arc::new(RedisJobQueue::new(redis));
            jobs::run_worker(&cfg, engine, queue, gate, telemetry).await
        }
        Commands::Migrate => {
            let pool = db::connect(&cfg.database_url).await?;
            db::migrate(&pool).await?;
            println!("Migrations applied.");
            Ok(())
        }
        Commands::Trigger { system } => {
            let redis = redis_manager(&cfg).await?;
            let gate = Arc::new(RedisGate::new(redis.clone()));
            let queue = Arc::new(RedisJobQueue::new(redis));
            let trigger = RatingTrigger::new(gate, queue, &cfg);
            let system = RatingSystem::from(system);
            match trigger.trigger(system).await? {
                TriggerOutcome::Enqueued => println!("Enqueued {} task.", system.task_name()),
                TriggerOutcome::Skipped => {
                    println!("A {system} calculation is already in flight; skipped.")
                }
            }
            Ok(())
        }
        Commands::Doctor => run_doctor(&cfg).await,
    }
}

async fn redis_manager(cfg: &ArenaConfig) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(cfg.redis_url.as_str())
        .with_context(|| format!("invalid redis url '{}'", cfg.redis_url))?;
    client
        .get_connection_manager()
        .await
        .context("failed to connect to redis")
}

async fn run_doctor(cfg: &ArenaConfig) -> Result<()> {
    println!("Profile: {}", cfg.profile);

    match db::connect(&cfg.database_url).await {
        Ok(pool) => {
            sqlx::query("SELECT 1").execute(&pool).await?;
            println!("Postgres: ok");
        }
        Err(err) => println!("Postgres: FAILED ({err:#})"),
    }

    match redis_manager(cfg).await {
        Ok(mut conn) => {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            println!("Redis: ok ({pong})");
        }
        Err(err) => println!("Redis: FAILED ({err:#})"),
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
