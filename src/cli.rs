use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    Uniform,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RatingSystemArg {
    Elo,
    Glicko,
}

const CLI_EXAMPLES: &str = "Examples:\n\
  model-arena migrate\n\
  model-arena serve --host 0.0.0.0 --port 8080\n\
  model-arena worker\n\
  model-arena trigger elo\n\
  model-arena --profile staging doctor\n\
\n\
Configuration:\n\
  - Flags fall back to ARENA_* environment variables.\n\
  - A TOML profiles file (.arena/config.toml) supplies per-environment defaults;\n\
    select one with --profile.";

#[derive(Debug, Parser)]
#[command(name = "model-arena")]
#[command(about = "Pairwise comparison and rating service for generative-model benchmarks")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "ARENA_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "ARENA_CONFIG", default_value = ".arena/config.toml")]
    pub config_path: String,

    #[arg(long, env = "ARENA_DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "ARENA_REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "ARENA_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "ARENA_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "ARENA_OBJECT_BUCKET")]
    pub object_bucket: Option<String>,

    #[arg(long, env = "ARENA_SELECTION_MODE", value_enum)]
    pub selection_mode: Option<SelectionMode>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the comparison/leaderboard HTTP API")]
    Serve,
    #[command(about = "Run the background rating worker (drains elo/glicko tasks)")]
    Worker,
    #[command(about = "Run pending database migrations")]
    Migrate,
    #[command(about = "Enqueue a rating run through the single-flight gate")]
    Trigger {
        #[arg(value_enum)]
        system: RatingSystemArg,
    },
    #[command(about = "Validate database and redis connectivity")]
    Doctor,
}
