use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::cli::RatingSystemArg;

/// The two rating systems maintained side by side. Each has its own
/// processed-comparison markers, gate key, and task name, so one system's
/// backlog never blocks the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RatingSystem {
    Elo,
    Glicko,
}

impl RatingSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            RatingSystem::Elo => "elo",
            RatingSystem::Glicko => "glicko",
        }
    }

    /// Stable task names; external operators enqueue these directly.
    pub fn task_name(self) -> &'static str {
        match self {
            RatingSystem::Elo => "elo_calculation",
            RatingSystem::Glicko => "glicko_calculation",
        }
    }

    pub fn gate_key(self) -> &'static str {
        match self {
            RatingSystem::Elo => "elo_calculation_in_progress",
            RatingSystem::Glicko => "glicko_calculation_in_progress",
        }
    }

    pub fn from_task_name(name: &str) -> Option<Self> {
        match name {
            "elo_calculation" => Some(RatingSystem::Elo),
            "glicko_calculation" => Some(RatingSystem::Glicko),
            _ => None,
        }
    }
}

impl From<RatingSystemArg> for RatingSystem {
    fn from(arg: RatingSystemArg) -> Self {
        match arg {
            RatingSystemArg::Elo => RatingSystem::Elo,
            RatingSystemArg::Glicko => RatingSystem::Glicko,
        }
    }
}

impl std::fmt::Display for RatingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Metric {
    pub id: i64,
    pub external_id: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TestSet {
    pub id: i64,
    pub external_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TagRef {
    pub id: i64,
    pub external_id: Uuid,
    pub name: String,
}

/// One eligible sample as seen by the pair selector: approved, bound to the
/// requested test set, not deprecated.
#[derive(Debug, Clone, FromRow)]
pub struct CandidateSample {
    pub sample_id: i64,
    pub comparison_sample_id: Uuid,
    pub correlation_id: Uuid,
    pub model_id: i64,
    pub prompt_id: i64,
}

/// A sample as loaded by the vote recorder, with its run's model resolved
/// eagerly for the response payload.
#[derive(Debug, Clone, FromRow)]
pub struct VotedSample {
    pub id: i64,
    pub comparison_sample_id: Uuid,
    pub test_set_id: Option<i64>,
    pub model_id: i64,
    pub model_name: String,
}

/// One comparison pending rating-engine processing.
#[derive(Debug, Clone, FromRow)]
pub struct PendingComparison {
    pub id: i64,
    pub metric_id: i64,
    pub test_set_id: i64,
}

/// A comparison rank joined to its sample's run, model, and prompt.
#[derive(Debug, Clone, FromRow)]
pub struct RankedSampleRow {
    pub comparison_id: i64,
    pub sample_id: i64,
    pub rank: i32,
    pub model_id: i64,
    pub prompt_id: i64,
}
