use std::collections::HashMap;

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::COMPARISON_ARTIFACT_KIND;
use crate::entities::{CandidateSample, Metric, VotedSample};
use crate::error::ArenaResult;

/// Read-only view over approved samples, their run/model/prompt context,
/// and the dimension tables the selectors and recorders resolve against.
#[derive(Clone)]
pub struct SampleCatalog {
    pool: PgPool,
}

impl SampleCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn metric_by_external_id(&self, external_id: Uuid) -> ArenaResult<Option<Metric>> {
        let metric = sqlx::query_as::<_, Metric>(
            "SELECT id, external_id, name, description FROM scoring.metric WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(metric)
    }

    pub async fn test_set_id_by_name(&self, name: &str) -> ArenaResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM sample.test_set WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Samples eligible for comparison in a test set: approved, not
    /// deprecated, and carrying a rendered comparison artifact.
    pub async fn eligible_candidates(&self, test_set_id: i64) -> ArenaResult<Vec<CandidateSample>> {
        let candidates = sqlx::query_as::<_, CandidateSample>(
            "SELECT s.id AS sample_id, \
                    s.comparison_sample_id, \
                    s.comparison_correlation_id AS correlation_id, \
                    r.model_id, \
                    r.prompt_id \
             FROM sample.sample s \
             JOIN specification.run r ON r.id = s.run_id \
             JOIN scoring.sample_approval_state aps ON aps.id = s.approval_state_id \
             LEFT JOIN specification.experimental_state es ON es.id = s.experimental_state_id \
             WHERE aps.name = 'APPROVED' \
               AND s.test_set_id = $1 \
               AND (es.name IS NULL OR es.name <> 'DEPRECATED') \
               AND EXISTS ( \
                   SELECT 1 FROM sample.artifact a \
                   JOIN sample.artifact_kind k ON k.id = a.artifact_kind_id \
                   WHERE a.sample_id = s.id AND k.name = $2 \
               )",
        )
        .bind(test_set_id)
        .bind(COMPARISON_ARTIFACT_KIND)
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates)
    }

    /// Per-model vote counts from the global (tagless) leaderboard rows for
    /// the metric/test-set scope. Models without a row simply have no entry.
    pub async fn model_vote_counts(
        &self,
        metric_id: i64,
        test_set_id: i64,
    ) -> ArenaResult<HashMap<i64, i64>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT model_id, vote_count FROM scoring.model_leaderboard \
             WHERE metric_id = $1 AND test_set_id = $2 AND tag_id IS NULL",
        )
        .bind(metric_id)
        .bind(test_set_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// One rendered comparison artifact key per sample.
    pub async fn artifact_keys(&self, sample_ids: &[i64]) -> ArenaResult<HashMap<i64, String>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT DISTINCT ON (a.sample_id) a.sample_id, a.key \
             FROM sample.artifact a \
             JOIN sample.artifact_kind k ON k.id = a.artifact_kind_id \
             WHERE k.name = $1 AND a.sample_id = ANY($2) \
             ORDER BY a.sample_id, a.id",
        )
        .bind(COMPARISON_ARTIFACT_KIND)
        .bind(sample_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn build_specifications(
        &self,
        prompt_ids: &[i64],
    ) -> ArenaResult<HashMap<i64, String>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, build_specification FROM specification.prompt WHERE id = ANY($1)",
        )
        .bind(prompt_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Samples addressed by their public comparison ids, with the owning
    /// model resolved for the vote response.
    pub async fn voted_samples(
        &self,
        comparison_sample_ids: &[Uuid],
    ) -> ArenaResult<Vec<VotedSample>> {
        let samples = sqlx::query_as::<_, VotedSample>(
            "SELECT s.id, s.comparison_sample_id, s.test_set_id, r.model_id, m.name AS model_name \
             FROM sample.sample s \
             JOIN specification.run r ON r.id = s.run_id \
             JOIN specification.model m ON m.id = r.model_id \
             WHERE s.comparison_sample_id = ANY($1)",
        )
        .bind(comparison_sample_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(samples)
    }
}
