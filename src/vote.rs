use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::catalog::SampleCatalog;
use crate::entities::RatingSystem;
use crate::error::{ArenaError, ArenaResult};
use crate::gate::RatingTrigger;
use crate::identity::{Identity, PermissionService};
use crate::telemetry::TelemetrySink;
use crate::token::TokenStore;

/// One position in a submitted ranking: either a single sample (strict
/// placement) or a set of samples sharing the position (tie).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RankEntry {
    Single(Uuid),
    Tied(Vec<Uuid>),
}

/// Flattens best-first rank positions into (rank, sample) tuples, rejecting
/// duplicates. Position indexes are 1-based.
pub fn flatten_ranks(ordered: &[RankEntry]) -> ArenaResult<Vec<(i32, Uuid)>> {
    let mut flat = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, entry) in ordered.iter().enumerate() {
        let rank = idx as i32 + 1;
        let ids: &[Uuid] = match entry {
            RankEntry::Single(id) => std::slice::from_ref(id),
            RankEntry::Tied(ids) => ids,
        };
        for id in ids {
            if !seen.insert(*id) {
                return Err(ArenaError::RanksInvalid(format!(
                    "sample {id} appears more than once"
                )));
            }
            flat.push((rank, *id));
        }
    }

    Ok(flat)
}

/// Checks the flattened ranking against the token's two samples: both must
/// appear exactly once and nothing else may.
pub fn validate_ranks(
    flat: &[(i32, Uuid)],
    sample_1: Uuid,
    sample_2: Uuid,
) -> ArenaResult<()> {
    if flat.len() != 2 {
        return Err(ArenaError::RanksInvalid(format!(
            "expected exactly 2 ranked samples, got {}",
            flat.len()
        )));
    }
    let ranked: std::collections::HashSet<Uuid> = flat.iter().map(|(_, id)| *id).collect();
    if ranked != std::collections::HashSet::from([sample_1, sample_2]) {
        return Err(ArenaError::RanksInvalid(
            "ranking does not match the samples issued with the token".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub sample_1_model: String,
    pub sample_2_model: String,
}

pub struct VoteRecorder {
    pool: PgPool,
    catalog: SampleCatalog,
    store: Arc<dyn TokenStore>,
    permissions: Arc<dyn PermissionService>,
    trigger: RatingTrigger,
    telemetry: TelemetrySink,
}

impl VoteRecorder {
    pub fn new(
        pool: PgPool,
        catalog: SampleCatalog,
        store: Arc<dyn TokenStore>,
        permissions: Arc<dyn PermissionService>,
        trigger: RatingTrigger,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            pool,
            catalog,
            store,
            permissions,
            trigger,
            telemetry,
        }
    }

    /// Consumes the token, validates the ranking, persists the comparison
    /// atomically, and pokes both rating systems. The token is single-shot:
    /// a second submission for the same token fails with
    /// `TokenUnknownOrExpired`, so clients cannot double-vote by retrying.
    pub async fn record_vote(
        &self,
        token: Uuid,
        ordered: &[RankEntry],
        identity: &Identity,
    ) -> ArenaResult<VoteOutcome> {
        let payload = self
            .store
            .take_and_delete(token)
            .await?
            .ok_or(ArenaError::TokenUnknownOrExpired)?;

        let samples = self
            .catalog
            .voted_samples(&[payload.sample_1, payload.sample_2])
            .await?;
        if samples.len() != 2 {
            return Err(ArenaError::SamplesNotFound);
        }
        let by_public_id: HashMap<Uuid, _> = samples
            .iter()
            .map(|s| (s.comparison_sample_id, s))
            .collect();
        let (Some(first), Some(second)) = (
            by_public_id.get(&payload.sample_1),
            by_public_id.get(&payload.sample_2),
        ) else {
            return Err(ArenaError::SamplesNotFound);
        };

        let flat = flatten_ranks(ordered)?;
        validate_ranks(&flat, payload.sample_1, payload.sample_2)?;

        let test_set_id = match (first.test_set_id, second.test_set_id) {
            (Some(a), Some(b)) if a == b => a,
            _ => return Err(ArenaError::TestSetMismatch),
        };

        let metric = self
            .catalog
            .metric_by_external_id(payload.metric_external_id)
            .await?
            .ok_or_else(|| ArenaError::NotFound("metric associated with comparison".to_string()))?;

        if !self.permissions.can_vote(identity).await? {
            return Err(ArenaError::Forbidden);
        }

        let sample_ranks: Vec<(i64, i32)> = flat
            .iter()
            .map(|&(rank, public_id)| {
                by_public_id
                    .get(&public_id)
                    .map(|sample| (sample.id, rank))
                    .ok_or(ArenaError::SamplesNotFound)
            })
            .collect::<ArenaResult<_>>()?;

        // One retry on transient conflicts; the transaction is all-or-nothing
        // either way.
        let comparison_id = match self
            .persist_comparison(identity, metric.id, test_set_id, &sample_ranks)
            .await
        {
            Ok(id) => id,
            Err(ArenaError::Database(err)) => {
                tracing::warn!(error = %err, "comparison insert failed, retrying once");
                self.persist_comparison(identity, metric.id, test_set_id, &sample_ranks)
                    .await?
            }
            Err(err) => return Err(err),
        };

        self.telemetry.emit(
            "comparison.recorded",
            json!({
                "comparison_id": comparison_id,
                "metric": metric.name,
                "authenticated": identity.user_id.is_some(),
            }),
        );

        // Best effort: the vote is durable either way, and the next vote's
        // trigger will pick up anything missed here.
        for system in [RatingSystem::Elo, RatingSystem::Glicko] {
            if let Err(err) = self.trigger.trigger(system).await {
                tracing::warn!(system = %system, error = %err, "rating trigger failed");
            }
        }

        Ok(VoteOutcome {
            sample_1_model: first.model_name.clone(),
            sample_2_model: second.model_name.clone(),
        })
    }

    async fn persist_comparison(
        &self,
        identity: &Identity,
        metric_id: i64,
        test_set_id: i64,
        sample_ranks: &[(i64, i32)],
    ) -> ArenaResult<i64> {
        let mut tx = self.pool.begin().await?;
        let comparison_id: i64 = sqlx::query_scalar(
            "INSERT INTO scoring.comparison \
             (user_id, identification_token_id, session_id, metric_id, test_set_id) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id",
        )
        .bind(identity.user_id)
        .bind(identity.identification_token_id)
        .bind(identity.session_id)
        .bind(metric_id)
        .bind(test_set_id)
        .fetch_one(&mut *tx)
        .await?;

        for &(sample_id, rank) in sample_ranks {
            sqlx::query(
                "INSERT INTO scoring.comparison_rank (comparison_id, sample_id, rank) \
                 VALUES ($1, $2, $3)",
            )
            .bind(comparison_id)
            .bind(sample_id)
            .bind(rank)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(comparison_id)
    }
}
