use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use uuid::Uuid;

use crate::catalog::SampleCatalog;
use crate::cli::SelectionMode;
use crate::config::{ArenaConfig, AUTHENTICATED_TEST_SET, UNAUTHENTICATED_TEST_SET};
use crate::entities::CandidateSample;
use crate::error::{ArenaError, ArenaResult};
use crate::identity::VoterCategory;
use crate::token::{PairPayload, TokenStore};

/// Share of batch requests that order correlations by model priority rather
/// than uniformly.
const PRIORITY_ORDERING_PROBABILITY: f64 = 0.8;

pub fn default_test_set_name(category: VoterCategory) -> &'static str {
    match category {
        VoterCategory::Authenticated => AUTHENTICATED_TEST_SET,
        VoterCategory::Anonymous => UNAUTHENTICATED_TEST_SET,
    }
}

/// Priority weight for a model given its global vote count and the mean
/// vote count across the leaderboard. Models far below the mean are pushed
/// toward the front of pair selection; the small random term keeps models
/// with identical counts from always colliding into the same pair.
pub fn priority_score(votes: i64, avg: f64, rng: &mut impl Rng) -> f64 {
    if votes == 0 {
        return 200.0;
    }
    let votes = votes as f64;

    let starved = (avg * 0.1).max(1.0);
    let below = (avg * 0.9).max(1.0);
    let near = (avg * 0.99).max(1.0);

    if votes < starved {
        150.0 + rng.random_range(0.0..10.0) + (1.0 - votes / starved)
    } else if votes < below {
        50.0 + rng.random_range(0.0..10.0) + (1.0 - votes / below)
    } else if votes < near {
        10.0 + rng.random_range(0.0..5.0) + (1.0 - votes / near)
    } else {
        1.0 - votes / avg.max(1.0)
    }
}

/// Scores every model that has an eligible sample. The mean is taken over
/// the leaderboard rows (models never voted on are absent from the map and
/// score the full zero-vote priority).
pub fn compute_model_priorities(
    candidates: &[CandidateSample],
    vote_counts: &HashMap<i64, i64>,
    rng: &mut impl Rng,
) -> HashMap<i64, f64> {
    let avg = if vote_counts.is_empty() {
        0.0
    } else {
        vote_counts.values().sum::<i64>() as f64 / vote_counts.len() as f64
    };

    let model_ids: HashSet<i64> = candidates.iter().map(|c| c.model_id).collect();
    let mut ordered: Vec<i64> = model_ids.into_iter().collect();
    ordered.sort_unstable();

    ordered
        .into_iter()
        .map(|model_id| {
            let votes = vote_counts.get(&model_id).copied().unwrap_or(0);
            (model_id, priority_score(votes, avg, rng))
        })
        .collect()
}

#[derive(Debug)]
pub enum PairingStrategy {
    Uniform,
    Priority { priorities: HashMap<i64, f64> },
}

/// Pure pairing core.
///
/// Candidates are grouped by correlation id; a correlation is eligible when
/// at least two distinct models are represented, otherwise no valid pair
/// exists inside it. Each eligible correlation contributes one draw slot per
/// participating model, so correlations rich in models get proportionally
/// more draws and a single correlation can fill a whole batch. Slots are
/// ordered per the strategy and the first `batch_size` each yield one
/// distinct-model pair.
pub fn plan_pairs(
    candidates: &[CandidateSample],
    strategy: &PairingStrategy,
    batch_size: usize,
    rng: &mut impl Rng,
) -> Vec<(CandidateSample, CandidateSample)> {
    let mut groups: BTreeMap<Uuid, Vec<&CandidateSample>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(candidate.correlation_id)
            .or_default()
            .push(candidate);
    }

    let eligible: BTreeMap<Uuid, (Vec<&CandidateSample>, BTreeSet<i64>)> = groups
        .into_iter()
        .filter_map(|(correlation_id, samples)| {
            let models: BTreeSet<i64> = samples.iter().map(|s| s.model_id).collect();
            (models.len() >= 2).then_some((correlation_id, (samples, models)))
        })
        .collect();

    let mut slots: Vec<Uuid> = eligible
        .iter()
        .flat_map(|(correlation_id, (_, models))| {
            std::iter::repeat_n(*correlation_id, models.len())
        })
        .collect();

    match strategy {
        PairingStrategy::Priority { priorities } if rng.random_bool(PRIORITY_ORDERING_PROBABILITY) => {
            // Mean priority of the models participating in the correlation;
            // slots of the same correlation tie-break randomly.
            let mut keyed: Vec<(f64, f64, Uuid)> = slots
                .into_iter()
                .map(|correlation_id| {
                    let (_, models) = &eligible[&correlation_id];
                    let mean = models
                        .iter()
                        .map(|m| priorities.get(m).copied().unwrap_or(0.0))
                        .sum::<f64>()
                        / models.len() as f64;
                    (mean, rng.random::<f64>(), correlation_id)
                })
                .collect();
            keyed.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.total_cmp(&b.1)));
            slots = keyed.into_iter().map(|(_, _, id)| id).collect();
        }
        _ => {
            slots.shuffle(rng);
        }
    }

    let mut pairs = Vec::with_capacity(batch_size.min(slots.len()));
    for correlation_id in slots.into_iter().take(batch_size) {
        let (samples, _) = &eligible[&correlation_id];
        let Some(first) = samples.choose(rng).copied() else {
            continue;
        };

        let partners: Vec<&CandidateSample> = samples
            .iter()
            .copied()
            .filter(|s| s.model_id != first.model_id && s.sample_id != first.sample_id)
            .collect();

        let second = match strategy {
            PairingStrategy::Uniform => partners.choose(rng).copied(),
            PairingStrategy::Priority { priorities } => partners
                .iter()
                .map(|s| {
                    let weight = priorities.get(&s.model_id).copied().unwrap_or(0.0);
                    (weight, rng.random::<f64>(), *s)
                })
                .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)))
                .map(|(_, _, s)| s),
        };

        if let Some(second) = second {
            pairs.push((first.clone(), second.clone()));
        }
    }

    pairs
}

/// One entry of a pair batch, ready for the transport layer.
#[derive(Debug, Clone)]
pub struct SelectedPair {
    pub token: Uuid,
    pub metric_external_id: Uuid,
    pub sample_1: PairSide,
    pub sample_2: PairSide,
    pub build_specification: String,
}

#[derive(Debug, Clone)]
pub struct PairSide {
    pub comparison_sample_id: Uuid,
    pub artifact_key: String,
}

pub struct PairSelector {
    catalog: SampleCatalog,
    store: Arc<dyn TokenStore>,
    mode: SelectionMode,
    max_batch_size: u32,
    token_ttl_secs: u64,
}

impl PairSelector {
    pub fn new(catalog: SampleCatalog, store: Arc<dyn TokenStore>, cfg: &ArenaConfig) -> Self {
        Self {
            catalog,
            store,
            mode: cfg.selection_mode,
            max_batch_size: cfg.max_batch_size,
            token_ttl_secs: cfg.token_ttl_secs,
        }
    }

    pub async fn select_batch(
        &self,
        metric_external_id: Uuid,
        batch_size: u32,
        category: VoterCategory,
    ) -> ArenaResult<Vec<SelectedPair>> {
        if batch_size == 0 || batch_size > self.max_batch_size {
            return Err(ArenaError::InvalidBatchSize {
                requested: batch_size,
                max: self.max_batch_size,
            });
        }

        let metric = self
            .catalog
            .metric_by_external_id(metric_external_id)
            .await?
            .ok_or(ArenaError::InvalidMetric)?;

        let test_set_name = default_test_set_name(category);
        let test_set_id = self
            .catalog
            .test_set_id_by_name(test_set_name)
            .await?
            .ok_or_else(|| ArenaError::NoDefaultTestSet(test_set_name.to_string()))?;

        let candidates = self.catalog.eligible_candidates(test_set_id).await?;

        let strategy = match self.mode {
            SelectionMode::Uniform => PairingStrategy::Uniform,
            SelectionMode::Priority => {
                let vote_counts = self
                    .catalog
                    .model_vote_counts(metric.id, test_set_id)
                    .await?;
                let mut rng = rand::rng();
                PairingStrategy::Priority {
                    priorities: compute_model_priorities(&candidates, &vote_counts, &mut rng),
                }
            }
        };

        let planned = {
            let mut rng = rand::rng();
            plan_pairs(&candidates, &strategy, batch_size as usize, &mut rng)
        };
        if planned.is_empty() {
            return Ok(Vec::new());
        }

        let sample_ids: Vec<i64> = planned
            .iter()
            .flat_map(|(a, b)| [a.sample_id, b.sample_id])
            .collect();
        let prompt_ids: Vec<i64> = planned.iter().map(|(a, _)| a.prompt_id).collect();

        let artifact_keys = self.catalog.artifact_keys(&sample_ids).await?;
        let build_specs = self.catalog.build_specifications(&prompt_ids).await?;

        let mut selected = Vec::with_capacity(planned.len());
        for (first, second) in planned {
            let (Some(key_1), Some(key_2)) = (
                artifact_keys.get(&first.sample_id),
                artifact_keys.get(&second.sample_id),
            ) else {
                tracing::warn!(
                    sample_1 = first.sample_id,
                    sample_2 = second.sample_id,
                    "comparison artifact disappeared between selection and hydration, dropping pair"
                );
                continue;
            };
            let Some(build_specification) = build_specs.get(&first.prompt_id) else {
                tracing::warn!(prompt_id = first.prompt_id, "prompt missing during hydration");
                continue;
            };

            let token = Uuid::new_v4();
            let payload = PairPayload {
                metric_external_id: metric.external_id,
                sample_1: first.comparison_sample_id,
                sample_2: second.comparison_sample_id,
            };
            self.store
                .put(token, &payload, self.token_ttl_secs)
                .await?;

            selected.push(SelectedPair {
                token,
                metric_external_id: metric.external_id,
                sample_1: PairSide {
                    comparison_sample_id: first.comparison_sample_id,
                    artifact_key: key_1.clone(),
                },
                sample_2: PairSide {
                    comparison_sample_id: second.comparison_sample_id,
                    artifact_key: key_2.clone(),
                },
                build_specification: build_specification.clone(),
            });
        }

        Ok(selected)
    }
}
