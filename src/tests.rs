use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::cli::*;
use crate::config::*;
use crate::elo;
use crate::entities::*;
use crate::error::*;
use crate::gate::*;
use crate::glicko::{self, GlickoRating};
use crate::jobs::*;
use crate::rating::*;
use crate::selection::*;
use crate::telemetry::TelemetrySink;
use crate::token::*;
use crate::vote::*;

fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

fn base_cfg() -> ArenaConfig {
    ArenaConfig {
        profile: "default".to_string(),
        config_path: ".arena/config.toml".to_string(),
        database_url: "postgres://localhost/model_arena_test".to_string(),
        redis_url: "redis://127.0.0.1:6379/0".to_string(),
        host: "127.0.0.1".to_string(),
        port: 8080,
        object_bucket: "arena-artifacts".to_string(),
        selection_mode: SelectionMode::Priority,
        max_batch_size: 10,
        rating_batch_size: 1000,
        token_ttl_secs: 3600,
        elo_gate_ttl_secs: 300,
        glicko_gate_ttl_secs: 3600,
        leaderboard_min_votes: 10,
        worker_poll_interval_ms: 10,
        telemetry_enabled: false,
        telemetry_path: ".arena/telemetry.jsonl".to_string(),
    }
}

fn candidate(sample_id: i64, correlation_id: Uuid, model_id: i64, prompt_id: i64) -> CandidateSample {
    CandidateSample {
        sample_id,
        comparison_sample_id: Uuid::new_v4(),
        correlation_id,
        model_id,
        prompt_id,
    }
}

// ---------------------------------------------------------------------------
// Elo math
// ---------------------------------------------------------------------------

#[test]
fn elo_expected_score_is_half_for_equal_ratings() {
    assert_eq!(elo::expected_score(1000.0, 1000.0), 0.5);
}

#[test]
fn elo_win_between_equals_moves_sixteen_points() {
    let (winner, loser) = elo::update_pair(1000.0, 1000.0, 1.0);
    assert_eq!(winner, 1016.0);
    assert_eq!(loser, 984.0);
}

#[test]
fn elo_updates_are_symmetric() {
    for (ra, rb, score) in [
        (1000.0, 1000.0, 1.0),
        (1234.5, 987.6, 0.0),
        (1100.0, 900.0, 0.5),
        (1723.9, 1456.1, 1.0),
    ] {
        let (na, nb) = elo::update_pair(ra, rb, score);
        let delta_a = na - ra;
        let delta_b = nb - rb;
        assert!((delta_a + delta_b).abs() < 1e-9, "deltas {delta_a} and {delta_b} do not cancel");
    }
}

#[test]
fn elo_tie_transfers_rating_from_the_stronger_side() {
    let (strong, weak) = elo::update_pair(1100.0, 900.0, 0.5);
    assert!(strong < 1100.0);
    assert!(weak > 900.0);
    assert!(((strong + weak) - 2000.0).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Glicko-2 math
// ---------------------------------------------------------------------------

#[test]
fn glicko_matches_glickman_worked_example() {
    // The example from the Glicko-2 paper, tau = 0.5.
    let player = GlickoRating {
        rating: 1500.0,
        deviation: 200.0,
        volatility: 0.06,
    };
    let opponents = [
        (GlickoRating { rating: 1400.0, deviation: 30.0, volatility: 0.06 }, 1.0),
        (GlickoRating { rating: 1550.0, deviation: 100.0, volatility: 0.06 }, 0.0),
        (GlickoRating { rating: 1700.0, deviation: 300.0, volatility: 0.06 }, 0.0),
    ];
    let updated = glicko::update_rating(player, &opponents).unwrap();
    assert!((updated.rating - 1464.06).abs() < 0.5, "rating was {}", updated.rating);
    assert!((updated.deviation - 151.52).abs() < 0.5, "deviation was {}", updated.deviation);
    assert!((updated.volatility - 0.05999).abs() < 0.001);
}

#[test]
fn glicko_win_raises_rating_and_shrinks_deviation() {
    let player = GlickoRating {
        rating: 1500.0,
        deviation: 200.0,
        volatility: 0.06,
    };
    let opponent = GlickoRating {
        rating: 1500.0,
        deviation: 350.0,
        volatility: 0.06,
    };
    let updated = glicko::update_rating(player, &[(opponent, 1.0)]).unwrap();
    assert!(updated.rating > 1500.0);
    assert!(updated.deviation < 200.0);
    assert!(updated.deviation >= glicko::MIN_DEVIATION);
}

#[test]
fn glicko_update_is_deterministic() {
    let player = GlickoRating {
        rating: 1437.2,
        deviation: 212.8,
        volatility: 0.059,
    };
    let opponent = GlickoRating {
        rating: 1613.0,
        deviation: 87.4,
        volatility: 0.061,
    };
    let first = glicko::update_rating(player, &[(opponent, 0.0)]).unwrap();
    let second = glicko::update_rating(player, &[(opponent, 0.0)]).unwrap();
    assert_eq!(first, second);
}

#[test]
fn glicko_deviation_stays_inside_bounds() {
    // Many sequential games against a sharp opponent drive RD down; the
    // floor holds. A long idle stretch drives it up; the cap holds.
    let opponent = GlickoRating {
        rating: 1500.0,
        deviation: 30.0,
        volatility: 0.06,
    };
    let mut player = GlickoRating::default();
    for _ in 0..200 {
        player = glicko::update_rating(player, &[(opponent, 1.0)]).unwrap();
        assert!(player.deviation >= glicko::MIN_DEVIATION);
        assert!(player.deviation <= glicko::MAX_DEVIATION);
    }

    for _ in 0..500 {
        player = glicko::update_rating(player, &[]).unwrap();
    }
    assert!(player.deviation <= glicko::MAX_DEVIATION);
}

// ---------------------------------------------------------------------------
// Priority bands and pair planning
// ---------------------------------------------------------------------------

#[test]
fn priority_bands_match_the_weight_table() {
    let mut rng = seeded(7);

    assert_eq!(priority_score(0, 100.0, &mut rng), 200.0);

    let starved = priority_score(1, 100.0, &mut rng);
    assert!((150.0..161.0).contains(&starved), "starved band was {starved}");

    let below = priority_score(50, 100.0, &mut rng);
    assert!((50.0..61.0).contains(&below), "below band was {below}");

    let near = priority_score(95, 100.0, &mut rng);
    assert!((10.0..16.0).contains(&near), "near band was {near}");

    let above = priority_score(200, 100.0, &mut rng);
    assert_eq!(above, 1.0 - 200.0 / 100.0);
}

#[test]
fn priorities_default_to_zero_vote_band_without_leaderboard_rows() {
    let mut rng = seeded(11);
    let corr = Uuid::new_v4();
    let candidates = vec![candidate(1, corr, 10, 1), candidate(2, corr, 11, 1)];
    let priorities = compute_model_priorities(&candidates, &HashMap::new(), &mut rng);
    assert_eq!(priorities[&10], 200.0);
    assert_eq!(priorities[&11], 200.0);
}

#[test]
fn single_correlation_with_three_models_fills_a_batch_of_three() {
    // 3 models x 2 samples sharing one correlation: the correlation carries
    // three draw slots, one per participating model.
    let corr = Uuid::new_v4();
    let mut candidates = Vec::new();
    let mut next_id = 1;
    for model_id in [1, 2, 3] {
        for _ in 0..2 {
            candidates.push(candidate(next_id, corr, model_id, 1));
            next_id += 1;
        }
    }

    let mut rng = seeded(3);
    let pairs = plan_pairs(&candidates, &PairingStrategy::Uniform, 3, &mut rng);
    assert_eq!(pairs.len(), 3);
    for (first, second) in &pairs {
        assert_ne!(first.sample_id, second.sample_id);
        assert_ne!(first.model_id, second.model_id);
        assert_eq!(first.correlation_id, second.correlation_id);
    }
}

#[test]
fn correlations_with_a_single_model_are_never_paired() {
    let corr_a = Uuid::new_v4();
    let corr_b = Uuid::new_v4();
    let candidates = vec![
        candidate(1, corr_a, 1, 1),
        candidate(2, corr_a, 1, 1),
        candidate(3, corr_b, 1, 2),
        candidate(4, corr_b, 2, 2),
    ];
    let mut rng = seeded(5);
    let pairs = plan_pairs(&candidates, &PairingStrategy::Uniform, 10, &mut rng);
    assert!(!pairs.is_empty());
    for (first, second) in &pairs {
        assert_eq!(first.correlation_id, corr_b);
        assert_ne!(first.model_id, second.model_id);
        assert_eq!(second.correlation_id, corr_b);
    }
}

#[test]
fn zero_vote_model_dominates_priority_batches() {
    // Model 1 has never been voted on; models 2 and 3 sit at 100 votes.
    // Over 100 batches of size 5 the starved model must appear in at least
    // 85 batches.
    let mut candidates = Vec::new();
    let mut next_id = 1;
    for _ in 0..10 {
        let corr = Uuid::new_v4();
        for model_id in [1, 2, 3] {
            candidates.push(candidate(next_id, corr, model_id, 1));
            next_id += 1;
        }
    }
    let vote_counts: HashMap<i64, i64> = HashMap::from([(2, 100), (3, 100)]);

    let mut rng = seeded(42);
    let mut batches_with_starved = 0;
    for _ in 0..100 {
        let priorities = compute_model_priorities(&candidates, &vote_counts, &mut rng);
        let pairs = plan_pairs(
            &candidates,
            &PairingStrategy::Priority { priorities },
            5,
            &mut rng,
        );
        assert!(!pairs.is_empty());
        if pairs
            .iter()
            .any(|(a, b)| a.model_id == 1 || b.model_id == 1)
        {
            batches_with_starved += 1;
        }
    }
    assert!(
        batches_with_starved >= 85,
        "starved model appeared in only {batches_with_starved} of 100 batches"
    );
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[test]
fn pair_payload_round_trips() {
    let payload = PairPayload {
        metric_external_id: Uuid::new_v4(),
        sample_1: Uuid::new_v4(),
        sample_2: Uuid::new_v4(),
    };
    let decoded = PairPayload::decode(&payload.encode()).unwrap();
    assert_eq!(decoded, payload);
}

#[test]
fn malformed_payloads_are_rejected() {
    for raw in ["", "abc", "a:b:c", "00000000-0000-0000-0000-000000000000:x:y"] {
        let err = PairPayload::decode(raw).unwrap_err();
        assert!(matches!(err, ArenaError::MalformedToken));
    }
}

#[tokio::test]
async fn memory_token_store_yields_payload_to_exactly_one_caller() {
    let store = MemoryTokenStore::new();
    let token = Uuid::new_v4();
    let payload = PairPayload {
        metric_external_id: Uuid::new_v4(),
        sample_1: Uuid::new_v4(),
        sample_2: Uuid::new_v4(),
    };
    store.put(token, &payload, 3600).await.unwrap();

    assert_eq!(store.take_and_delete(token).await.unwrap(), Some(payload));
    assert_eq!(store.take_and_delete(token).await.unwrap(), None);
}

#[tokio::test]
async fn memory_token_store_honors_ttl() {
    let store = MemoryTokenStore::new();
    let token = Uuid::new_v4();
    let payload = PairPayload {
        metric_external_id: Uuid::new_v4(),
        sample_1: Uuid::new_v4(),
        sample_2: Uuid::new_v4(),
    };
    store.put(token, &payload, 0).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(store.take_and_delete(token).await.unwrap(), None);
}

// ---------------------------------------------------------------------------
// Rank validation
// ---------------------------------------------------------------------------

#[test]
fn winner_loser_ranks_flatten_in_order() {
    let s1 = Uuid::new_v4();
    let s2 = Uuid::new_v4();
    let flat = flatten_ranks(&[RankEntry::Single(s1), RankEntry::Single(s2)]).unwrap();
    assert_eq!(flat, vec![(1, s1), (2, s2)]);
    validate_ranks(&flat, s1, s2).unwrap();
}

#[test]
fn tied_ranks_share_the_first_position() {
    let s1 = Uuid::new_v4();
    let s2 = Uuid::new_v4();
    let flat = flatten_ranks(&[RankEntry::Tied(vec![s1, s2])]).unwrap();
    assert_eq!(flat, vec![(1, s1), (1, s2)]);
    validate_ranks(&flat, s1, s2).unwrap();
}

#[test]
fn duplicate_and_foreign_samples_are_rejected() {
    let s1 = Uuid::new_v4();
    let s2 = Uuid::new_v4();

    let err = flatten_ranks(&[RankEntry::Single(s1), RankEntry::Single(s1)]).unwrap_err();
    assert!(matches!(err, ArenaError::RanksInvalid(_)));

    let flat = flatten_ranks(&[RankEntry::Single(s1), RankEntry::Single(Uuid::new_v4())]).unwrap();
    let err = validate_ranks(&flat, s1, s2).unwrap_err();
    assert!(matches!(err, ArenaError::RanksInvalid(_)));

    let short = flatten_ranks(&[RankEntry::Single(s1)]).unwrap();
    let err = validate_ranks(&short, s1, s2).unwrap_err();
    assert!(matches!(err, ArenaError::RanksInvalid(_)));
}

// ---------------------------------------------------------------------------
// Single-flight gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_triggers_collapse_to_one_enqueue() {
    let gate = Arc::new(MemoryGate::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let trigger = Arc::new(RatingTrigger::new(gate, queue.clone(), &base_cfg()));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let trigger = trigger.clone();
        handles.push(tokio::spawn(async move {
            trigger.trigger(RatingSystem::Elo).await.unwrap()
        }));
    }

    let mut enqueued = 0;
    let mut skipped = 0;
    for handle in handles {
        match handle.await.unwrap() {
            TriggerOutcome::Enqueued => enqueued += 1,
            TriggerOutcome::Skipped => skipped += 1,
        }
    }
    assert_eq!(enqueued, 1);
    assert_eq!(skipped, 49);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn released_gate_accepts_the_next_trigger() {
    let gate = Arc::new(MemoryGate::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let trigger = RatingTrigger::new(gate.clone(), queue.clone(), &base_cfg());

    assert_eq!(trigger.trigger(RatingSystem::Glicko).await.unwrap(), TriggerOutcome::Enqueued);
    assert_eq!(trigger.trigger(RatingSystem::Glicko).await.unwrap(), TriggerOutcome::Skipped);

    gate.release(RatingSystem::Glicko).await.unwrap();
    assert_eq!(trigger.trigger(RatingSystem::Glicko).await.unwrap(), TriggerOutcome::Enqueued);
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn gates_are_independent_per_rating_system() {
    let gate = MemoryGate::new();
    assert!(gate.acquire(RatingSystem::Elo, 300).await.unwrap());
    assert!(gate.acquire(RatingSystem::Glicko, 3600).await.unwrap());
    assert!(!gate.acquire(RatingSystem::Elo, 300).await.unwrap());
}

// ---------------------------------------------------------------------------
// Rating application
// ---------------------------------------------------------------------------

fn side(sample_id: i64, model_id: i64, prompt_id: i64, tag_ids: Vec<i64>) -> SideContext {
    SideContext {
        sample_id,
        model_id,
        prompt_id,
        tag_ids,
    }
}

fn win_context(comparison_id: i64) -> ComparisonContext {
    ComparisonContext {
        comparison_id,
        metric_id: 1,
        test_set_id: 1,
        outcome: ComparisonOutcome::FirstWins,
        first: side(101, 1, 11, vec![]),
        second: side(102, 2, 11, vec![]),
    }
}

#[test]
fn elo_boards_update_winner_and_loser_symmetrically() {
    let mut rows: HashMap<BoardKey, EloRow> = HashMap::new();
    apply_elo(&win_context(1), &mut rows);

    let winner_key = BoardKey {
        subject: Subject::Model(1),
        metric_id: 1,
        test_set_id: 1,
        tag_id: None,
    };
    let loser_key = BoardKey {
        subject: Subject::Model(2),
        metric_id: 1,
        test_set_id: 1,
        tag_id: None,
    };
    assert_eq!(rows[&winner_key].rating, 1016.0);
    assert_eq!(rows[&winner_key].wins, 1);
    assert_eq!(rows[&winner_key].votes, 1);
    assert_eq!(rows[&loser_key].rating, 984.0);
    assert_eq!(rows[&loser_key].losses, 1);

    // Prompt and sample boards move in lockstep with the model boards.
    let winner_sample = BoardKey {
        subject: Subject::Sample(101),
        metric_id: 1,
        test_set_id: 1,
        tag_id: None,
    };
    assert_eq!(rows[&winner_sample].rating, 1016.0);
    let winner_prompt = BoardKey {
        subject: Subject::Prompt { prompt_id: 11, model_id: 1 },
        metric_id: 1,
        test_set_id: 1,
        tag_id: None,
    };
    assert_eq!(rows[&winner_prompt].rating, 1016.0);
}

#[test]
fn tag_scoped_rows_update_alongside_global_rows() {
    let mut rows: HashMap<BoardKey, EloRow> = HashMap::new();
    let ctx = ComparisonContext {
        comparison_id: 1,
        metric_id: 1,
        test_set_id: 1,
        outcome: ComparisonOutcome::FirstWins,
        first: side(101, 1, 11, vec![7]),
        second: side(102, 2, 11, vec![7]),
    };
    apply_elo(&ctx, &mut rows);

    let tagged_winner = BoardKey {
        subject: Subject::Model(1),
        metric_id: 1,
        test_set_id: 1,
        tag_id: Some(7),
    };
    let global_winner = BoardKey {
        subject: Subject::Model(1),
        metric_id: 1,
        test_set_id: 1,
        tag_id: None,
    };
    assert_eq!(rows[&tagged_winner].rating, 1016.0);
    assert_eq!(rows[&global_winner].rating, 1016.0);
    assert_eq!(rows[&tagged_winner].votes, 1);

    // 2 sides x 3 subject kinds x (global + one tag) rows.
    assert_eq!(rows.values().filter(|r| r.dirty).count(), 12);
}

#[test]
fn tags_carried_by_only_one_side_are_not_scored() {
    // First side's prompt carries tags {7, 9}, second's only {7}. Tag 9 has
    // no opponent row to rate against, so no tag-9 row may be created or
    // touched for either side; tag 7 updates pairwise as usual.
    let mut rows: HashMap<BoardKey, EloRow> = HashMap::new();
    let ctx = ComparisonContext {
        comparison_id: 1,
        metric_id: 1,
        test_set_id: 1,
        outcome: ComparisonOutcome::FirstWins,
        first: side(101, 1, 11, vec![7, 9]),
        second: side(102, 2, 12, vec![7]),
    };
    apply_elo(&ctx, &mut rows);

    assert!(rows.keys().all(|key| key.tag_id != Some(9)));
    let shared_tag_winner = BoardKey {
        subject: Subject::Model(1),
        metric_id: 1,
        test_set_id: 1,
        tag_id: Some(7),
    };
    assert_eq!(rows[&shared_tag_winner].rating, 1016.0);
    // Tagless rows plus tag-7 rows, nothing else.
    assert_eq!(rows.values().filter(|r| r.dirty).count(), 12);
    assert_eq!(ctx.board_keys().len(), 12);

    // Glicko follows the same intersection rule.
    let mut glicko_rows: HashMap<BoardKey, GlickoRow> = HashMap::new();
    apply_glicko(&ctx, &mut glicko_rows).unwrap();
    assert!(glicko_rows.keys().all(|key| key.tag_id != Some(9)));
    assert_eq!(glicko_rows.values().filter(|r| r.dirty).count(), 12);
}

#[test]
fn vote_counts_always_equal_win_loss_tie_totals() {
    let mut rows: HashMap<BoardKey, EloRow> = HashMap::new();
    let mut rng = seeded(13);
    for comparison_id in 0..200 {
        let outcome = if rng.random_bool(0.3) {
            ComparisonOutcome::Tie
        } else {
            ComparisonOutcome::FirstWins
        };
        let model_a = rng.random_range(1..5);
        let mut model_b = rng.random_range(1..5);
        if model_b == model_a {
            model_b = if model_a == 4 { 1 } else { model_a + 1 };
        }
        let ctx = ComparisonContext {
            comparison_id,
            metric_id: 1,
            test_set_id: 1,
            outcome,
            first: side(model_a * 100, model_a, model_a * 10, vec![]),
            second: side(model_b * 100, model_b, model_b * 10, vec![]),
        };
        apply_elo(&ctx, &mut rows);
    }

    for (key, row) in &rows {
        assert_eq!(
            row.votes,
            row.wins + row.losses + row.ties,
            "count identity broken for {key:?}"
        );
    }
}

#[test]
fn glicko_boards_tie_keeps_equal_ratings_equal() {
    let mut rows: HashMap<BoardKey, GlickoRow> = HashMap::new();
    let ctx = ComparisonContext {
        comparison_id: 1,
        metric_id: 1,
        test_set_id: 1,
        outcome: ComparisonOutcome::Tie,
        first: side(101, 1, 11, vec![]),
        second: side(102, 2, 11, vec![]),
    };
    apply_glicko(&ctx, &mut rows).unwrap();

    let a = &rows[&BoardKey {
        subject: Subject::Model(1),
        metric_id: 1,
        test_set_id: 1,
        tag_id: None,
    }];
    let b = &rows[&BoardKey {
        subject: Subject::Model(2),
        metric_id: 1,
        test_set_id: 1,
        tag_id: None,
    }];
    assert!((a.rating.rating - b.rating.rating).abs() < 1e-9);
    assert_eq!(a.ties, 1);
    assert_eq!(b.ties, 1);
    assert!(a.rating.deviation < glicko::INITIAL_DEVIATION);
}

#[test]
fn glicko_board_deviations_stay_bounded_over_many_comparisons() {
    let mut rows: HashMap<BoardKey, GlickoRow> = HashMap::new();
    for comparison_id in 0..300 {
        let ctx = ComparisonContext {
            comparison_id,
            metric_id: 1,
            test_set_id: 1,
            outcome: ComparisonOutcome::FirstWins,
            first: side(101, 1, 11, vec![]),
            second: side(102, 2, 11, vec![]),
        };
        apply_glicko(&ctx, &mut rows).unwrap();
    }
    for row in rows.values() {
        assert!(row.rating.deviation >= glicko::MIN_DEVIATION);
        assert!(row.rating.deviation <= glicko::MAX_DEVIATION);
    }
}

#[test]
fn contexts_partition_ties_and_wins() {
    let pending = PendingComparison {
        id: 9,
        metric_id: 1,
        test_set_id: 2,
    };
    let row = |sample_id, rank, model_id| RankedSampleRow {
        comparison_id: 9,
        sample_id,
        rank,
        model_id,
        prompt_id: 5,
    };
    let tags = HashMap::new();

    let win = build_context(&pending, &[row(1, 1, 10), row(2, 2, 20)], &tags).unwrap();
    assert_eq!(win.outcome, ComparisonOutcome::FirstWins);
    assert_eq!(win.first.sample_id, 1);

    let swapped = build_context(&pending, &[row(1, 2, 10), row(2, 1, 20)], &tags).unwrap();
    assert_eq!(swapped.first.sample_id, 2);

    let tie = build_context(&pending, &[row(1, 1, 10), row(2, 1, 20)], &tags).unwrap();
    assert_eq!(tie.outcome, ComparisonOutcome::Tie);

    assert!(build_context(&pending, &[row(1, 1, 10)], &tags).is_err());
    assert!(build_context(&pending, &[row(1, 2, 10), row(2, 2, 20)], &tags).is_err());
}

// ---------------------------------------------------------------------------
// Config and wiring
// ---------------------------------------------------------------------------

#[test]
fn rating_systems_map_to_stable_task_names() {
    assert_eq!(RatingSystem::Elo.task_name(), "elo_calculation");
    assert_eq!(RatingSystem::Glicko.task_name(), "glicko_calculation");
    assert_eq!(
        RatingSystem::from_task_name("glicko_calculation"),
        Some(RatingSystem::Glicko)
    );
    assert_eq!(RatingSystem::from_task_name("unknown"), None);
}

#[test]
fn profiles_file_overrides_defaults() {
    use clap::Parser;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.staging]
database_url = "postgres://staging-db/arena"
selection_mode = "uniform"
rating_batch_size = 250
leaderboard_min_votes = 3
"#,
    )
    .unwrap();

    let cli = Cli::parse_from([
        "model-arena",
        "--profile",
        "staging",
        "--config-path",
        path.to_str().unwrap(),
        "serve",
    ]);
    let profiles = load_profiles(&cli.config_path).unwrap();
    let cfg = resolve_config(&cli, &profiles).unwrap();

    assert_eq!(cfg.database_url, "postgres://staging-db/arena");
    assert_eq!(cfg.selection_mode, SelectionMode::Uniform);
    assert_eq!(cfg.rating_batch_size, 250);
    assert_eq!(cfg.leaderboard_min_votes, 3);
    // Untouched settings keep their defaults.
    assert_eq!(cfg.max_batch_size, MAX_BATCH_SIZE);
    assert_eq!(cfg.elo_gate_ttl_secs, 300);
    assert_eq!(cfg.glicko_gate_ttl_secs, 3600);
}

#[test]
fn unknown_profiles_are_rejected() {
    use clap::Parser;

    let cli = Cli::parse_from(["model-arena", "--profile", "nope", "serve"]);
    let err = resolve_config(&cli, &ProfilesFile::default()).unwrap_err();
    assert!(err.to_string().contains("profile 'nope' not found"));
}

// ---------------------------------------------------------------------------
// Postgres-backed flows. These need a live database:
//   export DATABASE_URL=postgres://localhost/model_arena_test
//   cargo test -- --ignored
// ---------------------------------------------------------------------------

mod postgres {
    use super::*;
    use crate::catalog::SampleCatalog;
    use crate::identity::{Identity, StaticPermissionService};
    use sqlx::PgPool;

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/model_arena_test".to_string());
        let pool = crate::db::connect(&url).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();
        pool
    }

    struct Seeded {
        metric_id: i64,
        test_set_id: i64,
        model_a: i64,
        model_b: i64,
        sample_a: i64,
        sample_b: i64,
        sample_a_public: Uuid,
        sample_b_public: Uuid,
        metric_external_id: Uuid,
    }

    async fn seed_comparison_graph(pool: &PgPool) -> Seeded {
        let suffix = Uuid::new_v4().simple().to_string();
        let metric_external_id = Uuid::new_v4();

        let metric_id: i64 = sqlx::query_scalar(
            "INSERT INTO scoring.metric (external_id, name, description) \
             VALUES ($1, $2, 'test metric') RETURNING id",
        )
        .bind(metric_external_id)
        .bind(format!("Metric {suffix}"))
        .fetch_one(pool)
        .await
        .unwrap();

        let test_set_id: i64 = sqlx::query_scalar(
            "INSERT INTO sample.test_set (name) VALUES ($1) RETURNING id",
        )
        .bind(format!("Test Set {suffix}"))
        .fetch_one(pool)
        .await
        .unwrap();

        let template_id: i64 = sqlx::query_scalar(
            "INSERT INTO specification.template (name) VALUES ($1) RETURNING id",
        )
        .bind(format!("template-{suffix}"))
        .fetch_one(pool)
        .await
        .unwrap();

        let prompt_id: i64 = sqlx::query_scalar(
            "INSERT INTO specification.prompt (name, build_specification) \
             VALUES ($1, 'build a small castle') RETURNING id",
        )
        .bind(format!("prompt-{suffix}"))
        .fetch_one(pool)
        .await
        .unwrap();

        let mut model_ids = Vec::new();
        let mut sample_ids = Vec::new();
        let mut public_ids = Vec::new();
        let correlation = Uuid::new_v4();
        for label in ["a", "b"] {
            let model_id: i64 = sqlx::query_scalar(
                "INSERT INTO specification.model (name, slug) VALUES ($1, $2) RETURNING id",
            )
            .bind(format!("Model {label} {suffix}"))
            .bind(format!("model-{label}-{suffix}"))
            .fetch_one(pool)
            .await
            .unwrap();
            model_ids.push(model_id);

            let run_id: i64 = sqlx::query_scalar(
                "INSERT INTO specification.run (model_id, prompt_id, template_id) \
                 VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(model_id)
            .bind(prompt_id)
            .bind(template_id)
            .fetch_one(pool)
            .await
            .unwrap();

            let public_id = Uuid::new_v4();
            let sample_id: i64 = sqlx::query_scalar(
                "INSERT INTO sample.sample \
                 (run_id, comparison_correlation_id, comparison_sample_id, approval_state_id, \
                  test_set_id, is_complete, is_pending) \
                 VALUES ($1, $2, $3, \
                         (SELECT id FROM scoring.sample_approval_state WHERE name = 'APPROVED'), \
                         $4, TRUE, FALSE) \
                 RETURNING id",
            )
            .bind(run_id)
            .bind(correlation)
            .bind(public_id)
            .bind(test_set_id)
            .fetch_one(pool)
            .await
            .unwrap();
            sample_ids.push(sample_id);
            public_ids.push(public_id);

            sqlx::query(
                "INSERT INTO sample.artifact (sample_id, artifact_kind_id, bucket, key) \
                 VALUES ($1, \
                         (SELECT id FROM sample.artifact_kind \
                          WHERE name = 'RENDERED_MODEL_GLB_COMPARISON_SAMPLE'), \
                         'bucket', $2)",
            )
            .bind(sample_id)
            .bind(format!("renders/{label}-{suffix}.glb"))
            .execute(pool)
            .await
            .unwrap();
        }

        Seeded {
            metric_id,
            test_set_id,
            model_a: model_ids[0],
            model_b: model_ids[1],
            sample_a: sample_ids[0],
            sample_b: sample_ids[1],
            sample_a_public: public_ids[0],
            sample_b_public: public_ids[1],
            metric_external_id,
        }
    }

    async fn insert_comparison(pool: &PgPool, seeded: &Seeded, winner_first: bool) -> i64 {
        let token_id: i64 = sqlx::query_scalar(
            "INSERT INTO auth.identification_token (token) VALUES ($1) RETURNING id",
        )
        .bind(Uuid::new_v4())
        .fetch_one(pool)
        .await
        .unwrap();

        let comparison_id: i64 = sqlx::query_scalar(
            "INSERT INTO scoring.comparison \
             (identification_token_id, session_id, metric_id, test_set_id) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(token_id)
        .bind(Uuid::new_v4())
        .bind(seeded.metric_id)
        .bind(seeded.test_set_id)
        .fetch_one(pool)
        .await
        .unwrap();

        let (first, second) = if winner_first {
            (seeded.sample_a, seeded.sample_b)
        } else {
            (seeded.sample_b, seeded.sample_a)
        };
        for (sample_id, rank) in [(first, 1), (second, 2)] {
            sqlx::query(
                "INSERT INTO scoring.comparison_rank (comparison_id, sample_id, rank) \
                 VALUES ($1, $2, $3)",
            )
            .bind(comparison_id)
            .bind(sample_id)
            .bind(rank)
            .execute(pool)
            .await
            .unwrap();
        }
        comparison_id
    }

    #[tokio::test]
    #[ignore]
    async fn rating_engine_processes_marks_and_stays_idempotent() {
        let pool = test_pool().await;
        let seeded = seed_comparison_graph(&pool).await;
        let comparison_id = insert_comparison(&pool, &seeded, true).await;

        let engine = RatingEngine::new(pool.clone(), &base_cfg(), TelemetrySink::disabled());
        let gate = MemoryGate::new();

        let summary = engine.run(RatingSystem::Elo, &gate, 300).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 0);

        let board_score_sql = "SELECT elo_score FROM scoring.model_leaderboard \
             WHERE model_id = $1 AND metric_id = $2 AND test_set_id = $3 AND tag_id IS NULL";
        let winner: f64 = sqlx::query_scalar(board_score_sql)
            .bind(seeded.model_a)
            .bind(seeded.metric_id)
            .bind(seeded.test_set_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        let loser: f64 = sqlx::query_scalar(board_score_sql)
            .bind(seeded.model_b)
            .bind(seeded.metric_id)
            .bind(seeded.test_set_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(winner, 1016.0);
        assert_eq!(loser, 984.0);

        let marked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scoring.processed_comparison \
             WHERE comparison_id = $1 AND rating_system = 'elo'",
        )
        .bind(comparison_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(marked, 1);

        // Re-running without new comparisons is a no-op.
        let summary = engine.run(RatingSystem::Elo, &gate, 300).await.unwrap();
        assert_eq!(summary.processed, 0);

        // The Glicko system keeps its own markers.
        let summary = engine.run(RatingSystem::Glicko, &gate, 3600).await.unwrap();
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn vote_recorder_consumes_tokens_exactly_once() {
        let pool = test_pool().await;
        let seeded = seed_comparison_graph(&pool).await;

        let store = Arc::new(MemoryTokenStore::new());
        let gate = Arc::new(MemoryGate::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let cfg = base_cfg();
        let recorder = VoteRecorder::new(
            pool.clone(),
            SampleCatalog::new(pool.clone()),
            store.clone(),
            Arc::new(StaticPermissionService { allow: true }),
            RatingTrigger::new(gate, queue.clone(), &cfg),
            TelemetrySink::disabled(),
        );

        let token = Uuid::new_v4();
        store
            .put(
                token,
                &PairPayload {
                    metric_external_id: seeded.metric_external_id,
                    sample_1: seeded.sample_a_public,
                    sample_2: seeded.sample_b_public,
                },
                3600,
            )
            .await
            .unwrap();

        let token_id: i64 = sqlx::query_scalar(
            "INSERT INTO auth.identification_token (token) VALUES ($1) RETURNING id",
        )
        .bind(Uuid::new_v4())
        .fetch_one(&pool)
        .await
        .unwrap();
        let identity = Identity {
            user_id: None,
            identification_token_id: Some(token_id),
            session_id: Uuid::new_v4(),
        };

        let ranks = [
            RankEntry::Single(seeded.sample_a_public),
            RankEntry::Single(seeded.sample_b_public),
        ];
        let outcome = recorder.record_vote(token, &ranks, &identity).await.unwrap();
        assert!(outcome.sample_1_model.starts_with("Model a"));
        assert!(outcome.sample_2_model.starts_with("Model b"));

        // Both systems were poked through the gate.
        assert_eq!(queue.len(), 2);

        // The token is spent.
        let err = recorder.record_vote(token, &ranks, &identity).await.unwrap_err();
        assert!(matches!(err, ArenaError::TokenUnknownOrExpired));
    }
}
