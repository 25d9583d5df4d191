//! Elo rating arithmetic.
//!
//! Updates are computed as a single delta applied with opposite signs to the
//! two subjects, so a win's rating transfer is exactly symmetric.

pub const K_FACTOR: f64 = 32.0;

pub const INITIAL_RATING: f64 = 1000.0;

/// Expected score of `rating` against `opponent`.
pub fn expected_score(rating: f64, opponent: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - rating) / 400.0))
}

/// Rating transfer for the first subject given its actual score
/// (1.0 win, 0.5 tie, 0.0 loss). The second subject receives the negation.
pub fn rating_delta(rating: f64, opponent: f64, score: f64) -> f64 {
    K_FACTOR * (score - expected_score(rating, opponent))
}

/// Applies one pairwise result and returns the two updated ratings.
pub fn update_pair(rating_a: f64, rating_b: f64, score_a: f64) -> (f64, f64) {
    let delta = rating_delta(rating_a, rating_b, score_a);
    (rating_a + delta, rating_b - delta)
}
