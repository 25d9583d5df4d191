//! Glicko-2 rating arithmetic, following Glickman's published procedure.
//!
//! Ratings are kept on the canonical 1500-centered surface scale here and in
//! the database; the leaderboard projections shift them for display. All
//! computation happens on the internal scale (mu/phi) and converts back at
//! the end.

use anyhow::{Result, bail};

/// System constant constraining volatility change per update.
pub const TAU: f64 = 0.5;
/// Convergence threshold for the volatility iteration.
pub const EPSILON: f64 = 1e-6;
/// Surface-to-internal scale factor.
pub const GLICKO_SCALE: f64 = 173.7178;

pub const INITIAL_RATING: f64 = 1500.0;
pub const INITIAL_DEVIATION: f64 = 350.0;
pub const INITIAL_VOLATILITY: f64 = 0.06;

pub const MIN_DEVIATION: f64 = 30.0;
pub const MAX_DEVIATION: f64 = 350.0;

const MAX_VOLATILITY_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlickoRating {
    pub rating: f64,
    pub deviation: f64,
    pub volatility: f64,
}

impl Default for GlickoRating {
    fn default() -> Self {
        Self {
            rating: INITIAL_RATING,
            deviation: INITIAL_DEVIATION,
            volatility: INITIAL_VOLATILITY,
        }
    }
}

fn g(phi: f64) -> f64 {
    1.0 / (1.0 + 3.0 * phi * phi / (std::f64::consts::PI * std::f64::consts::PI)).sqrt()
}

fn expected(mu: f64, mu_opp: f64, phi_opp: f64) -> f64 {
    1.0 / (1.0 + (-g(phi_opp) * (mu - mu_opp)).exp())
}

/// The function whose root is the new volatility (on the x = ln(sigma^2)
/// axis). `a` is ln(sigma^2) for the pre-update volatility.
fn volatility_f(x: f64, delta: f64, phi: f64, v: f64, a: f64) -> f64 {
    let ex = x.exp();
    let denom = 2.0 * (phi * phi + v + ex) * (phi * phi + v + ex);
    ex * (delta * delta - phi * phi - v - ex) / denom - (x - a) / (TAU * TAU)
}

/// One rating period: updates `rating` against the listed opponents, each
/// with an actual score of 1.0 (win), 0.5 (tie), or 0.0 (loss).
///
/// Fails when the variance degenerates or the volatility iteration does not
/// converge; callers skip the comparison and leave it unmarked for retry.
pub fn update_rating(rating: GlickoRating, opponents: &[(GlickoRating, f64)]) -> Result<GlickoRating> {
    let mu = (rating.rating - INITIAL_RATING) / GLICKO_SCALE;
    let phi = rating.deviation / GLICKO_SCALE;
    let sigma = rating.volatility;

    if opponents.is_empty() {
        // No games: deviation grows, rating and volatility hold.
        let new_phi = (phi * phi + sigma * sigma).sqrt();
        return Ok(GlickoRating {
            rating: rating.rating,
            deviation: (GLICKO_SCALE * new_phi).clamp(MIN_DEVIATION, MAX_DEVIATION),
            volatility: sigma,
        });
    }

    let internal: Vec<(f64, f64, f64)> = opponents
        .iter()
        .map(|(opp, score)| {
            (
                (opp.rating - INITIAL_RATING) / GLICKO_SCALE,
                opp.deviation / GLICKO_SCALE,
                *score,
            )
        })
        .collect();

    // Estimated variance of the rating from game outcomes alone.
    let mut v_inv = 0.0;
    for &(mu_opp, phi_opp, _) in &internal {
        let e = expected(mu, mu_opp, phi_opp);
        v_inv += g(phi_opp) * g(phi_opp) * e * (1.0 - e);
    }
    if v_inv == 0.0 {
        bail!("glicko variance is degenerate (all expected scores saturated)");
    }
    let v = 1.0 / v_inv;

    // Estimated rating improvement.
    let outcome_sum: f64 = internal
        .iter()
        .map(|&(mu_opp, phi_opp, score)| g(phi_opp) * (score - expected(mu, mu_opp, phi_opp)))
        .sum();
    let delta = v * outcome_sum;

    // New volatility via the Illinois-style root finder.
    let a = (sigma * sigma).ln();
    let mut big_a = a;
    let mut big_b = if delta * delta > phi * phi + v {
        (delta * delta - phi * phi - v).ln()
    } else {
        let mut k = 1.0;
        while volatility_f(a - k * TAU, delta, phi, v, a) < 0.0 {
            k += 1.0;
            if k > MAX_VOLATILITY_ITERATIONS as f64 {
                bail!("glicko volatility bracket search did not terminate");
            }
        }
        a - k * TAU
    };

    let mut f_a = volatility_f(big_a, delta, phi, v, a);
    let mut f_b = volatility_f(big_b, delta, phi, v, a);
    let mut iterations = 0;
    while (big_b - big_a).abs() > EPSILON {
        iterations += 1;
        if iterations > MAX_VOLATILITY_ITERATIONS {
            bail!("glicko volatility iteration did not converge");
        }
        let big_c = big_a + (big_a - big_b) * f_a / (f_b - f_a);
        let f_c = volatility_f(big_c, delta, phi, v, a);
        if f_c * f_b <= 0.0 {
            big_a = big_b;
            f_a = f_b;
        } else {
            f_a /= 2.0;
        }
        big_b = big_c;
        f_b = f_c;
    }
    let sigma_prime = (big_a / 2.0).exp();

    // New deviation and rating.
    let phi_star = (phi * phi + sigma_prime * sigma_prime).sqrt();
    let phi_prime = 1.0 / (1.0 / (phi_star * phi_star) + 1.0 / v).sqrt();
    let mu_prime = mu + phi_prime * phi_prime * outcome_sum;

    Ok(GlickoRating {
        rating: GLICKO_SCALE * mu_prime + INITIAL_RATING,
        deviation: (GLICKO_SCALE * phi_prime).clamp(MIN_DEVIATION, MAX_DEVIATION),
        volatility: sigma_prime,
    })
}
