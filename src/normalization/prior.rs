/// Shape parameters of the Beta prior attached to a game's hero-click rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BetaPrior {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaPrior {
    /// Uninformative midpoint used for games without a published score.
    pub const NEUTRAL: BetaPrior = BetaPrior {
        alpha: 1.0,
        beta: 1.0,
    };
}

/// Map a 0-10 review score to a weak Beta prior.
///
/// The score is clamped to [0, 10] and normalized to [0, 1]; alpha runs from
/// 0.5 (score 0) to 1.5 (score 10) and beta mirrors it, so a score of 5 is the
/// neutral (1.0, 1.0). Both parameters are rounded to two decimals to match
/// the `numeric(5,2)` storage columns.
pub fn convert_score_to_prior(score: Option<f64>) -> BetaPrior {
    let Some(score) = score.filter(|s| !s.is_nan()) else {
        return BetaPrior::NEUTRAL;
    };

    let normalized = score.clamp(0.0, 10.0) / 10.0;
    BetaPrior {
        alpha: round2(0.5 + normalized),
        beta: round2(1.5 - normalized),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
