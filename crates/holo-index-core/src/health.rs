//! Health scoring model for indexed entities.
//!
//! A [`HealthScore`] combines five dimensions with fixed weights:
//!
//! | Dimension | Weight | Signal |
//! |-----------|--------|--------|
//! | structural | 0.25 | size heuristic from line count |
//! | maintenance | 0.20 | churn: `1 / (1 + changes / 10)` |
//! | knowledge | 0.20 | documentation flag + usage frequency |
//! | dependency | 0.20 | fan-in: `fan_in / (fan_in + 10)` |
//! | pattern | 0.15 | EMA of user ratings |
//!
//! Every dimension starts at the neutral value `0.5`. Usage frequency is an
//! exponential moving average over search hits. Unused entities decay
//! toward neutral via [`HealthUpdate::Decay`].
//!
//! All functions here are pure; persistence goes through the coordination
//! store, which applies [`apply_update`] inside a transaction.

use serde::{Deserialize, Serialize};

use crate::error::{HoloError, HoloResult};

pub const NEUTRAL: f64 = 0.5;

/// Dimension weights: structural, maintenance, knowledge, dependency, pattern.
pub const DIMENSION_WEIGHTS: [f64; 5] = [0.25, 0.20, 0.20, 0.20, 0.15];

/// Line count up to which structural fitness is perfect.
const STRUCTURAL_OK_LINES: f64 = 500.0;
/// Lines beyond `STRUCTURAL_OK_LINES` at which structural fitness reaches 0.
const STRUCTURAL_SPAN_LINES: f64 = 1500.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub entity_id: String,
    pub structural: f64,
    pub maintenance: f64,
    pub knowledge: f64,
    pub dependency: f64,
    pub pattern: f64,
    pub overall: f64,
    /// EMA of search hits, in `[0, 1]`.
    pub usage_frequency: f64,
    pub usage_count: u64,
    pub rating_count: u64,
    /// `1.0` when documented, `0.0` when not, neutral until observed.
    pub doc_coverage: f64,
    pub updated_at: i64,
}

impl HealthScore {
    pub fn neutral(entity_id: &str, now: i64) -> Self {
        let mut score = Self {
            entity_id: entity_id.to_string(),
            structural: NEUTRAL,
            maintenance: NEUTRAL,
            knowledge: NEUTRAL,
            dependency: NEUTRAL,
            pattern: NEUTRAL,
            overall: NEUTRAL,
            usage_frequency: 0.0,
            usage_count: 0,
            rating_count: 0,
            doc_coverage: NEUTRAL,
            updated_at: now,
        };
        score.recompute();
        score
    }

    pub fn dimensions(&self) -> [f64; 5] {
        [
            self.structural,
            self.maintenance,
            self.knowledge,
            self.dependency,
            self.pattern,
        ]
    }

    /// Combined centrality + criticality used to pick foundational entities.
    pub fn centrality(&self) -> f64 {
        0.6 * self.dependency + 0.4 * self.usage_frequency
    }

    fn recompute(&mut self) {
        self.knowledge = 0.5 * self.doc_coverage + 0.5 * (0.5 + 0.5 * self.usage_frequency);
        self.overall = weighted_overall(&self.dimensions());
    }

    /// Check every bounded field. Used before any write.
    pub fn validate(&self) -> HoloResult<()> {
        let fields = [
            ("structural", self.structural),
            ("maintenance", self.maintenance),
            ("knowledge", self.knowledge),
            ("dependency", self.dependency),
            ("pattern", self.pattern),
            ("overall", self.overall),
            ("usage_frequency", self.usage_frequency),
            ("doc_coverage", self.doc_coverage),
        ];
        for (name, value) in fields {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(HoloError::corruption(format!(
                    "health score {} for {} out of range: {}",
                    name, self.entity_id, value
                )));
            }
        }
        Ok(())
    }
}

/// Weighted sum of the five dimensions, clamped to `[0, 1]`.
pub fn weighted_overall(dims: &[f64; 5]) -> f64 {
    let sum: f64 = dims
        .iter()
        .zip(DIMENSION_WEIGHTS.iter())
        .map(|(d, w)| d * w)
        .sum();
    sum.clamp(0.0, 1.0)
}

/// Structural facts reported by a re-scan of the entity's source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructuralSignals {
    pub line_count: u32,
    /// Number of recent changes to the source.
    pub change_count: u32,
    /// Number of other entities depending on this one.
    pub fan_in: u32,
    pub documented: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthUpdate {
    /// The entity surfaced in a search.
    Usage,
    /// A user rating in `[0, 1]` attributed to the entity.
    Rating(f64),
    Structure(StructuralSignals),
    /// Time passed without use.
    Decay { elapsed_days: f64 },
}

/// Smoothing parameters for health updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// EMA factor for usage frequency.
    pub usage_alpha: f64,
    /// EMA factor for ratings folded into pattern quality.
    pub rating_alpha: f64,
    /// Days for usage-derived signals to lose half their distance to neutral.
    pub decay_half_life_days: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            usage_alpha: 0.1,
            rating_alpha: 0.2,
            decay_half_life_days: 30.0,
        }
    }
}

/// One EMA step: `alpha * sample + (1 - alpha) * prev`.
pub fn ema(prev: f64, sample: f64, alpha: f64) -> f64 {
    (alpha * sample + (1.0 - alpha) * prev).clamp(0.0, 1.0)
}

/// Apply an update to the previous score (or a neutral one) and return the
/// new score. Rejects out-of-range ratings before computing anything.
pub fn apply_update(
    prev: Option<&HealthScore>,
    entity_id: &str,
    update: &HealthUpdate,
    policy: &HealthPolicy,
    now: i64,
) -> HoloResult<HealthScore> {
    let mut score = match prev {
        Some(p) => p.clone(),
        None => HealthScore::neutral(entity_id, now),
    };

    match *update {
        HealthUpdate::Usage => {
            score.usage_frequency = ema(score.usage_frequency, 1.0, policy.usage_alpha);
            score.usage_count = score.usage_count.saturating_add(1);
        }
        HealthUpdate::Rating(rating) => {
            if !rating.is_finite() || !(0.0..=1.0).contains(&rating) {
                return Err(HoloError::invalid_feedback(format!(
                    "rating must be in [0, 1], got {}",
                    rating
                )));
            }
            score.pattern = ema(score.pattern, rating, policy.rating_alpha);
            score.rating_count = score.rating_count.saturating_add(1);
        }
        HealthUpdate::Structure(signals) => {
            let excess = (signals.line_count as f64 - STRUCTURAL_OK_LINES).max(0.0);
            score.structural = 1.0 - (excess / STRUCTURAL_SPAN_LINES).min(1.0);
            score.maintenance = 1.0 / (1.0 + signals.change_count as f64 / 10.0);
            score.dependency = signals.fan_in as f64 / (signals.fan_in as f64 + 10.0);
            score.doc_coverage = if signals.documented { 1.0 } else { 0.0 };
        }
        HealthUpdate::Decay { elapsed_days } => {
            if elapsed_days.is_finite() && elapsed_days > 0.0 && policy.decay_half_life_days > 0.0 {
                let factor = 0.5f64.powf(elapsed_days / policy.decay_half_life_days);
                score.usage_frequency *= factor;
                score.pattern = NEUTRAL + (score.pattern - NEUTRAL) * factor;
            }
        }
    }

    score.updated_at = now;
    score.recompute();
    score.validate()?;
    Ok(score)
}

/// Entity ids in the top `top_fraction` by [`HealthScore::centrality`].
///
/// Returns `ceil(n * top_fraction)` ids (at least one when `n > 0` and the
/// fraction is positive). Ties are broken by entity id.
pub fn foundational(scores: &[HealthScore], top_fraction: f64) -> Vec<String> {
    if scores.is_empty() || !top_fraction.is_finite() || top_fraction <= 0.0 {
        return Vec::new();
    }
    let fraction = top_fraction.min(1.0);
    let take = ((scores.len() as f64) * fraction).ceil().max(1.0) as usize;

    let mut ranked: Vec<&HealthScore> = scores.iter().collect();
    ranked.sort_by(|a, b| {
        b.centrality()
            .partial_cmp(&a.centrality())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    ranked
        .into_iter()
        .take(take)
        .map(|s| s.entity_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy::default()
    }

    #[test]
    fn test_weights_sum_to_one() {
        let sum: f64 = DIMENSION_WEIGHTS.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_neutral_score() {
        let s = HealthScore::neutral("e", 0);
        assert!((s.overall - 0.5).abs() < 1e-12);
        assert_eq!(s.usage_frequency, 0.0);
        s.validate().unwrap();
    }

    #[test]
    fn test_usage_follows_ema() {
        let mut s = apply_update(None, "e", &HealthUpdate::Usage, &policy(), 1).unwrap();
        assert!((s.usage_frequency - 0.1).abs() < 1e-12);
        s = apply_update(Some(&s), "e", &HealthUpdate::Usage, &policy(), 2).unwrap();
        assert!((s.usage_frequency - 0.19).abs() < 1e-12);
        assert_eq!(s.usage_count, 2);
        assert!(s.knowledge > NEUTRAL);
    }

    #[test]
    fn test_rating_rejects_out_of_range() {
        let err = apply_update(None, "e", &HealthUpdate::Rating(1.5), &policy(), 1).unwrap_err();
        assert!(matches!(err, HoloError::InvalidFeedback { .. }));
        let err =
            apply_update(None, "e", &HealthUpdate::Rating(f64::NAN), &policy(), 1).unwrap_err();
        assert!(matches!(err, HoloError::InvalidFeedback { .. }));
    }

    #[test]
    fn test_rating_moves_pattern() {
        let s = apply_update(None, "e", &HealthUpdate::Rating(1.0), &policy(), 1).unwrap();
        assert!((s.pattern - 0.6).abs() < 1e-12);
        assert_eq!(s.rating_count, 1);
    }

    #[test]
    fn test_structure_signals() {
        let big = StructuralSignals {
            line_count: 2600,
            change_count: 0,
            fan_in: 10,
            documented: true,
        };
        let s = apply_update(None, "e", &HealthUpdate::Structure(big), &policy(), 1).unwrap();
        assert_eq!(s.structural, 0.0);
        assert_eq!(s.maintenance, 1.0);
        assert!((s.dependency - 0.5).abs() < 1e-12);
        assert_eq!(s.doc_coverage, 1.0);

        let small = StructuralSignals {
            line_count: 120,
            change_count: 10,
            fan_in: 0,
            documented: false,
        };
        let s = apply_update(None, "e", &HealthUpdate::Structure(small), &policy(), 1).unwrap();
        assert_eq!(s.structural, 1.0);
        assert!((s.maintenance - 0.5).abs() < 1e-12);
        assert_eq!(s.dependency, 0.0);
    }

    #[test]
    fn test_decay_moves_toward_neutral() {
        let mut s = HealthScore::neutral("e", 0);
        for _ in 0..20 {
            s = apply_update(Some(&s), "e", &HealthUpdate::Rating(1.0), &policy(), 0).unwrap();
            s = apply_update(Some(&s), "e", &HealthUpdate::Usage, &policy(), 0).unwrap();
        }
        let before_pattern = s.pattern;
        let before_usage = s.usage_frequency;
        let decayed = apply_update(
            Some(&s),
            "e",
            &HealthUpdate::Decay { elapsed_days: 30.0 },
            &policy(),
            0,
        )
        .unwrap();
        assert!((decayed.pattern - NEUTRAL) < (before_pattern - NEUTRAL));
        assert!(decayed.pattern > NEUTRAL);
        assert!((decayed.usage_frequency - before_usage / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_foundational_top_fraction() {
        let mut scores = Vec::new();
        for (i, fan_in) in [0u32, 5, 50, 20, 1].iter().enumerate() {
            let signals = StructuralSignals {
                line_count: 100,
                change_count: 0,
                fan_in: *fan_in,
                documented: true,
            };
            scores.push(
                apply_update(
                    None,
                    &format!("e{}", i),
                    &HealthUpdate::Structure(signals),
                    &policy(),
                    0,
                )
                .unwrap(),
            );
        }
        assert_eq!(foundational(&scores, 0.2), vec!["e2".to_string()]);
        assert_eq!(
            foundational(&scores, 0.4),
            vec!["e2".to_string(), "e3".to_string()]
        );
        assert!(foundational(&scores, 0.0).is_empty());
        assert_eq!(foundational(&scores, 5.0).len(), 5);
    }
}
