//! Feedback math: rating validation, weighted delta, bounded weight update.
//!
//! Each rating dimension is mapped to a signal in `[-1, 1]` with
//! `signal = 2 * score - 1` (noise is inverted first). The weighted signal
//! is scaled by the learning rate and clamped to `±max_delta`:
//!
//! ```text
//! delta = clamp(lr * Σ fraction_d * signal_d, -max_delta, max_delta)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{HoloError, HoloResult};
use crate::models::{AffinityWeight, FeedbackRatings};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackPolicy {
    pub relevance_fraction: f64,
    pub noise_fraction: f64,
    pub completeness_fraction: f64,
    pub efficiency_fraction: f64,
    pub learning_rate: f64,
    pub max_delta: f64,
}

impl Default for FeedbackPolicy {
    fn default() -> Self {
        Self {
            relevance_fraction: 0.4,
            noise_fraction: 0.2,
            completeness_fraction: 0.25,
            efficiency_fraction: 0.15,
            learning_rate: 0.25,
            max_delta: 0.25,
        }
    }
}

impl FeedbackPolicy {
    pub fn fractions(&self) -> [f64; 4] {
        [
            self.relevance_fraction,
            self.noise_fraction,
            self.completeness_fraction,
            self.efficiency_fraction,
        ]
    }

    /// Fractions must be non-negative and sum to 1; rates must be in `(0, 1]`.
    pub fn validate(&self) -> Result<(), String> {
        let fractions = self.fractions();
        if fractions.iter().any(|f| !f.is_finite() || *f < 0.0) {
            return Err("feedback fractions must be non-negative".to_string());
        }
        let sum: f64 = fractions.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("feedback fractions must sum to 1.0, got {:.4}", sum));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err("feedback.learning_rate must be in (0, 1]".to_string());
        }
        if !(self.max_delta > 0.0 && self.max_delta <= 1.0) {
            return Err("feedback.max_delta must be in (0, 1]".to_string());
        }
        Ok(())
    }
}

/// Reject non-finite or out-of-range dimensions before anything is mutated.
pub fn validate_ratings(r: &FeedbackRatings) -> HoloResult<()> {
    let dims = [
        ("relevance", r.relevance),
        ("noise_level", r.noise_level),
        ("completeness", r.completeness),
        ("efficiency", r.efficiency),
    ];
    for (name, value) in dims {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(HoloError::invalid_feedback(format!(
                "{} must be in [0, 1], got {}",
                name, value
            )));
        }
    }
    Ok(())
}

/// Weighted, clamped delta for a set of (already validated) ratings.
pub fn compute_delta(r: &FeedbackRatings, policy: &FeedbackPolicy) -> f64 {
    let signals = [
        2.0 * r.relevance - 1.0,
        2.0 * (1.0 - r.noise_level) - 1.0,
        2.0 * r.completeness - 1.0,
        2.0 * r.efficiency - 1.0,
    ];
    let weighted: f64 = signals
        .iter()
        .zip(policy.fractions().iter())
        .map(|(s, f)| s * f)
        .sum();
    (policy.learning_rate * weighted).clamp(-policy.max_delta, policy.max_delta)
}

/// New weight after applying `delta`, clamped to `[-1, 1]`.
pub fn apply_delta(weight: f64, delta: f64) -> f64 {
    (weight + delta).clamp(AffinityWeight::MIN, AffinityWeight::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratings(relevance: f64, noise: f64, completeness: f64, efficiency: f64) -> FeedbackRatings {
        FeedbackRatings {
            relevance,
            noise_level: noise,
            completeness,
            efficiency,
        }
    }

    #[test]
    fn test_default_policy_valid() {
        FeedbackPolicy::default().validate().unwrap();
    }

    #[test]
    fn test_policy_rejects_bad_fractions() {
        let p = FeedbackPolicy {
            relevance_fraction: 0.9,
            ..FeedbackPolicy::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_positive_feedback_delta() {
        let d = compute_delta(&ratings(0.9, 0.1, 0.8, 0.9), &FeedbackPolicy::default());
        // 0.4*0.8 + 0.2*0.8 + 0.25*0.6 + 0.15*0.8 = 0.75, scaled by 0.25
        assert!((d - 0.1875).abs() < 1e-12);
    }

    #[test]
    fn test_negative_feedback_delta() {
        let d = compute_delta(&ratings(0.0, 1.0, 0.0, 0.0), &FeedbackPolicy::default());
        assert!((d + 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_neutral_feedback_is_zero() {
        let d = compute_delta(&ratings(0.5, 0.5, 0.5, 0.5), &FeedbackPolicy::default());
        assert!(d.abs() < 1e-12);
    }

    #[test]
    fn test_delta_clamped_to_max() {
        let p = FeedbackPolicy {
            learning_rate: 1.0,
            max_delta: 0.1,
            ..FeedbackPolicy::default()
        };
        assert!((compute_delta(&ratings(1.0, 0.0, 1.0, 1.0), &p) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_validate_ratings() {
        assert!(validate_ratings(&ratings(0.0, 1.0, 0.5, 0.5)).is_ok());
        assert!(validate_ratings(&ratings(1.1, 0.0, 0.5, 0.5)).is_err());
        assert!(validate_ratings(&ratings(0.5, -0.1, 0.5, 0.5)).is_err());
        assert!(validate_ratings(&ratings(0.5, 0.5, f64::NAN, 0.5)).is_err());
    }

    #[test]
    fn test_apply_delta_clamps() {
        assert_eq!(apply_delta(0.95, 0.25), 1.0);
        assert_eq!(apply_delta(-0.95, -0.25), -1.0);
        assert!((apply_delta(0.1, 0.2) - 0.3).abs() < 1e-12);
    }
}
