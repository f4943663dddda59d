//! Query complexity estimate used to pick reasoning-engine tiers.
//!
//! ```text
//! score = 0.4 * min(words / 30, 1)
//!       + 0.3 * min(hits / 50, 1)
//!       + 0.3 * intent_weight
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::Intent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityBand {
    Low,
    Medium,
    High,
    Critical,
}

impl ComplexityBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityBand::Low => "low",
            ComplexityBand::Medium => "medium",
            ComplexityBand::High => "high",
            ComplexityBand::Critical => "critical",
        }
    }
}

impl fmt::Display for ComplexityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bounds of the medium, high and critical bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for ComplexityThresholds {
    fn default() -> Self {
        Self {
            medium: 0.3,
            high: 0.55,
            critical: 0.8,
        }
    }
}

impl ComplexityThresholds {
    pub fn validate(&self) -> Result<(), String> {
        let ordered = 0.0 < self.medium
            && self.medium < self.high
            && self.high < self.critical
            && self.critical <= 1.0;
        if ordered {
            Ok(())
        } else {
            Err(format!(
                "complexity thresholds must satisfy 0 < medium < high < critical <= 1, got {} / {} / {}",
                self.medium, self.high, self.critical
            ))
        }
    }

    pub fn band(&self, score: f64) -> ComplexityBand {
        if score >= self.critical {
            ComplexityBand::Critical
        } else if score >= self.high {
            ComplexityBand::High
        } else if score >= self.medium {
            ComplexityBand::Medium
        } else {
            ComplexityBand::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    pub score: f64,
    pub band: ComplexityBand,
}

fn intent_weight(intent: Intent) -> f64 {
    match intent {
        Intent::Research => 1.0,
        Intent::ModuleHealth => 0.6,
        Intent::General => 0.3,
        Intent::DocLookup | Intent::CodeLocation => 0.2,
    }
}

pub fn estimate(
    text: &str,
    hit_count: usize,
    intent: Intent,
    thresholds: &ComplexityThresholds,
) -> ComplexityEstimate {
    let words = text.split_whitespace().count() as f64;
    let score = 0.4 * (words / 30.0).min(1.0)
        + 0.3 * (hit_count as f64 / 50.0).min(1.0)
        + 0.3 * intent_weight(intent);
    let score = score.clamp(0.0, 1.0);
    ComplexityEstimate {
        score,
        band: thresholds.band(score),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_code_location_is_low() {
        let e = estimate("find the rate limiter", 5, Intent::CodeLocation, &Default::default());
        assert_eq!(e.band, ComplexityBand::Low);
    }

    #[test]
    fn test_long_research_is_critical() {
        let text = "word ".repeat(40);
        let e = estimate(&text, 80, Intent::Research, &Default::default());
        assert!((e.score - 1.0).abs() < 1e-12);
        assert_eq!(e.band, ComplexityBand::Critical);
    }

    #[test]
    fn test_band_boundaries() {
        let t = ComplexityThresholds::default();
        assert_eq!(t.band(0.29), ComplexityBand::Low);
        assert_eq!(t.band(0.3), ComplexityBand::Medium);
        assert_eq!(t.band(0.55), ComplexityBand::High);
        assert_eq!(t.band(0.8), ComplexityBand::Critical);
    }

    #[test]
    fn test_thresholds_validation() {
        assert!(ComplexityThresholds::default().validate().is_ok());
        let bad = ComplexityThresholds {
            medium: 0.6,
            high: 0.5,
            critical: 0.9,
        };
        assert!(bad.validate().is_err());
    }
}
