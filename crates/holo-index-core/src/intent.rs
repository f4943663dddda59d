//! Keyword/phrase intent classifier.
//!
//! Each intent carries a table of weighted signals. A signal is either a
//! single word (matched against whole tokens) or a multi-word phrase
//! (matched as a substring of the normalized text). The intent with the
//! highest total wins; confidence reflects the margin over the runner-up:
//!
//! ```text
//! confidence = 0.5 + 0.5 * (top - runner_up) / top
//! ```
//!
//! No signals at all, or a tie for first place, yields `GENERAL` at `0.5`.

use crate::models::Intent;

/// Result of classifying a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
}

impl Classification {
    fn general() -> Self {
        Self {
            intent: Intent::General,
            confidence: 0.5,
        }
    }
}

struct Signals {
    intent: Intent,
    words: &'static [(&'static str, f64)],
    phrases: &'static [(&'static str, f64)],
}

const SIGNALS: &[Signals] = &[
    Signals {
        intent: Intent::DocLookup,
        words: &[
            ("docs", 2.0),
            ("documentation", 2.0),
            ("doc", 1.5),
            ("readme", 2.0),
            ("wsp", 2.0),
            ("protocol", 1.5),
            ("guide", 1.0),
            ("guideline", 1.0),
            ("spec", 1.0),
            ("explain", 1.0),
            ("roadmap", 1.0),
        ],
        phrases: &[("what does", 1.0), ("how to", 1.0), ("how do i", 1.0)],
    },
    Signals {
        intent: Intent::CodeLocation,
        words: &[
            ("find", 2.0),
            ("where", 1.5),
            ("locate", 2.0),
            ("function", 1.0),
            ("class", 1.0),
            ("method", 1.0),
            ("struct", 1.0),
            ("defined", 1.5),
            ("implementation", 1.0),
            ("implemented", 1.0),
            ("file", 0.5),
        ],
        phrases: &[("where is", 1.0), ("defined in", 1.0), ("source of", 1.0)],
    },
    Signals {
        intent: Intent::ModuleHealth,
        words: &[
            ("health", 2.0),
            ("violation", 2.0),
            ("violations", 2.0),
            ("debt", 1.5),
            ("refactor", 1.5),
            ("size", 1.0),
            ("complexity", 1.0),
            ("quality", 1.0),
            ("coverage", 1.0),
            ("stale", 1.0),
        ],
        phrases: &[("technical debt", 1.0), ("too large", 1.0), ("code smell", 1.0)],
    },
    Signals {
        intent: Intent::Research,
        words: &[
            ("research", 2.0),
            ("analyze", 1.5),
            ("analyse", 1.5),
            ("analysis", 1.5),
            ("compare", 1.5),
            ("architecture", 1.5),
            ("design", 1.0),
            ("why", 1.0),
            ("tradeoffs", 1.0),
            ("investigate", 1.5),
        ],
        phrases: &[
            ("how does", 1.0),
            ("trade-off", 1.0),
            ("deep dive", 1.5),
            ("pros and cons", 1.5),
        ],
    },
];

/// Classify `text` into an intent. Pure and deterministic.
pub fn classify(text: &str) -> Classification {
    let normalized = text.to_lowercase();
    let tokens: Vec<&str> = normalized
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|t| !t.is_empty())
        .collect();

    let mut scored: Vec<(Intent, f64)> = SIGNALS
        .iter()
        .map(|s| (s.intent, score(s, &tokens, &normalized)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (top_intent, top) = scored[0];
    let runner_up = scored.get(1).map(|(_, s)| *s).unwrap_or(0.0);
    if top <= 0.0 || (top - runner_up).abs() < f64::EPSILON {
        return Classification::general();
    }
    Classification {
        intent: top_intent,
        confidence: (0.5 + 0.5 * (top - runner_up) / top).clamp(0.0, 1.0),
    }
}

fn score(signals: &Signals, tokens: &[&str], normalized: &str) -> f64 {
    let words: f64 = signals
        .words
        .iter()
        .filter(|(w, _)| tokens.contains(w))
        .map(|(_, weight)| weight)
        .sum();
    let phrases: f64 = signals
        .phrases
        .iter()
        .filter(|(p, _)| normalized.contains(p))
        .map(|(_, weight)| weight)
        .sum();
    words + phrases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_rate_limiter_is_code_location() {
        let c = classify("find the rate limiter");
        assert_eq!(c.intent, Intent::CodeLocation);
        assert!(c.confidence >= 0.8);
    }

    #[test]
    fn test_doc_lookup() {
        let c = classify("Show me the WSP documentation for module layout");
        assert_eq!(c.intent, Intent::DocLookup);
    }

    #[test]
    fn test_module_health() {
        let c = classify("which modules have size violations?");
        assert_eq!(c.intent, Intent::ModuleHealth);
    }

    #[test]
    fn test_research() {
        let c = classify("analyze the architecture and compare the storage designs");
        assert_eq!(c.intent, Intent::Research);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn test_no_signal_is_general() {
        let c = classify("hello there");
        assert_eq!(c, Classification::general());
        assert_eq!(classify(""), Classification::general());
    }

    #[test]
    fn test_tie_is_general() {
        // "find" (CODE_LOCATION 2.0) vs "docs" (DOC_LOOKUP 2.0)
        let c = classify("find docs");
        assert_eq!(c.intent, Intent::General);
        assert_eq!(c.confidence, 0.5);
    }

    #[test]
    fn test_margin_lowers_confidence() {
        let c = classify("find the health function");
        assert_eq!(c.intent, Intent::CodeLocation);
        assert!(c.confidence > 0.5 && c.confidence < 1.0);
    }

    #[test]
    fn test_deterministic() {
        let text = "where is the rate limiter defined";
        assert_eq!(classify(text), classify(text));
    }
}
