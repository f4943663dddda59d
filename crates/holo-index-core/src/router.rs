//! Component routing: which components run for a classified query, and in
//! which order.
//!
//! Eligibility is static per intent. Learned affinity weights then prune
//! components the feedback loop has turned against and order the rest
//! (weight descending, static priority ascending on ties). Low-confidence
//! classifications are hedged by adding the `GENERAL` set.

use serde::{Deserialize, Serialize};

use crate::models::{AffinityWeight, Component, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Below this classification confidence the plan is widened. The
    /// classifier never reports less than 0.5 for a non-`GENERAL` intent, so
    /// only values above 0.5 affect classified queries.
    pub low_confidence_threshold: f64,
    /// Components whose weight falls below this are dropped.
    pub prune_threshold: f64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.6,
            prune_threshold: -0.5,
        }
    }
}

/// Ordered components plus the weight consulted for each.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPlan {
    pub components: Vec<Component>,
    pub affinity: Vec<(Component, f64)>,
    /// True when the low-confidence hedge added components.
    pub widened: bool,
}

impl RoutingPlan {
    pub fn contains(&self, component: Component) -> bool {
        self.components.contains(&component)
    }
}

/// Components statically eligible for `intent`.
pub fn eligible(intent: Intent) -> &'static [Component] {
    match intent {
        Intent::DocLookup => &[
            Component::DocSearch,
            Component::WspGuidance,
            Component::VectorSearch,
        ],
        Intent::CodeLocation => &[Component::VectorSearch, Component::HealthAnalysis],
        Intent::ModuleHealth => &[
            Component::HealthAnalysis,
            Component::VectorSearch,
            Component::FastReasoner,
        ],
        Intent::Research => &Component::ALL,
        Intent::General => &[
            Component::VectorSearch,
            Component::DocSearch,
            Component::FastReasoner,
        ],
    }
}

/// Build a routing plan. `weights` are the stored weights for `intent`;
/// missing pairs count as neutral.
pub fn route(
    intent: Intent,
    confidence: f64,
    weights: &[AffinityWeight],
    policy: &RoutingPolicy,
) -> RoutingPlan {
    let mut candidates: Vec<Component> = eligible(intent).to_vec();
    let mut widened = false;
    if confidence < policy.low_confidence_threshold && intent != Intent::General {
        for &c in eligible(Intent::General) {
            if !candidates.contains(&c) {
                candidates.push(c);
                widened = true;
            }
        }
    }
    if intent != Intent::Research {
        candidates.retain(|c| *c != Component::DeepReasoner);
    }

    let weight_of = |c: Component| {
        weights
            .iter()
            .find(|w| w.component == c && w.intent == intent && w.weight.is_finite())
            .map(|w| w.weight)
            .unwrap_or(AffinityWeight::NEUTRAL)
    };

    let mut scored: Vec<(Component, f64)> = candidates
        .into_iter()
        .map(|c| (c, weight_of(c)))
        .filter(|(c, w)| *c == Component::VectorSearch || *w >= policy.prune_threshold)
        .collect();

    if !scored.iter().any(|(c, _)| *c == Component::VectorSearch) {
        scored.push((Component::VectorSearch, weight_of(Component::VectorSearch)));
    }

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.static_priority().cmp(&b.0.static_priority()))
    });

    RoutingPlan {
        components: scored.iter().map(|(c, _)| *c).collect(),
        affinity: scored,
        widened,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(component: Component, intent: Intent, w: f64) -> AffinityWeight {
        AffinityWeight {
            weight: w,
            ..AffinityWeight::neutral(component, intent)
        }
    }

    #[test]
    fn test_neutral_weights_use_static_priority() {
        let plan = route(Intent::DocLookup, 0.9, &[], &RoutingPolicy::default());
        assert_eq!(
            plan.components,
            vec![
                Component::VectorSearch,
                Component::DocSearch,
                Component::WspGuidance
            ]
        );
        assert!(!plan.widened);
    }

    #[test]
    fn test_code_location_never_deep() {
        let plan = route(Intent::CodeLocation, 1.0, &[], &RoutingPolicy::default());
        assert!(plan.contains(Component::VectorSearch));
        assert!(!plan.contains(Component::DeepReasoner));
    }

    #[test]
    fn test_research_includes_deep() {
        let plan = route(Intent::Research, 0.9, &[], &RoutingPolicy::default());
        assert_eq!(plan.components.len(), 6);
        assert!(plan.contains(Component::DeepReasoner));
    }

    #[test]
    fn test_weights_reorder() {
        let weights = vec![weight(Component::WspGuidance, Intent::DocLookup, 0.6)];
        let plan = route(Intent::DocLookup, 0.9, &weights, &RoutingPolicy::default());
        assert_eq!(plan.components[0], Component::WspGuidance);
        assert_eq!(plan.affinity[0], (Component::WspGuidance, 0.6));
    }

    #[test]
    fn test_weights_for_other_intents_ignored() {
        let weights = vec![weight(Component::WspGuidance, Intent::General, 0.9)];
        let plan = route(Intent::DocLookup, 0.9, &weights, &RoutingPolicy::default());
        assert_eq!(plan.components[0], Component::VectorSearch);
    }

    #[test]
    fn test_prune_keeps_vector_search() {
        let weights = vec![
            weight(Component::VectorSearch, Intent::CodeLocation, -1.0),
            weight(Component::HealthAnalysis, Intent::CodeLocation, -0.9),
        ];
        let plan = route(Intent::CodeLocation, 0.9, &weights, &RoutingPolicy::default());
        assert_eq!(plan.components, vec![Component::VectorSearch]);
    }

    #[test]
    fn test_low_confidence_widens() {
        let plan = route(Intent::CodeLocation, 0.3, &[], &RoutingPolicy::default());
        assert!(plan.widened);
        assert!(plan.contains(Component::DocSearch));
        assert!(plan.contains(Component::FastReasoner));
        assert!(!plan.contains(Component::DeepReasoner));
    }

    #[test]
    fn test_default_policy_widens_narrow_classifier_margin() {
        let class = crate::intent::classify("find the docs file guide");
        assert_eq!(class.intent, Intent::DocLookup);
        assert!(class.confidence > 0.5);

        let plan = route(class.intent, class.confidence, &[], &RoutingPolicy::default());
        assert!(plan.widened);
        assert!(plan.contains(Component::FastReasoner));

        let sure = crate::intent::classify("explain the protocol docs");
        let plan = route(sure.intent, sure.confidence, &[], &RoutingPolicy::default());
        assert!(!plan.widened);
    }
}
