//! Store-backed component routing.
//!
//! Reads the current affinity weights for the query's intent on every call,
//! so a committed feedback transaction is visible to the very next routing
//! decision. If the store cannot be reached the last weights seen for that
//! intent are used instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use holo_index_core::models::{AffinityWeight, Intent};
use holo_index_core::router::{route, RoutingPlan, RoutingPolicy};
use holo_index_core::store::CoordinationStore;
use holo_index_core::HoloResult;

pub struct Router {
    store: Arc<dyn CoordinationStore>,
    policy: RoutingPolicy,
    cache: RwLock<HashMap<Intent, Vec<AffinityWeight>>>,
}

impl Router {
    pub fn new(store: Arc<dyn CoordinationStore>, policy: RoutingPolicy) -> Self {
        Self {
            store,
            policy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Weights for `intent`, with out-of-range values dropped (read as neutral).
    pub async fn weights(&self, intent: Intent) -> HoloResult<Vec<AffinityWeight>> {
        match self.store.affinity_weights(intent).await {
            Ok(weights) => {
                let weights = sanitize(weights);
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(intent, weights.clone());
                }
                Ok(weights)
            }
            Err(e) if e.is_unavailable() => {
                let cached = self
                    .cache
                    .read()
                    .ok()
                    .and_then(|c| c.get(&intent).cloned())
                    .unwrap_or_default();
                tracing::warn!(
                    error = %e,
                    intent = %intent,
                    cached = cached.len(),
                    "store unreachable, routing with last known weights"
                );
                Ok(cached)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn plan(&self, intent: Intent, confidence: f64) -> HoloResult<RoutingPlan> {
        let weights = self.weights(intent).await?;
        let plan = route(intent, confidence, &weights, &self.policy);
        tracing::debug!(
            intent = %intent,
            confidence,
            components = ?plan.components,
            widened = plan.widened,
            "routed"
        );
        Ok(plan)
    }
}

fn sanitize(weights: Vec<AffinityWeight>) -> Vec<AffinityWeight> {
    weights
        .into_iter()
        .filter(|w| {
            let ok = AffinityWeight::in_bounds(w.weight);
            if !ok {
                tracing::error!(
                    component = %w.component,
                    intent = %w.intent,
                    weight = w.weight,
                    "stored affinity weight out of range, treating as neutral"
                );
            }
            ok
        })
        .collect()
}
