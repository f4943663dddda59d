//! Feedback learning.
//!
//! A rating of a past query becomes one bounded delta, applied in a single
//! store transaction to the affinity weight of every component that fired
//! for the query's intent. Components that were routed but skipped are not
//! touched.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use holo_index_core::feedback::{compute_delta, validate_ratings, FeedbackPolicy};
use holo_index_core::models::{
    now_ts, AffinityWeight, BreadcrumbKind, Component, FeedbackEvent, FeedbackRatings, Intent,
};
use holo_index_core::store::CoordinationStore;
use holo_index_core::{HoloError, HoloResult};

use crate::breadcrumbs::BreadcrumbTrail;
use crate::health::HealthScorer;

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackOutcome {
    pub event: FeedbackEvent,
    pub intent: Intent,
    /// Weights after the update, one per participating component.
    pub weights: Vec<AffinityWeight>,
    /// Surfaced entities that received the relevance rating.
    pub rated_entities: usize,
}

pub struct FeedbackLearner {
    store: Arc<dyn CoordinationStore>,
    trail: Arc<BreadcrumbTrail>,
    health: Arc<HealthScorer>,
    policy: FeedbackPolicy,
}

impl FeedbackLearner {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        trail: Arc<BreadcrumbTrail>,
        health: Arc<HealthScorer>,
        policy: FeedbackPolicy,
    ) -> Self {
        Self {
            store,
            trail,
            health,
            policy,
        }
    }

    pub async fn record_feedback(
        &self,
        query_id: &str,
        ratings: FeedbackRatings,
    ) -> HoloResult<FeedbackOutcome> {
        validate_ratings(&ratings)?;
        let query = self
            .store
            .get_query(query_id)
            .await?
            .ok_or_else(|| HoloError::invalid_feedback(format!("unknown query {}", query_id)))?;

        let delta = compute_delta(&ratings, &self.policy);
        let mut components: Vec<Component> = self
            .store
            .component_runs(query_id)
            .await?
            .into_iter()
            .filter(|r| r.status.participated())
            .map(|r| r.component)
            .collect();
        components.sort();
        components.dedup();

        let event = FeedbackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            query_id: query_id.to_string(),
            ratings,
            delta,
            created_at: now_ts(),
        };

        let weights = match self
            .store
            .apply_feedback(&event, query.intent, &components)
            .await
        {
            Ok(w) => w,
            Err(e @ HoloError::CorruptionDetected { .. }) => {
                tracing::error!(query_id, error = %e, "feedback rejected, weights unchanged");
                let payload = json!({
                    "operation": "apply_feedback",
                    "feedback_id": event.id,
                    "details": e.to_string(),
                });
                if let Err(trail_err) = self
                    .trail
                    .append(Some(query_id), BreadcrumbKind::Corruption, payload)
                    .await
                {
                    tracing::warn!(error = %trail_err, "could not record corruption breadcrumb");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let payload = json!({
            "feedback_id": event.id,
            "intent": query.intent,
            "delta": delta,
            "components": components,
        });
        if let Err(e) = self
            .trail
            .append(Some(query_id), BreadcrumbKind::Feedback, payload)
            .await
        {
            tracing::warn!(error = %e, "feedback committed but breadcrumb was not recorded");
        }

        let mut rated_entities = 0;
        for entity_id in self.store.surfaced_entities(query_id).await? {
            match self.health.observe_rating(&entity_id, ratings.relevance).await {
                Ok(_) => rated_entities += 1,
                Err(e) => tracing::warn!(entity_id, error = %e, "rating not applied to health"),
            }
        }

        tracing::info!(
            query_id,
            intent = %query.intent,
            delta,
            components = components.len(),
            "feedback applied"
        );

        Ok(FeedbackOutcome {
            event,
            intent: query.intent,
            weights,
            rated_entities,
        })
    }
}
