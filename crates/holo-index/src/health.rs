//! Health scoring over the Coordination Store.
//!
//! Every observation is one atomic read-modify-write of a single score; the
//! store retries on version conflicts. Scores start neutral on first
//! observation.

use std::sync::Arc;

use holo_index_core::health::{foundational, HealthScore, HealthUpdate, StructuralSignals};
use holo_index_core::models::now_ts;
use holo_index_core::store::CoordinationStore;
use holo_index_core::HoloResult;

use crate::config::HealthConfig;

const SECONDS_PER_DAY: f64 = 86_400.0;

pub struct HealthScorer {
    store: Arc<dyn CoordinationStore>,
    config: HealthConfig,
}

impl HealthScorer {
    pub fn new(store: Arc<dyn CoordinationStore>, config: HealthConfig) -> Self {
        Self { store, config }
    }

    pub fn alert_threshold(&self) -> f64 {
        self.config.alert_threshold
    }

    async fn apply(&self, entity_id: &str, update: HealthUpdate) -> HoloResult<HealthScore> {
        self.store
            .update_health(entity_id, &update, &self.config.policy())
            .await
    }

    /// The entity surfaced in a search result.
    pub async fn observe_usage(&self, entity_id: &str) -> HoloResult<HealthScore> {
        self.apply(entity_id, HealthUpdate::Usage).await
    }

    /// A rating in `[0, 1]` attributed to the entity.
    pub async fn observe_rating(&self, entity_id: &str, rating: f64) -> HoloResult<HealthScore> {
        self.apply(entity_id, HealthUpdate::Rating(rating)).await
    }

    pub async fn observe_structure(
        &self,
        entity_id: &str,
        signals: StructuralSignals,
    ) -> HoloResult<HealthScore> {
        self.apply(entity_id, HealthUpdate::Structure(signals)).await
    }

    /// Stored score, or a neutral one for an entity never observed.
    pub async fn get_score(&self, entity_id: &str) -> HoloResult<HealthScore> {
        Ok(self
            .store
            .get_health(entity_id)
            .await?
            .unwrap_or_else(|| HealthScore::neutral(entity_id, now_ts())))
    }

    /// Ids in the top `top_fraction` by centrality (configured fraction when `None`).
    pub async fn foundational_entities(&self, top_fraction: Option<f64>) -> HoloResult<Vec<String>> {
        let scores = self.store.all_health().await?;
        Ok(foundational(
            &scores,
            top_fraction.unwrap_or(self.config.foundational_fraction),
        ))
    }

    /// Decay every score by the time elapsed since its last update.
    /// Returns the number of scores touched.
    pub async fn decay_all(&self, now: i64) -> HoloResult<usize> {
        let scores = self.store.all_health().await?;
        let mut touched = 0;
        for score in scores {
            let elapsed_days = (now - score.updated_at) as f64 / SECONDS_PER_DAY;
            if elapsed_days <= 0.0 {
                continue;
            }
            self.apply(&score.entity_id, HealthUpdate::Decay { elapsed_days })
                .await?;
            touched += 1;
        }
        tracing::info!(touched, "health decay applied");
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_index_core::store::memory::InMemoryStore;

    fn scorer() -> HealthScorer {
        HealthScorer::new(Arc::new(InMemoryStore::new()), HealthConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_entity_is_neutral() {
        let s = scorer();
        let score = s.get_score("nobody").await.unwrap();
        assert!((score.overall - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_usage_raises_frequency() {
        let s = scorer();
        let a = s.observe_usage("e1").await.unwrap();
        let b = s.observe_usage("e1").await.unwrap();
        assert!(b.usage_frequency > a.usage_frequency);
        assert_eq!(b.usage_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_rating_rejected() {
        let s = scorer();
        assert!(s.observe_rating("e1", 1.5).await.is_err());
        assert!(s.observe_rating("e1", f64::NAN).await.is_err());
    }

    #[tokio::test]
    async fn test_foundational_prefers_high_fan_in() {
        let s = scorer();
        for (id, fan_in) in [("core", 50), ("leaf", 0), ("mid", 5)] {
            s.observe_structure(
                id,
                StructuralSignals {
                    line_count: 100,
                    change_count: 1,
                    fan_in,
                    documented: true,
                },
            )
            .await
            .unwrap();
        }
        let top = s.foundational_entities(Some(0.34)).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], "core");
    }

    #[tokio::test]
    async fn test_decay_lowers_usage() {
        let s = scorer();
        let before = s.observe_usage("e1").await.unwrap();
        let touched = s.decay_all(before.updated_at + 30 * 86_400).await.unwrap();
        assert_eq!(touched, 1);
        let after = s.get_score("e1").await.unwrap();
        assert!(after.usage_frequency < before.usage_frequency);
    }
}
