//! In-memory implementation of both store traits, for tests and embedding.
//!
//! Entities live behind one `RwLock`, all coordination state behind another.
//! Every mutating coordination operation takes the write lock for its whole
//! validate-then-apply sequence, which makes it atomic with respect to
//! concurrent callers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{HoloError, HoloResult};
use crate::feedback::apply_delta;
use crate::health::{apply_update, HealthPolicy, HealthScore, HealthUpdate};
use crate::index::{term_coverage, SearchFilters};
use crate::models::{
    now_ts, AffinityWeight, BreadcrumbEvent, Component, ComponentRun, FeedbackEvent,
    IndexedEntity, Intent, Query, RoutingDecision,
};

use super::{
    check_breadcrumb, check_delta, check_weight, CoordinationStore, EntityCandidate, EntityStore,
};

#[derive(Default)]
struct Coordination {
    queries: HashMap<String, Query>,
    routing: HashMap<String, RoutingDecision>,
    runs: HashMap<String, Vec<ComponentRun>>,
    surfaced: HashMap<String, Vec<String>>,
    weights: BTreeMap<(Intent, Component), AffinityWeight>,
    feedback: Vec<FeedbackEvent>,
    health: BTreeMap<String, HealthScore>,
    breadcrumbs: Vec<BreadcrumbEvent>,
    next_breadcrumb_id: i64,
}

/// In-memory store for tests and single-process use.
pub struct InMemoryStore {
    entities: RwLock<HashMap<String, IndexedEntity>>,
    coord: RwLock<Coordination>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            coord: RwLock::new(Coordination {
                next_breadcrumb_id: 1,
                ..Coordination::default()
            }),
        }
    }

    fn entities_read(&self) -> HoloResult<RwLockReadGuard<'_, HashMap<String, IndexedEntity>>> {
        self.entities.read().map_err(|_| poisoned())
    }

    fn entities_write(&self) -> HoloResult<RwLockWriteGuard<'_, HashMap<String, IndexedEntity>>> {
        self.entities.write().map_err(|_| poisoned())
    }

    fn coord_read(&self) -> HoloResult<RwLockReadGuard<'_, Coordination>> {
        self.coord.read().map_err(|_| poisoned())
    }

    fn coord_write(&self) -> HoloResult<RwLockWriteGuard<'_, Coordination>> {
        self.coord.write().map_err(|_| poisoned())
    }

    /// Overwrite a weight without any validation.
    #[cfg(test)]
    pub(crate) fn force_weight(&self, component: Component, intent: Intent, weight: f64) {
        let mut coord = self.coord.write().unwrap();
        let mut w = AffinityWeight::neutral(component, intent);
        w.weight = weight;
        coord.weights.insert((intent, component), w);
    }

    /// Number of stored feedback events.
    pub fn feedback_count(&self) -> usize {
        self.coord.read().map(|c| c.feedback.len()).unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> HoloError {
    HoloError::storage("in-memory store lock poisoned")
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn upsert_entity(&self, entity: &IndexedEntity) -> HoloResult<()> {
        let mut stored = entity.clone();
        stored.deleted = false;
        self.entities_write()?.insert(entity.id.clone(), stored);
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> HoloResult<bool> {
        let mut entities = self.entities_write()?;
        match entities.get_mut(id) {
            Some(e) if !e.deleted => {
                e.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_entity(&self, id: &str) -> HoloResult<Option<IndexedEntity>> {
        Ok(self.entities_read()?.get(id).cloned())
    }

    async fn count_entities(&self) -> HoloResult<usize> {
        Ok(self.entities_read()?.values().filter(|e| !e.deleted).count())
    }

    async fn vector_candidates(&self, filters: &SearchFilters) -> HoloResult<Vec<EntityCandidate>> {
        let entities = self.entities_read()?;
        Ok(entities
            .values()
            .filter(|e| !e.deleted && filters.matches(e.kind, &e.source_path))
            .map(EntityCandidate::from)
            .collect())
    }

    async fn keyword_candidates(
        &self,
        terms: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> HoloResult<Vec<EntityCandidate>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let entities = self.entities_read()?;
        let mut matched: Vec<(f64, EntityCandidate)> = entities
            .values()
            .filter(|e| !e.deleted && filters.matches(e.kind, &e.source_path))
            .filter_map(|e| {
                let coverage = term_coverage(terms, &e.source_path, &e.content);
                (coverage > 0.0).then(|| (coverage, EntityCandidate::from(e)))
            })
            .collect();
        matched.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.entity_id.cmp(&b.1.entity_id))
        });
        matched.truncate(limit);
        Ok(matched.into_iter().map(|(_, c)| c).collect())
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn record_query(&self, query: &Query) -> HoloResult<()> {
        self.coord_write()?
            .queries
            .insert(query.id.clone(), query.clone());
        Ok(())
    }

    async fn get_query(&self, id: &str) -> HoloResult<Option<Query>> {
        Ok(self.coord_read()?.queries.get(id).cloned())
    }

    async fn record_routing(&self, decision: &RoutingDecision) -> HoloResult<()> {
        let mut coord = self.coord_write()?;
        if coord.routing.contains_key(&decision.query_id) {
            return Err(HoloError::storage(format!(
                "routing decision for {} already recorded",
                decision.query_id
            )));
        }
        coord
            .routing
            .insert(decision.query_id.clone(), decision.clone());
        Ok(())
    }

    async fn get_routing(&self, query_id: &str) -> HoloResult<Option<RoutingDecision>> {
        Ok(self.coord_read()?.routing.get(query_id).cloned())
    }

    async fn record_execution(
        &self,
        query_id: &str,
        runs: &[ComponentRun],
        surfaced: &[String],
    ) -> HoloResult<()> {
        let mut coord = self.coord_write()?;
        coord.runs.insert(query_id.to_string(), runs.to_vec());
        coord
            .surfaced
            .insert(query_id.to_string(), surfaced.to_vec());
        Ok(())
    }

    async fn component_runs(&self, query_id: &str) -> HoloResult<Vec<ComponentRun>> {
        Ok(self
            .coord_read()?
            .runs
            .get(query_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn surfaced_entities(&self, query_id: &str) -> HoloResult<Vec<String>> {
        Ok(self
            .coord_read()?
            .surfaced
            .get(query_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn affinity_weights(&self, intent: Intent) -> HoloResult<Vec<AffinityWeight>> {
        let coord = self.coord_read()?;
        Ok(coord
            .weights
            .values()
            .filter(|w| w.intent == intent)
            .cloned()
            .collect())
    }

    async fn all_affinity_weights(&self) -> HoloResult<Vec<AffinityWeight>> {
        Ok(self.coord_read()?.weights.values().cloned().collect())
    }

    async fn apply_feedback(
        &self,
        event: &FeedbackEvent,
        intent: Intent,
        components: &[Component],
    ) -> HoloResult<Vec<AffinityWeight>> {
        check_delta(event.delta)?;
        let mut coord = self.coord_write()?;
        if !coord.queries.contains_key(&event.query_id) {
            return Err(HoloError::invalid_feedback(format!(
                "unknown query {}",
                event.query_id
            )));
        }

        // Validate everything before touching state.
        let mut updated = Vec::with_capacity(components.len());
        for &component in components {
            let current = coord
                .weights
                .get(&(intent, component))
                .cloned()
                .unwrap_or_else(|| AffinityWeight::neutral(component, intent));
            check_weight(component, intent, current.weight)?;
            updated.push(AffinityWeight {
                weight: apply_delta(current.weight, event.delta),
                update_count: current.update_count + 1,
                updated_at: event.created_at,
                ..current
            });
        }

        coord.feedback.push(event.clone());
        for w in &updated {
            coord.weights.insert((w.intent, w.component), w.clone());
        }
        Ok(updated)
    }

    async fn get_health(&self, entity_id: &str) -> HoloResult<Option<HealthScore>> {
        Ok(self.coord_read()?.health.get(entity_id).cloned())
    }

    async fn update_health(
        &self,
        entity_id: &str,
        update: &HealthUpdate,
        policy: &HealthPolicy,
    ) -> HoloResult<HealthScore> {
        let mut coord = self.coord_write()?;
        let prev = coord.health.get(entity_id);
        if let Some(p) = prev {
            p.validate()?;
        }
        let next = apply_update(prev, entity_id, update, policy, now_ts())?;
        coord.health.insert(entity_id.to_string(), next.clone());
        Ok(next)
    }

    async fn all_health(&self) -> HoloResult<Vec<HealthScore>> {
        Ok(self.coord_read()?.health.values().cloned().collect())
    }

    async fn append_breadcrumb(&self, event: &BreadcrumbEvent) -> HoloResult<i64> {
        check_breadcrumb(event)?;
        let mut coord = self.coord_write()?;
        let id = coord.next_breadcrumb_id;
        coord.next_breadcrumb_id += 1;
        let mut stored = event.clone();
        stored.id = id;
        coord.breadcrumbs.push(stored);
        Ok(id)
    }

    async fn breadcrumbs(
        &self,
        query_id: Option<&str>,
        limit: usize,
    ) -> HoloResult<Vec<BreadcrumbEvent>> {
        let coord = self.coord_read()?;
        let matching: Vec<&BreadcrumbEvent> = coord
            .breadcrumbs
            .iter()
            .filter(|b| match query_id {
                Some(q) => b.query_id.as_deref() == Some(q),
                None => true,
            })
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    async fn prune_breadcrumbs(&self, before: i64) -> HoloResult<u64> {
        let mut coord = self.coord_write()?;
        let len = coord.breadcrumbs.len();
        coord.breadcrumbs.retain(|b| b.created_at >= before);
        Ok((len - coord.breadcrumbs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BreadcrumbKind, EntityKind, FeedbackRatings};
    use serde_json::json;

    fn ratings() -> FeedbackRatings {
        FeedbackRatings {
            relevance: 0.9,
            noise_level: 0.1,
            completeness: 0.8,
            efficiency: 0.9,
        }
    }

    fn event(query_id: &str, delta: f64) -> FeedbackEvent {
        FeedbackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            query_id: query_id.to_string(),
            ratings: ratings(),
            delta,
            created_at: now_ts(),
        }
    }

    async fn store_with_query() -> (InMemoryStore, Query) {
        let store = InMemoryStore::new();
        let q = Query::new("find the rate limiter", Intent::CodeLocation, 1.0);
        store.record_query(&q).await.unwrap();
        (store, q)
    }

    #[tokio::test]
    async fn test_soft_delete_hides_entity() {
        let store = InMemoryStore::new();
        let e = IndexedEntity::new("a", EntityKind::CodeSymbol, "src/a.rs", "fn a()");
        store.upsert_entity(&e).await.unwrap();
        assert_eq!(store.count_entities().await.unwrap(), 1);
        assert!(store.delete_entity("a").await.unwrap());
        assert!(!store.delete_entity("a").await.unwrap());
        assert_eq!(store.count_entities().await.unwrap(), 0);
        assert!(store
            .vector_candidates(&SearchFilters::default())
            .await
            .unwrap()
            .is_empty());
        assert!(store.get_entity("a").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_keyword_candidates_match_path_or_content() {
        let store = InMemoryStore::new();
        store
            .upsert_entity(&IndexedEntity::new(
                "a",
                EntityKind::CodeSymbol,
                "src/limiter.rs",
                "struct Gate",
            ))
            .await
            .unwrap();
        store
            .upsert_entity(&IndexedEntity::new(
                "b",
                EntityKind::DocSection,
                "docs/intro.md",
                "Nothing relevant",
            ))
            .await
            .unwrap();
        let found = store
            .keyword_candidates(&["limiter".to_string()], &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, "a");
    }

    #[tokio::test]
    async fn test_routing_is_immutable() {
        let (store, q) = store_with_query().await;
        let decision = RoutingDecision {
            query_id: q.id.clone(),
            intent: q.intent,
            confidence: q.confidence,
            components: vec![Component::VectorSearch],
            affinity: vec![(Component::VectorSearch, 0.0)],
            created_at: now_ts(),
        };
        store.record_routing(&decision).await.unwrap();
        assert!(store.record_routing(&decision).await.is_err());
        assert_eq!(store.get_routing(&q.id).await.unwrap(), Some(decision));
    }

    #[tokio::test]
    async fn test_apply_feedback_updates_only_listed_components() {
        let (store, q) = store_with_query().await;
        let updated = store
            .apply_feedback(&event(&q.id, 0.2), Intent::CodeLocation, &[Component::VectorSearch])
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert!((updated[0].weight - 0.2).abs() < 1e-12);
        let all = store.all_affinity_weights().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].component, Component::VectorSearch);
        assert_eq!(store.feedback_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_feedback_unknown_query() {
        let store = InMemoryStore::new();
        let err = store
            .apply_feedback(&event("nope", 0.1), Intent::General, &[Component::VectorSearch])
            .await
            .unwrap_err();
        assert!(matches!(err, HoloError::InvalidFeedback { .. }));
        assert_eq!(store.feedback_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_weight_rejects_whole_transaction() {
        let (store, q) = store_with_query().await;
        store.force_weight(Component::DocSearch, Intent::CodeLocation, 3.0);
        let err = store
            .apply_feedback(
                &event(&q.id, 0.1),
                Intent::CodeLocation,
                &[Component::VectorSearch, Component::DocSearch],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HoloError::CorruptionDetected { .. }));
        assert_eq!(store.feedback_count(), 0);
        let weights = store.affinity_weights(Intent::CodeLocation).await.unwrap();
        assert!(weights
            .iter()
            .all(|w| w.component != Component::VectorSearch));
    }

    #[tokio::test]
    async fn test_weights_stay_clamped() {
        let (store, q) = store_with_query().await;
        for _ in 0..10 {
            store
                .apply_feedback(&event(&q.id, 0.25), Intent::CodeLocation, &[Component::VectorSearch])
                .await
                .unwrap();
        }
        let w = store.affinity_weights(Intent::CodeLocation).await.unwrap();
        assert_eq!(w[0].weight, 1.0);
        assert_eq!(w[0].update_count, 10);
    }

    #[tokio::test]
    async fn test_breadcrumb_ids_monotonic_and_limit() {
        let store = InMemoryStore::new();
        let mut last = 0;
        for i in 0..5 {
            let ev = BreadcrumbEvent::new(Some("q"), BreadcrumbKind::Routed, "t", json!({"i": i}));
            let id = store.append_breadcrumb(&ev).await.unwrap();
            assert!(id > last);
            last = id;
        }
        let recent = store.breadcrumbs(Some("q"), 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload["i"], 3);
        assert_eq!(recent[1].payload["i"], 4);
        assert!(store.breadcrumbs(Some("other"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_breadcrumb_payload_limit() {
        let store = InMemoryStore::new();
        let big = "x".repeat(super::super::MAX_BREADCRUMB_PAYLOAD_BYTES + 1);
        let ev = BreadcrumbEvent::new(None, BreadcrumbKind::Done, "t", json!(big));
        assert!(store.append_breadcrumb(&ev).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_breadcrumbs() {
        let store = InMemoryStore::new();
        let mut old = BreadcrumbEvent::new(None, BreadcrumbKind::Done, "t", json!({}));
        old.created_at = 10;
        store.append_breadcrumb(&old).await.unwrap();
        let fresh = BreadcrumbEvent::new(None, BreadcrumbKind::Done, "t", json!({}));
        store.append_breadcrumb(&fresh).await.unwrap();
        assert_eq!(store.prune_breadcrumbs(100).await.unwrap(), 1);
        assert_eq!(store.breadcrumbs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_health_persists() {
        let store = InMemoryStore::new();
        let policy = HealthPolicy::default();
        store
            .update_health("e", &HealthUpdate::Usage, &policy)
            .await
            .unwrap();
        let s = store
            .update_health("e", &HealthUpdate::Usage, &policy)
            .await
            .unwrap();
        assert_eq!(s.usage_count, 2);
        assert_eq!(store.get_health("e").await.unwrap(), Some(s));
        assert!(store
            .update_health("e", &HealthUpdate::Rating(2.0), &policy)
            .await
            .is_err());
        assert_eq!(store.get_health("e").await.unwrap().unwrap().rating_count, 0);
    }
}
