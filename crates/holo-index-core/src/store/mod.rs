//! Storage abstraction for HoloIndex.
//!
//! Two traits split the persistent state:
//!
//! - [`EntityStore`] holds indexed entities and their embeddings. It is
//!   read-mostly during query serving and written by the indexing feed.
//! - [`CoordinationStore`] owns every piece of coordination state: queries,
//!   routing decisions, component runs, affinity weights, feedback events,
//!   health scores and the breadcrumb trail.
//!
//! Implementations must be `Send + Sync` and must apply every mutating
//! operation atomically: either all rows change or none do.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert_entity`](EntityStore::upsert_entity) | Insert or replace an entity |
//! | [`vector_candidates`](EntityStore::vector_candidates) | Live entities for similarity scoring |
//! | [`keyword_candidates`](EntityStore::keyword_candidates) | Live entities containing any query term |
//! | [`record_routing`](CoordinationStore::record_routing) | Persist an immutable routing decision |
//! | [`apply_feedback`](CoordinationStore::apply_feedback) | One transaction: feedback event + weight updates |
//! | [`update_health`](CoordinationStore::update_health) | Read-modify-write of one health score |
//! | [`append_breadcrumb`](CoordinationStore::append_breadcrumb) | Append to the audit trail |

pub mod memory;

use async_trait::async_trait;

use crate::error::{HoloError, HoloResult};
use crate::health::{HealthPolicy, HealthScore, HealthUpdate};
use crate::index::SearchFilters;
use crate::models::{
    AffinityWeight, BreadcrumbEvent, Component, ComponentRun, EntityKind, FeedbackEvent,
    IndexedEntity, Intent, Query, RoutingDecision,
};

/// Upper bound on a breadcrumb's serialized payload.
pub const MAX_BREADCRUMB_PAYLOAD_BYTES: usize = 16 * 1024;

/// Attempts for an optimistic read-modify-write transaction before giving up.
pub const MAX_TX_ATTEMPTS: usize = 5;

/// A live entity handed to the index for scoring.
#[derive(Debug, Clone)]
pub struct EntityCandidate {
    pub entity_id: String,
    pub kind: EntityKind,
    pub source_path: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub model_version: Option<String>,
}

impl From<&IndexedEntity> for EntityCandidate {
    fn from(e: &IndexedEntity) -> Self {
        Self {
            entity_id: e.id.clone(),
            kind: e.kind,
            source_path: e.source_path.clone(),
            content: e.content.clone(),
            embedding: e.embedding.clone(),
            model_version: e.model_version.clone(),
        }
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or replace an entity (clears a previous soft delete).
    async fn upsert_entity(&self, entity: &IndexedEntity) -> HoloResult<()>;

    /// Soft-delete an entity. Returns `false` if absent or already deleted.
    async fn delete_entity(&self, id: &str) -> HoloResult<bool>;

    /// Fetch an entity, including soft-deleted ones.
    async fn get_entity(&self, id: &str) -> HoloResult<Option<IndexedEntity>>;

    /// Number of live entities.
    async fn count_entities(&self) -> HoloResult<usize>;

    /// All live entities matching `filters`, embedded or not.
    async fn vector_candidates(&self, filters: &SearchFilters) -> HoloResult<Vec<EntityCandidate>>;

    /// Live entities matching `filters` whose path or content contains at
    /// least one of `terms` (lowercase). When more than `limit` match, the
    /// ones matching the most terms are kept.
    async fn keyword_candidates(
        &self,
        terms: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> HoloResult<Vec<EntityCandidate>>;
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn record_query(&self, query: &Query) -> HoloResult<()>;

    async fn get_query(&self, id: &str) -> HoloResult<Option<Query>>;

    /// Persist a routing decision. A second decision for the same query is
    /// rejected: decisions are immutable.
    async fn record_routing(&self, decision: &RoutingDecision) -> HoloResult<()>;

    async fn get_routing(&self, query_id: &str) -> HoloResult<Option<RoutingDecision>>;

    /// Persist component outcomes and surfaced entity ids for a finished query,
    /// in one transaction.
    async fn record_execution(
        &self,
        query_id: &str,
        runs: &[ComponentRun],
        surfaced: &[String],
    ) -> HoloResult<()>;

    async fn component_runs(&self, query_id: &str) -> HoloResult<Vec<ComponentRun>>;

    async fn surfaced_entities(&self, query_id: &str) -> HoloResult<Vec<String>>;

    /// Stored weights for `intent`. Pairs never updated are absent.
    async fn affinity_weights(&self, intent: Intent) -> HoloResult<Vec<AffinityWeight>>;

    async fn all_affinity_weights(&self) -> HoloResult<Vec<AffinityWeight>>;

    /// Insert `event` and add `event.delta` to the weight of each
    /// `(component, intent)` pair, clamped to `[-1, 1]`, in one transaction.
    ///
    /// If any stored weight is out of range the whole transaction is
    /// rejected with [`HoloError::CorruptionDetected`].
    async fn apply_feedback(
        &self,
        event: &FeedbackEvent,
        intent: Intent,
        components: &[Component],
    ) -> HoloResult<Vec<AffinityWeight>>;

    async fn get_health(&self, entity_id: &str) -> HoloResult<Option<HealthScore>>;

    /// Apply `update` to the stored score (or a neutral one) atomically.
    async fn update_health(
        &self,
        entity_id: &str,
        update: &HealthUpdate,
        policy: &HealthPolicy,
    ) -> HoloResult<HealthScore>;

    async fn all_health(&self) -> HoloResult<Vec<HealthScore>>;

    /// Append an event and return its assigned id. Ids increase monotonically.
    async fn append_breadcrumb(&self, event: &BreadcrumbEvent) -> HoloResult<i64>;

    /// The most recent `limit` events (optionally for one query), oldest first.
    async fn breadcrumbs(
        &self,
        query_id: Option<&str>,
        limit: usize,
    ) -> HoloResult<Vec<BreadcrumbEvent>>;

    /// Delete events created before `before`. Returns the number removed.
    async fn prune_breadcrumbs(&self, before: i64) -> HoloResult<u64>;
}

/// Reject payloads larger than [`MAX_BREADCRUMB_PAYLOAD_BYTES`].
pub fn check_breadcrumb(event: &BreadcrumbEvent) -> HoloResult<String> {
    let payload = serde_json::to_string(&event.payload)?;
    if payload.len() > MAX_BREADCRUMB_PAYLOAD_BYTES {
        return Err(HoloError::corruption(format!(
            "breadcrumb payload of {} bytes exceeds limit of {}",
            payload.len(),
            MAX_BREADCRUMB_PAYLOAD_BYTES
        )));
    }
    Ok(payload)
}

/// Reject a stored weight that violates the `[-1, 1]` invariant.
pub fn check_weight(component: Component, intent: Intent, weight: f64) -> HoloResult<()> {
    if AffinityWeight::in_bounds(weight) {
        Ok(())
    } else {
        Err(HoloError::corruption(format!(
            "affinity weight ({}, {}) out of range: {}",
            component, intent, weight
        )))
    }
}

/// Reject a delta that is not finite. The learner bounds it further.
pub fn check_delta(delta: f64) -> HoloResult<()> {
    if delta.is_finite() && delta.abs() <= 1.0 {
        Ok(())
    } else {
        Err(HoloError::invalid_feedback(format!(
            "feedback delta out of range: {}",
            delta
        )))
    }
}
