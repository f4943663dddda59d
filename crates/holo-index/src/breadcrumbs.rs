//! Breadcrumb trail and the per-query state machine.
//!
//! Every state change of a query is appended to the Coordination Store as a
//! [`BreadcrumbEvent`], in causal order. When the store is unreachable the
//! event waits in a bounded in-memory backlog; the backlog is flushed, oldest
//! first, ahead of the next append that reaches the store. A full backlog
//! rejects the append with [`HoloError::StoreUnavailable`].

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use holo_index_core::models::{BreadcrumbEvent, BreadcrumbKind};
use holo_index_core::store::{check_breadcrumb, CoordinationStore};
use holo_index_core::{HoloError, HoloResult};

/// Lifecycle of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Classified,
    Routed,
    Executing,
    Composed,
    Done,
    Failed,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Classified => "classified",
            QueryState::Routed => "routed",
            QueryState::Executing => "executing",
            QueryState::Composed => "composed",
            QueryState::Done => "done",
            QueryState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Done | QueryState::Failed)
    }

    /// Forward steps only; any non-terminal state may fail.
    pub fn can_transition(&self, to: QueryState) -> bool {
        use QueryState::*;
        match (self, to) {
            (Classified, Routed) | (Routed, Executing) | (Executing, Composed) | (Composed, Done) => {
                true
            }
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    fn breadcrumb_kind(&self) -> BreadcrumbKind {
        match self {
            QueryState::Classified => BreadcrumbKind::Classified,
            QueryState::Routed => BreadcrumbKind::Routed,
            QueryState::Executing => BreadcrumbKind::Executing,
            QueryState::Composed => BreadcrumbKind::Composed,
            QueryState::Done => BreadcrumbKind::Done,
            QueryState::Failed => BreadcrumbKind::Failed,
        }
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Appends breadcrumbs, buffering them while the store is down.
pub struct BreadcrumbTrail {
    store: Arc<dyn CoordinationStore>,
    agent_id: String,
    capacity: usize,
    backlog: Mutex<VecDeque<BreadcrumbEvent>>,
}

impl BreadcrumbTrail {
    pub fn new(store: Arc<dyn CoordinationStore>, agent_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
            capacity: capacity.max(1),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Events waiting for the store.
    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    /// Append an event. Returns the stored id, or `None` when the event was
    /// queued in the backlog instead.
    pub async fn append(
        &self,
        query_id: Option<&str>,
        kind: BreadcrumbKind,
        payload: Value,
    ) -> HoloResult<Option<i64>> {
        let event = BreadcrumbEvent::new(query_id, kind, &self.agent_id, payload);
        check_breadcrumb(&event)?;

        let mut backlog = self.backlog.lock().await;
        while let Some(pending) = backlog.front() {
            match self.store.append_breadcrumb(pending).await {
                Ok(_) => {
                    backlog.pop_front();
                }
                Err(e) if e.is_unavailable() => return self.enqueue(&mut backlog, event, e),
                Err(e) => {
                    tracing::error!(error = %e, kind = pending.kind.as_str(), "dropping backlogged breadcrumb");
                    backlog.pop_front();
                }
            }
        }

        match self.store.append_breadcrumb(&event).await {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.is_unavailable() => self.enqueue(&mut backlog, event, e),
            Err(e) => Err(e),
        }
    }

    fn enqueue(
        &self,
        backlog: &mut VecDeque<BreadcrumbEvent>,
        event: BreadcrumbEvent,
        cause: HoloError,
    ) -> HoloResult<Option<i64>> {
        if backlog.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "breadcrumb backlog full");
            return Err(HoloError::unavailable(format!(
                "breadcrumb backlog full ({} events): {}",
                self.capacity, cause
            )));
        }
        tracing::warn!(kind = event.kind.as_str(), backlog = backlog.len() + 1, "store unreachable, breadcrumb queued");
        backlog.push_back(event);
        Ok(None)
    }
}

/// One query's position in its lifecycle, recording each step on the trail.
pub struct QueryTracker<'a> {
    trail: &'a BreadcrumbTrail,
    query_id: String,
    state: QueryState,
}

impl<'a> QueryTracker<'a> {
    /// A tracker in `Classified` that has not recorded anything yet.
    pub fn new(trail: &'a BreadcrumbTrail, query_id: &str) -> Self {
        Self {
            trail,
            query_id: query_id.to_string(),
            state: QueryState::Classified,
        }
    }

    /// Start in `Classified` and record it.
    pub async fn start(
        trail: &'a BreadcrumbTrail,
        query_id: &str,
        payload: Value,
    ) -> HoloResult<QueryTracker<'a>> {
        let tracker = Self::new(trail, query_id);
        tracker.record(QueryState::Classified, payload).await?;
        Ok(tracker)
    }

    /// Record the initial `Classified` state.
    pub async fn record_classified(&self, payload: Value) -> HoloResult<()> {
        self.record(QueryState::Classified, payload).await
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub async fn advance(&mut self, to: QueryState, payload: Value) -> HoloResult<()> {
        if !self.state.can_transition(to) {
            return Err(HoloError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(query_id = %self.query_id, from = %self.state, to = %to, "query transition");
        self.state = to;
        self.record(to, payload).await
    }

    /// Record an event that does not change state (e.g. an escalation).
    pub async fn note(&self, kind: BreadcrumbKind, payload: Value) -> HoloResult<()> {
        self.trail
            .append(Some(&self.query_id), kind, payload)
            .await
            .map(|_| ())
    }

    async fn record(&self, state: QueryState, payload: Value) -> HoloResult<()> {
        self.note(state.breadcrumb_kind(), payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use holo_index_core::health::{HealthPolicy, HealthScore, HealthUpdate};
    use holo_index_core::models::*;
    use holo_index_core::store::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates breadcrumb calls to an in-memory store unless switched off.
    struct Flaky {
        inner: InMemoryStore,
        down: AtomicBool,
    }

    impl Flaky {
        fn check(&self) -> HoloResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(HoloError::unavailable("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CoordinationStore for Flaky {
        async fn record_query(&self, q: &Query) -> HoloResult<()> {
            self.inner.record_query(q).await
        }
        async fn get_query(&self, id: &str) -> HoloResult<Option<Query>> {
            self.inner.get_query(id).await
        }
        async fn record_routing(&self, d: &RoutingDecision) -> HoloResult<()> {
            self.inner.record_routing(d).await
        }
        async fn get_routing(&self, id: &str) -> HoloResult<Option<RoutingDecision>> {
            self.inner.get_routing(id).await
        }
        async fn record_execution(&self, id: &str, r: &[ComponentRun], s: &[String]) -> HoloResult<()> {
            self.inner.record_execution(id, r, s).await
        }
        async fn component_runs(&self, id: &str) -> HoloResult<Vec<ComponentRun>> {
            self.inner.component_runs(id).await
        }
        async fn surfaced_entities(&self, id: &str) -> HoloResult<Vec<String>> {
            self.inner.surfaced_entities(id).await
        }
        async fn affinity_weights(&self, i: Intent) -> HoloResult<Vec<AffinityWeight>> {
            self.inner.affinity_weights(i).await
        }
        async fn all_affinity_weights(&self) -> HoloResult<Vec<AffinityWeight>> {
            self.inner.all_affinity_weights().await
        }
        async fn apply_feedback(
            &self,
            e: &FeedbackEvent,
            i: Intent,
            c: &[Component],
        ) -> HoloResult<Vec<AffinityWeight>> {
            self.inner.apply_feedback(e, i, c).await
        }
        async fn get_health(&self, id: &str) -> HoloResult<Option<HealthScore>> {
            self.inner.get_health(id).await
        }
        async fn update_health(
            &self,
            id: &str,
            u: &HealthUpdate,
            p: &HealthPolicy,
        ) -> HoloResult<HealthScore> {
            self.inner.update_health(id, u, p).await
        }
        async fn all_health(&self) -> HoloResult<Vec<HealthScore>> {
            self.inner.all_health().await
        }
        async fn append_breadcrumb(&self, e: &BreadcrumbEvent) -> HoloResult<i64> {
            self.check()?;
            self.inner.append_breadcrumb(e).await
        }
        async fn breadcrumbs(&self, q: Option<&str>, limit: usize) -> HoloResult<Vec<BreadcrumbEvent>> {
            self.inner.breadcrumbs(q, limit).await
        }
        async fn prune_breadcrumbs(&self, before: i64) -> HoloResult<u64> {
            self.inner.prune_breadcrumbs(before).await
        }
    }

    fn flaky() -> Arc<Flaky> {
        Arc::new(Flaky {
            inner: InMemoryStore::new(),
            down: AtomicBool::new(false),
        })
    }

    #[test]
    fn test_legal_transitions() {
        use QueryState::*;
        assert!(Classified.can_transition(Routed));
        assert!(Composed.can_transition(Done));
        assert!(Executing.can_transition(Failed));
        assert!(!Classified.can_transition(Executing));
        assert!(!Done.can_transition(Failed));
        assert!(!Failed.can_transition(Routed));
    }

    #[tokio::test]
    async fn test_tracker_rejects_skipping_states() {
        let store = flaky();
        let trail = BreadcrumbTrail::new(store.clone(), "test", 4);
        let mut t = QueryTracker::start(&trail, "q1", json!({})).await.unwrap();
        let err = t.advance(QueryState::Composed, json!({})).await.unwrap_err();
        assert!(matches!(err, HoloError::InvalidTransition { .. }));
        assert_eq!(t.state(), QueryState::Classified);
    }

    #[tokio::test]
    async fn test_tracker_records_in_causal_order() {
        let store = flaky();
        let trail = BreadcrumbTrail::new(store.clone(), "test", 4);
        let mut t = QueryTracker::start(&trail, "q1", json!({})).await.unwrap();
        for s in [QueryState::Routed, QueryState::Executing, QueryState::Composed, QueryState::Done] {
            t.advance(s, json!({})).await.unwrap();
        }
        let kinds: Vec<_> = store
            .breadcrumbs(Some("q1"), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                BreadcrumbKind::Classified,
                BreadcrumbKind::Routed,
                BreadcrumbKind::Executing,
                BreadcrumbKind::Composed,
                BreadcrumbKind::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_backlog_flushes_in_order() {
        let store = flaky();
        let trail = BreadcrumbTrail::new(store.clone(), "test", 4);
        store.down.store(true, Ordering::SeqCst);
        assert_eq!(trail.append(None, BreadcrumbKind::Feedback, json!({"n": 1})).await.unwrap(), None);
        assert_eq!(trail.append(None, BreadcrumbKind::Feedback, json!({"n": 2})).await.unwrap(), None);
        assert_eq!(trail.backlog_len().await, 2);

        store.down.store(false, Ordering::SeqCst);
        assert!(trail.append(None, BreadcrumbKind::Feedback, json!({"n": 3})).await.unwrap().is_some());
        assert_eq!(trail.backlog_len().await, 0);

        let ns: Vec<i64> = store
            .breadcrumbs(None, 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_full_backlog_rejects() {
        let store = flaky();
        let trail = BreadcrumbTrail::new(store.clone(), "test", 2);
        store.down.store(true, Ordering::SeqCst);
        trail.append(None, BreadcrumbKind::Feedback, json!({})).await.unwrap();
        trail.append(None, BreadcrumbKind::Feedback, json!({})).await.unwrap();
        let err = trail.append(None, BreadcrumbKind::Feedback, json!({})).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(trail.backlog_len().await, 2);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let store = flaky();
        let trail = BreadcrumbTrail::new(store.clone(), "test", 2);
        let big = "x".repeat(20 * 1024);
        let err = trail
            .append(None, BreadcrumbKind::Feedback, json!({ "blob": big }))
            .await
            .unwrap_err();
        assert!(matches!(err, HoloError::CorruptionDetected { .. }));
    }
}
