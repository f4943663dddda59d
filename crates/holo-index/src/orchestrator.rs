//! Query execution.
//!
//! A query moves through `CLASSIFIED → ROUTED → EXECUTING → COMPOSED → DONE`
//! (or `FAILED`), with a breadcrumb for each step. Execution has two phases:
//!
//! 1. **Retrieval**: the routed retrieval components run concurrently as
//!    tokio tasks, each under its own timeout. If the query could not be
//!    embedded they use the lexical fallback.
//! 2. **Analysis**: health analysis of the retrieved entities runs alongside
//!    the reasoning engines. Which engines run depends on the complexity band:
//!
//! | Band | Engines |
//! |------|---------|
//! | low | fast |
//! | medium | fast, then deep if fast is unsure or unavailable |
//! | high | fast and deep concurrently |
//! | critical | as high, plus the arbiter |
//!
//! Every timeout drops the in-flight call and is reported as `timed_out`
//! without affecting its siblings. The query deadline bounds both phases;
//! whatever finished before it is composed and the output is marked partial.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;

use holo_index_core::complexity::{estimate, ComplexityBand, ComplexityEstimate};
use holo_index_core::compose::{compose, Alert, ComponentResult, ComposedOutput, Severity, Verbosity};
use holo_index_core::embedding::Embedder;
use holo_index_core::engine::{build_prompt, rules_based_inference, Inference, ReasoningEngine};
use holo_index_core::index::{rank_hits, SearchFilters, SearchHit, SearchOutcome, VectorIndex};
use holo_index_core::intent::classify;
use holo_index_core::models::{
    now_ts, BreadcrumbKind, Component, ComponentRun, ComponentStatus, EntityKind, Query,
    RoutingDecision,
};
use holo_index_core::router::{route, RoutingPlan};
use holo_index_core::store::{CoordinationStore, EntityStore};
use holo_index_core::{HoloError, HoloResult};

use crate::breadcrumbs::{BreadcrumbTrail, QueryState, QueryTracker};
use crate::config::Config;
use crate::embedding::{embed_one, RetryPolicy};
use crate::engines::Engines;
use crate::health::HealthScorer;
use crate::router::Router;

/// Everything a caller gets back for one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub output: ComposedOutput,
    pub complexity: ComplexityEstimate,
    pub runs: Vec<ComponentRun>,
    /// `Done`, or `Failed` when the outcome could not be persisted.
    pub state: QueryState,
    pub elapsed_ms: u64,
}

pub struct Orchestrator {
    pub(crate) index: Arc<VectorIndex<dyn EntityStore>>,
    pub(crate) coord: Arc<dyn CoordinationStore>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) engines: Engines,
    pub(crate) router: Router,
    pub(crate) health: Arc<HealthScorer>,
    pub(crate) trail: Arc<BreadcrumbTrail>,
    pub(crate) config: Config,
}

/// How one engine call ended.
enum EngineRun {
    Answered(Inference),
    Unavailable(String),
    TimedOut(u64),
    NotInvoked,
}

struct EngineOutcome {
    run: EngineRun,
    elapsed_ms: u64,
}

impl EngineOutcome {
    fn not_invoked() -> Self {
        Self {
            run: EngineRun::NotInvoked,
            elapsed_ms: 0,
        }
    }

    fn confidence(&self) -> Option<f64> {
        match &self.run {
            EngineRun::Answered(inf) => Some(inf.confidence),
            _ => None,
        }
    }
}

/// A query result never depends on its breadcrumbs being stored.
fn tolerate(result: HoloResult<()>) {
    match result {
        Ok(()) => {}
        Err(e @ HoloError::InvalidTransition { .. }) => {
            tracing::error!(error = %e, "illegal query transition");
        }
        Err(e) => tracing::warn!(error = %e, "breadcrumb not recorded"),
    }
}

fn remaining(budget: Duration, deadline: Instant) -> Duration {
    budget.min(deadline.saturating_duration_since(Instant::now()))
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

impl Orchestrator {
    fn filters_for(&self, component: Component) -> SearchFilters {
        match component {
            Component::DocSearch => SearchFilters::kind(EntityKind::DocSection),
            Component::WspGuidance => SearchFilters::kind(EntityKind::DocSection)
                .with_prefix(self.config.retrieval.guidance_prefix.clone()),
            _ => SearchFilters::default(),
        }
    }

    /// Classify, route, execute and compose one query.
    pub async fn run(&self, text: &str, verbosity: Verbosity) -> HoloResult<QueryResponse> {
        let started = Instant::now();
        let orch = &self.config.orchestration;
        let deadline = started + Duration::from_millis(orch.query_deadline_ms);

        let class = classify(text);
        let query = Query::new(text, class.intent, class.confidence);
        if let Err(e) = self.coord.record_query(&query).await {
            tracing::warn!(error = %e, "query not persisted; feedback for it will be rejected");
        }

        let mut tracker = QueryTracker::new(&self.trail, &query.id);
        tolerate(
            tracker
                .record_classified(json!({
                    "intent": query.intent,
                    "confidence": query.confidence,
                }))
                .await,
        );

        let plan = match self.router.plan(query.intent, query.confidence).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "affinity weights unreadable, routing on static priority");
                route(query.intent, query.confidence, &[], &self.config.routing)
            }
        };
        let decision = RoutingDecision {
            query_id: query.id.clone(),
            intent: query.intent,
            confidence: query.confidence,
            components: plan.components.clone(),
            affinity: plan.affinity.clone(),
            created_at: now_ts(),
        };
        if let Err(e) = self.coord.record_routing(&decision).await {
            tracing::warn!(error = %e, "routing decision not persisted");
        }
        tolerate(
            tracker
                .advance(
                    QueryState::Routed,
                    json!({ "components": plan.components, "widened": plan.widened }),
                )
                .await,
        );
        tolerate(
            tracker
                .advance(
                    QueryState::Executing,
                    json!({ "deadline_ms": orch.query_deadline_ms }),
                )
                .await,
        );

        let vector = self.embed_query(&query.text, deadline).await;
        let mut results = self.retrieve(&query, &plan, &vector, deadline).await;

        let hits = merged_hits(&results, self.config.retrieval.top_k);
        let complexity = estimate(&query.text, hits.len(), query.intent, &orch.complexity);
        tracing::debug!(score = complexity.score, band = %complexity.band, "complexity estimated");

        let (health_result, engine_results) = tokio::join!(
            self.analyze_health(&plan, &hits, deadline),
            self.reason(&query, &plan, &hits, complexity.band, deadline, &tracker),
        );
        results.extend(health_result);
        results.extend(engine_results);

        let order: HashMap<Component, usize> = plan
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i))
            .collect();
        results.sort_by_key(|r| order.get(&r.component).copied().unwrap_or(usize::MAX));

        let output = compose(
            query.intent,
            query.confidence,
            &results,
            verbosity,
            &orch.limits(),
        );
        tolerate(
            tracker
                .advance(
                    QueryState::Composed,
                    json!({
                        "sections": output.sections.len(),
                        "degraded": output.degraded,
                        "partial": output.partial,
                    }),
                )
                .await,
        );

        let runs: Vec<ComponentRun> = results
            .iter()
            .map(|r| ComponentRun {
                query_id: query.id.clone(),
                component: r.component,
                status: r.status,
                elapsed_ms: r.elapsed_ms,
            })
            .collect();
        let surfaced = output.surfaced_entities();

        let state = match self.coord.record_execution(&query.id, &runs, &surfaced).await {
            Ok(()) => {
                for entity_id in &surfaced {
                    if let Err(e) = self.health.observe_usage(entity_id).await {
                        tracing::warn!(entity_id = %entity_id, error = %e, "usage not recorded");
                    }
                }
                tolerate(
                    tracker
                        .advance(QueryState::Done, json!({ "surfaced": surfaced.len() }))
                        .await,
                );
                QueryState::Done
            }
            Err(e) => {
                tracing::error!(query_id = %query.id, error = %e, "query outcome not persisted");
                tolerate(
                    tracker
                        .advance(QueryState::Failed, json!({ "error": e.to_string() }))
                        .await,
                );
                QueryState::Failed
            }
        };

        let elapsed_ms = millis(started.elapsed());
        tracing::info!(
            query_id = %query.id,
            intent = %query.intent,
            band = %complexity.band,
            degraded = output.degraded,
            partial = output.partial,
            elapsed_ms,
            "query served"
        );

        Ok(QueryResponse {
            query_id: query.id,
            output,
            complexity,
            runs,
            state,
            elapsed_ms,
        })
    }

    /// Embed the query text, or explain why the lexical path must be used.
    async fn embed_query(&self, text: &str, deadline: Instant) -> Result<Arc<Vec<f32>>, String> {
        if self.embedder.dims() == 0 {
            return Err("no embedding provider configured".to_string());
        }
        let policy = RetryPolicy::query(&self.config.embedding);
        match tokio::time::timeout_at(deadline, embed_one(self.embedder.as_ref(), text, policy)).await {
            Ok(Ok(vector)) => Ok(Arc::new(vector)),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "query embedding failed, using lexical search");
                Err(format!("embedding unavailable: {}", e))
            }
            Err(_) => {
                tracing::warn!("query deadline reached while embedding");
                Err("query deadline reached while embedding".to_string())
            }
        }
    }

    async fn retrieve(
        &self,
        query: &Query,
        plan: &RoutingPlan,
        vector: &Result<Arc<Vec<f32>>, String>,
        deadline: Instant,
    ) -> Vec<ComponentResult> {
        let budget = remaining(
            Duration::from_millis(self.config.orchestration.component_timeout_ms),
            deadline,
        );
        let top_k = self.config.retrieval.top_k;
        let components: Vec<Component> = plan
            .components
            .iter()
            .copied()
            .filter(|c| c.is_retrieval())
            .collect();

        let mut set = JoinSet::new();
        for &component in &components {
            let index = Arc::clone(&self.index);
            let filters = self.filters_for(component);
            let text = query.text.clone();
            let vector = vector.clone();
            set.spawn(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(
                    budget,
                    search_component(&index, &text, &vector, top_k, &filters),
                )
                .await;
                let mut result = match outcome {
                    Ok(Ok((outcome, fallback))) => {
                        let status = if outcome.degraded {
                            ComponentStatus::Degraded
                        } else {
                            ComponentStatus::Completed
                        };
                        let mut r = ComponentResult::new(component, status);
                        r.hits = outcome.hits;
                        r.detail = fallback;
                        r
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(component = %component, error = %e, "retrieval failed");
                        ComponentResult::new(component, ComponentStatus::Failed)
                            .with_detail(e.to_string())
                    }
                    Err(_) => {
                        tracing::warn!(component = %component, budget_ms = millis(budget), "retrieval timed out");
                        ComponentResult::new(component, ComponentStatus::TimedOut)
                            .with_detail(format!("budget {}ms", millis(budget)))
                    }
                };
                result.elapsed_ms = millis(started.elapsed());
                result
            });
        }

        let mut results = Vec::with_capacity(components.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => tracing::error!(error = %e, "retrieval task did not complete"),
            }
        }
        for c in components {
            if !results.iter().any(|r| r.component == c) {
                results.push(
                    ComponentResult::new(c, ComponentStatus::Failed).with_detail("task aborted"),
                );
            }
        }
        results
    }

    async fn analyze_health(
        &self,
        plan: &RoutingPlan,
        hits: &[SearchHit],
        deadline: Instant,
    ) -> Option<ComponentResult> {
        if !plan.contains(Component::HealthAnalysis) {
            return None;
        }
        let budget = remaining(
            Duration::from_millis(self.config.orchestration.component_timeout_ms),
            deadline,
        );
        let threshold = self.health.alert_threshold();
        let started = Instant::now();

        let work = async {
            let mut insights = Vec::new();
            let mut alerts = Vec::new();
            for hit in hits {
                let score = self.health.get_score(&hit.entity_id).await?;
                insights.push(format!(
                    "{}: health {:.2} (structural {:.2}, maintenance {:.2}, usage {:.2})",
                    hit.source_path,
                    score.overall,
                    score.structural,
                    score.maintenance,
                    score.usage_frequency
                ));
                if score.overall < threshold {
                    alerts.push(Alert {
                        severity: if score.overall < threshold / 2.0 {
                            Severity::Critical
                        } else {
                            Severity::Warning
                        },
                        message: format!("Low health score in {}", hit.source_path),
                        component: Component::HealthAnalysis,
                    });
                }
            }
            Ok::<_, HoloError>((insights, alerts))
        };

        let mut result = match tokio::time::timeout(budget, work).await {
            Ok(Ok((insights, alerts))) => {
                let mut r = ComponentResult::new(Component::HealthAnalysis, ComponentStatus::Completed);
                r.insights = insights;
                r.alerts = alerts;
                r
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "health analysis failed");
                ComponentResult::new(Component::HealthAnalysis, ComponentStatus::Failed)
                    .with_detail(e.to_string())
            }
            Err(_) => {
                tracing::warn!(budget_ms = millis(budget), "health analysis timed out");
                ComponentResult::new(Component::HealthAnalysis, ComponentStatus::TimedOut)
                    .with_detail(format!("budget {}ms", millis(budget)))
            }
        };
        result.elapsed_ms = millis(started.elapsed());
        Some(result)
    }

    async fn invoke(
        &self,
        component: Component,
        engine: Option<&Arc<dyn ReasoningEngine>>,
        prompt: &str,
        budget_ms: u64,
        deadline: Instant,
    ) -> EngineOutcome {
        let Some(engine) = engine else {
            return EngineOutcome {
                run: EngineRun::Unavailable(format!("{} not configured", component)),
                elapsed_ms: 0,
            };
        };
        let budget = remaining(Duration::from_millis(budget_ms), deadline);
        let started = Instant::now();
        let run = match tokio::time::timeout(budget, engine.infer(prompt, budget)).await {
            Ok(Ok(inference)) => EngineRun::Answered(inference),
            Ok(Err(e)) => {
                tracing::warn!(engine = engine.name(), error = %e, "reasoning engine failed");
                EngineRun::Unavailable(e.to_string())
            }
            Err(_) => {
                tracing::warn!(engine = engine.name(), budget_ms = millis(budget), "reasoning engine timed out");
                EngineRun::TimedOut(millis(budget))
            }
        };
        EngineOutcome {
            run,
            elapsed_ms: millis(started.elapsed()),
        }
    }

    async fn reason(
        &self,
        query: &Query,
        plan: &RoutingPlan,
        hits: &[SearchHit],
        band: ComplexityBand,
        deadline: Instant,
        tracker: &QueryTracker<'_>,
    ) -> Vec<ComponentResult> {
        let fast_planned = plan.contains(Component::FastReasoner);
        let deep_planned = plan.contains(Component::DeepReasoner);
        if !fast_planned && !deep_planned {
            return Vec::new();
        }

        let prompt = build_prompt(query, hits);
        let reasoning = &self.config.reasoning;
        let fast = || {
            self.invoke(
                Component::FastReasoner,
                self.engines.fast.as_ref(),
                &prompt,
                reasoning.fast.timeout_ms,
                deadline,
            )
        };
        let deep = || {
            self.invoke(
                Component::DeepReasoner,
                self.engines.deep.as_ref(),
                &prompt,
                reasoning.deep.timeout_ms,
                deadline,
            )
        };

        let (fast_out, deep_out) = match band {
            ComplexityBand::Low => {
                if fast_planned {
                    (fast().await, EngineOutcome::not_invoked())
                } else {
                    (EngineOutcome::not_invoked(), deep().await)
                }
            }
            ComplexityBand::Medium => {
                let fast_out = if fast_planned {
                    fast().await
                } else {
                    EngineOutcome::not_invoked()
                };
                let unsure = fast_out
                    .confidence()
                    .map_or(true, |c| c < self.config.orchestration.escalation_confidence);
                let deep_out = if deep_planned && unsure {
                    tolerate(
                        tracker
                            .note(
                                BreadcrumbKind::Escalation,
                                json!({ "band": band, "to": Component::DeepReasoner, "fast_confidence": fast_out.confidence() }),
                            )
                            .await,
                    );
                    deep().await
                } else {
                    EngineOutcome::not_invoked()
                };
                (fast_out, deep_out)
            }
            ComplexityBand::High | ComplexityBand::Critical => {
                if band == ComplexityBand::Critical {
                    self.arbitrate(query, deadline, tracker).await;
                }
                let fast_fut = async {
                    if fast_planned {
                        fast().await
                    } else {
                        EngineOutcome::not_invoked()
                    }
                };
                let deep_fut = async {
                    if deep_planned {
                        deep().await
                    } else {
                        EngineOutcome::not_invoked()
                    }
                };
                tokio::join!(fast_fut, deep_fut)
            }
        };

        let mut results = Vec::new();
        if fast_planned {
            results.push(engine_result(Component::FastReasoner, fast_out));
        }
        if deep_planned {
            results.push(engine_result(Component::DeepReasoner, deep_out));
        }

        let answered = results.iter().any(|r| r.status == ComponentStatus::Completed);
        if !answered {
            if let Some(first) = results
                .iter_mut()
                .find(|r| r.status != ComponentStatus::Skipped)
            {
                let summary = rules_based_inference(query.intent, hits);
                first.insights.push(format!("rules-based summary: {}", summary.result));
            }
        }
        results
    }

    async fn arbitrate(&self, query: &Query, deadline: Instant, tracker: &QueryTracker<'_>) {
        let reason = "critical complexity";
        let escalated = match &self.engines.arbiter {
            Some(arbiter) => {
                let budget = remaining(
                    Duration::from_millis(self.config.orchestration.component_timeout_ms),
                    deadline,
                );
                match tokio::time::timeout(budget, arbiter.escalate(query, reason)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "arbiter escalation failed");
                        false
                    }
                    Err(_) => {
                        tracing::warn!("arbiter escalation timed out");
                        false
                    }
                }
            }
            None => false,
        };
        tolerate(
            tracker
                .note(
                    BreadcrumbKind::Escalation,
                    json!({ "band": ComplexityBand::Critical, "arbiter": escalated, "reason": reason }),
                )
                .await,
        );
    }
}

async fn search_component(
    index: &VectorIndex<dyn EntityStore>,
    text: &str,
    vector: &Result<Arc<Vec<f32>>, String>,
    k: usize,
    filters: &SearchFilters,
) -> HoloResult<(SearchOutcome, Option<String>)> {
    let reason = match vector {
        Ok(v) => match index.search(v, k, filters).await {
            Ok(outcome) => return Ok((outcome, None)),
            Err(HoloError::DegradedSearch { reason }) => reason,
            Err(e) => return Err(e),
        },
        Err(reason) => reason.clone(),
    };
    let outcome = index.lexical_search(text, k, filters).await?;
    Ok((outcome, Some(format!("lexical fallback ({})", reason))))
}

/// Best hit per entity across every retrieval result, ranked.
fn merged_hits(results: &[ComponentResult], k: usize) -> Vec<SearchHit> {
    let mut best: HashMap<&str, &SearchHit> = HashMap::new();
    for hit in results.iter().flat_map(|r| r.hits.iter()) {
        best.entry(hit.entity_id.as_str())
            .and_modify(|cur| {
                if hit.similarity > cur.similarity {
                    *cur = hit;
                }
            })
            .or_insert(hit);
    }
    rank_hits(best.into_values().cloned().collect(), k)
}

fn engine_result(component: Component, outcome: EngineOutcome) -> ComponentResult {
    let mut r = match outcome.run {
        EngineRun::Answered(inf) => {
            let mut r = ComponentResult::new(component, ComponentStatus::Completed);
            r.insights.push(format!(
                "{}: {} (confidence {:.2})",
                component, inf.result, inf.confidence
            ));
            r
        }
        EngineRun::Unavailable(reason) => {
            ComponentResult::new(component, ComponentStatus::Degraded).with_detail(reason)
        }
        EngineRun::TimedOut(budget_ms) => ComponentResult::new(component, ComponentStatus::TimedOut)
            .with_detail(format!("budget {}ms", budget_ms)),
        EngineRun::NotInvoked => ComponentResult::new(component, ComponentStatus::Skipped),
    };
    r.elapsed_ms = outcome.elapsed_ms;
    r
}
