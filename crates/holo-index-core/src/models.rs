//! Core data models shared by the index, the router, the learner and the
//! coordination store.
//!
//! Timestamps are Unix seconds (`i64`), matching the SQLite schema.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Current time as Unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Hex-encoded SHA-256 of an entity's content, used to skip re-embedding
/// unchanged text.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CodeSymbol,
    DocSection,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CodeSymbol => "code_symbol",
            EntityKind::DocSection => "doc_section",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code_symbol" => Some(EntityKind::CodeSymbol),
            "doc_section" => Some(EntityKind::DocSection),
            _ => None,
        }
    }
}

/// A searchable unit: a code symbol or a documentation section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub source_path: String,
    pub content: String,
    /// Embedding vector, absent until the entity has been embedded.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Model that produced `embedding`. A mismatch with the index's model
    /// marks the embedding stale.
    #[serde(default)]
    pub model_version: Option<String>,
    pub indexed_at: i64,
    #[serde(default)]
    pub deleted: bool,
    pub content_hash: String,
}

impl IndexedEntity {
    /// Build a live, not-yet-embedded entity.
    pub fn new(
        id: impl Into<String>,
        kind: EntityKind,
        source_path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            kind,
            source_path: source_path.into(),
            content_hash: content_hash(&content),
            content,
            embedding: None,
            model_version: None,
            indexed_at: now_ts(),
            deleted: false,
        }
    }

    pub fn with_embedding(mut self, vector: Vec<f32>, model_version: impl Into<String>) -> Self {
        self.embedding = Some(vector);
        self.model_version = Some(model_version.into());
        self
    }

    /// Whether the entity carries a usable embedding for `model_version`/`dims`.
    pub fn is_fresh(&self, model_version: &str, dims: usize) -> bool {
        match (&self.embedding, &self.model_version) {
            (Some(v), Some(m)) => m == model_version && v.len() == dims,
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Intents and components
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    DocLookup,
    CodeLocation,
    ModuleHealth,
    Research,
    General,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::DocLookup,
        Intent::CodeLocation,
        Intent::ModuleHealth,
        Intent::Research,
        Intent::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::DocLookup => "DOC_LOOKUP",
            Intent::CodeLocation => "CODE_LOCATION",
            Intent::ModuleHealth => "MODULE_HEALTH",
            Intent::Research => "RESEARCH",
            Intent::General => "GENERAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase().replace('-', "_");
        Intent::ALL.into_iter().find(|i| i.as_str() == upper)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reasoning component the router can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    /// Similarity search over every live entity.
    VectorSearch,
    /// Similarity search restricted to documentation sections.
    DocSearch,
    /// Protocol guidance lookup: documentation under the guidance prefix.
    WspGuidance,
    /// Health-score inspection of surfaced entities.
    HealthAnalysis,
    /// Fast external reasoning engine.
    FastReasoner,
    /// Deep external reasoning engine (RESEARCH only).
    DeepReasoner,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::VectorSearch,
        Component::DocSearch,
        Component::WspGuidance,
        Component::HealthAnalysis,
        Component::FastReasoner,
        Component::DeepReasoner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::VectorSearch => "vector-search",
            Component::DocSearch => "doc-search",
            Component::WspGuidance => "wsp-guidance",
            Component::HealthAnalysis => "health-analysis",
            Component::FastReasoner => "fast-reasoner",
            Component::DeepReasoner => "deep-reasoner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Component::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Tie-break order when affinity weights are equal (lower runs first).
    pub fn static_priority(&self) -> u8 {
        match self {
            Component::VectorSearch => 0,
            Component::DocSearch => 1,
            Component::WspGuidance => 2,
            Component::HealthAnalysis => 3,
            Component::FastReasoner => 4,
            Component::DeepReasoner => 5,
        }
    }

    /// Retrieval components read the vector index; the rest consume their hits.
    pub fn is_retrieval(&self) -> bool {
        matches!(
            self,
            Component::VectorSearch | Component::DocSearch | Component::WspGuidance
        )
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Queries, routing, learning
// ═══════════════════════════════════════════════════════════════════════

/// A single user request after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub text: String,
    pub intent: Intent,
    pub confidence: f64,
    pub created_at: i64,
}

impl Query {
    pub fn new(text: impl Into<String>, intent: Intent, confidence: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            intent,
            confidence,
            created_at: now_ts(),
        }
    }
}

/// Immutable record of which components were selected for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub query_id: String,
    pub intent: Intent,
    pub confidence: f64,
    /// Selected components, in execution-priority order.
    pub components: Vec<Component>,
    /// Affinity weight consulted for each selected component.
    pub affinity: Vec<(Component, f64)>,
    pub created_at: i64,
}

/// Learned preference of a component for an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityWeight {
    pub component: Component,
    pub intent: Intent,
    pub weight: f64,
    pub update_count: u64,
    pub updated_at: i64,
}

impl AffinityWeight {
    /// Neutral starting weight used on first observation.
    pub const NEUTRAL: f64 = 0.0;
    pub const MIN: f64 = -1.0;
    pub const MAX: f64 = 1.0;

    pub fn neutral(component: Component, intent: Intent) -> Self {
        Self {
            component,
            intent,
            weight: Self::NEUTRAL,
            update_count: 0,
            updated_at: now_ts(),
        }
    }

    pub fn in_bounds(weight: f64) -> bool {
        weight.is_finite() && (Self::MIN..=Self::MAX).contains(&weight)
    }
}

/// The four user-facing rating dimensions, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRatings {
    pub relevance: f64,
    /// Higher means noisier output; inverted when computing the delta.
    pub noise_level: f64,
    pub completeness: f64,
    pub efficiency: f64,
}

/// A user rating of a past query's output. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub id: String,
    pub query_id: String,
    pub ratings: FeedbackRatings,
    pub delta: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Completed,
    /// Completed, but through a fallback path.
    Degraded,
    TimedOut,
    Failed,
    /// Planned but not invoked (e.g. deep engine not escalated to).
    Skipped,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Completed => "completed",
            ComponentStatus::Degraded => "degraded",
            ComponentStatus::TimedOut => "timed_out",
            ComponentStatus::Failed => "failed",
            ComponentStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(ComponentStatus::Completed),
            "degraded" => Some(ComponentStatus::Degraded),
            "timed_out" => Some(ComponentStatus::TimedOut),
            "failed" => Some(ComponentStatus::Failed),
            "skipped" => Some(ComponentStatus::Skipped),
            _ => None,
        }
    }

    /// Whether the component actually fired for the query.
    pub fn participated(&self) -> bool {
        !matches!(self, ComponentStatus::Skipped)
    }
}

/// Execution outcome of one routed component for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRun {
    pub query_id: String,
    pub component: Component,
    pub status: ComponentStatus,
    pub elapsed_ms: u64,
}

// ═══════════════════════════════════════════════════════════════════════
// Breadcrumbs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreadcrumbKind {
    Classified,
    Routed,
    Executing,
    Composed,
    Done,
    Failed,
    Feedback,
    Escalation,
    Corruption,
}

impl BreadcrumbKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreadcrumbKind::Classified => "classified",
            BreadcrumbKind::Routed => "routed",
            BreadcrumbKind::Executing => "executing",
            BreadcrumbKind::Composed => "composed",
            BreadcrumbKind::Done => "done",
            BreadcrumbKind::Failed => "failed",
            BreadcrumbKind::Feedback => "feedback",
            BreadcrumbKind::Escalation => "escalation",
            BreadcrumbKind::Corruption => "corruption",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            BreadcrumbKind::Classified,
            BreadcrumbKind::Routed,
            BreadcrumbKind::Executing,
            BreadcrumbKind::Composed,
            BreadcrumbKind::Done,
            BreadcrumbKind::Failed,
            BreadcrumbKind::Feedback,
            BreadcrumbKind::Escalation,
            BreadcrumbKind::Corruption,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

/// Append-only audit record of a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreadcrumbEvent {
    /// Assigned by the store on append; `0` before that.
    pub id: i64,
    pub query_id: Option<String>,
    pub kind: BreadcrumbKind,
    pub payload: serde_json::Value,
    pub agent_id: String,
    pub created_at: i64,
}

impl BreadcrumbEvent {
    pub fn new(
        query_id: Option<&str>,
        kind: BreadcrumbKind,
        agent_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: 0,
            query_id: query_id.map(str::to_string),
            kind,
            payload,
            agent_id: agent_id.to_string(),
            created_at: now_ts(),
        }
    }
}
