//! TOML configuration.
//!
//! Only `[db].path` is required; every other section and field has a
//! default. [`load_config`] parses and validates in one step.
//!
//! ```toml
//! [db]
//! path = "./data/holo.sqlite"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [reasoning.fast]
//! provider = "ollama"
//! model = "qwen2.5-coder:1.5b"
//!
//! [orchestration]
//! component_timeout_ms = 3000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use holo_index_core::complexity::ComplexityThresholds;
use holo_index_core::compose::{ComposeLimits, Verbosity};
use holo_index_core::feedback::FeedbackPolicy;
use holo_index_core::health::HealthPolicy;
use holo_index_core::router::RoutingPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub routing: RoutingPolicy,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub feedback: FeedbackPolicy,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub breadcrumbs: BreadcrumbConfig,
}

impl Config {
    /// Defaults everywhere except the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            embedding: EmbeddingConfig::default(),
            reasoning: ReasoningConfig::default(),
            retrieval: RetrievalConfig::default(),
            routing: RoutingPolicy::default(),
            orchestration: OrchestrationConfig::default(),
            feedback: FeedbackPolicy::default(),
            health: HealthConfig::default(),
            breadcrumbs: BreadcrumbConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retries after the first attempt, per batch or query.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-attempt budget when embedding a query at serve time.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_query_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    #[serde(default = "default_fast_engine")]
    pub fast: EngineConfig,
    #[serde(default = "default_deep_engine")]
    pub deep: EngineConfig,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            fast: default_fast_engine(),
            deep: default_deep_engine(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Component budget for one inference.
    #[serde(default = "default_engine_timeout_ms")]
    pub timeout_ms: u64,
}

impl EngineConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_engine_timeout_ms() -> u64 {
    2000
}
fn default_fast_engine() -> EngineConfig {
    EngineConfig {
        provider: default_provider(),
        model: None,
        url: None,
        timeout_ms: 2000,
    }
}
fn default_deep_engine() -> EngineConfig {
    EngineConfig {
        timeout_ms: 8000,
        ..default_fast_engine()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Hits returned per retrieval component.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Path prefix holding protocol guidance documents.
    #[serde(default = "default_guidance_prefix")]
    pub guidance_prefix: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            guidance_prefix: default_guidance_prefix(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_guidance_prefix() -> String {
    "WSP_framework/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestrationConfig {
    #[serde(default = "default_component_timeout_ms")]
    pub component_timeout_ms: u64,
    /// Hard limit for a whole query; outstanding components are aborted.
    #[serde(default = "default_query_deadline_ms")]
    pub query_deadline_ms: u64,
    /// Medium-band queries escalate to the deep engine below this.
    #[serde(default = "default_escalation_confidence")]
    pub escalation_confidence: f64,
    #[serde(default)]
    pub complexity: ComplexityThresholds,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default = "default_max_entries")]
    pub max_entries_per_section: usize,
    /// Recorded on every breadcrumb this process writes.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            component_timeout_ms: default_component_timeout_ms(),
            query_deadline_ms: default_query_deadline_ms(),
            escalation_confidence: default_escalation_confidence(),
            complexity: ComplexityThresholds::default(),
            verbosity: Verbosity::default(),
            max_entries_per_section: default_max_entries(),
            agent_id: default_agent_id(),
        }
    }
}

impl OrchestrationConfig {
    pub fn limits(&self) -> ComposeLimits {
        ComposeLimits {
            max_entries_per_section: self.max_entries_per_section,
        }
    }
}

fn default_component_timeout_ms() -> u64 {
    3000
}
fn default_query_deadline_ms() -> u64 {
    10_000
}
fn default_escalation_confidence() -> f64 {
    0.6
}
fn default_max_entries() -> usize {
    10
}
fn default_agent_id() -> String {
    "holo-index".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_usage_alpha")]
    pub usage_alpha: f64,
    #[serde(default = "default_rating_alpha")]
    pub rating_alpha: f64,
    #[serde(default = "default_half_life")]
    pub decay_half_life_days: f64,
    /// Surfaced entities below this overall score raise an alert.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default = "default_foundational_fraction")]
    pub foundational_fraction: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            usage_alpha: default_usage_alpha(),
            rating_alpha: default_rating_alpha(),
            decay_half_life_days: default_half_life(),
            alert_threshold: default_alert_threshold(),
            foundational_fraction: default_foundational_fraction(),
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            usage_alpha: self.usage_alpha,
            rating_alpha: self.rating_alpha,
            decay_half_life_days: self.decay_half_life_days,
        }
    }
}

fn default_usage_alpha() -> f64 {
    0.1
}
fn default_rating_alpha() -> f64 {
    0.2
}
fn default_half_life() -> f64 {
    30.0
}
fn default_alert_threshold() -> f64 {
    0.35
}
fn default_foundational_fraction() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreadcrumbConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Events held in memory while the store is unreachable.
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
}

impl Default for BreadcrumbConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            backlog_capacity: default_backlog_capacity(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}
fn default_backlog_capacity() -> usize {
    256
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        bail!("{} must be in [0.0, 1.0], got {}", name, value);
    }
    Ok(())
}

fn check_engine(name: &str, engine: &EngineConfig) -> Result<()> {
    match engine.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if engine.model.is_none() {
                bail!("reasoning.{}.model must be specified when provider is 'ollama'", name);
            }
        }
        other => bail!(
            "Unknown reasoning provider for reasoning.{}: '{}'. Must be disabled or ollama.",
            name,
            other
        ),
    }
    if engine.timeout_ms == 0 {
        bail!("reasoning.{}.timeout_ms must be > 0", name);
    }
    Ok(())
}

/// Check every range and cross-field constraint.
pub fn validate(config: &Config) -> Result<()> {
    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.query_timeout_ms == 0 {
        bail!("embedding.query_timeout_ms must be > 0");
    }

    check_engine("fast", &config.reasoning.fast)?;
    check_engine("deep", &config.reasoning.deep)?;

    // Retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }

    // Routing
    check_unit(
        "routing.low_confidence_threshold",
        config.routing.low_confidence_threshold,
    )?;
    if !(-1.0..=1.0).contains(&config.routing.prune_threshold) {
        bail!("routing.prune_threshold must be in [-1.0, 1.0]");
    }

    // Orchestration
    let orch = &config.orchestration;
    if orch.component_timeout_ms == 0 || orch.query_deadline_ms == 0 {
        bail!("orchestration budgets must be > 0");
    }
    if orch.query_deadline_ms < orch.component_timeout_ms {
        bail!("orchestration.query_deadline_ms must be >= component_timeout_ms");
    }
    check_unit(
        "orchestration.escalation_confidence",
        orch.escalation_confidence,
    )?;
    orch.complexity
        .validate()
        .map_err(|e| anyhow::anyhow!("orchestration.complexity: {}", e))?;
    if orch.max_entries_per_section == 0 {
        bail!("orchestration.max_entries_per_section must be >= 1");
    }

    // Feedback
    config
        .feedback
        .validate()
        .map_err(|e| anyhow::anyhow!("feedback: {}", e))?;

    // Health
    let h = &config.health;
    if !(h.usage_alpha > 0.0 && h.usage_alpha <= 1.0) {
        bail!("health.usage_alpha must be in (0.0, 1.0]");
    }
    if !(h.rating_alpha > 0.0 && h.rating_alpha <= 1.0) {
        bail!("health.rating_alpha must be in (0.0, 1.0]");
    }
    if !(h.decay_half_life_days > 0.0) {
        bail!("health.decay_half_life_days must be > 0");
    }
    check_unit("health.alert_threshold", h.alert_threshold)?;
    check_unit("health.foundational_fraction", h.foundational_fraction)?;

    // Breadcrumbs
    if config.breadcrumbs.backlog_capacity == 0 {
        bail!("breadcrumbs.backlog_capacity must be >= 1");
    }

    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}
