//! Wiring: one [`HoloIndex`] owns the stores, providers and services for a
//! process and exposes the query, feedback and health operations.

use std::sync::Arc;

use anyhow::Result;

use holo_index_core::compose::Verbosity;
use holo_index_core::embedding::Embedder;
use holo_index_core::index::VectorIndex;
use holo_index_core::models::FeedbackRatings;
use holo_index_core::store::{CoordinationStore, EntityStore};
use holo_index_core::HoloResult;

use crate::breadcrumbs::BreadcrumbTrail;
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::engines::Engines;
use crate::health::HealthScorer;
use crate::learner::{FeedbackLearner, FeedbackOutcome};
use crate::orchestrator::{Orchestrator, QueryResponse};
use crate::router::Router;
use crate::sqlite_store::SqliteStore;

pub struct HoloIndex {
    config: Config,
    coord: Arc<dyn CoordinationStore>,
    orchestrator: Orchestrator,
    learner: FeedbackLearner,
    health: Arc<HealthScorer>,
    trail: Arc<BreadcrumbTrail>,
}

impl HoloIndex {
    /// Open the configured SQLite database (running migrations) and build the
    /// configured providers.
    pub async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config).await?);
        let embedder = create_embedder(&config.embedding)?;
        let engines = Engines::from_config(&config.reasoning)?;
        Ok(Self::assemble(config, store.clone(), store, embedder, engines))
    }

    /// Build from explicit parts.
    pub fn assemble(
        config: Config,
        entities: Arc<dyn EntityStore>,
        coord: Arc<dyn CoordinationStore>,
        embedder: Arc<dyn Embedder>,
        engines: Engines,
    ) -> Self {
        let index = Arc::new(VectorIndex::new(
            entities,
            embedder.model_version(),
            embedder.dims(),
        ));
        let trail = Arc::new(BreadcrumbTrail::new(
            coord.clone(),
            config.orchestration.agent_id.clone(),
            config.breadcrumbs.backlog_capacity,
        ));
        let health = Arc::new(HealthScorer::new(coord.clone(), config.health.clone()));
        let router = Router::new(coord.clone(), config.routing);
        let learner = FeedbackLearner::new(
            coord.clone(),
            trail.clone(),
            health.clone(),
            config.feedback,
        );
        let orchestrator = Orchestrator {
            index,
            coord: coord.clone(),
            embedder,
            engines,
            router,
            health: health.clone(),
            trail: trail.clone(),
            config: config.clone(),
        };
        Self {
            config,
            coord,
            orchestrator,
            learner,
            health,
            trail,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn query(&self, text: &str, verbosity: Verbosity) -> HoloResult<QueryResponse> {
        self.orchestrator.run(text, verbosity).await
    }

    pub async fn record_feedback(
        &self,
        query_id: &str,
        ratings: FeedbackRatings,
    ) -> HoloResult<FeedbackOutcome> {
        self.learner.record_feedback(query_id, ratings).await
    }

    pub fn index(&self) -> &VectorIndex<dyn EntityStore> {
        &self.orchestrator.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.orchestrator.embedder
    }

    pub fn router(&self) -> &Router {
        &self.orchestrator.router
    }

    pub fn health(&self) -> &HealthScorer {
        &self.health
    }

    pub fn trail(&self) -> &BreadcrumbTrail {
        &self.trail
    }

    pub fn coordination(&self) -> &Arc<dyn CoordinationStore> {
        &self.coord
    }
}
