//! SQLite-backed implementation of [`EntityStore`] and [`CoordinationStore`].
//!
//! Multi-row writes run inside one `BEGIN IMMEDIATE` / `tx.commit()`
//! transaction; dropping the transaction on any error rolls it back.
//! Taking the write lock up front lets the connection's busy timeout queue
//! concurrent writers instead of failing a read snapshot on upgrade.
//! Read-modify-write rows (`affinity_weights`, `health_scores`) carry a
//! `version` column. Writes are conditional on the version read; on a
//! conflict or `SQLITE_BUSY` the whole transaction is retried after a
//! jittered backoff, at most [`MAX_TX_ATTEMPTS`] times.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use holo_index_core::embedding::{blob_to_vec, vec_to_blob};
use holo_index_core::error::{HoloError, HoloResult};
use holo_index_core::feedback::apply_delta;
use holo_index_core::health::{apply_update, HealthPolicy, HealthScore, HealthUpdate};
use holo_index_core::index::SearchFilters;
use holo_index_core::models::{
    now_ts, AffinityWeight, BreadcrumbEvent, BreadcrumbKind, Component, ComponentRun,
    ComponentStatus, EntityKind, FeedbackEvent, IndexedEntity, Intent, Query, RoutingDecision,
};
use holo_index_core::store::{
    check_breadcrumb, check_delta, check_weight, CoordinationStore, EntityCandidate, EntityStore,
    MAX_TX_ATTEMPTS,
};

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and bring the schema up to date.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction holding the database write lock.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }
}

/// Map a driver error into the shared taxonomy.
pub fn store_err(e: sqlx::Error) -> HoloError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => HoloError::unavailable(e.to_string()),
        ref locked if is_busy(locked) => HoloError::unavailable(locked.to_string()),
        other => HoloError::storage(other.to_string()),
    }
}

fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let code = db.code();
            matches!(code.as_deref(), Some("5") | Some("6") | Some("517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Failure of one transaction attempt.
enum TxError {
    /// Lock contention; the attempt may be retried.
    Busy(String),
    Fail(HoloError),
}

impl From<sqlx::Error> for TxError {
    fn from(e: sqlx::Error) -> Self {
        if is_busy(&e) {
            TxError::Busy(e.to_string())
        } else {
            TxError::Fail(store_err(e))
        }
    }
}

impl From<HoloError> for TxError {
    fn from(e: HoloError) -> Self {
        TxError::Fail(e)
    }
}

/// Exponential backoff with full jitter, so contending writers spread out.
fn backoff_delay(attempt: usize) -> Duration {
    let ceiling = 5u64 << attempt.min(5);
    Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling))
}

async fn backoff(attempt: usize) {
    tokio::time::sleep(backoff_delay(attempt)).await;
}

fn bad_row(what: &str, value: &str) -> HoloError {
    HoloError::storage(format!("unrecognized {} in store: {}", what, value))
}

fn row_to_candidate(row: &SqliteRow) -> HoloResult<EntityCandidate> {
    let kind: String = row.get("kind");
    let blob: Option<Vec<u8>> = row.get("embedding");
    Ok(EntityCandidate {
        entity_id: row.get("id"),
        kind: EntityKind::parse(&kind).ok_or_else(|| bad_row("entity kind", &kind))?,
        source_path: row.get("source_path"),
        content: row.get("content"),
        embedding: blob.as_deref().map(blob_to_vec),
        model_version: row.get("model_version"),
    })
}

fn row_to_weight(row: &SqliteRow) -> HoloResult<AffinityWeight> {
    let component: String = row.get("component");
    let intent: String = row.get("intent");
    let update_count: i64 = row.get("update_count");
    Ok(AffinityWeight {
        component: Component::parse(&component).ok_or_else(|| bad_row("component", &component))?,
        intent: Intent::parse(&intent).ok_or_else(|| bad_row("intent", &intent))?,
        weight: row.get("weight"),
        update_count: update_count.max(0) as u64,
        updated_at: row.get("updated_at"),
    })
}

fn row_to_breadcrumb(row: &SqliteRow) -> HoloResult<BreadcrumbEvent> {
    let kind: String = row.get("kind");
    let payload: String = row.get("payload");
    Ok(BreadcrumbEvent {
        id: row.get("id"),
        query_id: row.get("query_id"),
        kind: BreadcrumbKind::parse(&kind).ok_or_else(|| bad_row("breadcrumb kind", &kind))?,
        payload: serde_json::from_str(&payload)?,
        agent_id: row.get("agent_id"),
        created_at: row.get("created_at"),
    })
}

fn parse_health(json: &str) -> HoloResult<HealthScore> {
    serde_json::from_str(json)
        .map_err(|e| HoloError::corruption(format!("unreadable health score: {}", e)))
}

/// FTS5 expression matching any of `terms` as a prefix.
fn fts_expression(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"*", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

const ENTITY_FILTER: &str = "e.deleted = 0 \
     AND (?1 IS NULL OR e.kind = ?1) \
     AND (?2 IS NULL OR substr(e.source_path, 1, length(?2)) = ?2)";

impl SqliteStore {
    async fn feedback_attempt(
        &self,
        event: &FeedbackEvent,
        intent: Intent,
        components: &[Component],
    ) -> Result<Option<Vec<AffinityWeight>>, TxError> {
        let mut tx = self.begin_write().await?;

        let known: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM queries WHERE id = ?")
            .bind(&event.query_id)
            .fetch_one(&mut *tx)
            .await?;
        if !known {
            return Err(HoloError::invalid_feedback(format!("unknown query {}", event.query_id)).into());
        }

        // Read and validate every row before the first write.
        let mut planned = Vec::with_capacity(components.len());
        for &component in components {
            let row = sqlx::query(
                "SELECT weight, update_count, version FROM affinity_weights WHERE component = ? AND intent = ?",
            )
            .bind(component.as_str())
            .bind(intent.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            let (weight, count, version) = match row {
                Some(r) => {
                    let w: f64 = r.get("weight");
                    let c: i64 = r.get("update_count");
                    let v: i64 = r.get("version");
                    (w, c.max(0) as u64, Some(v))
                }
                None => (AffinityWeight::NEUTRAL, 0, None),
            };
            check_weight(component, intent, weight)?;
            planned.push((
                AffinityWeight {
                    component,
                    intent,
                    weight: apply_delta(weight, event.delta),
                    update_count: count + 1,
                    updated_at: event.created_at,
                },
                version,
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO feedback_events (id, query_id, relevance, noise_level, completeness,
                                         efficiency, delta, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.query_id)
        .bind(event.ratings.relevance)
        .bind(event.ratings.noise_level)
        .bind(event.ratings.completeness)
        .bind(event.ratings.efficiency)
        .bind(event.delta)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        for (w, version) in &planned {
            let affected = match version {
                Some(v) => sqlx::query(
                    r#"
                    UPDATE affinity_weights
                    SET weight = ?, update_count = ?, updated_at = ?, version = version + 1
                    WHERE component = ? AND intent = ? AND version = ?
                    "#,
                )
                .bind(w.weight)
                .bind(w.update_count as i64)
                .bind(w.updated_at)
                .bind(w.component.as_str())
                .bind(w.intent.as_str())
                .bind(v)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                None => sqlx::query(
                    r#"
                    INSERT INTO affinity_weights (component, intent, weight, update_count, updated_at, version)
                    VALUES (?, ?, ?, ?, ?, 1)
                    ON CONFLICT(component, intent) DO NOTHING
                    "#,
                )
                .bind(w.component.as_str())
                .bind(w.intent.as_str())
                .bind(w.weight)
                .bind(w.update_count as i64)
                .bind(w.updated_at)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            };
            if affected == 0 {
                return Ok(None);
            }
        }

        tx.commit().await?;
        Ok(Some(planned.into_iter().map(|(w, _)| w).collect()))
    }

    async fn health_attempt(
        &self,
        entity_id: &str,
        update: &HealthUpdate,
        policy: &HealthPolicy,
    ) -> Result<Option<HealthScore>, TxError> {
        let mut tx = self.begin_write().await?;

        let row = sqlx::query("SELECT score_json, version FROM health_scores WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_optional(&mut *tx)
            .await?;

        let (prev, version) = match row {
            Some(r) => {
                let json: String = r.get("score_json");
                let v: i64 = r.get("version");
                let score = parse_health(&json)?;
                score.validate()?;
                (Some(score), Some(v))
            }
            None => (None, None),
        };

        let next = apply_update(prev.as_ref(), entity_id, update, policy, now_ts())?;
        let json = serde_json::to_string(&next).map_err(HoloError::from)?;

        let affected = match version {
            Some(v) => sqlx::query(
                r#"
                UPDATE health_scores
                SET score_json = ?, overall = ?, updated_at = ?, version = version + 1
                WHERE entity_id = ? AND version = ?
                "#,
            )
            .bind(&json)
            .bind(next.overall)
            .bind(next.updated_at)
            .bind(entity_id)
            .bind(v)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            None => sqlx::query(
                r#"
                INSERT INTO health_scores (entity_id, score_json, overall, updated_at, version)
                VALUES (?, ?, ?, ?, 1)
                ON CONFLICT(entity_id) DO NOTHING
                "#,
            )
            .bind(entity_id)
            .bind(&json)
            .bind(next.overall)
            .bind(next.updated_at)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };
        if affected == 0 {
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(next))
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn upsert_entity(&self, entity: &IndexedEntity) -> HoloResult<()> {
        let blob = entity.embedding.as_deref().map(vec_to_blob);
        let dims = entity.embedding.as_ref().map(|v| v.len() as i64);

        let mut tx = self.begin_write().await.map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO entities (id, kind, source_path, content, content_hash, embedding,
                                  model_version, dims, indexed_at, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                source_path = excluded.source_path,
                content = excluded.content,
                content_hash = excluded.content_hash,
                embedding = excluded.embedding,
                model_version = excluded.model_version,
                dims = excluded.dims,
                indexed_at = excluded.indexed_at,
                deleted = 0
            "#,
        )
        .bind(&entity.id)
        .bind(entity.kind.as_str())
        .bind(&entity.source_path)
        .bind(&entity.content)
        .bind(&entity.content_hash)
        .bind(blob)
        .bind(&entity.model_version)
        .bind(dims)
        .bind(entity.indexed_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query("DELETE FROM entities_fts WHERE entity_id = ?")
            .bind(&entity.id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        sqlx::query("INSERT INTO entities_fts (entity_id, source_path, content) VALUES (?, ?, ?)")
            .bind(&entity.id)
            .bind(&entity.source_path)
            .bind(&entity.content)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> HoloResult<bool> {
        let mut tx = self.begin_write().await.map_err(store_err)?;
        let affected = sqlx::query("UPDATE entities SET deleted = 1 WHERE id = ? AND deleted = 0")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?
            .rows_affected();
        sqlx::query("DELETE FROM entities_fts WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(affected > 0)
    }

    async fn get_entity(&self, id: &str) -> HoloResult<Option<IndexedEntity>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, source_path, content, content_hash, embedding, model_version,
                   indexed_at, deleted
            FROM entities WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            None => Ok(None),
            Some(r) => {
                let cand = row_to_candidate(&r)?;
                let deleted: i64 = r.get("deleted");
                Ok(Some(IndexedEntity {
                    id: cand.entity_id,
                    kind: cand.kind,
                    source_path: cand.source_path,
                    content: cand.content,
                    embedding: cand.embedding,
                    model_version: cand.model_version,
                    indexed_at: r.get("indexed_at"),
                    deleted: deleted != 0,
                    content_hash: r.get("content_hash"),
                }))
            }
        }
    }

    async fn count_entities(&self) -> HoloResult<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(n.max(0) as usize)
    }

    async fn vector_candidates(&self, filters: &SearchFilters) -> HoloResult<Vec<EntityCandidate>> {
        let sql = format!(
            "SELECT e.id, e.kind, e.source_path, e.content, e.embedding, e.model_version \
             FROM entities e WHERE {}",
            ENTITY_FILTER
        );
        let rows = sqlx::query(&sql)
            .bind(filters.kind.map(|k| k.as_str()))
            .bind(filters.path_prefix.as_deref())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_candidate).collect()
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
        let sql = format!(
            "SELECT e.id, e.kind, e.source_path, e.content, e.embedding, e.model_version \
             FROM entities_fts f JOIN entities e ON e.id = f.entity_id \
             WHERE entities_fts MATCH ?3 AND {} \
             ORDER BY f.rank, e.id LIMIT ?4",
            ENTITY_FILTER
        );
        let rows = sqlx::query(&sql)
            .bind(filters.kind.map(|k| k.as_str()))
            .bind(filters.path_prefix.as_deref())
            .bind(fts_expression(terms))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_candidate).collect()
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn record_query(&self, query: &Query) -> HoloResult<()> {
        sqlx::query(
            "INSERT INTO queries (id, text, intent, confidence, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&query.id)
        .bind(&query.text)
        .bind(query.intent.as_str())
        .bind(query.confidence)
        .bind(query.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_query(&self, id: &str) -> HoloResult<Option<Query>> {
        let row = sqlx::query("SELECT id, text, intent, confidence, created_at FROM queries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match row {
            None => Ok(None),
            Some(r) => {
                let intent: String = r.get("intent");
                Ok(Some(Query {
                    id: r.get("id"),
                    text: r.get("text"),
                    intent: Intent::parse(&intent).ok_or_else(|| bad_row("intent", &intent))?,
                    confidence: r.get("confidence"),
                    created_at: r.get("created_at"),
                }))
            }
        }
    }

    async fn record_routing(&self, decision: &RoutingDecision) -> HoloResult<()> {
        let components = serde_json::to_string(&decision.components)?;
        let affinity = serde_json::to_string(&decision.affinity)?;
        let result = sqlx::query(
            r#"
            INSERT INTO routing_decisions (query_id, intent, confidence, components_json,
                                           affinity_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&decision.query_id)
        .bind(decision.intent.as_str())
        .bind(decision.confidence)
        .bind(&components)
        .bind(&affinity)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(HoloError::storage(
                format!("routing decision for {} already recorded", decision.query_id),
            )),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn get_routing(&self, query_id: &str) -> HoloResult<Option<RoutingDecision>> {
        let row = sqlx::query(
            r#"
            SELECT query_id, intent, confidence, components_json, affinity_json, created_at
            FROM routing_decisions WHERE query_id = ?
            "#,
        )
        .bind(query_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        match row {
            None => Ok(None),
            Some(r) => {
                let intent: String = r.get("intent");
                let components: String = r.get("components_json");
                let affinity: String = r.get("affinity_json");
                Ok(Some(RoutingDecision {
                    query_id: r.get("query_id"),
                    intent: Intent::parse(&intent).ok_or_else(|| bad_row("intent", &intent))?,
                    confidence: r.get("confidence"),
                    components: serde_json::from_str(&components)?,
                    affinity: serde_json::from_str(&affinity)?,
                    created_at: r.get("created_at"),
                }))
            }
        }
    }

    async fn record_execution(
        &self,
        query_id: &str,
        runs: &[ComponentRun],
        surfaced: &[String],
    ) -> HoloResult<()> {
        let mut tx = self.begin_write().await.map_err(store_err)?;
        for run in runs {
            sqlx::query(
                r#"
                INSERT INTO component_runs (query_id, component, status, elapsed_ms)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(query_id, component) DO UPDATE SET
                    status = excluded.status,
                    elapsed_ms = excluded.elapsed_ms
                "#,
            )
            .bind(query_id)
            .bind(run.component.as_str())
            .bind(run.status.as_str())
            .bind(run.elapsed_ms as i64)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        for (position, entity_id) in surfaced.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO surfaced_entities (query_id, entity_id, position)
                VALUES (?, ?, ?)
                ON CONFLICT(query_id, entity_id) DO NOTHING
                "#,
            )
            .bind(query_id)
            .bind(entity_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn component_runs(&self, query_id: &str) -> HoloResult<Vec<ComponentRun>> {
        let rows = sqlx::query(
            "SELECT component, status, elapsed_ms FROM component_runs WHERE query_id = ? ORDER BY rowid",
        )
        .bind(query_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(|r| {
                let component: String = r.get("component");
                let status: String = r.get("status");
                let elapsed: i64 = r.get("elapsed_ms");
                Ok(ComponentRun {
                    query_id: query_id.to_string(),
                    component: Component::parse(&component)
                        .ok_or_else(|| bad_row("component", &component))?,
                    status: ComponentStatus::parse(&status)
                        .ok_or_else(|| bad_row("component status", &status))?,
                    elapsed_ms: elapsed.max(0) as u64,
                })
            })
            .collect()
    }

    async fn surfaced_entities(&self, query_id: &str) -> HoloResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT entity_id FROM surfaced_entities WHERE query_id = ? ORDER BY position",
        )
        .bind(query_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn affinity_weights(&self, intent: Intent) -> HoloResult<Vec<AffinityWeight>> {
        let rows = sqlx::query(
            r#"
            SELECT component, intent, weight, update_count, updated_at
            FROM affinity_weights WHERE intent = ? ORDER BY component
            "#,
        )
        .bind(intent.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(row_to_weight).collect()
    }

    async fn all_affinity_weights(&self) -> HoloResult<Vec<AffinityWeight>> {
        let rows = sqlx::query(
            r#"
            SELECT component, intent, weight, update_count, updated_at
            FROM affinity_weights ORDER BY intent, component
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(row_to_weight).collect()
    }

    async fn apply_feedback(
        &self,
        event: &FeedbackEvent,
        intent: Intent,
        components: &[Component],
    ) -> HoloResult<Vec<AffinityWeight>> {
        check_delta(event.delta)?;
        for attempt in 1..=MAX_TX_ATTEMPTS {
            match self.feedback_attempt(event, intent, components).await {
                Ok(Some(updated)) => return Ok(updated),
                Ok(None) => {
                    tracing::debug!(attempt, query_id = %event.query_id, "affinity version conflict, retrying")
                }
                Err(TxError::Busy(reason)) => {
                    tracing::debug!(attempt, %reason, "feedback transaction busy, retrying")
                }
                Err(TxError::Fail(e)) => return Err(e),
            }
            backoff(attempt).await;
        }
        Err(HoloError::unavailable(format!(
            "feedback for {} not applied after {} attempts",
            event.query_id, MAX_TX_ATTEMPTS
        )))
    }

    async fn get_health(&self, entity_id: &str) -> HoloResult<Option<HealthScore>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT score_json FROM health_scores WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        json.as_deref().map(parse_health).transpose()
    }

    async fn update_health(
        &self,
        entity_id: &str,
        update: &HealthUpdate,
        policy: &HealthPolicy,
    ) -> HoloResult<HealthScore> {
        for attempt in 1..=MAX_TX_ATTEMPTS {
            match self.health_attempt(entity_id, update, policy).await {
                Ok(Some(score)) => return Ok(score),
                Ok(None) => {
                    tracing::debug!(attempt, entity_id, "health version conflict, retrying")
                }
                Err(TxError::Busy(reason)) => {
                    tracing::debug!(attempt, %reason, "health transaction busy, retrying")
                }
                Err(TxError::Fail(e)) => return Err(e),
            }
            backoff(attempt).await;
        }
        Err(HoloError::unavailable(format!(
            "health update for {} not applied after {} attempts",
            entity_id, MAX_TX_ATTEMPTS
        )))
    }

    async fn all_health(&self) -> HoloResult<Vec<HealthScore>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT score_json FROM health_scores ORDER BY entity_id")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        rows.iter().map(|j| parse_health(j)).collect()
    }

    async fn append_breadcrumb(&self, event: &BreadcrumbEvent) -> HoloResult<i64> {
        let payload = check_breadcrumb(event)?;
        let result = sqlx::query(
            r#"
            INSERT INTO breadcrumbs (query_id, kind, payload, agent_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.query_id)
        .bind(event.kind.as_str())
        .bind(&payload)
        .bind(&event.agent_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn breadcrumbs(
        &self,
        query_id: Option<&str>,
        limit: usize,
    ) -> HoloResult<Vec<BreadcrumbEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, query_id, kind, payload, agent_id, created_at
            FROM breadcrumbs
            WHERE (?1 IS NULL OR query_id = ?1)
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(query_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let mut events = rows
            .iter()
            .map(row_to_breadcrumb)
            .collect::<HoloResult<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    async fn prune_breadcrumbs(&self, before: i64) -> HoloResult<u64> {
        let result = sqlx::query("DELETE FROM breadcrumbs WHERE created_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_expression_quotes_terms() {
        let terms = vec!["rate".to_string(), "limiter".to_string()];
        assert_eq!(fts_expression(&terms), "\"rate\"* OR \"limiter\"*");
    }

    #[test]
    fn test_backoff_delay_is_bounded_and_nonzero() {
        for attempt in 1..=MAX_TX_ATTEMPTS {
            let ceiling = Duration::from_millis(5 << attempt.min(5));
            for _ in 0..50 {
                let d = backoff_delay(attempt);
                assert!(d >= Duration::from_millis(1));
                assert!(d <= ceiling);
            }
        }
    }

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(store_err(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(!store_err(sqlx::Error::RowNotFound).is_unavailable());
    }
}
