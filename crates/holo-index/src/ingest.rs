//! Indexing feed.
//!
//! Entities arrive as JSON Lines, one record per line:
//!
//! ```json
//! {"id": "sym:limiter", "kind": "code_symbol", "source_path": "src/limiter.rs", "content": "pub struct RateLimiter"}
//! {"id": "doc:old", "deleted": true}
//! ```
//!
//! A record may carry a `structure` object (`line_count`, `change_count`,
//! `fan_in`, `documented`) which is forwarded to the health scorer.
//! Records whose content hash and embedding are already current are left
//! alone. Embedding failures are not fatal: the entity is stored without a
//! vector and picked up later by [`embed_pending`].

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use holo_index_core::health::StructuralSignals;
use holo_index_core::models::{content_hash, EntityKind, IndexedEntity};
use holo_index_core::store::EntityStore;

use crate::embedding::{embed_with_retry, RetryPolicy};
use crate::service::HoloIndex;

#[derive(Debug, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    #[serde(default)]
    pub kind: Option<EntityKind>,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub structure: Option<StructuralSignals>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestStats {
    pub records: u64,
    pub upserted: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub embedded: u64,
    /// Stored without a vector; `holo embed pending` retries them.
    pub embeddings_pending: u64,
    /// Lines that could not be parsed or were missing fields.
    pub rejected: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmbedStats {
    pub pending: u64,
    pub embedded: u64,
    pub failed: u64,
}

pub async fn ingest_file(holo: &HoloIndex, path: &Path) -> Result<IngestStats> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    let mut stats = IngestStats::default();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EntityRecord>(&line) {
            Ok(r) => records.push(r),
            Err(e) => {
                tracing::warn!(line = n + 1, error = %e, "skipping malformed record");
                stats.rejected += 1;
            }
        }
    }
    let mut ingested = ingest_records(holo, records).await?;
    ingested.rejected += stats.rejected;
    Ok(ingested)
}

pub async fn ingest_records(holo: &HoloIndex, records: Vec<EntityRecord>) -> Result<IngestStats> {
    let index = holo.index();
    let store = index.store();
    let embedding_enabled = holo.embedder().dims() > 0;
    let mut stats = IngestStats::default();
    let mut to_write: Vec<IndexedEntity> = Vec::new();
    let mut structures: Vec<(String, StructuralSignals)> = Vec::new();

    for record in records {
        stats.records += 1;
        if record.deleted {
            if index.delete(&record.id).await? {
                stats.deleted += 1;
            }
            continue;
        }
        let (Some(kind), Some(source_path), Some(content)) =
            (record.kind, record.source_path, record.content)
        else {
            tracing::warn!(id = %record.id, "record missing kind, source_path or content");
            stats.rejected += 1;
            continue;
        };
        if let Some(signals) = record.structure {
            structures.push((record.id.clone(), signals));
        }

        if let Some(existing) = store.get_entity(&record.id).await? {
            let current = !existing.deleted
                && existing.content_hash == content_hash(&content)
                && existing.source_path == source_path
                && (!embedding_enabled || existing.is_fresh(index.model_version(), index.dims()));
            if current {
                stats.unchanged += 1;
                continue;
            }
        }
        to_write.push(IndexedEntity::new(record.id, kind, source_path, content));
    }

    let batch_size = holo.config().embedding.batch_size.max(1);
    for batch in to_write.chunks(batch_size) {
        let vectors = if embedding_enabled {
            embed_batch(holo, batch).await
        } else {
            None
        };
        for (i, entity) in batch.iter().enumerate() {
            let entity = match vectors.as_ref().and_then(|v| v.get(i)) {
                Some(vector) => {
                    stats.embedded += 1;
                    entity
                        .clone()
                        .with_embedding(vector.clone(), index.model_version())
                }
                None => {
                    if embedding_enabled {
                        stats.embeddings_pending += 1;
                    }
                    entity.clone()
                }
            };
            index.upsert(&entity).await?;
            stats.upserted += 1;
        }
    }

    for (id, signals) in structures {
        holo.health().observe_structure(&id, signals).await?;
    }

    tracing::info!(
        upserted = stats.upserted,
        unchanged = stats.unchanged,
        deleted = stats.deleted,
        "ingest complete"
    );
    Ok(stats)
}

async fn embed_batch(holo: &HoloIndex, batch: &[IndexedEntity]) -> Option<Vec<Vec<f32>>> {
    let texts: Vec<String> = batch.iter().map(|e| e.content.clone()).collect();
    let policy = RetryPolicy::indexing(&holo.config().embedding);
    match embed_with_retry(holo.embedder().as_ref(), &texts, policy).await {
        Ok(vectors) => Some(vectors),
        Err(e) => {
            tracing::warn!(error = %e, entities = batch.len(), "embedding batch failed, storing without vectors");
            None
        }
    }
}

/// Embed live entities whose vector is missing or from another model.
pub async fn embed_pending(holo: &HoloIndex, limit: usize) -> Result<EmbedStats> {
    let index = holo.index();
    let ids = index.stale_entities(limit).await?;
    let mut stats = EmbedStats {
        pending: ids.len() as u64,
        ..EmbedStats::default()
    };
    if ids.is_empty() || holo.embedder().dims() == 0 {
        return Ok(stats);
    }

    let mut entities = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(entity) = index.store().get_entity(id).await? {
            entities.push(entity);
        }
    }

    let batch_size = holo.config().embedding.batch_size.max(1);
    for batch in entities.chunks(batch_size) {
        match embed_batch(holo, batch).await {
            Some(vectors) => {
                for (entity, vector) in batch.iter().zip(vectors) {
                    let updated = entity
                        .clone()
                        .with_embedding(vector, index.model_version());
                    index.upsert(&updated).await?;
                    stats.embedded += 1;
                }
            }
            None => stats.failed += batch.len() as u64,
        }
    }

    tracing::info!(embedded = stats.embedded, failed = stats.failed, "embed pending complete");
    Ok(stats)
}
