//! Vector index over the entity store.
//!
//! The index algorithm operates entirely through the [`EntityStore`] trait:
//! the store supplies candidate entities, the index scores and ranks them.
//!
//! # Ranking
//!
//! 1. Fetch live candidates matching the [`SearchFilters`].
//! 2. Exclude stale embeddings (wrong model version or dimensionality).
//! 3. Score by cosine similarity (vector mode) or by the fraction of query
//!    terms present in path + content (lexical fallback, `degraded`).
//! 4. Sort by score (desc), then entity id (asc).
//! 5. Truncate to `k`.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;
use crate::error::{HoloError, HoloResult};
use crate::models::{EntityKind, IndexedEntity};
use crate::store::{EntityCandidate, EntityStore};

/// Characters of entity content kept as a display snippet.
pub const SNIPPET_CHARS: usize = 240;

/// Lexical candidates fetched per requested result.
const LEXICAL_CANDIDATE_FACTOR: usize = 8;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "do", "does", "for", "how", "i", "in", "is", "me", "my", "of", "on",
    "or", "the", "to", "with",
];

/// Restricts a search by entity kind and/or source-path prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub kind: Option<EntityKind>,
    pub path_prefix: Option<String>,
}

impl SearchFilters {
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            path_prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, kind: EntityKind, source_path: &str) -> bool {
        if let Some(k) = self.kind {
            if k != kind {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !source_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entity_id: String,
    pub kind: EntityKind,
    pub source_path: String,
    /// Cosine similarity (vector mode) or term coverage (lexical mode).
    pub similarity: f64,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    /// True when the lexical fallback produced the hits.
    pub degraded: bool,
    /// Candidates skipped because their embedding was stale or missing.
    pub stale_excluded: usize,
}

/// Embedding-backed nearest-neighbour index.
pub struct VectorIndex<S: ?Sized> {
    store: Arc<S>,
    model_version: String,
    dims: usize,
}

impl<S: EntityStore + ?Sized> VectorIndex<S> {
    pub fn new(store: Arc<S>, model_version: impl Into<String>, dims: usize) -> Self {
        Self {
            store,
            model_version: model_version.into(),
            dims,
        }
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Insert or replace an entity without rebuilding anything else.
    ///
    /// Embeddings produced by the index's current model must have exactly
    /// `dims` finite components.
    pub async fn upsert(&self, entity: &IndexedEntity) -> HoloResult<()> {
        if entity.id.trim().is_empty() {
            return Err(HoloError::storage("entity id must not be empty"));
        }
        if let Some(vector) = &entity.embedding {
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(HoloError::storage(format!(
                    "embedding for {} contains non-finite values",
                    entity.id
                )));
            }
            if entity.model_version.as_deref() == Some(self.model_version.as_str())
                && vector.len() != self.dims
            {
                return Err(HoloError::storage(format!(
                    "embedding for {} has {} dims, model {} expects {}",
                    entity.id,
                    vector.len(),
                    self.model_version,
                    self.dims
                )));
            }
        }
        self.store.upsert_entity(entity).await
    }

    /// Soft-delete an entity. Returns `false` if it was absent or already deleted.
    pub async fn delete(&self, id: &str) -> HoloResult<bool> {
        self.store.delete_entity(id).await
    }

    /// Rank live entities by cosine similarity to `query_vector`.
    pub async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> HoloResult<SearchOutcome> {
        if k == 0 {
            return Ok(SearchOutcome::default());
        }
        if query_vector.len() != self.dims {
            return Err(HoloError::DegradedSearch {
                reason: format!(
                    "query vector has {} dims, index expects {}",
                    query_vector.len(),
                    self.dims
                ),
            });
        }

        let candidates = self.store.vector_candidates(filters).await?;
        let mut stale = 0usize;
        let mut hits = Vec::with_capacity(candidates.len());

        for cand in candidates {
            if !filters.matches(cand.kind, &cand.source_path) {
                continue;
            }
            let fresh = cand.model_version.as_deref() == Some(self.model_version.as_str())
                && cand.embedding.as_ref().map(|v| v.len()) == Some(self.dims);
            if !fresh {
                stale += 1;
                continue;
            }
            let vector = cand.embedding.as_deref().unwrap_or_default();
            let similarity = cosine_similarity(query_vector, vector) as f64;
            hits.push(to_hit(cand, similarity));
        }

        if stale > 0 {
            tracing::debug!(stale, model = %self.model_version, "excluded stale embeddings");
        }

        Ok(SearchOutcome {
            hits: rank_hits(hits, k),
            degraded: false,
            stale_excluded: stale,
        })
    }

    /// Keyword fallback used when the query could not be embedded.
    pub async fn lexical_search(
        &self,
        text: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> HoloResult<SearchOutcome> {
        let terms = query_terms(text);
        if terms.is_empty() || k == 0 {
            return Ok(SearchOutcome {
                hits: Vec::new(),
                degraded: true,
                stale_excluded: 0,
            });
        }

        let limit = k.saturating_mul(LEXICAL_CANDIDATE_FACTOR).max(50);
        let candidates = self.store.keyword_candidates(&terms, filters, limit).await?;

        let hits = candidates
            .into_iter()
            .filter(|c| filters.matches(c.kind, &c.source_path))
            .filter_map(|c| {
                let score = term_coverage(&terms, &c.source_path, &c.content);
                (score > 0.0).then(|| to_hit(c, score))
            })
            .collect();

        Ok(SearchOutcome {
            hits: rank_hits(hits, k),
            degraded: true,
            stale_excluded: 0,
        })
    }

    /// Ids of live entities whose embedding is missing or stale.
    pub async fn stale_entities(&self, limit: usize) -> HoloResult<Vec<String>> {
        let candidates = self.store.vector_candidates(&SearchFilters::default()).await?;
        let mut ids: Vec<String> = candidates
            .into_iter()
            .filter(|c| {
                c.model_version.as_deref() != Some(self.model_version.as_str())
                    || c.embedding.as_ref().map(|v| v.len()) != Some(self.dims)
            })
            .map(|c| c.entity_id)
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }
}

fn to_hit(cand: EntityCandidate, similarity: f64) -> SearchHit {
    SearchHit {
        snippet: snippet(&cand.content),
        entity_id: cand.entity_id,
        kind: cand.kind,
        source_path: cand.source_path,
        similarity,
    }
}

/// First [`SNIPPET_CHARS`] characters of `content`.
pub fn snippet(content: &str) -> String {
    content.chars().take(SNIPPET_CHARS).collect()
}

/// Sort by similarity (desc) then entity id (asc) and keep the top `k`.
///
/// Non-finite similarities sort last.
pub fn rank_hits(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        let sa = if a.similarity.is_finite() { a.similarity } else { f64::NEG_INFINITY };
        let sb = if b.similarity.is_finite() { b.similarity } else { f64::NEG_INFINITY };
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    hits.truncate(k);
    hits
}

/// Lowercased, de-duplicated query terms with stop words removed.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.len() >= 2 && !STOP_WORDS.contains(t))
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// Fraction of `terms` that occur in the path or content (case-insensitive).
pub fn term_coverage(terms: &[String], source_path: &str, content: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = format!("{}\n{}", source_path, content).to_lowercase();
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f64 / terms.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn hit(id: &str, sim: f64) -> SearchHit {
        SearchHit {
            entity_id: id.to_string(),
            kind: EntityKind::CodeSymbol,
            source_path: format!("src/{}.rs", id),
            similarity: sim,
            snippet: String::new(),
        }
    }

    #[test]
    fn test_rank_ties_broken_by_id() {
        let ranked = rank_hits(vec![hit("b", 0.5), hit("a", 0.5), hit("c", 0.9)], 10);
        let ids: Vec<&str> = ranked.iter().map(|h| h.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rank_truncates_and_sinks_nan() {
        let ranked = rank_hits(vec![hit("x", f64::NAN), hit("y", 0.1), hit("z", 0.2)], 2);
        let ids: Vec<&str> = ranked.iter().map(|h| h.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "y"]);
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(
            query_terms("Find the rate limiter, the RATE limiter!"),
            vec!["find", "rate", "limiter"]
        );
        assert!(query_terms("  a  ").is_empty());
    }

    #[test]
    fn test_term_coverage() {
        let terms = query_terms("rate limiter config");
        let cov = term_coverage(&terms, "src/limiter.rs", "pub struct RateLimiter");
        assert!((cov - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_filters() {
        let f = SearchFilters::kind(EntityKind::DocSection).with_prefix("docs/");
        assert!(f.matches(EntityKind::DocSection, "docs/a.md"));
        assert!(!f.matches(EntityKind::CodeSymbol, "docs/a.md"));
        assert!(!f.matches(EntityKind::DocSection, "src/a.md"));
    }

    async fn seeded_index() -> VectorIndex<InMemoryStore> {
        let index = VectorIndex::new(Arc::new(InMemoryStore::new()), "m1", 2);
        let entities = vec![
            IndexedEntity::new("a", EntityKind::CodeSymbol, "src/a.rs", "alpha limiter")
                .with_embedding(vec![1.0, 0.0], "m1"),
            IndexedEntity::new("b", EntityKind::CodeSymbol, "src/b.rs", "beta")
                .with_embedding(vec![0.0, 1.0], "m1"),
            IndexedEntity::new("c", EntityKind::DocSection, "docs/c.md", "gamma limiter")
                .with_embedding(vec![0.7, 0.7], "m1"),
            IndexedEntity::new("old", EntityKind::CodeSymbol, "src/old.rs", "old limiter")
                .with_embedding(vec![1.0, 0.0, 0.0], "m0"),
        ];
        for e in &entities {
            index.upsert(e).await.unwrap();
        }
        index
    }

    #[tokio::test]
    async fn test_search_excludes_stale_and_orders() {
        let index = seeded_index().await;
        let out = index
            .search(&[1.0, 0.0], 10, &SearchFilters::default())
            .await
            .unwrap();
        let ids: Vec<&str> = out.hits.iter().map(|h| h.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(out.stale_excluded, 1);
        assert!(!out.degraded);
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_dims() {
        let index = seeded_index().await;
        let bad = IndexedEntity::new("bad", EntityKind::CodeSymbol, "src/bad.rs", "x")
            .with_embedding(vec![1.0, 0.0, 0.0], "m1");
        assert!(index.upsert(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_hides_entity() {
        let index = seeded_index().await;
        assert!(index.delete("a").await.unwrap());
        assert!(!index.delete("a").await.unwrap());
        let out = index
            .search(&[1.0, 0.0], 10, &SearchFilters::default())
            .await
            .unwrap();
        assert!(out.hits.iter().all(|h| h.entity_id != "a"));
    }

    #[tokio::test]
    async fn test_lexical_fallback_is_degraded() {
        let index = seeded_index().await;
        let out = index
            .lexical_search("limiter", 10, &SearchFilters::kind(EntityKind::CodeSymbol))
            .await
            .unwrap();
        assert!(out.degraded);
        let ids: Vec<&str> = out.hits.iter().map(|h| h.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "old"]);
    }

    #[tokio::test]
    async fn test_lexical_keeps_full_match_among_many_partial() {
        let index = VectorIndex::new(Arc::new(InMemoryStore::new()), "m1", 2);
        for i in 0..60 {
            let id = format!("a{:02}", i);
            index
                .upsert(&IndexedEntity::new(&id, EntityKind::CodeSymbol, format!("src/gen/{}.rs", id), "rate"))
                .await
                .unwrap();
        }
        index
            .upsert(&IndexedEntity::new(
                "zz",
                EntityKind::CodeSymbol,
                "src/net/rate_limiter.rs",
                "rate limiter",
            ))
            .await
            .unwrap();

        let out = index
            .lexical_search("rate limiter", 5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(out.hits.len(), 5);
        assert_eq!(out.hits[0].entity_id, "zz");
        assert!((out.hits[0].similarity - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_stale_entities_listing() {
        let index = seeded_index().await;
        index
            .upsert(&IndexedEntity::new("new", EntityKind::CodeSymbol, "src/n.rs", "n"))
            .await
            .unwrap();
        assert_eq!(index.stale_entities(10).await.unwrap(), vec!["new", "old"]);
    }
}
