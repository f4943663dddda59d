//! Capability traits for the external reasoning engines and the
//! critical-complexity arbitration hook.
//!
//! Both engines are optional. When neither is available the orchestrator
//! falls back to [`rules_based_inference`], which summarizes retrieval hits
//! without any model call.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::index::SearchHit;
use crate::models::{Intent, Query};

/// Structured answer from a reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub result: String,
    /// Engine's self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    pub tokens_used: u64,
}

/// An external reasoning engine (fast pattern classifier or deep orchestrator).
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Run one inference. `budget` is advisory: the orchestrator enforces it
    /// with its own timeout regardless of what the engine does.
    async fn infer(&self, prompt: &str, budget: Duration) -> Result<Inference>;
}

/// Hook invoked when a query is estimated at `critical` complexity.
#[async_trait]
pub trait Arbiter: Send + Sync {
    async fn escalate(&self, query: &Query, reason: &str) -> Result<()>;
}

/// Build the prompt sent to either engine.
pub fn build_prompt(query: &Query, hits: &[SearchHit]) -> String {
    let mut prompt = format!(
        "Intent: {}\nQuestion: {}\n\nRelevant entities:\n",
        query.intent, query.text
    );
    for hit in hits.iter().take(8) {
        prompt.push_str(&format!(
            "- {} ({:.2}): {}\n",
            hit.source_path,
            hit.similarity,
            hit.snippet.replace('\n', " ")
        ));
    }
    prompt.push_str(
        "\nAnswer concisely. Respond as JSON: {\"answer\": string, \"confidence\": number between 0 and 1}.",
    );
    prompt
}

/// Model-free summary used when no engine is reachable.
///
/// Confidence is fixed at 0.3, below the default escalation threshold.
pub fn rules_based_inference(intent: Intent, hits: &[SearchHit]) -> Inference {
    let result = match hits.first() {
        None => format!("No indexed entities matched this {} query.", intent),
        Some(top) => {
            let mut paths: Vec<&str> = hits.iter().map(|h| h.source_path.as_str()).collect();
            paths.sort_unstable();
            paths.dedup();
            format!(
                "Best match: {} (similarity {:.2}). {} matching location(s): {}",
                top.source_path,
                top.similarity,
                paths.len(),
                paths.iter().take(5).copied().collect::<Vec<_>>().join(", ")
            )
        }
    };
    Inference {
        result,
        confidence: 0.3,
        tokens_used: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    fn hit(id: &str, path: &str, sim: f64) -> SearchHit {
        SearchHit {
            entity_id: id.to_string(),
            kind: EntityKind::CodeSymbol,
            source_path: path.to_string(),
            similarity: sim,
            snippet: "fn limit()".to_string(),
        }
    }

    #[test]
    fn test_rules_based_empty() {
        let inf = rules_based_inference(Intent::General, &[]);
        assert!(inf.result.contains("No indexed entities"));
        assert_eq!(inf.tokens_used, 0);
    }

    #[test]
    fn test_rules_based_dedups_paths() {
        let hits = vec![
            hit("a", "src/limiter.rs", 0.9),
            hit("b", "src/limiter.rs", 0.8),
            hit("c", "src/gate.rs", 0.5),
        ];
        let inf = rules_based_inference(Intent::CodeLocation, &hits);
        assert!(inf.result.starts_with("Best match: src/limiter.rs"));
        assert!(inf.result.contains("2 matching location(s)"));
    }

    #[test]
    fn test_prompt_mentions_intent_and_paths() {
        let q = Query::new("where is the limiter", Intent::CodeLocation, 0.9);
        let prompt = build_prompt(&q, &[hit("a", "src/limiter.rs", 0.9)]);
        assert!(prompt.contains("CODE_LOCATION"));
        assert!(prompt.contains("src/limiter.rs"));
    }
}
