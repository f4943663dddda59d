//! Reasoning engine backends.
//!
//! Only Ollama's generate API is supported. The model is asked for a JSON
//! object `{"answer": ..., "confidence": ...}`; a reply that is not valid
//! JSON is kept verbatim with a low confidence so the orchestrator still
//! escalates it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

pub use holo_index_core::engine::{Arbiter, Inference, ReasoningEngine};

use crate::config::{EngineConfig, ReasoningConfig};

/// Confidence assigned to free-text replies.
const UNSTRUCTURED_CONFIDENCE: f64 = 0.2;

pub struct OllamaEngine {
    name: String,
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaEngine {
    pub fn new(name: &str, config: &EngineConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("reasoning.{}.model required for Ollama provider", name))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            name: name.to_string(),
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct StructuredAnswer {
    answer: String,
    confidence: f64,
}

/// Turn a model reply into an [`Inference`].
pub fn parse_answer(reply: &str, tokens_used: u64) -> Inference {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    match serde_json::from_str::<StructuredAnswer>(trimmed) {
        Ok(s) => Inference {
            result: s.answer,
            confidence: if s.confidence.is_finite() {
                s.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            tokens_used,
        },
        Err(_) => Inference {
            result: reply.trim().to_string(),
            confidence: UNSTRUCTURED_CONFIDENCE,
            tokens_used,
        },
    }
}

#[async_trait]
impl ReasoningEngine for OllamaEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn infer(&self, prompt: &str, budget: Duration) -> Result<Inference> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .timeout(budget)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow!(
                    "Ollama generate failed (is Ollama running at {}?): {}",
                    self.url,
                    e
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body);
        }

        let reply: GenerateResponse = response.json().await?;
        Ok(parse_answer(
            &reply.response,
            reply.prompt_eval_count + reply.eval_count,
        ))
    }
}

/// Build an engine from config, or `None` when it is disabled.
pub fn create_engine(name: &str, config: &EngineConfig) -> Result<Option<Arc<dyn ReasoningEngine>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "ollama" => Ok(Some(Arc::new(OllamaEngine::new(name, config)?))),
        other => bail!("Unknown reasoning provider: {}", other),
    }
}

/// The fast and deep engines, either of which may be absent.
#[derive(Clone, Default)]
pub struct Engines {
    pub fast: Option<Arc<dyn ReasoningEngine>>,
    pub deep: Option<Arc<dyn ReasoningEngine>>,
    pub arbiter: Option<Arc<dyn Arbiter>>,
}

impl Engines {
    pub fn from_config(config: &ReasoningConfig) -> Result<Self> {
        Ok(Self {
            fast: create_engine("fast", &config.fast)?,
            deep: create_engine("deep", &config.deep)?,
            arbiter: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_answer() {
        let inf = parse_answer(r#"{"answer": "see limiter.rs", "confidence": 0.82}"#, 40);
        assert_eq!(inf.result, "see limiter.rs");
        assert!((inf.confidence - 0.82).abs() < 1e-12);
        assert_eq!(inf.tokens_used, 40);
    }

    #[test]
    fn test_parse_fenced_answer_and_clamp() {
        let inf = parse_answer("```json\n{\"answer\": \"x\", \"confidence\": 7}\n```", 0);
        assert_eq!(inf.result, "x");
        assert_eq!(inf.confidence, 1.0);
    }

    #[test]
    fn test_parse_free_text() {
        let inf = parse_answer("It is in src/limiter.rs", 3);
        assert_eq!(inf.result, "It is in src/limiter.rs");
        assert_eq!(inf.confidence, UNSTRUCTURED_CONFIDENCE);
    }

    #[test]
    fn test_disabled_engine_is_none() {
        let engines = Engines::from_config(&ReasoningConfig::default()).unwrap();
        assert!(engines.fast.is_none());
        assert!(engines.deep.is_none());
    }
}
