//! Embedding providers.
//!
//! Implementations of [`Embedder`]:
//! - **[`DisabledEmbedder`]**: always fails; every search takes the lexical path.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//! - **[`OpenAIEmbedder`]**: `POST https://api.openai.com/v1/embeddings`.
//! - **`LocalEmbedder`**: fastembed, behind `--features local-embeddings-fastembed`.
//!
//! Providers make exactly one request per call. Retries live in
//! [`embed_with_retry`] so that indexing and query serving share one bounded
//! policy:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors and per-attempt timeouts → retry
//! - backoff doubles from the base delay, capped at 2^5

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

pub use holo_index_core::embedding::{DisabledEmbedder, Embedder};

use crate::config::EmbeddingConfig;

/// A request the provider rejected; retrying cannot help.
#[derive(Debug, thiserror::Error)]
#[error("{provider} rejected request ({status}): {body}")]
pub struct PermanentError {
    pub provider: &'static str,
    pub status: u16,
    pub body: String,
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

async fn post_json(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 || status.is_server_error() {
        bail!("{} API error {}: {}", provider, status, body);
    }
    Err(PermanentError {
        provider,
        status: status.as_u16(),
        body,
    }
    .into())
}

fn parse_vectors(values: &[serde_json::Value], what: &str) -> Result<Vec<Vec<f32>>> {
    values
        .iter()
        .map(|v| {
            v.as_array()
                .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", what))
                .map(|arr| arr.iter().map(|x| x.as_f64().unwrap_or(0.0) as f32).collect())
        })
        .collect()
}

fn expect_dims(vectors: &[Vec<f32>], dims: usize, model: &str) -> Result<()> {
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        bail!(
            "model {} returned {} dims, configured for {}",
            model,
            bad.len(),
            dims
        );
    }
    Ok(())
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_version(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);
        let json = post_json("Ollama", request).await.map_err(|e| {
            if e.is::<PermanentError>() {
                e
            } else {
                anyhow!("Ollama embedding failed (is Ollama running at {}?): {}", self.url, e)
            }
        })?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;
        let vectors = parse_vectors(embeddings, "Ollama")?;
        expect_dims(&vectors, self.dims, &self.model)?;
        Ok(vectors)
    }
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIEmbedder {
    /// Requires `OPENAI_API_KEY` in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: http_client(config)?,
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_version(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let json = post_json("OpenAI", request).await?;
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;
        let embeddings: Vec<serde_json::Value> = data
            .iter()
            .map(|item| item.get("embedding").cloned().unwrap_or_default())
            .collect();
        let vectors = parse_vectors(&embeddings, "OpenAI")?;
        expect_dims(&vectors, self.dims, &self.model)?;
        Ok(vectors)
    }
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Validate the name up front.
        fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_version(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let slot = Arc::clone(&self.model);
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model(&name)?)
                        .with_show_download_progress(false),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model unavailable"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Create the configured embedder.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings-fastembed`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Bounded retry policy for embedding calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Policy for bulk indexing.
    pub fn indexing(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            attempt_timeout: Duration::from_secs(config.timeout_secs),
            base_backoff: Duration::from_secs(1),
        }
    }

    /// Policy for embedding a query while a caller waits.
    pub fn query(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            attempt_timeout: Duration::from_millis(config.query_timeout_ms),
            base_backoff: Duration::from_millis(50),
        }
    }
}

/// Call `embed_batch` with a per-attempt timeout and exponential backoff.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut last_err = None;
    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let factor = 1u32 << (attempt - 1).min(5);
            tokio::time::sleep(policy.base_backoff * factor).await;
        }
        match tokio::time::timeout(policy.attempt_timeout, embedder.embed_batch(texts)).await {
            Ok(Ok(vectors)) => {
                if vectors.len() != texts.len() {
                    bail!(
                        "embedding provider returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    );
                }
                return Ok(vectors);
            }
            Ok(Err(e)) if e.is::<PermanentError>() => return Err(e),
            Ok(Err(e)) => {
                tracing::debug!(attempt, error = %e, "embedding attempt failed");
                last_err = Some(e);
            }
            Err(_) => {
                tracing::debug!(attempt, "embedding attempt timed out");
                last_err = Some(anyhow!(
                    "embedding timed out after {}ms",
                    policy.attempt_timeout.as_millis()
                ));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
}

/// Embed one text under `policy`.
pub async fn embed_one(embedder: &dyn Embedder, text: &str, policy: RetryPolicy) -> Result<Vec<f32>> {
    embed_with_retry(embedder, &[text.to_string()], policy)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}
