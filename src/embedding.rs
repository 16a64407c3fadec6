//! Vector embedding generation and per-document readiness tracking.
//!
//! Embeddings are generated asynchronously after document loading, so
//! queries fall back to BM25 until a document's vectors are ready. The
//! [`Embedder`] trait abstracts the inference endpoint; the production
//! implementation talks to a local Ollama server.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Settings for the embedding client.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Ollama server URL.
    pub host: String,
    /// Embedding model name.
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
        }
    }
}

/// Generates vector embeddings for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts, preserving input order.
    /// An empty input yields an empty output.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Whether the embedding service is reachable.
    async fn available(&self) -> bool;
}

/// Requests are chunked so a large batch never overwhelms the endpoint.
const OLLAMA_SUB_BATCH: usize = 10;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// [`Embedder`] backed by the Ollama HTTP API.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        reqwest::Url::parse(&config.host).context("parse ollama host")?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model,
        })
    }

    async fn embed_sub_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.host))
            .json(&body)
            .send()
            .await
            .context("ollama embed request")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("ollama embed: HTTP {}: {}", status, detail);
        }

        let parsed: EmbedResponse = response.json().await.context("parse ollama response")?;
        if parsed.embeddings.len() != texts.len() {
            bail!(
                "ollama returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            );
        }

        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("ollama returned no embeddings"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(texts.len());
        for sub in texts.chunks(OLLAMA_SUB_BATCH) {
            results.extend(self.embed_sub_batch(sub).await?);
        }
        Ok(results)
    }

    async fn available(&self) -> bool {
        self.client
            .get(format!("{}/api/version", self.host))
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Tracks whether embeddings are ready per document, so hybrid search knows
/// when to use vectors instead of BM25 alone.
///
/// Unknown documents default to not-ready. `set_ready` must only be called
/// after every chunk embedding has been assigned and persisted.
pub struct EmbeddingStatus {
    ready: RwLock<HashSet<String>>,
}

impl EmbeddingStatus {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(HashSet::new()),
        }
    }

    pub fn is_ready(&self, doc_id: &str) -> bool {
        self.ready.read().expect("status lock poisoned").contains(doc_id)
    }

    pub fn set_ready(&self, doc_id: &str) {
        self.ready
            .write()
            .expect("status lock poisoned")
            .insert(doc_id.to_string());
    }

    /// Drops the ready flag, e.g. when a document is re-indexed.
    pub fn clear(&self, doc_id: &str) {
        self.ready.write().expect("status lock poisoned").remove(doc_id);
    }
}

impl Default for EmbeddingStatus {
    fn default() -> Self {
        Self::new()
    }
}
