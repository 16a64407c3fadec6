//! Hybrid retrieval: BM25 fused with dense-vector cosine similarity.
//!
//! The hybrid searcher wraps the BM25 searcher, an embedder, and the
//! per-document readiness tracker. Until a document's embeddings are ready
//! (or whenever the embedder fails), it silently degrades to BM25, so
//! retrieval quality only ever improves as vectors arrive.
//!
//! Two fusion methods:
//! - **Reciprocal Rank Fusion** (default): each chunk sums `1 / (k + rank)`
//!   over the BM25 and cosine rankings it appears in.
//! - **Weighted**: max-normalized BM25 combined with cosine mapped to
//!   `[0, 1]`, weighted 0.3 / 0.7 by default.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::embedding::{Embedder, EmbeddingStatus};
use crate::models::{Chunk, Index, DEFAULT_MAX_TOKENS};
use crate::search::{Bm25Searcher, ScoredChunk, Searcher, NO_RELEVANT_EXCERPTS};

/// Default `k` constant for Reciprocal Rank Fusion.
pub const DEFAULT_RRF_K: usize = 60;

/// How BM25 and embedding rankings are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMethod {
    Rrf,
    Weighted,
}

impl FusionMethod {
    /// Parse the CLI flag value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rrf" => Ok(Self::Rrf),
            "weighted" => Ok(Self::Weighted),
            other => bail!("unknown fusion method: '{}' (use 'rrf' or 'weighted')", other),
        }
    }
}

/// Tuning for hybrid scoring.
#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub fusion: FusionMethod,
    /// BM25 share for weighted fusion.
    pub bm25_weight: f64,
    /// Embedding share for weighted fusion.
    pub embed_weight: f64,
    /// RRF rank-smoothing constant.
    pub rrf_k: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            fusion: FusionMethod::Rrf,
            bm25_weight: 0.3,
            embed_weight: 0.7,
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

impl HybridConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.bm25_weight) {
            bail!("bm25 weight must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.embed_weight) {
            bail!("embed weight must be in [0.0, 1.0]");
        }
        if self.rrf_k == 0 {
            bail!("rrf k must be >= 1");
        }
        Ok(())
    }
}

/// Cosine similarity between two vectors, in `[-1, 1]`.
///
/// Mismatched lengths and zero-norm inputs map to 0 rather than an error.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Combines BM25 keyword scores with embedding cosine similarity.
pub struct HybridSearcher {
    embedder: Arc<dyn Embedder>,
    status: Arc<EmbeddingStatus>,
    bm25: Bm25Searcher,
    config: HybridConfig,
}

impl HybridSearcher {
    pub fn new(embedder: Arc<dyn Embedder>, status: Arc<EmbeddingStatus>) -> Self {
        Self {
            embedder,
            status,
            bm25: Bm25Searcher::new(),
            config: HybridConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HybridConfig) -> Self {
        self.config = config;
        self
    }

    /// Weighted fusion. Chunks without embeddings contribute only their
    /// (normalized, weighted) BM25 score.
    fn score_weighted<'a>(
        &self,
        index: &'a Index,
        query: &str,
        query_embed: &[f32],
    ) -> Vec<ScoredChunk<'a>> {
        let bm25_scored = self.bm25.score_chunks(index, query);

        let max_bm25 = bm25_scored.iter().map(|sc| sc.score).fold(0.0, f64::max);
        let mut bm25_map: HashMap<&str, f64> = HashMap::with_capacity(bm25_scored.len());
        for sc in &bm25_scored {
            let normalized = if max_bm25 > 0.0 { sc.score / max_bm25 } else { 0.0 };
            bm25_map.insert(sc.chunk.chunk_id.as_str(), normalized);
        }

        let mut results: Vec<ScoredChunk<'a>> = Vec::with_capacity(index.chunks.len());
        for chunk in &index.chunks {
            let Some(embedding) = chunk.embedding.as_ref() else {
                if let Some(&bm25_score) = bm25_map.get(chunk.chunk_id.as_str()) {
                    if bm25_score > 0.0 {
                        results.push(ScoredChunk {
                            chunk,
                            score: bm25_score * self.config.bm25_weight,
                        });
                    }
                }
                continue;
            };

            // Cosine is in [-1, 1]; shift to [0, 1] before weighting.
            let embed_score = (cosine_similarity(query_embed, embedding) + 1.0) / 2.0;
            let bm25_score = bm25_map.get(chunk.chunk_id.as_str()).copied().unwrap_or(0.0);
            let hybrid =
                self.config.bm25_weight * bm25_score + self.config.embed_weight * embed_score;

            if hybrid > 0.0 {
                results.push(ScoredChunk { chunk, score: hybrid });
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// Reciprocal Rank Fusion over the BM25 ranking (positive scores only)
    /// and the cosine ranking (embedded chunks only). Ranks are 1-based;
    /// a chunk absent from a ranking contributes nothing for it.
    fn score_rrf<'a>(
        &self,
        index: &'a Index,
        query: &str,
        query_embed: &[f32],
    ) -> Vec<ScoredChunk<'a>> {
        let k = self.config.rrf_k as f64;

        let bm25_ranked = self.bm25.score_chunks(index, query);

        let mut embed_ranked: Vec<(&Chunk, f64)> = index
            .chunks
            .iter()
            .filter_map(|c| {
                c.embedding
                    .as_ref()
                    .map(|e| (c, cosine_similarity(query_embed, e)))
            })
            .collect();
        embed_ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut fused: HashMap<&str, f64> = HashMap::new();
        for (rank, sc) in bm25_ranked.iter().enumerate() {
            *fused.entry(sc.chunk.chunk_id.as_str()).or_insert(0.0) +=
                1.0 / (k + (rank + 1) as f64);
        }
        for (rank, (chunk, _)) in embed_ranked.iter().enumerate() {
            *fused.entry(chunk.chunk_id.as_str()).or_insert(0.0) +=
                1.0 / (k + (rank + 1) as f64);
        }

        // Walk chunks in insertion order so equal fused scores stay stable.
        let mut results: Vec<ScoredChunk<'a>> = index
            .chunks
            .iter()
            .filter_map(|c| {
                fused
                    .get(c.chunk_id.as_str())
                    .map(|&score| ScoredChunk { chunk: c, score })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }
}

#[async_trait]
impl Searcher for HybridSearcher {
    async fn search(&self, index: &Index, query: &str, max_tokens: i64) -> String {
        let max_tokens = if max_tokens <= 0 {
            DEFAULT_MAX_TOKENS
        } else {
            max_tokens
        };

        // Until this document's embeddings land, BM25 carries the query.
        if !self.status.is_ready(&index.doc_id) {
            return self.bm25.search(index, query, max_tokens).await;
        }

        if !index.chunks.iter().any(|c| c.embedding.is_some()) {
            return self.bm25.search(index, query, max_tokens).await;
        }

        let query_embed = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "query embedding failed, falling back to BM25");
                return self.bm25.search(index, query, max_tokens).await;
            }
        };

        let scored = match self.config.fusion {
            FusionMethod::Rrf => self.score_rrf(index, query, &query_embed),
            FusionMethod::Weighted => self.score_weighted(index, query, &query_embed),
        };

        if scored.is_empty() {
            return NO_RELEVANT_EXCERPTS.to_string();
        }

        self.bm25.build_response(&scored, max_tokens)
    }
}
