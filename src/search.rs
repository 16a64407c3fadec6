//! BM25 full-text search over indexed chunks.
//!
//! Scoring uses Okapi BM25 with the Lucene-style smoothed IDF
//! `ln(1 + (N - df + 0.5) / (df + 0.5))`, term-frequency saturation, and
//! document-length normalization. Chunks containing code get a small boost.
//! Responses are assembled under an approximate token budget with
//! source-linked excerpts.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{Chunk, Index, DEFAULT_MAX_TOKENS};
use crate::text::normalize_terms;

/// Returned when no chunk scores above zero for the query.
pub const NO_RELEVANT_EXCERPTS: &str = "No relevant excerpts found in the indexed document.";

/// Returned when the token budget admits no excerpt at all.
pub const TOKEN_LIMIT_TOO_SMALL: &str = "Token limit too small to return any excerpt.";

const EXCERPT_SEPARATOR: &str = "\n--------------------------------\n\n";

/// Minimum excerpt body retained when trimming to fit the budget.
const MIN_TRIMMED_BODY_CHARS: usize = 80;

/// How queries are matched against an indexed document.
#[async_trait]
pub trait Searcher: Send + Sync {
    /// Return the top-scoring excerpts that fit within `max_tokens`
    /// (approximate; zero or negative selects the default budget).
    async fn search(&self, index: &Index, query: &str, max_tokens: i64) -> String;
}

/// Tuning parameters for BM25 scoring.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Config {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Length normalization strength.
    pub b: f64,
    /// Multiplier applied to positive scores of chunks containing code.
    pub code_boost: f64,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            code_boost: 1.2,
        }
    }
}

/// A chunk paired with its relevance score.
pub(crate) struct ScoredChunk<'a> {
    pub chunk: &'a Chunk,
    pub score: f64,
}

/// Estimates token count (~4 bytes per token, rounded up).
pub(crate) fn approx_tokens(s: &str) -> i64 {
    ((s.len() + 3) / 4) as i64
}

fn excerpt_title(chunk: &Chunk) -> String {
    // With a breadcrumb of depth > 1, show "parent › leaf"; otherwise the
    // leaf title alone.
    if chunk.heading_path.len() > 1 {
        let n = chunk.heading_path.len();
        format!("{} › {}", chunk.heading_path[n - 2], chunk.heading_path[n - 1])
    } else {
        chunk.title.clone()
    }
}

fn format_excerpt_with_text(chunk: &Chunk, text: &str) -> String {
    format!(
        "### {}\nSource: {}#L{}-L{}\n\n{}\n",
        excerpt_title(chunk),
        chunk.path,
        chunk.start_line,
        chunk.end_line,
        text
    )
}

/// Markdown-formatted excerpt with a source link.
fn format_excerpt(chunk: &Chunk) -> String {
    format_excerpt_with_text(chunk, &chunk.text)
}

/// Inverse document frequency; rare terms are more discriminating.
fn calc_idf(num_chunks: f64, doc_freq: f64) -> f64 {
    (1.0 + (num_chunks - doc_freq + 0.5) / (doc_freq + 0.5)).ln()
}

/// BM25 term-frequency component with saturation and length normalization.
fn calc_tf(term_count: f64, doc_len: f64, avg_len: f64, k1: f64, b: f64) -> f64 {
    let denominator = term_count + k1 * (1.0 - b + b * (doc_len / avg_len));
    if denominator == 0.0 {
        return 0.0;
    }
    (term_count * (k1 + 1.0)) / denominator
}

/// BM25-ranked retrieval. The default searcher when embeddings are
/// disabled, and the fallback inside the hybrid searcher.
pub struct Bm25Searcher {
    config: Bm25Config,
}

impl Bm25Searcher {
    pub fn new() -> Self {
        Self {
            config: Bm25Config::default(),
        }
    }

    fn score_chunk(
        &self,
        chunk: &Chunk,
        query_term_counts: &HashMap<&str, usize>,
        doc_freq: &HashMap<String, usize>,
        num_chunks: f64,
        avg_len: f64,
    ) -> f64 {
        let mut tf: HashMap<&str, usize> = HashMap::with_capacity(chunk.terms.len());
        for term in &chunk.terms {
            *tf.entry(term.as_str()).or_insert(0) += 1;
        }

        let doc_len = chunk.terms.len() as f64;
        let cfg = self.config;
        let mut score = 0.0;

        for (term, query_freq) in query_term_counts {
            let df = doc_freq.get(*term).copied().unwrap_or(0) as f64;
            if df == 0.0 {
                continue; // Term not in this document at all.
            }

            let idf = calc_idf(num_chunks, df);
            let tf_score = calc_tf(
                tf.get(*term).copied().unwrap_or(0) as f64,
                doc_len,
                avg_len,
                cfg.k1,
                cfg.b,
            );
            score += idf * tf_score * (*query_freq as f64);
        }

        if chunk.has_code && score > 0.0 {
            score *= cfg.code_boost;
        }

        score
    }

    /// Rank all chunks of `index` against `query`, best first. Only
    /// positive-scoring chunks are returned; ties keep insertion order.
    pub(crate) fn score_chunks<'a>(&self, index: &'a Index, query: &str) -> Vec<ScoredChunk<'a>> {
        let query_terms = normalize_terms(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut query_term_counts: HashMap<&str, usize> = HashMap::with_capacity(query_terms.len());
        for term in &query_terms {
            *query_term_counts.entry(term.as_str()).or_insert(0) += 1;
        }

        let num_chunks = index.num_chunks as f64;
        if num_chunks == 0.0 {
            return Vec::new();
        }

        let avg_len =
            index.chunks.iter().map(|c| c.terms.len() as f64).sum::<f64>() / num_chunks;

        let mut results: Vec<ScoredChunk<'a>> = Vec::with_capacity(index.chunks.len());
        for chunk in &index.chunks {
            let score =
                self.score_chunk(chunk, &query_term_counts, &index.doc_freq, num_chunks, avg_len);
            if score > 0.0 {
                results.push(ScoredChunk { chunk, score });
            }
        }

        // Stable sort keeps insertion order for equal scores.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        results
    }

    /// Assemble ranked excerpts into a response under the token budget.
    pub(crate) fn build_response(&self, scored: &[ScoredChunk<'_>], max_tokens: i64) -> String {
        let mut out = String::new();
        let mut tokens_used: i64 = 0;
        let mut excerpt_count = 0usize;

        for sc in scored {
            let mut excerpt = format_excerpt(sc.chunk);
            let mut tokens = approx_tokens(&excerpt);

            // Only the first excerpt gets trimmed to fit; later ones must
            // fit wholly or are skipped.
            if excerpt_count == 0 && tokens > max_tokens {
                excerpt = self.trim_excerpt(sc.chunk, max_tokens);
                tokens = approx_tokens(&excerpt);
            }

            if tokens_used + tokens > max_tokens {
                break;
            }

            if excerpt_count > 0 {
                out.push_str(EXCERPT_SEPARATOR);
            }

            out.push_str(&excerpt);
            tokens_used += tokens;
            excerpt_count += 1;

            if tokens_used >= max_tokens {
                break;
            }
        }

        if excerpt_count == 0 {
            return TOKEN_LIMIT_TOO_SMALL.to_string();
        }

        out
    }

    /// Shorten a chunk's body so the formatted excerpt fits the budget,
    /// never below [`MIN_TRIMMED_BODY_CHARS`] characters of body. The cut
    /// pays for the appended ellipsis suffix, so an unfloored trim lands
    /// within the budget.
    fn trim_excerpt(&self, chunk: &Chunk, max_tokens: i64) -> String {
        const ELLIPSIS_SUFFIX: &str = "\n…";

        let excerpt = format_excerpt(chunk);
        let over = approx_tokens(&excerpt) - max_tokens;

        let runes: Vec<char> = chunk.text.chars().collect();
        let mut cut = runes.len() as i64 - (over * 4 + ELLIPSIS_SUFFIX.len() as i64);

        if cut < MIN_TRIMMED_BODY_CHARS as i64 {
            cut = (MIN_TRIMMED_BODY_CHARS).min(runes.len()) as i64;
        }
        if (cut as usize) < runes.len() {
            let mut trimmed: String = runes[..cut as usize].iter().collect();
            trimmed.push_str(ELLIPSIS_SUFFIX);
            return format_excerpt_with_text(chunk, &trimmed);
        }

        excerpt
    }
}

impl Default for Bm25Searcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Searcher for Bm25Searcher {
    async fn search(&self, index: &Index, query: &str, max_tokens: i64) -> String {
        let max_tokens = if max_tokens <= 0 {
            DEFAULT_MAX_TOKENS
        } else {
            max_tokens
        };

        let scored = self.score_chunks(index, query);
        if scored.is_empty() {
            return NO_RELEVANT_EXCERPTS.to_string();
        }

        self.build_response(&scored, max_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CACHE_VERSION;
    use chrono::Utc;
    use std::collections::HashSet;

    fn make_chunk(doc_id: &str, n: usize, title: &str, text: &str, has_code: bool) -> Chunk {
        let start = n * 10 + 1;
        let end = start + 9;
        Chunk {
            chunk_id: format!("{}:{}-{}", doc_id, start, end),
            doc_id: doc_id.to_string(),
            path: "docs/guide.md".to_string(),
            title: title.to_string(),
            heading_path: vec![title.to_string()],
            start_line: start,
            end_line: end,
            text: text.to_string(),
            terms: normalize_terms(text),
            code_blocks: Vec::new(),
            table_rows: Vec::new(),
            has_code,
            embedding: None,
        }
    }

    fn make_index(chunks: Vec<Chunk>) -> Index {
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for chunk in &chunks {
            let distinct: HashSet<&str> = chunk.terms.iter().map(String::as_str).collect();
            for term in distinct {
                *doc_freq.entry(term.to_string()).or_insert(0) += 1;
            }
        }
        Index {
            doc_id: "feedbeeffeedbeef".to_string(),
            path: "docs/guide.md".to_string(),
            source_url: None,
            file_hash: "00".repeat(32),
            indexed_at: Utc::now(),
            num_chunks: chunks.len(),
            chunks,
            doc_freq,
            version: CACHE_VERSION,
        }
    }

    fn three_section_index() -> Index {
        make_index(vec![
            make_chunk(
                "feedbeeffeedbeef",
                0,
                "Introduction",
                "Welcome overview text without special vocabulary",
                false,
            ),
            make_chunk(
                "feedbeeffeedbeef",
                1,
                "Consumer Config",
                "The consumer reads messages. A consumer must be configured before start.",
                false,
            ),
            make_chunk(
                "feedbeeffeedbeef",
                2,
                "Producer Setup",
                "The producer publishes messages to the stream",
                false,
            ),
        ])
    }

    #[tokio::test]
    async fn test_ranking_places_best_chunk_first() {
        let index = three_section_index();
        let searcher = Bm25Searcher::new();

        let response = searcher.search(&index, "consumer configuration", 1000).await;
        assert!(response.starts_with("### Consumer Config"));
        assert!(response.contains("Source: docs/guide.md#L11-L20"));
    }

    #[tokio::test]
    async fn test_no_match_returns_fixed_message() {
        let index = three_section_index();
        let searcher = Bm25Searcher::new();

        let response = searcher.search(&index, "zeppelin", 500).await;
        assert_eq!(response, NO_RELEVANT_EXCERPTS);
    }

    #[tokio::test]
    async fn test_empty_query_returns_fixed_message() {
        let index = three_section_index();
        let searcher = Bm25Searcher::new();

        assert_eq!(searcher.search(&index, "", 500).await, NO_RELEVANT_EXCERPTS);
        // All-stopword queries normalize to nothing as well.
        assert_eq!(
            searcher.search(&index, "the of and", 500).await,
            NO_RELEVANT_EXCERPTS
        );
    }

    #[tokio::test]
    async fn test_deterministic_responses() {
        let index = three_section_index();
        let searcher = Bm25Searcher::new();

        let a = searcher.search(&index, "consumer messages", 300).await;
        let b = searcher.search(&index, "consumer messages", 300).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_unrelated_chunk_does_not_change_top_result() {
        let mut index = three_section_index();
        let searcher = Bm25Searcher::new();
        let before = searcher.search(&index, "consumer configuration", 1000).await;
        let top_before = before.lines().next().unwrap().to_string();

        let extra = make_chunk(
            "feedbeeffeedbeef",
            3,
            "Appendix",
            "Completely unrelated glossary entries about networking hardware",
            false,
        );
        let distinct: HashSet<&str> = extra.terms.iter().map(String::as_str).collect();
        for term in distinct {
            *index.doc_freq.entry(term.to_string()).or_insert(0) += 1;
        }
        index.chunks.push(extra);
        index.num_chunks += 1;

        let after = searcher.search(&index, "consumer configuration", 1000).await;
        assert_eq!(after.lines().next().unwrap(), top_before);
    }

    #[tokio::test]
    async fn test_code_boost_breaks_tie() {
        let index = make_index(vec![
            make_chunk("feedbeeffeedbeef", 0, "Plain", "retry logic explained here", false),
            make_chunk("feedbeeffeedbeef", 1, "Snippet", "retry logic explained here", true),
        ]);
        let searcher = Bm25Searcher::new();

        let response = searcher.search(&index, "retry", 1000).await;
        assert!(response.starts_with("### Snippet"));
    }

    #[tokio::test]
    async fn test_budget_trims_first_excerpt() {
        let long_text = "consumer settings detail ".repeat(70); // ~1750 chars
        let index = make_index(vec![make_chunk(
            "feedbeeffeedbeef",
            0,
            "Consumer Config",
            &long_text,
            false,
        )]);
        let searcher = Bm25Searcher::new();

        let response = searcher.search(&index, "consumer", 50).await;
        assert!(response.contains("…"), "trimmed body should end with ellipsis");
        // Budget plus a little formatting slack.
        assert!(approx_tokens(&response) <= 65, "got {}", approx_tokens(&response));
    }

    #[tokio::test]
    async fn test_budget_too_small_for_any_excerpt() {
        let long_text = "consumer settings detail ".repeat(70);
        let index = make_index(vec![make_chunk(
            "feedbeeffeedbeef",
            0,
            "Consumer Config",
            &long_text,
            false,
        )]);
        let searcher = Bm25Searcher::new();

        // The 80-char body floor keeps even a maximally trimmed excerpt
        // above a 10-token budget.
        let response = searcher.search(&index, "consumer", 10).await;
        assert_eq!(response, TOKEN_LIMIT_TOO_SMALL);
    }

    #[tokio::test]
    async fn test_budget_admits_single_whole_excerpt() {
        let text_a = "alpha consumer notes ".repeat(40); // ~840 chars ≈ 210 tokens
        let text_b = "beta consumer notes ".repeat(40);
        let index = make_index(vec![
            make_chunk("feedbeeffeedbeef", 0, "Alpha", &text_a, false),
            make_chunk("feedbeeffeedbeef", 1, "Beta", &text_b, false),
        ]);
        let searcher = Bm25Searcher::new();

        let response = searcher.search(&index, "consumer", 250).await;
        // Second excerpt cannot fit wholly; no separator present.
        assert!(!response.contains("--------------------------------"));
    }

    #[tokio::test]
    async fn test_excerpts_joined_with_separator() {
        let index = three_section_index();
        let searcher = Bm25Searcher::new();

        let response = searcher.search(&index, "messages", 1000).await;
        assert!(response.contains(EXCERPT_SEPARATOR));
    }

    #[tokio::test]
    async fn test_breadcrumb_title_uses_parent_and_leaf() {
        let mut chunk = make_chunk("feedbeeffeedbeef", 0, "Durable Consumers", "consumer details", false);
        chunk.heading_path = vec![
            "Guide".to_string(),
            "Consumers".to_string(),
            "Durable Consumers".to_string(),
        ];
        let index = make_index(vec![chunk]);
        let searcher = Bm25Searcher::new();

        let response = searcher.search(&index, "consumer", 500).await;
        assert!(response.starts_with("### Consumers › Durable Consumers"));
    }

    #[tokio::test]
    async fn test_zero_max_tokens_uses_default() {
        let index = three_section_index();
        let searcher = Bm25Searcher::new();

        let with_zero = searcher.search(&index, "consumer", 0).await;
        let with_default = searcher.search(&index, "consumer", DEFAULT_MAX_TOKENS).await;
        assert_eq!(with_zero, with_default);
    }

    #[test]
    fn test_idf_decreases_with_document_frequency() {
        let rare = calc_idf(100.0, 1.0);
        let common = calc_idf(100.0, 90.0);
        assert!(rare > common);
        assert!(common > 0.0);
    }

    #[test]
    fn test_approx_tokens_rounds_up() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abc"), 1);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }
}
