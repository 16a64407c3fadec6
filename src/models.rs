//! Core data types used throughout docdex.
//!
//! These types represent the documents and chunks that flow through the
//! indexing and retrieval pipeline. The data lifecycle is:
//!
//! ```text
//! path/URL → parse() → Chunk* → Index → cache (memory + disk JSON)
//!                                  ↓
//!                          embed() → Chunk.embedding
//!                                  ↓
//!                         search() → token-bounded excerpts
//! ```
//!
//! A [`Chunk`] is immutable once produced, except for its `embedding`, which
//! is filled in exactly once after asynchronous computation. An [`Index`] is
//! the fully parsed form of one source document; it is persisted as a single
//! pretty-printed JSON blob and reloaded on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Incremented whenever the on-disk index format changes. Records with a
/// different version are rejected on load and rebuilt from source.
pub const CACHE_VERSION: u32 = 4;

/// Default token budget for query responses.
pub const DEFAULT_MAX_TOKENS: i64 = 500;

/// A fenced code block extracted from a markdown chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Language tag from the opening fence (may be empty).
    pub language: String,
    /// The joined lines between the fences, without the fences themselves.
    pub code: String,
    /// 1-indexed line of the opening fence.
    pub line: usize,
}

/// A markdown table row extracted from a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    /// Trimmed, non-empty, non-separator cells.
    pub cells: Vec<String>,
    /// 1-indexed line of the row.
    pub line: usize,
}

/// A single searchable section of a document.
///
/// Example: a heading `## Consumer Configuration` and its content becomes
/// one chunk with `title = "Consumer Configuration"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier of the form `<doc_id>:<start_line>-<end_line>`.
    pub chunk_id: String,
    /// The document this chunk belongs to.
    pub doc_id: String,
    /// Path of the source file, used in excerpt source links.
    pub path: String,
    /// Leaf heading text (falls back to the file basename).
    pub title: String,
    /// Ancestor heading titles at this chunk's location, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heading_path: Vec<String>,
    /// 1-indexed first line of the chunk (inclusive).
    pub start_line: usize,
    /// 1-indexed last line of the chunk (inclusive).
    pub end_line: usize,
    /// Raw text, headings included.
    pub text: String,
    /// Normalized, stopword-filtered terms extracted from `text`.
    pub terms: Vec<String>,
    /// Fenced code blocks contained in the chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_blocks: Vec<CodeBlock>,
    /// Table rows contained in the chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub table_rows: Vec<TableRow>,
    /// Whether the chunk contains at least one code block.
    pub has_code: bool,
    /// Dense embedding vector, assigned once by the worker pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A fully parsed and indexed document.
///
/// One `Index` exists per source document; the cache owns the canonical
/// copy and hands it out behind `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// 16 hex chars: first 64 bits of SHA-256 of the canonical source key
    /// (absolute path, or URL for fetched sites).
    pub doc_id: String,
    /// Local file path. For URL-sourced documents this is the cached
    /// markdown file, so excerpt links open in editors.
    pub path: String,
    /// Original URL for site loads; absent for local files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Full SHA-256 hex of the raw bytes at index time. Used to detect
    /// content changes.
    pub file_hash: String,
    /// When this index was created.
    pub indexed_at: DateTime<Utc>,
    /// All searchable sections, in parse order.
    pub chunks: Vec<Chunk>,
    /// term → number of chunks containing it at least once. Feeds IDF.
    pub doc_freq: HashMap<String, usize>,
    /// `chunks.len()`, stored for quick access during scoring.
    pub num_chunks: usize,
    /// On-disk format version; must equal [`CACHE_VERSION`].
    pub version: u32,
}
