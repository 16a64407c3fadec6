//! # docdex
//!
//! **A local documentation indexing and retrieval engine served over MCP stdio.**
//!
//! docdex ingests markdown files (from disk or URLs, with HTML→Markdown
//! conversion), splits them into structurally meaningful chunks, builds a
//! per-document term index, and answers natural-language prompts with
//! token-bounded, source-linked excerpts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ files / URLs │──▶│   Indexer    │──▶│  Cache (JSON  │
//! │              │   │ parse+persist│   │  blobs + mem) │
//! └──────────────┘   └──────┬───────┘   └───────┬───────┘
//!                           │                   │
//!                    ┌──────▼───────┐   ┌───────▼───────┐
//!                    │ Worker pool  │   │   Searcher    │
//!                    │ (embeddings) │   │ BM25 / hybrid │
//!                    └──────────────┘   └───────┬───────┘
//!                                               │
//!                                       ┌───────▼───────┐
//!                                       │  MCP (stdio)  │
//!                                       └───────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A path or URL resolves to a deterministic **DocID** ([`parser`]).
//! 2. The **cache** ([`cache`]) is checked: memory first, then per-document
//!    JSON blobs on disk, invalidated by content hash.
//! 3. On a miss, the content is parsed into [`models::Chunk`]s by heading
//!    hierarchy and size limits, persisted, and optionally enqueued for
//!    embedding ([`indexer`]).
//! 4. Queries rank chunks with **BM25** ([`search`]), optionally fused with
//!    dense-vector cosine similarity ([`hybrid`]) once the async worker
//!    pool has produced embeddings ([`embedding`]).
//! 5. Excerpts are concatenated under a token budget and returned through
//!    the **MCP tool layer** ([`mcp`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core data types: `Chunk`, `CodeBlock`, `TableRow`, `Index` |
//! | [`text`] | Text normalization: HTML strip, tokenize, stopword filter |
//! | [`parser`] | Markdown and sliding-window chunkers, DocID derivation |
//! | [`cache`] | Two-tier cache: RwLock memory map + JSON blobs on disk |
//! | [`search`] | BM25 scoring and token-budgeted response assembly |
//! | [`hybrid`] | BM25 ∪ cosine fusion (RRF or weighted) with BM25 fallback |
//! | [`embedding`] | Embedder trait, Ollama client, readiness tracking |
//! | [`fetcher`] | HTTP fetching with HTML→Markdown conversion |
//! | [`indexer`] | Orchestrator: load/query/list/status + worker pool |
//! | [`mcp`] | MCP tool handlers and the stdio JSON-RPC bridge |

pub mod cache;
pub mod embedding;
pub mod fetcher;
pub mod hybrid;
pub mod indexer;
pub mod mcp;
pub mod models;
pub mod parser;
pub mod search;
pub mod text;

pub use indexer::{Indexer, OsFileReader, SystemClock};
pub use mcp::McpServer;
pub use models::{Chunk, Index};
