//! # docdex server binary
//!
//! Wires together all dependencies and runs the MCP server on stdio.
//! Diagnostic logs go to stderr and to a dated debug file in the cache
//! directory; stdout is reserved for the protocol stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use docdex::cache::FileCache;
use docdex::embedding::{Embedder, EmbeddingConfig, EmbeddingStatus, OllamaEmbedder};
use docdex::fetcher::HttpFetcher;
use docdex::hybrid::{FusionMethod, HybridConfig, HybridSearcher, DEFAULT_RRF_K};
use docdex::indexer::{Indexer, OsFileReader, SystemClock};
use docdex::mcp::McpServer;
use docdex::parser::MarkdownParser;
use docdex::search::{Bm25Searcher, Searcher};

/// docdex: index local markdown and source files, answer prompts with
/// token-bounded, source-linked excerpts over MCP stdio.
#[derive(Parser)]
#[command(
    name = "docdex",
    about = "Local documentation indexing and retrieval engine served over MCP stdio",
    version
)]
struct Cli {
    /// Directory for cache and log files.
    #[arg(long, default_value = ".mcp-cache")]
    cache_dir: PathBuf,

    /// Enable Ollama-based semantic search (experimental, non-blocking).
    #[arg(long)]
    experimental_embeddings: bool,

    /// Ollama server URL for embeddings.
    #[arg(long, default_value = "http://localhost:11434")]
    ollama_host: String,

    /// Ollama embedding model to use.
    #[arg(long, default_value = "nomic-embed-text")]
    ollama_model: String,

    /// Fusion method for hybrid search: 'rrf' or 'weighted'.
    #[arg(long, default_value = "rrf")]
    hybrid_fusion_method: String,

    /// BM25 weight for weighted fusion (0.0-1.0).
    #[arg(long, default_value_t = 0.3)]
    hybrid_bm25_weight: f64,

    /// Embedding weight for weighted fusion (0.0-1.0).
    #[arg(long, default_value_t = 0.7)]
    hybrid_embed_weight: f64,

    /// K constant for Reciprocal Rank Fusion.
    #[arg(long, default_value_t = DEFAULT_RRF_K)]
    hybrid_rrf_k: usize,

    /// Number of embedding worker tasks.
    #[arg(long, default_value_t = 2)]
    max_concurrent_embeddings: usize,
}

/// Log to stderr (info, env-overridable) and to an append-only
/// `debug-YYYY-MM-DD.txt` in the cache directory (debug). stdout stays
/// untouched for the MCP stream.
fn init_tracing(cache_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("create cache dir {}", cache_dir.display()))?;

    let date = chrono::Local::now().format("%Y-%m-%d");
    let log_path = cache_dir.join(format!("debug-{}.txt", date));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.cache_dir)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        cache_dir = %cli.cache_dir.display(),
        "server starting"
    );

    let hybrid_config = HybridConfig {
        fusion: FusionMethod::parse(&cli.hybrid_fusion_method)?,
        bm25_weight: cli.hybrid_bm25_weight,
        embed_weight: cli.hybrid_embed_weight,
        rrf_k: cli.hybrid_rrf_k,
    };
    hybrid_config.validate()?;

    let cache = Arc::new(FileCache::new(&cli.cache_dir).context("create cache")?);
    let parser = Arc::new(MarkdownParser::new());

    // Searcher selection: hybrid when embeddings are enabled and the
    // embedder constructs, BM25 otherwise.
    let mut embedder: Option<Arc<dyn Embedder>> = None;
    let mut embed_status: Option<Arc<EmbeddingStatus>> = None;

    let searcher: Arc<dyn Searcher> = if cli.experimental_embeddings {
        let embed_config = EmbeddingConfig {
            host: cli.ollama_host.clone(),
            model: cli.ollama_model.clone(),
        };
        match OllamaEmbedder::new(embed_config) {
            Ok(ollama) => {
                let ollama: Arc<dyn Embedder> = Arc::new(ollama);
                if !ollama.available().await {
                    tracing::warn!(
                        host = %cli.ollama_host,
                        "embedding service unreachable; queries fall back to BM25 until it responds"
                    );
                }

                let status = Arc::new(EmbeddingStatus::new());
                embedder = Some(ollama.clone());
                embed_status = Some(status.clone());

                tracing::info!(
                    model = %cli.ollama_model,
                    host = %cli.ollama_host,
                    fusion = %cli.hybrid_fusion_method,
                    "experimental embeddings enabled (async)"
                );
                Arc::new(HybridSearcher::new(ollama, status).with_config(hybrid_config))
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to create embedder, using BM25 only");
                Arc::new(Bm25Searcher::new())
            }
        }
    } else {
        Arc::new(Bm25Searcher::new())
    };

    let fetcher = Arc::new(HttpFetcher::new().context("create fetcher")?);

    let mut indexer = Indexer::new(
        cache,
        parser,
        searcher,
        Arc::new(OsFileReader),
        Arc::new(SystemClock),
    )
    .with_fetcher(fetcher);

    if let (Some(embedder), Some(status)) = (embedder, embed_status) {
        indexer = indexer.with_embedder(embedder, status, cli.max_concurrent_embeddings);
    }

    let indexer = Arc::new(indexer);
    indexer.start().await;

    let server = McpServer::new(indexer.clone());
    tracing::info!("server ready, waiting for requests");

    let service = server.serve(stdio()).await.context("start MCP server")?;
    service.waiting().await.context("serve MCP")?;

    // Spill any still-pending embedding work for the next start.
    if let Err(e) = indexer.close().await {
        tracing::error!(error = %e, "failed to save pending queue");
    }

    Ok(())
}
