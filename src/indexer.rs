//! Document loading, caching, querying, and the embedding worker pool.
//!
//! The indexer ties the other components together behind constructor
//! injection: a cache, a markdown parser, a searcher, a file reader, a
//! clock, and optionally a fetcher and an embedder. Everything it does is
//! reachable from an MCP tool call.
//!
//! # Load pipeline
//!
//! ```text
//! path ──▶ DocID ──▶ memory? ──▶ disk (path+hash match)? ──▶ parse
//!                      │                  │                    │
//!                      └── cached ◀───────┘          persist + enqueue
//! ```
//!
//! # Embedding pipeline
//!
//! Loads enqueue the freshly built index on a bounded channel; a fixed pool
//! of workers drains it, coalescing documents into batches (50 ms window or
//! 100 chunks) before one `embed_batch` call. A full queue blocks the
//! enqueuing loader, which is the backpressure story for bulk loads. On
//! shutdown the pending queue spills to `queue.json` and is re-enqueued on
//! the next start.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, Semaphore};
use walkdir::WalkDir;

use crate::cache::{Cache, CacheError};
use crate::embedding::{Embedder, EmbeddingStatus};
use crate::fetcher::Fetcher;
use crate::models::{Chunk, Index, CACHE_VERSION, DEFAULT_MAX_TOKENS};
use crate::parser::{doc_id_for_path, doc_id_for_url, DocumentParser, GenericParser};
use crate::search::Searcher;

const DEFAULT_QUEUE_SIZE: usize = 10_000;
const DEFAULT_WORKER_COUNT: usize = 2;

/// Maximum chunks coalesced into one embedding call.
const MAX_BATCH_CHUNKS: usize = 100;
/// How long a worker waits for more queued documents before embedding.
const BATCH_WAIT: Duration = Duration::from_millis(50);

/// Concurrency cap for bulk glob loads.
const GLOB_WORKERS: usize = 4;

const QUEUE_FILE: &str = "queue.json";

/// Abstracts file access so loads are testable with controlled content.
pub trait FileReader: Send + Sync {
    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>>;

    /// Content hash used to detect when a file needs re-indexing.
    fn hash_file(&self, path: &str) -> std::io::Result<String>;
}

/// Production [`FileReader`] over the real filesystem.
pub struct OsFileReader;

impl FileReader for OsFileReader {
    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn hash_file(&self, path: &str) -> std::io::Result<String> {
        let data = std::fs::read(path)?;
        Ok(format!("{:x}", Sha256::digest(&data)))
    }
}

/// Abstracts time so tests are reproducible.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production [`Clock`] using system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of loading a single document.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub doc_id: String,
    pub path: String,
    pub num_chunks: usize,
    pub from_cache: bool,
    pub indexed_at: DateTime<Utc>,
}

impl LoadResult {
    fn cached(index: &Index) -> Self {
        Self {
            doc_id: index.doc_id.clone(),
            path: index.path.clone(),
            num_chunks: index.num_chunks,
            from_cache: true,
            indexed_at: index.indexed_at,
        }
    }
}

/// Summary of a bulk glob load.
#[derive(Debug, Default)]
pub struct LoadGlobResult {
    pub loaded: usize,
    pub cached: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub results: Vec<LoadResult>,
}

/// Outcome of loading a website.
#[derive(Debug, Clone)]
pub struct SiteLoadResult {
    pub doc_id: String,
    pub url: String,
    pub num_chunks: usize,
    pub from_cache: bool,
    pub indexed_at: DateTime<Utc>,
}

/// Summary information about one cached document.
#[derive(Debug, Clone)]
pub struct DocInfo {
    pub doc_id: String,
    pub path: String,
    pub source_url: Option<String>,
    pub num_chunks: usize,
    pub indexed_at: DateTime<Utc>,
}

/// Real-time indexing metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexerStatus {
    pub docs_count: usize,
    pub queue_length: usize,
    pub embedded_count: usize,
    pub active_workers: usize,
}

#[derive(Default)]
struct Stats {
    queue_length: usize,
    embedded_count: usize,
    active_workers: usize,
}

#[derive(Serialize, Deserialize)]
struct QueueSpillover {
    doc_ids: Vec<String>,
}

/// Orchestrates loading, parsing, caching, querying, and embedding.
///
/// Every field is shared, so clones are cheap handles onto the same
/// engine; worker tasks and background loads each hold one.
#[derive(Clone)]
pub struct Indexer {
    cache: Arc<dyn Cache>,
    parser: Arc<dyn DocumentParser>,
    generic_parser: GenericParser,
    searcher: Arc<dyn Searcher>,
    reader: Arc<dyn FileReader>,
    clock: Arc<dyn Clock>,
    fetcher: Option<Arc<dyn Fetcher>>,

    embedder: Option<Arc<dyn Embedder>>,
    embed_status: Option<Arc<EmbeddingStatus>>,
    worker_count: usize,
    queue_tx: Option<mpsc::Sender<Arc<Index>>>,
    // Shared by the worker pool; also drained by `close` for spillover.
    queue_rx: Option<Arc<Mutex<mpsc::Receiver<Arc<Index>>>>>,

    stats: Arc<RwLock<Stats>>,
}

impl Indexer {
    pub fn new(
        cache: Arc<dyn Cache>,
        parser: Arc<dyn DocumentParser>,
        searcher: Arc<dyn Searcher>,
        reader: Arc<dyn FileReader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            parser,
            generic_parser: GenericParser::new(),
            searcher,
            reader,
            clock,
            fetcher: None,
            embedder: None,
            embed_status: None,
            worker_count: DEFAULT_WORKER_COUNT,
            queue_tx: None,
            queue_rx: None,
            stats: Arc::new(RwLock::new(Stats::default())),
        }
    }

    /// Enable site loading.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Enable async embedding generation with the given worker count.
    pub fn with_embedder(
        mut self,
        embedder: Arc<dyn Embedder>,
        status: Arc<EmbeddingStatus>,
        worker_count: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_SIZE);
        self.embedder = Some(embedder);
        self.embed_status = Some(status);
        self.worker_count = worker_count.max(1);
        self.queue_tx = Some(tx);
        self.queue_rx = Some(Arc::new(Mutex::new(rx)));
        self
    }

    /// Hydrate the cache, spawn the worker pool, and re-enqueue any
    /// spilled-over pending documents.
    pub async fn start(&self) {
        if let Err(e) = self.cache.hydrate() {
            tracing::warn!(error = %e, "failed to hydrate cache");
        }

        if self.embedder.is_some() {
            for worker_id in 0..self.worker_count {
                let worker = self.clone();
                tokio::spawn(async move {
                    worker.embedding_worker(worker_id).await;
                });
            }
            self.restore_queue();
        }
    }

    /// Drain the pending queue without blocking and persist the DocIDs to
    /// `queue.json` so the next start can re-enqueue them. In-flight
    /// batches are left to finish on their own.
    pub async fn close(&self) -> Result<()> {
        let Some(rx) = &self.queue_rx else {
            return Ok(());
        };

        let mut doc_ids = Vec::new();
        {
            let mut guard = rx.lock().await;
            while let Ok(index) = guard.try_recv() {
                doc_ids.push(index.doc_id.clone());
            }
        }

        if doc_ids.is_empty() {
            return Ok(());
        }

        let path = self.cache.dir().join(QUEUE_FILE);
        let data = serde_json::to_vec(&QueueSpillover {
            doc_ids: doc_ids.clone(),
        })?;
        std::fs::write(&path, data)
            .with_context(|| format!("write queue file {}", path.display()))?;

        tracing::info!(count = doc_ids.len(), file = %path.display(), "saved pending queue");
        Ok(())
    }

    /// Re-enqueue DocIDs spilled over by a previous shutdown. The file is
    /// deleted right after reading so an immediate crash cannot replay it.
    fn restore_queue(&self) {
        let path = self.cache.dir().join(QUEUE_FILE);

        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open queue file");
                return;
            }
        };
        let _ = std::fs::remove_file(&path);

        let spill: QueueSpillover = match serde_json::from_slice(&data) {
            Ok(spill) => spill,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode queue file");
                return;
            }
        };

        let Some(tx) = &self.queue_tx else { return };

        let mut restored = 0usize;
        for doc_id in spill.doc_ids {
            if let Ok(index) = self.cache.get(&doc_id) {
                if tx.try_send(index).is_ok() {
                    self.stats.write().expect("stats lock poisoned").queue_length += 1;
                    restored += 1;
                }
            }
        }

        if restored > 0 {
            tracing::info!(count = restored, "restored pending queue");
        }
    }

    /// Index a local file, reusing the memory or disk cache when the
    /// content is unchanged.
    pub async fn load(&self, path: &str) -> Result<LoadResult> {
        if path.is_empty() {
            bail!("path is required");
        }

        let doc_id = doc_id_for_path(path);

        if let Ok(cached) = self.cache.get(&doc_id) {
            return Ok(LoadResult::cached(&cached));
        }

        let content = self
            .reader
            .read_file(path)
            .with_context(|| format!("read file {}", path))?;
        let file_hash = self
            .reader
            .hash_file(path)
            .with_context(|| format!("hash file {}", path))?;

        // Disk cache survives restarts; valid only while path and content
        // both still match.
        if let Ok(cached) = self.cache.load_from_disk(&doc_id) {
            if cached.path == path && cached.file_hash == file_hash {
                self.cache.set(&doc_id, cached.clone());
                return Ok(LoadResult::cached(&cached));
            }
        }

        let content_str = String::from_utf8_lossy(&content);
        let ext = extension_lowercase(path);
        let (chunks, doc_freq) = if ext == "md" || ext == "markdown" {
            self.parser.parse(path, &content_str)
        } else {
            self.generic_parser.parse(path, &content_str)
        };

        let index = Arc::new(Index {
            doc_id: doc_id.clone(),
            path: path.to_string(),
            source_url: None,
            file_hash,
            indexed_at: self.clock.now(),
            num_chunks: chunks.len(),
            chunks,
            doc_freq,
            version: CACHE_VERSION,
        });

        self.cache.set(&doc_id, index.clone());
        self.cache.save_to_disk(&index).context("save cache")?;

        self.enqueue_for_embedding(index.clone()).await;

        Ok(LoadResult {
            doc_id,
            path: index.path.clone(),
            num_chunks: index.num_chunks,
            from_cache: false,
            indexed_at: index.indexed_at,
        })
    }

    /// Load all files matching a glob pattern, minus excludes. `**`
    /// patterns walk recursively; plain patterns expand one directory
    /// level. More than two files load through a small worker pool.
    pub async fn load_glob(&self, pattern: &str, excludes: &[String]) -> Result<LoadGlobResult> {
        if pattern.is_empty() {
            bail!("pattern is required");
        }

        let matches = if pattern.contains("**") {
            find_files_recursive(pattern)
        } else {
            find_files_flat(pattern)?
        };

        if matches.is_empty() {
            bail!("no files match pattern: {}", pattern);
        }

        let files: Vec<String> = matches
            .into_iter()
            .filter(|p| Path::new(p).is_file())
            .filter(|p| !is_excluded(p, excludes))
            .collect();

        if files.is_empty() {
            bail!("no files match pattern after exclusions");
        }

        let mut result = LoadGlobResult::default();

        if files.len() <= 2 {
            for path in &files {
                match self.load(path).await {
                    Ok(load_result) => {
                        result.loaded += 1;
                        if load_result.from_cache {
                            result.cached += 1;
                        }
                        result.results.push(load_result);
                    }
                    Err(e) => {
                        result.failed += 1;
                        result.errors.push(format!("{}: {:#}", path, e));
                    }
                }
            }
            return Ok(result);
        }

        let semaphore = Arc::new(Semaphore::new(GLOB_WORKERS));
        let mut join_set = tokio::task::JoinSet::new();
        for path in files {
            let indexer = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let load_result = indexer.load(&path).await;
                (path, load_result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(load_result))) => {
                    result.loaded += 1;
                    if load_result.from_cache {
                        result.cached += 1;
                    }
                    result.results.push(load_result);
                }
                Ok((path, Err(e))) => {
                    result.failed += 1;
                    result.errors.push(format!("{}: {:#}", path, e));
                }
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(format!("load task failed: {}", e));
                }
            }
        }

        Ok(result)
    }

    /// Start a glob load in the background and return immediately.
    pub fn load_glob_async(&self, pattern: &str, excludes: Vec<String>) -> Result<()> {
        if pattern.is_empty() {
            bail!("pattern is required");
        }

        let indexer = self.clone();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            match indexer.load_glob(&pattern, &excludes).await {
                Ok(res) => tracing::info!(
                    pattern = %pattern,
                    loaded = res.loaded,
                    cached = res.cached,
                    failed = res.failed,
                    "async load complete"
                ),
                Err(e) => tracing::error!(pattern = %pattern, error = %e, "async load failed"),
            }
        });

        Ok(())
    }

    /// Fetch a URL, convert it to markdown, and index the result. The
    /// markdown is written under the cache directory so excerpt source
    /// links resolve to a real local file.
    pub async fn load_site(&self, url: &str, force: bool) -> Result<SiteLoadResult> {
        if url.is_empty() {
            bail!("url is required");
        }
        let Some(fetcher) = &self.fetcher else {
            bail!("site loading not configured (no fetcher)");
        };

        let doc_id = doc_id_for_url(url);

        if !force {
            if let Ok(cached) = self.cache.get(&doc_id) {
                return Ok(SiteLoadResult {
                    doc_id: cached.doc_id.clone(),
                    url: url.to_string(),
                    num_chunks: cached.num_chunks,
                    from_cache: true,
                    indexed_at: cached.indexed_at,
                });
            }

            if let Ok(cached) = self.cache.load_from_disk(&doc_id) {
                // Guard: a different URL colliding on the 64-bit DocID
                // falls through to a re-fetch.
                if cached.path == url {
                    self.cache.set(&doc_id, cached.clone());
                    return Ok(SiteLoadResult {
                        doc_id: cached.doc_id.clone(),
                        url: url.to_string(),
                        num_chunks: cached.num_chunks,
                        from_cache: true,
                        indexed_at: cached.indexed_at,
                    });
                }
            }
        }

        let markdown = fetcher.fetch_as_markdown(url).await.context("fetch site")?;

        let local_path = self
            .cache
            .save_markdown(&doc_id, &markdown)
            .context("save markdown")?;

        let file_hash = format!("{:x}", Sha256::digest(markdown.as_bytes()));

        // Parse against the local path so source links are openable.
        let (chunks, doc_freq) = self.parser.parse(&local_path, &markdown);

        let index = Arc::new(Index {
            doc_id: doc_id.clone(),
            path: local_path,
            source_url: Some(url.to_string()),
            file_hash,
            indexed_at: self.clock.now(),
            num_chunks: chunks.len(),
            chunks,
            doc_freq,
            version: CACHE_VERSION,
        });

        self.cache.set(&doc_id, index.clone());
        self.cache.save_to_disk(&index).context("save cache")?;

        self.enqueue_for_embedding(index.clone()).await;

        Ok(SiteLoadResult {
            doc_id,
            url: url.to_string(),
            num_chunks: index.num_chunks,
            from_cache: false,
            indexed_at: index.indexed_at,
        })
    }

    /// Search one indexed document and return token-bounded excerpts.
    pub async fn query(
        &self,
        doc_id: &str,
        path: &str,
        prompt: &str,
        max_tokens: i64,
    ) -> Result<String> {
        let doc_id = if doc_id.is_empty() {
            if path.is_empty() {
                bail!("doc_id or path is required");
            }
            doc_id_for_path(path)
        } else {
            doc_id.to_string()
        };

        let index = match self.cache.get(&doc_id) {
            Ok(index) => index,
            Err(_) => {
                let index = match self.cache.load_from_disk(&doc_id) {
                    Ok(index) => index,
                    Err(CacheError::NotFound) => {
                        bail!("document not loaded (call docs_load first)")
                    }
                    Err(e) => return Err(anyhow::Error::new(e).context("load from cache")),
                };

                if !path.is_empty() && index.path != path {
                    bail!(
                        "cache doc_id exists but path differs: cached={} requested={}",
                        index.path,
                        path
                    );
                }

                self.cache.set(&doc_id, index.clone());
                index
            }
        };

        if prompt.is_empty() {
            bail!("prompt is required");
        }

        Ok(self.searcher.search(&index, prompt, max_tokens).await)
    }

    /// Search every cached document, spending the shared token budget in
    /// DocID order and joining non-empty responses.
    pub async fn query_all(&self, prompt: &str, max_tokens: i64) -> Result<String> {
        if prompt.is_empty() {
            bail!("prompt is required");
        }

        let mut doc_ids = self.cache.list();
        if doc_ids.is_empty() {
            bail!("no documents loaded (use docs_load or site_loads first)");
        }
        doc_ids.sort();

        let max_tokens = if max_tokens <= 0 {
            DEFAULT_MAX_TOKENS
        } else {
            max_tokens
        };

        let mut results: Vec<String> = Vec::new();
        let mut tokens_used: i64 = 0;

        for doc_id in doc_ids {
            let Ok(index) = self.cache.get(&doc_id) else {
                continue;
            };

            let remaining = max_tokens - tokens_used;
            if remaining <= 0 {
                break;
            }

            let excerpt = self.searcher.search(&index, prompt, remaining).await;
            if !excerpt.is_empty() && !excerpt.contains("No relevant excerpts") {
                tokens_used += (excerpt.len() / 4) as i64;
                results.push(excerpt);
            }
        }

        if results.is_empty() {
            return Ok("No relevant excerpts found in any loaded document.".to_string());
        }

        Ok(results.join("\n\n---\n\n"))
    }

    /// Snapshot of all cached documents, in DocID order.
    pub fn list(&self) -> Vec<DocInfo> {
        let mut doc_ids = self.cache.list();
        doc_ids.sort();

        doc_ids
            .iter()
            .filter_map(|doc_id| self.cache.get(doc_id).ok())
            .map(|index| DocInfo {
                doc_id: index.doc_id.clone(),
                path: index.path.clone(),
                source_url: index.source_url.clone(),
                num_chunks: index.num_chunks,
                indexed_at: index.indexed_at,
            })
            .collect()
    }

    /// Current indexing metrics. `docs_count` is sampled from the cache at
    /// the moment of the call.
    pub fn status(&self) -> IndexerStatus {
        let stats = self.stats.read().expect("stats lock poisoned");
        IndexerStatus {
            docs_count: self.cache.list().len(),
            queue_length: stats.queue_length,
            embedded_count: stats.embedded_count,
            active_workers: stats.active_workers,
        }
    }

    /// Queue a freshly parsed index for embedding. Blocks when the queue
    /// is full, which is the backpressure for bulk loaders.
    async fn enqueue_for_embedding(&self, index: Arc<Index>) {
        let Some(tx) = &self.queue_tx else { return };

        // A re-parse invalidates any previous embeddings for this doc.
        if let Some(status) = &self.embed_status {
            status.clear(&index.doc_id);
        }

        if tx.send(index).await.is_ok() {
            self.stats.write().expect("stats lock poisoned").queue_length += 1;
        }
    }

    async fn embedding_worker(self, worker_id: usize) {
        // Idle waits are bounded so the receiver lock is released
        // periodically; `close` needs it to drain the queue.
        const IDLE_WAIT: Duration = Duration::from_millis(250);

        let Some(rx) = self.queue_rx.clone() else { return };

        loop {
            let first = {
                let mut guard = rx.lock().await;
                match tokio::time::timeout(IDLE_WAIT, guard.recv()).await {
                    Ok(Some(index)) => index,
                    Ok(None) => return, // channel closed
                    Err(_) => continue,
                }
            };

            let mut total_chunks = first.chunks.len();
            let mut batch = vec![first];

            // Opportunistically widen the batch until the window elapses
            // or enough chunks have accumulated.
            let deadline = tokio::time::Instant::now() + BATCH_WAIT;
            while total_chunks < MAX_BATCH_CHUNKS {
                let next = {
                    let mut guard = rx.lock().await;
                    tokio::time::timeout_at(deadline, guard.recv()).await
                };
                match next {
                    Ok(Some(index)) => {
                        total_chunks += index.chunks.len();
                        batch.push(index);
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            self.stats.write().expect("stats lock poisoned").active_workers += 1;

            tracing::debug!(worker_id, docs = batch.len(), total_chunks, "embedding batch");
            self.generate_batch_embeddings(&batch).await;

            let mut stats = self.stats.write().expect("stats lock poisoned");
            stats.active_workers -= 1;
            stats.queue_length = stats.queue_length.saturating_sub(batch.len());
            stats.embedded_count += batch.len();
        }
    }

    async fn generate_batch_embeddings(&self, batch: &[Arc<Index>]) {
        let Some(embedder) = &self.embedder else { return };

        let mut all_texts: Vec<String> = Vec::new();
        for index in batch {
            for chunk in &index.chunks {
                all_texts.push(prepare_text_for_embedding(chunk));
            }
        }
        if all_texts.is_empty() {
            return;
        }

        let all_embeddings = match embedder.embed_batch(&all_texts).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                tracing::warn!(
                    batch_size = batch.len(),
                    total_chunks = all_texts.len(),
                    error = %e,
                    "failed to generate batch embeddings"
                );
                return;
            }
        };

        if all_embeddings.len() != all_texts.len() {
            tracing::error!(
                expected = all_texts.len(),
                got = all_embeddings.len(),
                "embedding result count mismatch"
            );
            return;
        }

        let mut embeddings = all_embeddings.into_iter();
        for index in batch {
            let mut updated = (**index).clone();
            for chunk in &mut updated.chunks {
                chunk.embedding = embeddings.next();
            }
            let updated = Arc::new(updated);

            // Publish the fully assigned index before flipping readiness,
            // so readers see either no embeddings or all of them.
            self.cache.set(&updated.doc_id, updated.clone());
            if let Err(e) = self.cache.save_to_disk(&updated) {
                tracing::warn!(doc_id = %updated.doc_id, error = %e, "failed to persist embeddings");
            }
            if let Some(status) = &self.embed_status {
                status.set_ready(&updated.doc_id);
            }
        }

        tracing::debug!(
            docs = batch.len(),
            total_chunks = all_texts.len(),
            "batch embeddings generated"
        );
    }
}

/// Prefix a chunk with file and breadcrumb context before embedding, which
/// measurably improves retrieval for code and deeply nested docs.
fn prepare_text_for_embedding(chunk: &Chunk) -> String {
    let mut out = String::new();

    let ext = extension_lowercase(&chunk.path);
    if ext != "md" && ext != "markdown" && !chunk.path.is_empty() {
        out.push_str(&format!(
            "File: {} (Lang: {})\n",
            Path::new(&chunk.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ext
        ));
    }

    if !chunk.heading_path.is_empty() {
        out.push_str(&chunk.heading_path.join(" > "));
        out.push_str(": ");
    }

    out.push_str(&chunk.text);
    out
}

fn extension_lowercase(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Expand a `**` pattern: walk the base directory and match the remainder
/// against file basenames.
fn find_files_recursive(pattern: &str) -> Vec<String> {
    let (base, file_pattern) = match pattern.split_once("**") {
        Some((base, rest)) => {
            let base = base.trim_end_matches('/');
            let rest = rest.trim_start_matches('/');
            (
                if base.is_empty() { "." } else { base },
                if rest.is_empty() { "*" } else { rest },
            )
        }
        None => (".", "*"),
    };

    let Ok(glob) = Glob::new(file_pattern) else {
        return Vec::new();
    };
    let matcher = glob.compile_matcher();

    let mut matches: Vec<String> = WalkDir::new(base)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect();
    matches.sort();
    matches
}

/// Expand a flat pattern by listing the parent directory and matching
/// basenames.
fn find_files_flat(pattern: &str) -> Result<Vec<String>> {
    let path = Path::new(pattern);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_pattern = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "*".to_string());

    let glob = Glob::new(&file_pattern).context("invalid glob pattern")?;
    let matcher = glob.compile_matcher();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(Vec::new()),
    };

    let mut matches: Vec<String> = entries
        .flatten()
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect();
    matches.sort();
    Ok(matches)
}

/// Whether `path` matches any exclude pattern: by full cleaned path, by
/// basename, or by `**/<term>/**`-style containment.
fn is_excluded(path: &str, excludes: &[String]) -> bool {
    if excludes.is_empty() {
        return false;
    }

    let clean: PathBuf = Path::new(path).components().collect();
    let clean_str = clean.to_string_lossy();
    let base = clean
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for pattern in excludes {
        if let Ok(glob) = Glob::new(pattern) {
            let matcher = glob.compile_matcher();
            if matcher.is_match(clean_str.as_ref()) || matcher.is_match(&base) {
                return true;
            }
        }

        // "**/vendor/**" and friends exclude anything under that directory.
        if let Some(rest) = pattern.strip_prefix("**/") {
            let term = rest.strip_suffix("**").unwrap_or(rest);
            let term = term.strip_suffix("/*").unwrap_or(term);
            if !term.is_empty() && clean_str.contains(term) {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileCache;
    use crate::models::Index;
    use crate::parser::MarkdownParser;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct MockReader {
        files: StdMutex<HashMap<String, String>>,
    }

    impl MockReader {
        fn new() -> Self {
            Self {
                files: StdMutex::new(HashMap::new()),
            }
        }

        fn insert(&self, path: &str, content: &str) {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_string());
        }
    }

    impl FileReader for MockReader {
        fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .map(|c| c.as_bytes().to_vec())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
        }

        fn hash_file(&self, path: &str) -> std::io::Result<String> {
            let files = self.files.lock().unwrap();
            let content = files
                .get(path)
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))?;
            Ok(format!("{:x}", Sha256::digest(content.as_bytes())))
        }
    }

    struct MockClock {
        now: StdMutex<DateTime<Utc>>,
    }

    impl MockClock {
        fn at(ts: &str) -> Self {
            Self {
                now: StdMutex::new(ts.parse().unwrap()),
            }
        }

        fn advance_to(&self, ts: &str) {
            *self.now.lock().unwrap() = ts.parse().unwrap();
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    struct MockSearcher;

    #[async_trait]
    impl Searcher for MockSearcher {
        async fn search(&self, _index: &Index, query: &str, _max_tokens: i64) -> String {
            format!("Mock search result for: {}", query)
        }
    }

    struct MockFetcher {
        markdown: String,
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch_as_markdown(&self, _url: &str) -> Result<String> {
            Ok(self.markdown.clone())
        }
    }

    struct MockEmbedder;

    #[async_trait]
    impl Embedder for MockEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        async fn available(&self) -> bool {
            true
        }
    }

    struct Harness {
        _tmp: TempDir,
        reader: Arc<MockReader>,
        clock: Arc<MockClock>,
        cache: Arc<FileCache>,
    }

    fn build_indexer() -> (Arc<Indexer>, Harness) {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(FileCache::new(tmp.path()).unwrap());
        let reader = Arc::new(MockReader::new());
        let clock = Arc::new(MockClock::at("2024-01-01T00:00:00Z"));

        let indexer = Arc::new(Indexer::new(
            cache.clone(),
            Arc::new(MarkdownParser::new()),
            Arc::new(MockSearcher),
            reader.clone(),
            clock.clone(),
        ));

        (
            indexer,
            Harness {
                _tmp: tmp,
                reader,
                clock,
                cache,
            },
        )
    }

    #[tokio::test]
    async fn test_load_requires_path() {
        let (indexer, _h) = build_indexer();
        assert!(indexer.load("").await.is_err());
    }

    #[tokio::test]
    async fn test_load_then_cache_hit() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# H\n\ntext");

        let first = indexer.load("docs/a.md").await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.num_chunks, 1);
        assert_eq!(first.doc_id.len(), 16);

        let second = indexer.load("docs/a.md").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.doc_id, first.doc_id);
        assert_eq!(second.indexed_at, first.indexed_at);
    }

    #[tokio::test]
    async fn test_load_reindexes_when_content_changes() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# H\n\noriginal");
        let first = indexer.load("docs/a.md").await.unwrap();

        h.reader.insert("docs/a.md", "# H\n\nchanged content");
        h.clock.advance_to("2024-02-01T00:00:00Z");

        // Simulate a restart: fresh memory tier over the same disk cache.
        // The stale disk record fails the hash check and is re-parsed.
        let cache = Arc::new(FileCache::new(h.cache.dir()).unwrap());
        let indexer2 = Arc::new(Indexer::new(
            cache,
            Arc::new(MarkdownParser::new()),
            Arc::new(MockSearcher),
            h.reader.clone(),
            h.clock.clone(),
        ));
        let reloaded = indexer2.load("docs/a.md").await.unwrap();

        assert!(!reloaded.from_cache);
        assert_eq!(reloaded.doc_id, first.doc_id);
        assert_ne!(reloaded.indexed_at, first.indexed_at);
    }

    #[tokio::test]
    async fn test_load_disk_hit_when_unchanged() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# H\n\ntext");
        let first = indexer.load("docs/a.md").await.unwrap();

        // Restart with an empty memory tier over the same disk cache.
        let cache = Arc::new(FileCache::new(h.cache.dir()).unwrap());
        let indexer2 = Arc::new(Indexer::new(
            cache,
            Arc::new(MarkdownParser::new()),
            Arc::new(MockSearcher),
            h.reader.clone(),
            h.clock.clone(),
        ));

        let second = indexer2.load("docs/a.md").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.indexed_at, first.indexed_at);
    }

    #[tokio::test]
    async fn test_load_uses_generic_parser_for_source_files() {
        let (indexer, h) = build_indexer();
        h.reader.insert("src/lib.rs", "fn alpha() {}\nfn beta() {}");

        let result = indexer.load("src/lib.rs").await.unwrap();
        assert_eq!(result.num_chunks, 1);

        let index = h.cache.get(&result.doc_id).unwrap();
        assert_eq!(index.chunks[0].title, "Source Code: lib.rs");
        assert!(index.chunks[0].has_code);
    }

    #[tokio::test]
    async fn test_query_not_loaded() {
        let (indexer, _h) = build_indexer();
        let err = indexer
            .query("0123456789abcdef", "", "anything", 100)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("document not loaded"));
    }

    #[tokio::test]
    async fn test_query_requires_identifier_and_prompt() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# H\n\ntext");
        indexer.load("docs/a.md").await.unwrap();

        let err = indexer.query("", "", "prompt", 100).await.unwrap_err();
        assert!(err.to_string().contains("doc_id or path is required"));

        let err = indexer.query("", "docs/a.md", "", 100).await.unwrap_err();
        assert!(err.to_string().contains("prompt is required"));
    }

    #[tokio::test]
    async fn test_query_derives_doc_id_from_path() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# H\n\ntext");
        indexer.load("docs/a.md").await.unwrap();

        let answer = indexer.query("", "docs/a.md", "anything", 100).await.unwrap();
        assert_eq!(answer, "Mock search result for: anything");
    }

    #[tokio::test]
    async fn test_query_all_requires_documents() {
        let (indexer, _h) = build_indexer();
        assert!(indexer.query_all("prompt", 100).await.is_err());
    }

    #[tokio::test]
    async fn test_query_all_joins_responses() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# A\n\nalpha");
        h.reader.insert("docs/b.md", "# B\n\nbeta");
        indexer.load("docs/a.md").await.unwrap();
        indexer.load("docs/b.md").await.unwrap();

        let combined = indexer.query_all("prompt", 2000).await.unwrap();
        assert_eq!(
            combined,
            "Mock search result for: prompt\n\n---\n\nMock search result for: prompt"
        );
    }

    #[tokio::test]
    async fn test_load_site_caches_and_refetches() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(FileCache::new(tmp.path()).unwrap());
        let indexer = Arc::new(
            Indexer::new(
                cache.clone(),
                Arc::new(MarkdownParser::new()),
                Arc::new(MockSearcher),
                Arc::new(MockReader::new()),
                Arc::new(MockClock::at("2024-01-01T00:00:00Z")),
            )
            .with_fetcher(Arc::new(MockFetcher {
                markdown: "# Fetched\n\nsite body".to_string(),
            })),
        );
        let h = Harness {
            _tmp: tmp,
            reader: Arc::new(MockReader::new()),
            clock: Arc::new(MockClock::at("2024-01-01T00:00:00Z")),
            cache,
        };

        let first = indexer.load_site("https://example.com/docs", false).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.url, "https://example.com/docs");
        assert_eq!(first.num_chunks, 1);

        let index = h.cache.get(&first.doc_id).unwrap();
        assert_eq!(index.source_url.as_deref(), Some("https://example.com/docs"));
        assert!(index.path.ends_with(&format!("{}.md", first.doc_id)));

        let second = indexer.load_site("https://example.com/docs", false).await.unwrap();
        assert!(second.from_cache);

        let forced = indexer.load_site("https://example.com/docs", true).await.unwrap();
        assert!(!forced.from_cache);
    }

    #[tokio::test]
    async fn test_list_reports_cached_docs() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# A\n\nalpha");
        indexer.load("docs/a.md").await.unwrap();

        let docs = indexer.list();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "docs/a.md");
        assert_eq!(docs[0].num_chunks, 1);
        assert!(docs[0].source_url.is_none());
    }

    #[tokio::test]
    async fn test_status_counts_docs() {
        let (indexer, h) = build_indexer();
        h.reader.insert("docs/a.md", "# A\n\nalpha");
        indexer.load("docs/a.md").await.unwrap();

        let status = indexer.status();
        assert_eq!(status.docs_count, 1);
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.active_workers, 0);
    }

    #[tokio::test]
    async fn test_worker_pool_embeds_and_flips_readiness() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(FileCache::new(tmp.path()).unwrap());
        let reader = Arc::new(MockReader::new());
        reader.insert("docs/a.md", "# A\n\nalpha content");
        let status = Arc::new(EmbeddingStatus::new());

        let indexer = Arc::new(
            Indexer::new(
                cache.clone(),
                Arc::new(MarkdownParser::new()),
                Arc::new(MockSearcher),
                reader.clone(),
                Arc::new(MockClock::at("2024-01-01T00:00:00Z")),
            )
            .with_embedder(Arc::new(MockEmbedder), status.clone(), 2),
        );
        indexer.start().await;

        let result = indexer.load("docs/a.md").await.unwrap();

        // Wait for the async worker to embed and publish.
        for _ in 0..100 {
            if status.is_ready(&result.doc_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(status.is_ready(&result.doc_id));

        let index = cache.get(&result.doc_id).unwrap();
        assert!(index.chunks.iter().all(|c| c.embedding.is_some()));

        // Re-persisted with embeddings.
        let on_disk = cache.load_from_disk(&result.doc_id).unwrap();
        assert!(on_disk.chunks.iter().all(|c| c.embedding.is_some()));
    }

    #[tokio::test]
    async fn test_close_spills_queue_and_restart_restores() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(FileCache::new(tmp.path()).unwrap());
        let reader = Arc::new(MockReader::new());
        reader.insert("docs/a.md", "# A\n\nalpha");
        let status = Arc::new(EmbeddingStatus::new());

        // Workers never started, so the enqueued doc stays pending.
        let indexer = Arc::new(
            Indexer::new(
                cache.clone(),
                Arc::new(MarkdownParser::new()),
                Arc::new(MockSearcher),
                reader.clone(),
                Arc::new(MockClock::at("2024-01-01T00:00:00Z")),
            )
            .with_embedder(Arc::new(MockEmbedder), status.clone(), 1),
        );
        indexer.load("docs/a.md").await.unwrap();

        indexer.close().await.unwrap();
        let queue_path = tmp.path().join("queue.json");
        assert!(queue_path.exists());

        let spill: QueueSpillover =
            serde_json::from_slice(&std::fs::read(&queue_path).unwrap()).unwrap();
        assert_eq!(spill.doc_ids.len(), 1);

        // Restart: hydrate + restore deletes the spillover file.
        let cache2 = Arc::new(FileCache::new(tmp.path()).unwrap());
        let indexer2 = Arc::new(
            Indexer::new(
                cache2,
                Arc::new(MarkdownParser::new()),
                Arc::new(MockSearcher),
                reader,
                Arc::new(MockClock::at("2024-01-01T00:00:00Z")),
            )
            .with_embedder(Arc::new(MockEmbedder), Arc::new(EmbeddingStatus::new()), 1),
        );
        // Restore without spawning workers so the queue length is
        // observable.
        if let Err(e) = indexer2.cache.hydrate() {
            panic!("hydrate failed: {}", e);
        }
        indexer2.restore_queue();

        assert!(!queue_path.exists());
        assert_eq!(indexer2.status().queue_length, 1);
    }

    #[tokio::test]
    async fn test_load_glob_with_excludes() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("vendor")).unwrap();
        std::fs::write(docs.join("a.md"), "# A\n\nalpha").unwrap();
        std::fs::write(docs.join("b.md"), "# B\n\nbeta").unwrap();
        std::fs::write(docs.join("vendor").join("c.md"), "# C\n\ngamma").unwrap();

        let cache_dir = TempDir::new().unwrap();
        let cache = Arc::new(FileCache::new(cache_dir.path()).unwrap());
        let indexer = Arc::new(Indexer::new(
            cache,
            Arc::new(MarkdownParser::new()),
            Arc::new(MockSearcher),
            Arc::new(OsFileReader),
            Arc::new(SystemClock),
        ));

        let pattern = format!("{}/**/*.md", docs.display());
        let result = indexer
            .load_glob(&pattern, &["**/vendor/**".to_string()])
            .await
            .unwrap();

        assert_eq!(result.loaded, 2);
        assert_eq!(result.failed, 0);
        assert!(result
            .results
            .iter()
            .all(|r| !r.path.contains("vendor")));
    }

    #[tokio::test]
    async fn test_load_glob_no_matches_errors() {
        let (indexer, _h) = build_indexer();
        assert!(indexer
            .load_glob("/nonexistent-dir-docdex/**/*.md", &[])
            .await
            .is_err());
        assert!(indexer.load_glob("", &[]).await.is_err());
    }

    #[test]
    fn test_is_excluded_variants() {
        let excludes: Vec<String> = vec![
            "**/vendor/**".to_string(),
            "*.tmp".to_string(),
            "**/node_modules/**".to_string(),
        ];
        assert!(is_excluded("proj/vendor/lib.go", &excludes));
        assert!(is_excluded("scratch.tmp", &excludes));
        assert!(is_excluded("web/node_modules/react/index.js", &excludes));
        assert!(!is_excluded("docs/guide.md", &excludes));
        assert!(!is_excluded("docs/guide.md", &[]));
    }

    #[test]
    fn test_prepare_text_for_embedding_rules() {
        let mut chunk = Chunk {
            chunk_id: "x:1-2".to_string(),
            doc_id: "x".to_string(),
            path: "docs/guide.md".to_string(),
            title: "Guide".to_string(),
            heading_path: Vec::new(),
            start_line: 1,
            end_line: 2,
            text: "body text".to_string(),
            terms: Vec::new(),
            code_blocks: Vec::new(),
            table_rows: Vec::new(),
            has_code: false,
            embedding: None,
        };

        // Markdown, no breadcrumb: the text alone.
        assert_eq!(prepare_text_for_embedding(&chunk), "body text");

        // Markdown with breadcrumb.
        chunk.heading_path = vec!["Guide".to_string(), "Setup".to_string()];
        assert_eq!(prepare_text_for_embedding(&chunk), "Guide > Setup: body text");

        // Source file: file prefix plus text.
        chunk.heading_path = Vec::new();
        chunk.path = "src/main.rs".to_string();
        assert_eq!(
            prepare_text_for_embedding(&chunk),
            "File: main.rs (Lang: rs)\nbody text"
        );
    }
}
