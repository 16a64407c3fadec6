//! MCP tool layer and JSON-RPC protocol bridge.
//!
//! Each tool is a thin adapter: it parses and validates arguments, calls
//! one [`Indexer`] method, and formats the result as text. [`McpServer`]
//! bridges the [`ToolRegistry`] to the MCP JSON-RPC protocol so any MCP
//! client can drive the engine over stdio.
//!
//! | Tool | Engine call |
//! |------|-------------|
//! | `docs_load` | [`Indexer::load`] |
//! | `docs_load_glob` | [`Indexer::load_glob`] |
//! | `docs_query` | [`Indexer::query`] / [`Indexer::query_all`] |
//! | `site_loads` | [`Indexer::load_site`] per URL |
//! | `read_repository` | [`Indexer::load_glob_async`] with safe excludes |
//! | `indexing_status` | [`Indexer::status`] |
//! | `docs_list` | [`Indexer::list`] |

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorCode, Implementation, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::Value;

use crate::indexer::Indexer;

/// Bridge handed to every tool execution.
pub struct ToolContext {
    pub indexer: Arc<Indexer>,
}

/// An MCP tool that agents can discover and call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores (e.g. `"docs_load"`).
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Execute with parsed arguments and return the response text.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String>;
}

fn str_arg(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

// ── docs_load ────────────────────────────────────────────────────────────

struct DocsLoadTool;

#[async_trait]
impl Tool for DocsLoadTool {
    fn name(&self) -> &str {
        "docs_load"
    }

    fn description(&self) -> &str {
        "Load + index a markdown file and cache it locally for fast subsequent queries."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to a local markdown file (e.g. docs/nats.md)" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let path = str_arg(&params, "path");
        if path.is_empty() {
            bail!("path is required");
        }

        tracing::debug!(path, "docs_load: loading file");
        let result = ctx.indexer.load(&path).await?;
        tracing::info!(
            path,
            doc_id = %result.doc_id,
            chunks = result.num_chunks,
            from_cache = result.from_cache,
            "docs_load: success"
        );

        if result.from_cache {
            Ok(format!(
                "Loaded from cache.\n\ndoc_id: {}\npath: {}\nchunks: {}\nindexed_at: {}\n",
                result.doc_id,
                result.path,
                result.num_chunks,
                result.indexed_at.to_rfc3339()
            ))
        } else {
            Ok(format!(
                "Indexed and cached.\n\ndoc_id: {}\npath: {}\nchunks: {}\n",
                result.doc_id, result.path, result.num_chunks
            ))
        }
    }
}

// ── docs_load_glob ───────────────────────────────────────────────────────

struct DocsLoadGlobTool;

#[async_trait]
impl Tool for DocsLoadGlobTool {
    fn name(&self) -> &str {
        "docs_load_glob"
    }

    fn description(&self) -> &str {
        "Load multiple markdown files matching a glob pattern (e.g. 'docs/**/*.md'). Faster than calling docs_load repeatedly."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Glob pattern to match markdown files (e.g. 'docs/**/*.md', '*.md')" }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let pattern = str_arg(&params, "pattern");
        if pattern.is_empty() {
            bail!("pattern is required");
        }

        tracing::debug!(pattern, "docs_load_glob: loading files");
        let result = ctx.indexer.load_glob(&pattern, &[]).await?;
        tracing::info!(
            pattern,
            loaded = result.loaded,
            cached = result.cached,
            failed = result.failed,
            "docs_load_glob: success"
        );

        let total_chunks: usize = result.results.iter().map(|r| r.num_chunks).sum();
        let mut msg = format!(
            "Loaded {} files ({} cached), {} chunks total",
            result.loaded, result.cached, total_chunks
        );
        if result.failed > 0 {
            msg.push_str(&format!(", {} failed", result.failed));
        }
        Ok(msg)
    }
}

// ── docs_query ───────────────────────────────────────────────────────────

struct DocsQueryTool;

#[async_trait]
impl Tool for DocsQueryTool {
    fn name(&self) -> &str {
        "docs_query"
    }

    fn description(&self) -> &str {
        "Query indexed documents. If doc_id/path omitted, searches ALL loaded docs. Returns token-bounded, source-linked excerpts."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "doc_id": { "type": "string", "description": "DocID returned from docs_load (optional if path is provided)" },
                "path": { "type": "string", "description": "Path to the markdown file (used to derive doc_id if doc_id omitted)" },
                "prompt": { "type": "string", "description": "Short query prompt (e.g. 'consumer')" },
                "max_tokens": { "type": "integer", "description": "Approx max tokens to return (default 500)" }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let doc_id = str_arg(&params, "doc_id");
        let path = str_arg(&params, "path");
        let prompt = str_arg(&params, "prompt");
        let max_tokens = params
            .get("max_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        if prompt.is_empty() {
            bail!("prompt is required");
        }

        let answer = if doc_id.is_empty() && path.is_empty() {
            tracing::debug!(prompt, max_tokens, "docs_query: searching all documents");
            ctx.indexer.query_all(&prompt, max_tokens).await?
        } else {
            tracing::debug!(doc_id, path, prompt, max_tokens, "docs_query: searching document");
            ctx.indexer.query(&doc_id, &path, &prompt, max_tokens).await?
        };

        tracing::info!(prompt, answer_length = answer.len(), "docs_query: success");
        Ok(answer)
    }
}

// ── site_loads ───────────────────────────────────────────────────────────

struct SiteLoadsTool;

#[async_trait]
impl Tool for SiteLoadsTool {
    fn name(&self) -> &str {
        "site_loads"
    }

    fn description(&self) -> &str {
        "Fetch multiple website URLs, convert HTML to markdown, and cache them for querying."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "urls": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "URLs of websites to fetch and convert to markdown"
                },
                "force": { "type": "boolean", "description": "Force re-fetch even if cached (default: false)" }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let urls: Vec<String> = params
            .get("urls")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let force = params.get("force").and_then(|v| v.as_bool()).unwrap_or(false);

        if urls.is_empty() {
            bail!("urls is required (provide at least one URL)");
        }

        tracing::debug!(count = urls.len(), force, "site_loads: fetching sites");

        let mut body = String::new();
        let (mut loaded, mut cached, mut failed) = (0usize, 0usize, 0usize);

        for url in &urls {
            match ctx.indexer.load_site(url, force).await {
                Ok(result) => {
                    loaded += 1;
                    if result.from_cache {
                        cached += 1;
                    }
                    body.push_str(&format!("- {} (chunks: {})\n", url, result.num_chunks));
                }
                Err(e) => {
                    tracing::error!(url, error = %e, "site_loads: failed to load");
                    failed += 1;
                    body.push_str(&format!("- FAILED: {} ({:#})\n", url, e));
                }
            }
        }

        tracing::info!(loaded, cached, failed, "site_loads: complete");

        Ok(format!(
            "Loaded {} sites ({} from cache, {} failed)\n\n{}",
            loaded, cached, failed, body
        ))
    }
}

// ── read_repository ──────────────────────────────────────────────────────

struct ReadRepositoryTool;

/// Defaults that keep build artifacts and dependencies out of the index.
const REPO_DEFAULT_EXCLUDES: &[&str] = &[
    "**/vendor/**",
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/build/**",
    "**/*_test.go",
    "**/*.pb.go",
    "**/gen/**",
    "**/generated/**",
];

#[async_trait]
impl Tool for ReadRepositoryTool {
    fn name(&self) -> &str {
        "read_repository"
    }

    fn description(&self) -> &str {
        "Index a source repository with safe defaults (excludes vendor, gen, test files). Use this for loading codebases."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Root directory of the repository or service to index" },
                "excludes": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Glob patterns to exclude (defaults to vendor, gen, test files)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let root = str_arg(&params, "path");
        if root.is_empty() {
            bail!("path is required");
        }

        let mut excludes: Vec<String> =
            REPO_DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        if let Some(user) = params.get("excludes").and_then(|v| v.as_array()) {
            excludes.extend(user.iter().filter_map(|v| v.as_str()).map(String::from));
        }

        let pattern = format!("{}/**/*", root.trim_end_matches('/'));

        tracing::debug!(path = root, "read_repository: scanning repo");
        ctx.indexer.load_glob_async(&pattern, excludes)?;
        tracing::info!(path = root, "read_repository: started async");

        Ok(format!(
            "Started indexing repository at {}\n\nThis process runs in the background. Use 'docs_list' to check progress or see loaded files.",
            root
        ))
    }
}

// ── indexing_status ──────────────────────────────────────────────────────

struct IndexingStatusTool;

#[async_trait]
impl Tool for IndexingStatusTool {
    fn name(&self) -> &str {
        "indexing_status"
    }

    fn description(&self) -> &str {
        "Check the progress of background indexing (queue depth, embedded count, etc)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<String> {
        let status = ctx.indexer.status();

        let state = if status.queue_length > 0 || status.active_workers > 0 {
            "indexing"
        } else {
            "idle"
        };

        let resp = serde_json::json!({
            "docs_count": status.docs_count,
            "queue_length": status.queue_length,
            "embedded_count": status.embedded_count,
            "active_workers": status.active_workers,
            "status": state,
        });

        Ok(serde_json::to_string_pretty(&resp)?)
    }
}

// ── docs_list ────────────────────────────────────────────────────────────

struct DocsListTool;

/// Listing cap so a repository of thousands of files cannot blow out the
/// caller's context.
const MAX_LIST_DISPLAY: usize = 50;

#[async_trait]
impl Tool for DocsListTool {
    fn name(&self) -> &str {
        "docs_list"
    }

    fn description(&self) -> &str {
        "List all currently cached documents (from docs_load or site_loads). Returns doc_id, path, and chunk count."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<String> {
        let docs = ctx.indexer.list();

        if docs.is_empty() {
            return Ok(
                "No documents currently loaded. Use docs_load, site_loads, or read_repository first."
                    .to_string(),
            );
        }

        let mut out = format!("Loaded documents: {}\n\n", docs.len());
        for (i, doc) in docs.iter().enumerate() {
            if i >= MAX_LIST_DISPLAY {
                out.push_str(&format!("\n... and {} more files.", docs.len() - MAX_LIST_DISPLAY));
                break;
            }
            out.push_str(&format!("- doc_id: {}\n", doc.doc_id));
            if let Some(url) = &doc.source_url {
                out.push_str(&format!("  url: {}\n", url));
            }
            out.push_str(&format!("  path: {}\n", doc.path));
            out.push_str(&format!("  chunks: {}\n", doc.num_chunks));
        }

        tracing::info!(count = docs.len(), "docs_list: success");
        Ok(out)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Registry for the engine's MCP tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry pre-loaded with all built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DocsLoadTool));
        registry.register(Box::new(DocsLoadGlobTool));
        registry.register(Box::new(DocsQueryTool));
        registry.register(Box::new(SiteLoadsTool));
        registry.register(Box::new(ReadRepositoryTool));
        registry.register(Box::new(IndexingStatusTool));
        registry.register(Box::new(DocsListTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ── MCP bridge ───────────────────────────────────────────────────────────

/// Bridges the tool registry to the MCP JSON-RPC protocol.
///
/// Each MCP session receives a clone of this struct (everything is behind
/// `Arc`), so all sessions share the same indexer and tool set.
#[derive(Clone)]
pub struct McpServer {
    tools: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
}

impl McpServer {
    pub fn new(indexer: Arc<Indexer>) -> Self {
        Self {
            tools: Arc::new(ToolRegistry::with_builtins()),
            ctx: Arc::new(ToolContext { indexer }),
        }
    }

    /// Convert a docdex tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn Tool) -> rmcp::model::Tool {
        let schema_value = tool.parameters_schema();
        let input_schema: Arc<serde_json::Map<String, Value>> = match schema_value {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        rmcp::model::Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "docdex".to_string(),
                title: Some("docdex".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use docs_load to index a markdown file once (cached), then docs_query to \
                 fetch token-bounded, source-linked excerpts."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<rmcp::model::Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match tool.execute(params, &self.ctx).await {
            Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!("{:#}", e))])),
        }
    }
}
