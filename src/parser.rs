//! Splits documents into searchable chunks.
//!
//! Two strategies: [`MarkdownParser`] splits by heading hierarchy and size
//! limits and extracts fenced code blocks and table rows; [`GenericParser`]
//! applies a sliding line window to source code and other unstructured
//! files. Both return the chunk sequence plus a term → chunk-count mapping
//! used for BM25 scoring.
//!
//! No NLP, just practical rules: chunk boundaries land on headings, long
//! paragraph breaks, or the hard line limit.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::models::{Chunk, CodeBlock, TableRow};
use crate::text::normalize_terms;

/// How one document becomes chunks. Implementations must be pure: the same
/// `(path, content)` always produces the same output.
pub trait DocumentParser: Send + Sync {
    /// Split `content` into chunks, attributing them to `path`.
    ///
    /// Returns the chunks in document order and the document-frequency map
    /// (how many chunks contain each term at least once).
    fn parse(&self, path: &str, content: &str) -> (Vec<Chunk>, HashMap<String, usize>);
}

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap());

static FENCE_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```(\w*)\s*$").unwrap());

static FENCE_CLOSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```\s*$").unwrap());

/// Stable 16-hex-char identifier for a file path: the first 64 bits of
/// SHA-256 over the absolute, lexically normalized path.
pub fn doc_id_for_path(path: &str) -> String {
    let abs = absolute_path(path);
    let digest = format!("{:x}", Sha256::digest(abs.to_string_lossy().as_bytes()));
    digest[..16].to_string()
}

/// Stable 16-hex-char identifier for a URL.
pub fn doc_id_for_url(url: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    digest[..16].to_string()
}

/// Absolute form of `path` with `.` and `..` components resolved lexically.
/// Does not touch the filesystem, so DocIDs stay stable for paths that do
/// not exist yet.
fn absolute_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    };

    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// term → number of chunks whose term list contains it at least once.
fn doc_frequency(chunks: &[Chunk]) -> HashMap<String, usize> {
    let mut doc_freq = HashMap::new();
    for chunk in chunks {
        let distinct: HashSet<&str> = chunk.terms.iter().map(String::as_str).collect();
        for term in distinct {
            *doc_freq.entry(term.to_string()).or_insert(0) += 1;
        }
    }
    doc_freq
}

/// Tracks the current heading hierarchy for breadcrumb paths.
#[derive(Default)]
struct HeadingStack {
    levels: Vec<usize>,
    titles: Vec<String>,
}

impl HeadingStack {
    fn push(&mut self, level: usize, title: String) {
        // Pop headings at the same or a deeper level before descending.
        while self.levels.last().is_some_and(|&l| l >= level) {
            self.levels.pop();
            self.titles.pop();
        }
        self.levels.push(level);
        self.titles.push(title);
    }

    fn path(&self) -> Vec<String> {
        self.titles.clone()
    }
}

/// A separator cell looks like `---`, `:---:`, or `---:`.
fn is_separator_cell(cell: &str) -> bool {
    cell.chars().all(|c| c == '-' || c == ':')
}

/// Extracts trimmed, non-empty, non-separator cells from a `| a | b |` row.
fn parse_table_row(line: &str) -> Vec<String> {
    let line = line.trim();
    if !line.starts_with('|') {
        return Vec::new();
    }
    line.split('|')
        .map(str::trim)
        .filter(|cell| !cell.is_empty() && !is_separator_cell(cell))
        .map(str::to_string)
        .collect()
}

/// The section being accumulated between chunk boundaries.
struct SectionState<'a> {
    doc_id: &'a str,
    path: &'a str,
    title: String,
    start: usize,
    buf: Vec<&'a str>,
    headings: HeadingStack,
    code_blocks: Vec<CodeBlock>,
    table_rows: Vec<TableRow>,
}

impl<'a> SectionState<'a> {
    fn new(doc_id: &'a str, path: &'a str) -> Self {
        Self {
            doc_id,
            path,
            title: basename(path),
            start: 1,
            buf: Vec::with_capacity(256),
            headings: HeadingStack::default(),
            code_blocks: Vec::new(),
            table_rows: Vec::new(),
        }
    }

    /// Emit the buffered section as a chunk ending at `end_line`.
    /// Sections that trim to empty text are discarded but still advance
    /// the start counter.
    fn flush(&mut self, end_line: usize, chunks: &mut Vec<Chunk>) {
        let text = self.buf.join("\n").trim().to_string();
        if text.is_empty() {
            self.buf.clear();
            self.start = end_line + 1;
            self.code_blocks.clear();
            self.table_rows.clear();
            return;
        }

        let terms = normalize_terms(&text);
        let code_blocks = std::mem::take(&mut self.code_blocks);
        let table_rows = std::mem::take(&mut self.table_rows);
        chunks.push(Chunk {
            chunk_id: format!("{}:{}-{}", self.doc_id, self.start, end_line),
            doc_id: self.doc_id.to_string(),
            path: self.path.to_string(),
            title: self.title.clone(),
            heading_path: self.headings.path(),
            start_line: self.start,
            end_line,
            text,
            terms,
            has_code: !code_blocks.is_empty(),
            code_blocks,
            table_rows,
            embedding: None,
        });

        self.buf.clear();
        self.start = end_line + 1;
    }
}

/// Splits markdown by headings and paragraph breaks. The default strategy
/// for `.md`/`.markdown` files.
pub struct MarkdownParser {
    /// Hard limit before a new chunk is forced.
    pub max_lines_per_chunk: usize,
    /// Minimum buffered lines before a heading triggers a split.
    pub min_lines_per_chunk: usize,
}

impl MarkdownParser {
    pub fn new() -> Self {
        Self {
            max_lines_per_chunk: 120,
            min_lines_per_chunk: 12,
        }
    }
}

impl Default for MarkdownParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentParser for MarkdownParser {
    fn parse(&self, path: &str, content: &str) -> (Vec<Chunk>, HashMap<String, usize>) {
        let lines: Vec<&str> = content.split('\n').collect();
        let doc_id = doc_id_for_path(path);

        let mut state = SectionState::new(&doc_id, path);
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut blank_run = 0usize;

        // Fence state. A truncated (never closed) block keeps its lines as
        // plain text and records no CodeBlock.
        let mut in_code_block = false;
        let mut code_lang = String::new();
        let mut code_start = 0usize;
        let mut code_buf: Vec<&str> = Vec::new();

        for (i, line) in lines.iter().enumerate() {
            let ln = i + 1;

            if in_code_block {
                if FENCE_CLOSE_RE.is_match(line) {
                    state.code_blocks.push(CodeBlock {
                        language: code_lang.clone(),
                        code: code_buf.join("\n"),
                        line: code_start,
                    });
                    in_code_block = false;
                    code_buf.clear();
                    state.buf.push(line);
                    continue;
                }
                code_buf.push(line);
                state.buf.push(line);
                continue;
            }

            if let Some(caps) = FENCE_OPEN_RE.captures(line) {
                in_code_block = true;
                code_lang = caps[1].to_string();
                code_start = ln;
                code_buf.clear();
                state.buf.push(line);
                continue;
            }

            if let Some(caps) = HEADING_RE.captures(line) {
                let level = caps[1].len();
                let title = caps[2].to_string();

                // Only split if the current section has enough content.
                if state.buf.len() >= self.min_lines_per_chunk {
                    state.flush(ln - 1, &mut chunks);
                }

                state.headings.push(level, title.clone());
                state.title = title;
                state.buf.push(line);
                blank_run = 0;
                continue;
            }

            if line.trim_start().starts_with('|') {
                let cells = parse_table_row(line);
                if !cells.is_empty() {
                    state.table_rows.push(TableRow { cells, line: ln });
                }
            }

            if line.trim().is_empty() {
                blank_run += 1;
            } else {
                blank_run = 0;
            }

            state.buf.push(line);

            // Force a split at the hard line limit or a long paragraph break.
            if state.buf.len() >= self.max_lines_per_chunk || blank_run >= 4 {
                state.flush(ln, &mut chunks);
                blank_run = 0;
            }
        }

        if !state.buf.is_empty() {
            state.flush(lines.len(), &mut chunks);
        }

        let doc_freq = doc_frequency(&chunks);
        (chunks, doc_freq)
    }
}

/// Splits files without heading structure (source code, plain text) using a
/// sliding window of lines.
#[derive(Clone)]
pub struct GenericParser {
    /// Lines per window.
    pub chunk_size: usize,
    /// Lines shared between consecutive windows.
    pub overlap: usize,
}

impl GenericParser {
    pub fn new() -> Self {
        Self {
            chunk_size: 60,
            overlap: 10,
        }
    }
}

impl Default for GenericParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentParser for GenericParser {
    fn parse(&self, path: &str, content: &str) -> (Vec<Chunk>, HashMap<String, usize>) {
        let lines: Vec<&str> = content.split('\n').collect();
        let doc_id = doc_id_for_path(path);
        let filename = basename(path);

        let chunk_size = self.chunk_size.max(1);
        let overlap = if self.overlap >= chunk_size {
            chunk_size / 2
        } else {
            self.overlap
        };
        let step = chunk_size - overlap;

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            let end = (i + chunk_size).min(lines.len());

            // Suppress tiny tail windows unless they are the only chunk.
            if end - i < 10 && !chunks.is_empty() {
                break;
            }

            let text = lines[i..end].join("\n");
            let terms = normalize_terms(&text);
            chunks.push(Chunk {
                chunk_id: format!("{}:{}-{}", doc_id, i + 1, end),
                doc_id: doc_id.clone(),
                path: path.to_string(),
                title: format!("Source Code: {}", filename),
                heading_path: Vec::new(),
                start_line: i + 1,
                end_line: end,
                text,
                terms,
                code_blocks: Vec::new(),
                table_rows: Vec::new(),
                has_code: true,
                embedding: None,
            });

            if end == lines.len() {
                break;
            }
            i += step;
        }

        let doc_freq = doc_frequency(&chunks);
        (chunks, doc_freq)
    }
}
