//! Core data models shared by the pipeline, the store and the retrieval service.
//!
//! These types represent the sources, chunks, embedding records and search
//! results that flow from the filesystem roots into a collection and back out
//! to a query.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for record identifiers. Fixed so ids are stable across runs and machines.
const RECORD_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x0c, 0x4e, 0x1a, 0x93, 0x2b, 0x5d, 0x47, 0xa1, 0x58, 0x0e, 0x7d, 0x2c, 0x91, 0xb3, 0x64,
]);

/// Whether a source is free-form prose or a file inside a code repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Document,
    Code,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Document => "document",
            SourceKind::Code => "code",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" | "documents" | "doc" => Ok(SourceKind::Document),
            "code" => Ok(SourceKind::Code),
            other => Err(format!(
                "unknown source kind '{}'. Must be document or code.",
                other
            )),
        }
    }
}

/// A file found by discovery, before it is read.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Identity of the source: `/`-separated path relative to its root.
    pub rel_path: String,
    /// Where to read the bytes from.
    pub abs_path: PathBuf,
    pub kind: SourceKind,
}

/// Byte and line extent of a chunk within its normalized source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Inclusive start byte offset.
    pub start: usize,
    /// Exclusive end byte offset.
    pub end: usize,
    /// 1-based first line.
    pub start_line: u32,
    /// 1-based last line, inclusive.
    pub end_line: u32,
}

/// A contiguous slice of a source's normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_path: String,
    /// 0-based, contiguous within a source.
    pub ordinal: u32,
    pub kind: SourceKind,
    /// Language tag for code (`rust`, `python`, ...) or the document format (`markdown`, `text`, `pdf`).
    pub language: Option<String>,
    /// Name of the top-level definition this chunk starts in, code only.
    pub symbol: Option<String>,
    pub span: Span,
    /// Number of leading bytes of `text` repeated from the previous chunk.
    pub overlap: usize,
    pub text: String,
}

impl Chunk {
    /// The part of this chunk that the previous chunk does not already cover.
    pub fn fresh_text(&self) -> &str {
        self.text.get(self.overlap..).unwrap_or("")
    }
}

/// Stable identifier for the chunk at `ordinal` of `source_path`.
///
/// Re-ingesting the same path yields the same ids, which makes upsert idempotent.
pub fn record_id(source_path: &str, ordinal: u32) -> String {
    let name = format!("{}#{}", source_path, ordinal);
    Uuid::new_v5(&RECORD_NAMESPACE, name.as_bytes()).to_string()
}

/// A chunk paired with its vector, ready to upsert.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: String,
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: record_id(&chunk.source_path, chunk.ordinal),
            chunk,
            vector,
        }
    }
}

/// Query-time projection of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    pub source_path: String,
    /// Cosine similarity, higher is more relevant.
    pub score: f32,
    pub ordinal: u32,
    pub kind: SourceKind,
    pub language: Option<String>,
    pub symbol: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
}

/// Optional narrowing applied inside the store query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub kind: Option<SourceKind>,
    pub path_prefix: Option<String>,
}

impl SearchFilter {
    pub fn kind(kind: SourceKind) -> Self {
        Self {
            kind: Some(kind),
            path_prefix: None,
        }
    }

    pub fn matches(&self, kind: SourceKind, source_path: &str) -> bool {
        if let Some(k) = self.kind {
            if k != kind {
                return false;
            }
        }
        match &self.path_prefix {
            Some(prefix) => source_path.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// Collection metadata as recorded by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dims: usize,
    pub model: String,
    pub records: u64,
}

/// Persisted fingerprint of the last successful ingestion of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub path: String,
    pub kind: SourceKind,
    /// SHA-256 hex digest of the raw bytes.
    pub digest: String,
    /// Embedding model the chunks were produced with.
    pub model: String,
    pub chunk_count: u32,
    pub updated_at: i64,
}

/// Why a source was passed over without being indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Binary,
    Undecodable,
    TooLarge { bytes: u64, limit: u64 },
    Empty,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Binary => f.write_str("binary content"),
            SkipReason::Undecodable => f.write_str("not valid UTF-8"),
            SkipReason::TooLarge { bytes, limit } => {
                write!(f, "{} bytes exceeds limit of {}", bytes, limit)
            }
            SkipReason::Empty => f.write_str("no indexable text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSource {
    pub path: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub path: String,
    pub reason: String,
}

/// Counters for one pipeline run. Each pipeline owns its own and they are merged at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub discovered: u64,
    pub succeeded: u64,
    pub unchanged: u64,
    pub skipped: Vec<SkippedSource>,
    pub failed: Vec<FailedSource>,
    pub chunks_written: u64,
    pub pruned: u64,
    /// Dry run only: sources that would be re-indexed and their chunk count.
    pub planned: u64,
    pub planned_chunks: u64,
}

impl IngestSummary {
    pub fn merge(&mut self, other: IngestSummary) {
        self.discovered += other.discovered;
        self.succeeded += other.succeeded;
        self.unchanged += other.unchanged;
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        self.chunks_written += other.chunks_written;
        self.pruned += other.pruned;
        self.planned += other.planned;
        self.planned_chunks += other.planned_chunks;
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
