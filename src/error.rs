//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Errors are layered by blast radius:
//!
//! | Type | Scope | Effect |
//! |------|-------|--------|
//! | [`ConfigError`] | process | fatal at startup, exit code 2 |
//! | [`SourceError`] | one file | recorded in the run summary, run continues |
//! | [`EmbeddingError`] | one batch | retried, then escalates to [`SourceError`] |
//! | [`StoreError`] | one write or query | retried on writes, surfaced on reads |
//! | [`RetrievalError`] | one search | returned to the caller, never an empty list |
//!
//! Command-level code in `main.rs` and the `run_*` helpers wraps these in
//! `anyhow` for context; the library boundaries stay typed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Fatal configuration or startup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(
        "collection '{name}' has dimension {existing}, but the embedder produces {requested}; \
         drop the collection or configure a matching model"
    )]
    DimensionMismatch {
        name: String,
        existing: usize,
        requested: usize,
    },

    #[error(
        "collection '{name}' was built with model '{existing}', but '{requested}' is configured"
    )]
    ModelMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("embedding provider unavailable: {0}")]
    Provider(String),

    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Per-source failure. The pipeline records it and moves on.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unreadable: {0}")]
    Unreadable(#[source] std::io::Error),

    #[error("discovery failed: {0}")]
    Walk(String),

    #[error("unparseable: {0}")]
    Unparseable(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Network failures, rate limits, 5xx. Worth retrying.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend refused the input (4xx other than 429). Not retried.
    #[error("embedding request rejected: {0}")]
    Rejected(String),

    #[error("embedding has dimension {got}, expected {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("embedding backend returned {got} vectors for {want} inputs")]
    CountMismatch { got: usize, want: usize },

    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<EmbeddingError>,
    },
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("vector has dimension {got}, collection '{collection}' expects {want}")]
    DimensionMismatch {
        collection: String,
        got: usize,
        want: usize,
    },

    #[error("collection '{0}' does not exist")]
    CollectionMissing(String),

    #[error("store write failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<StoreError>,
    },
}

impl StoreError {
    /// Lock contention, pool exhaustion, I/O hiccups and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Backend(sqlx::Error::PoolTimedOut) | Self::Backend(sqlx::Error::Io(_)) => true,
            Self::Backend(sqlx::Error::Database(db)) => {
                let msg = db.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("collection query failed: {0}")]
    Store(#[from] StoreError),

    #[error("search timed out after {0:?}")]
    Timeout(Duration),
}
