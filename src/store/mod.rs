//! Vector collection storage.
//!
//! The [`CollectionStore`] trait is everything the pipeline and the retrieval
//! service need from a vector index: create a collection with a fixed
//! dimension, upsert records by id, delete a source's records, and run an
//! exact cosine nearest-neighbour query.
//!
//! Two backends:
//! - [`SqliteStore`]: durable, vectors as little-endian `f32` BLOBs scored in Rust.
//! - [`InMemoryStore`]: `RwLock`-guarded maps for tests.
//!
//! The store is the single serialization point of an ingest run. Every write
//! method is atomic on its own, and [`replace_source`](CollectionStore::replace_source)
//! swaps a source's whole chunk set in one step.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;

use crate::error::{ConfigError, StoreError};
use crate::models::{Chunk, CollectionInfo, EmbeddingRecord, SearchFilter, SearchResult};

/// Per-kind counts for `docsift stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub document_sources: u64,
    pub document_chunks: u64,
    pub code_sources: u64,
    pub code_chunks: u64,
}

#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Create the collection if it does not exist and check that an existing
    /// one was built with the same dimension and model.
    async fn ensure_collection(
        &self,
        name: &str,
        dims: usize,
        model: &str,
    ) -> Result<CollectionInfo, ConfigError>;

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError>;

    /// Insert or replace records by id. Atomic per call.
    async fn upsert(&self, collection: &str, records: &[EmbeddingRecord])
        -> Result<usize, StoreError>;

    /// Remove every record of `source_path`. Returns how many were removed.
    async fn delete_by_source(&self, collection: &str, source_path: &str)
        -> Result<usize, StoreError>;

    /// Replace all records of `source_path` with `records`.
    ///
    /// The default runs [`delete_by_source`](Self::delete_by_source) then
    /// [`upsert`](Self::upsert), so a concurrent query may briefly miss the
    /// source. Backends that can do both in one transaction override it.
    async fn replace_source(
        &self,
        collection: &str,
        source_path: &str,
        records: &[EmbeddingRecord],
    ) -> Result<usize, StoreError> {
        self.delete_by_source(collection, source_path).await?;
        self.upsert(collection, records).await
    }

    /// At most `k` records by descending cosine similarity. Ties go to the
    /// most recently upserted record. A missing collection yields no results.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>, StoreError>;

    /// Stored chunks of one source in ordinal order.
    async fn source_chunks(&self, collection: &str, source_path: &str)
        -> Result<Vec<Chunk>, StoreError>;

    async fn stats(&self, collection: &str) -> Result<CollectionStats, StoreError>;
}

/// A scored candidate before ranking.
pub(crate) struct Scored {
    pub score: f32,
    pub seq: u64,
    pub result: SearchResult,
}

/// Sort by score descending, then by recency, and keep the first `k`.
pub(crate) fn top_k(mut scored: Vec<Scored>, k: usize) -> Vec<SearchResult> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.seq.cmp(&a.seq))
    });
    scored.truncate(k);
    scored.into_iter().map(|s| s.result).collect()
}

pub(crate) fn to_result(id: &str, chunk: &Chunk, score: f32) -> SearchResult {
    SearchResult {
        id: id.to_string(),
        text: chunk.text.clone(),
        source_path: chunk.source_path.clone(),
        score,
        ordinal: chunk.ordinal,
        kind: chunk.kind,
        language: chunk.language.clone(),
        symbol: chunk.symbol.clone(),
        start_line: chunk.span.start_line,
        end_line: chunk.span.end_line,
    }
}
