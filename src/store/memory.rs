//! In-memory [`CollectionStore`] for tests.
//!
//! Collections live in a `HashMap` behind a `parking_lot::RwLock`; every
//! write takes the write lock once, which makes each call atomic. Queries are
//! brute-force cosine similarity over the collection.
//!
//! Besides the trait, it exposes a write-call counter and a failure injector
//! so pipeline tests can assert "no writes happened" and exercise retries.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{to_result, top_k, CollectionStats, CollectionStore, Scored};
use crate::embedding::cosine_similarity;
use crate::error::{ConfigError, StoreError};
use crate::models::{
    Chunk, CollectionInfo, EmbeddingRecord, SearchFilter, SearchResult, SourceKind,
};

struct StoredRecord {
    chunk: Chunk,
    vector: Vec<f32>,
    seq: u64,
}

struct Collection {
    dims: usize,
    model: String,
    next_seq: u64,
    records: HashMap<String, StoredRecord>,
}

impl Collection {
    fn check_dims(&self, name: &str, records: &[EmbeddingRecord]) -> Result<(), StoreError> {
        match records.iter().find(|r| r.vector.len() != self.dims) {
            Some(bad) => Err(StoreError::DimensionMismatch {
                collection: name.to_string(),
                got: bad.vector.len(),
                want: self.dims,
            }),
            None => Ok(()),
        }
    }

    fn remove_source(&mut self, source_path: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.chunk.source_path != source_path);
        before - self.records.len()
    }

    fn insert(&mut self, records: &[EmbeddingRecord]) -> usize {
        for r in records {
            self.next_seq += 1;
            self.records.insert(
                r.id.clone(),
                StoredRecord {
                    chunk: r.chunk.clone(),
                    vector: r.vector.clone(),
                    seq: self.next_seq,
                },
            );
        }
        records.len()
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    write_calls: AtomicU64,
    fail_writes: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write calls (upsert, delete, replace) received so far.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` write calls fail with a transient timeout.
    pub fn inject_write_failures(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Total records across the collection, for assertions.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |c| c.records.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Timeout(Duration::ZERO));
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionStore for InMemoryStore {
    async fn ensure_collection(
        &self,
        name: &str,
        dims: usize,
        model: &str,
    ) -> Result<CollectionInfo, ConfigError> {
        let mut collections = self.collections.write();
        let c = collections.entry(name.to_string()).or_insert_with(|| Collection {
            dims,
            model: model.to_string(),
            next_seq: 0,
            records: HashMap::new(),
        });
        if c.dims != dims {
            return Err(ConfigError::DimensionMismatch {
                name: name.to_string(),
                existing: c.dims,
                requested: dims,
            });
        }
        if c.model != model {
            return Err(ConfigError::ModelMismatch {
                name: name.to_string(),
                existing: c.model.clone(),
                requested: model.to_string(),
            });
        }
        Ok(CollectionInfo {
            name: name.to_string(),
            dims: c.dims,
            model: c.model.clone(),
            records: c.records.len() as u64,
        })
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError> {
        Ok(self.collections.read().get(name).map(|c| CollectionInfo {
            name: name.to_string(),
            dims: c.dims,
            model: c.model.clone(),
            records: c.records.len() as u64,
        }))
    }

    async fn upsert(
        &self,
        collection: &str,
        records: &[EmbeddingRecord],
    ) -> Result<usize, StoreError> {
        self.begin_write()?;
        let mut collections = self.collections.write();
        let c = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        c.check_dims(collection, records)?;
        Ok(c.insert(records))
    }

    async fn delete_by_source(
        &self,
        collection: &str,
        source_path: &str,
    ) -> Result<usize, StoreError> {
        self.begin_write()?;
        let mut collections = self.collections.write();
        Ok(collections
            .get_mut(collection)
            .map_or(0, |c| c.remove_source(source_path)))
    }

    async fn replace_source(
        &self,
        collection: &str,
        source_path: &str,
        records: &[EmbeddingRecord],
    ) -> Result<usize, StoreError> {
        self.begin_write()?;
        let mut collections = self.collections.write();
        let c = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        c.check_dims(collection, records)?;
        c.remove_source(source_path);
        Ok(c.insert(records))
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let collections = self.collections.read();
        let Some(c) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != c.dims {
            return Err(StoreError::DimensionMismatch {
                collection: collection.to_string(),
                got: vector.len(),
                want: c.dims,
            });
        }

        let scored = c
            .records
            .iter()
            .filter(|(_, r)| filter.matches(r.chunk.kind, &r.chunk.source_path))
            .map(|(id, r)| {
                let score = cosine_similarity(vector, &r.vector);
                Scored {
                    score,
                    seq: r.seq,
                    result: to_result(id, &r.chunk, score),
                }
            })
            .collect();
        Ok(top_k(scored, k))
    }

    async fn source_chunks(
        &self,
        collection: &str,
        source_path: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        let collections = self.collections.read();
        let mut chunks: Vec<Chunk> = collections
            .get(collection)
            .map(|c| {
                c.records
                    .values()
                    .filter(|r| r.chunk.source_path == source_path)
                    .map(|r| r.chunk.clone())
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.ordinal);
        Ok(chunks)
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        let collections = self.collections.read();
        let mut stats = CollectionStats::default();
        let Some(c) = collections.get(collection) else {
            return Ok(stats);
        };
        let mut doc_paths = std::collections::HashSet::new();
        let mut code_paths = std::collections::HashSet::new();
        for r in c.records.values() {
            match r.chunk.kind {
                SourceKind::Document => {
                    stats.document_chunks += 1;
                    doc_paths.insert(r.chunk.source_path.as_str());
                }
                SourceKind::Code => {
                    stats.code_chunks += 1;
                    code_paths.insert(r.chunk.source_path.as_str());
                }
            }
        }
        stats.document_sources = doc_paths.len() as u64;
        stats.code_sources = code_paths.len() as u64;
        Ok(stats)
    }
}
