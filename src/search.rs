//! Retrieval service: embed a query, ask the store, return ranked results.
//!
//! Ranking is entirely the store's: results come back by descending cosine
//! similarity with ties going to the most recently written record. Nothing
//! here re-ranks. An empty query or `k = 0` is an empty answer, while every
//! embedding or store failure is an error so callers can tell "nothing
//! matched" apart from "could not search".

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{ConfigError, EmbeddingError, RetrievalError};
use crate::models::{SearchFilter, SearchResult, SourceKind};
use crate::store::{CollectionStore, SqliteStore};

pub struct RetrievalService {
    store: Arc<dyn CollectionStore>,
    embedder: Arc<dyn Embedder>,
    collection: String,
    default_k: usize,
    max_k: usize,
    timeout: Duration,
}

impl RetrievalService {
    /// Check the collection against the embedder and build the service.
    ///
    /// A collection built with another dimension or model is fatal. A
    /// collection that does not exist yet is fine; searches return nothing
    /// until something is ingested.
    pub async fn connect(
        store: Arc<dyn CollectionStore>,
        embedder: Arc<dyn Embedder>,
        collection: &str,
        retrieval: &RetrievalConfig,
    ) -> Result<Self, ConfigError> {
        let info = store
            .collection_info(collection)
            .await
            .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?;
        if let Some(info) = info {
            if info.dims != embedder.dims() {
                return Err(ConfigError::DimensionMismatch {
                    name: collection.to_string(),
                    existing: info.dims,
                    requested: embedder.dims(),
                });
            }
            if info.model != embedder.model_name() {
                return Err(ConfigError::ModelMismatch {
                    name: collection.to_string(),
                    existing: info.model,
                    requested: embedder.model_name().to_string(),
                });
            }
        }

        Ok(Self {
            store,
            embedder,
            collection: collection.to_string(),
            default_k: retrieval.default_k,
            max_k: retrieval.max_k,
            timeout: Duration::from_secs(retrieval.timeout_secs),
        })
    }

    /// Open the configured SQLite store and embedder.
    pub async fn open(config: &Config) -> Result<Self, ConfigError> {
        let store = SqliteStore::open(&config.db).await?;
        let embedder = create_embedder(&config.embedding)?;
        Self::connect(
            Arc::new(store),
            embedder,
            &config.collection.name,
            &config.retrieval,
        )
        .await
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    /// At most `k` results (clamped to `max_k`) most similar to `query`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let k = k.min(self.max_k);

        let texts = [query.to_string()];
        let mut vectors = tokio::time::timeout(self.timeout, self.embedder.embed(&texts))
            .await
            .map_err(|_| RetrievalError::Timeout(self.timeout))??;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                got: vectors.len(),
                want: 1,
            }
            .into());
        }
        let vector = vectors.swap_remove(0);

        let results = tokio::time::timeout(
            self.timeout,
            self.store.query(&self.collection, &vector, k, filter),
        )
        .await
        .map_err(|_| RetrievalError::Timeout(self.timeout))??;

        debug!(query, k, hits = results.len(), "search");
        Ok(results)
    }
}

/// `docsift search` arguments.
#[derive(Debug, Clone, Default)]
pub struct SearchArgs {
    pub query: String,
    pub k: Option<usize>,
    pub kind: Option<SourceKind>,
    pub path_prefix: Option<String>,
    pub json: bool,
}

pub async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    let filter = SearchFilter {
        kind: args.kind,
        path_prefix: args.path_prefix,
    };
    let k = args.k.unwrap_or(service.default_k());
    let results = service.search(&args.query, k, &filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, r) in results.iter().enumerate() {
        let lang = r.language.as_deref().unwrap_or("-");
        println!(
            "{}. [{:.3}] {} #{} ({}, {})",
            i + 1,
            r.score,
            r.source_path,
            r.ordinal,
            r.kind,
            lang
        );
        println!("    lines: {}-{}", r.start_line, r.end_line);
        if let Some(ref symbol) = r.symbol {
            println!("    symbol: {}", symbol);
        }
        let excerpt: String = r.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", r.id);
        println!();
    }
    Ok(())
}
