//! Batching, bounded concurrency, retry and per-run caching around an [`Embedder`].
//!
//! One `BatchEmbedder` is shared by every pipeline of an ingest run, so its
//! semaphore caps the number of backend calls in flight across documents and
//! all code repositories together. Vectors are cached by the SHA-256 of the
//! exact text for the lifetime of the embedder; identical texts inside one
//! request are sent once.

use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use crate::retry::{retry, RetryError, RetryPolicy};

pub struct BatchEmbedder {
    inner: Arc<dyn Embedder>,
    batch_size: usize,
    concurrency: usize,
    timeout: Duration,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
    backend_calls: AtomicU64,
    cache_hits: AtomicU64,
}

impl BatchEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self::with_settings(
            inner,
            config.batch_size,
            config.concurrency,
            Duration::from_secs(config.timeout_secs),
            RetryPolicy::new(config.max_retries, Duration::from_millis(config.backoff_ms)),
        )
    }

    pub fn with_settings(
        inner: Arc<dyn Embedder>,
        batch_size: usize,
        concurrency: usize,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            inner,
            batch_size: batch_size.max(1),
            concurrency,
            timeout,
            policy,
            permits: Arc::new(Semaphore::new(concurrency)),
            cache: Mutex::new(HashMap::new()),
            backend_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    pub fn dims(&self) -> usize {
        self.inner.dims()
    }

    pub fn inner(&self) -> &Arc<dyn Embedder> {
        &self.inner
    }

    /// Backend `embed` calls made so far, retries included.
    pub fn backend_calls(&self) -> u64 {
        self.backend_calls.load(Ordering::Relaxed)
    }

    /// Texts answered without a new backend call.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Embed every text, one vector per input in input order.
    ///
    /// Fails as a whole if any batch fails after retries; nothing is returned
    /// for the texts that did succeed, but their vectors stay cached.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = texts.iter().map(|t| cache_key(t)).collect();

        let pending: Vec<(String, String)> = {
            let cache = self.cache.lock();
            let mut seen = HashSet::new();
            keys.iter()
                .zip(texts)
                .filter(|(k, _)| !cache.contains_key(*k) && seen.insert((*k).clone()))
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect()
        };
        self.cache_hits
            .fetch_add((texts.len() - pending.len()) as u64, Ordering::Relaxed);

        if !pending.is_empty() {
            debug!(
                texts = texts.len(),
                pending = pending.len(),
                batch_size = self.batch_size,
                "embedding batches"
            );
            let batches: Vec<Vec<(String, String)>> = pending
                .chunks(self.batch_size)
                .map(<[_]>::to_vec)
                .collect();
            let results: Vec<Vec<(String, Vec<f32>)>> = stream::iter(batches)
                .map(|batch| async move { self.embed_batch(batch).await })
                .buffer_unordered(self.concurrency)
                .try_collect()
                .await?;

            let mut cache = self.cache.lock();
            for (key, vector) in results.into_iter().flatten() {
                cache.insert(key, vector);
            }
        }

        let cache = self.cache.lock();
        keys.iter()
            .map(|k| {
                cache.get(k).cloned().ok_or(EmbeddingError::CountMismatch {
                    got: 0,
                    want: 1,
                })
            })
            .collect()
    }

    async fn embed_batch(
        &self,
        batch: Vec<(String, String)>,
    ) -> Result<Vec<(String, Vec<f32>)>, EmbeddingError> {
        let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
        let texts = &texts;
        let this = self;

        let vectors = retry(
            &self.policy,
            "embedding batch",
            EmbeddingError::is_retryable,
            move || async move {
                let _permit = this
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| EmbeddingError::Transient("embedding pool closed".into()))?;
                this.backend_calls.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(this.timeout, this.inner.embed(texts)).await {
                    Ok(result) => result,
                    Err(_) => Err(EmbeddingError::Timeout(this.timeout)),
                }
            },
        )
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => EmbeddingError::Exhausted {
                attempts,
                last: Box::new(last),
            },
        })?;

        if vectors.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                got: vectors.len(),
                want: batch.len(),
            });
        }
        let want = self.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != want) {
            return Err(EmbeddingError::DimensionMismatch {
                got: bad.len(),
                want,
            });
        }

        Ok(batch
            .into_iter()
            .map(|(k, _)| k)
            .zip(vectors)
            .collect())
    }
}

fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
