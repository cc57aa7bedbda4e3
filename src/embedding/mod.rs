//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete backends:
//! - **[`OpenAiEmbedder`]**: `POST /v1/embeddings` on OpenAI or a compatible endpoint.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: in-process inference via fastembed (feature
//!   `local-embeddings-fastembed`); no network calls after the model download.
//! - **[`HashEmbedder`]**: deterministic feature hashing of word tokens.
//!   Offline, instant, and good enough for lexical overlap; used by tests.
//!
//! Providers make exactly one attempt per call and classify failures into
//! [`EmbeddingError`] variants. Batching, retries, timeouts and caching live in
//! [`BatchEmbedder`].
//!
//! Also provides the vector helpers used by the SQLite store:
//! [`cosine_similarity`], [`vec_to_blob`] and [`blob_to_vec`].
//!
//! # Failure classification
//!
//! - HTTP 429 (rate limited) and 5xx (server error): `Transient`, retried
//! - other HTTP 4xx: `Rejected`, fails the batch immediately
//! - network errors: `Transient`
//! - client-side timeout: `Timeout`, retried

mod batch;

pub use batch::BatchEmbedder;

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{ConfigError, EmbeddingError};

/// Default model for the `local` provider, matching the sentence-transformers
/// `all-MiniLM-L6-v2` model.
pub const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";
pub const DEFAULT_HASH_MODEL: &str = "feature-hash-v1";
pub const DEFAULT_DIMS: usize = 384;

/// Text to fixed-length vector.
///
/// Implementations must return exactly one vector per input, in input order,
/// each of length [`dims`](Embedder::dims).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identity recorded with the collection.
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Create the [`Embedder`] selected by `[embedding] provider`.
///
/// | Config value | Backend |
/// |--------------|---------|
/// | `"local"` | `LocalEmbedder` (requires `local-embeddings-fastembed`) |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"hash"` | [`HashEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, ConfigError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.model.as_deref().unwrap_or(DEFAULT_HASH_MODEL),
            config.dims.unwrap_or(DEFAULT_DIMS),
        ))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(local::LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(ConfigError::Provider(
            "the local provider requires building with --features local-embeddings-fastembed"
                .to_string(),
        )),
        other => Err(ConfigError::Provider(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ConfigError::Provider(format!("failed to build HTTP client: {}", e)))
}

fn classify_status(backend: &str, status: StatusCode, body: String) -> EmbeddingError {
    let msg = format!("{} API error {}: {}", backend, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EmbeddingError::Transient(msg)
    } else {
        EmbeddingError::Rejected(msg)
    }
}

fn classify_send_error(backend: &str, err: reqwest::Error, timeout: Duration) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::Timeout(timeout)
    } else {
        EmbeddingError::Transient(format!("{} request failed: {}", backend, err))
    }
}

/// Numeric array to a vector. Any non-number rejects the whole response.
fn json_floats(backend: &str, values: &[serde_json::Value]) -> Result<Vec<f32>, EmbeddingError> {
    values
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                EmbeddingError::Rejected(format!("{} embedding contains a non-number: {}", backend, v))
            })
        })
        .collect()
}

// ============ OpenAI ============

/// Embedding backend using the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY`. `[embedding] url` may point at any
/// OpenAI-compatible base URL.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ConfigError::Invalid("embedding.model required for openai".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| ConfigError::Invalid("embedding.dims required for openai".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ConfigError::Provider("OPENAI_API_KEY environment variable not set".into())
        })?;
        let base = config
            .url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            endpoint: format!("{}/embeddings", base),
            api_key,
            model,
            dims,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error("OpenAI", e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("OpenAI", status, text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Transient(format!("OpenAI response unreadable: {}", e)))?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Rejected("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::Rejected("OpenAI response missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(pos, |i| i as usize);
        indexed.push((index, json_floats("OpenAI", embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedding backend using a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ConfigError::Invalid("embedding.model required for ollama".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| ConfigError::Invalid("embedding.dims required for ollama".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error("Ollama", e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("Ollama", status, text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Transient(format!("Ollama response unreadable: {}", e)))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::Rejected("Ollama response missing embeddings".into()))?;

    embeddings
        .iter()
        .map(|e| {
            let values = e
                .as_array()
                .ok_or_else(|| EmbeddingError::Rejected("Ollama embedding is not an array".into()))?;
            json_floats("Ollama", values)
        })
        .collect()
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use super::*;
    use parking_lot::Mutex;

    /// In-process embedding via fastembed. The model is loaded on first use
    /// and kept for the life of the embedder.
    pub struct LocalEmbedder {
        model_name: String,
        dims: usize,
        model: fastembed::EmbeddingModel,
        loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
            let (model, native_dims) = resolve_local_model(&model_name)?;
            let dims = config.dims.unwrap_or(native_dims);
            if dims != native_dims {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' produces {} dimensions, but embedding.dims = {}",
                    model_name, native_dims, dims
                )));
            }
            Ok(Self {
                model_name,
                dims,
                model,
                loaded: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn resolve_local_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize), ConfigError> {
        use fastembed::EmbeddingModel as M;
        let resolved = match name {
            "all-minilm-l6-v2" => (M::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (M::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (M::BGEBaseENV15, 768),
            "bge-large-en-v1.5" => (M::BGELargeENV15, 1024),
            "nomic-embed-text-v1" => (M::NomicEmbedTextV1, 768),
            "nomic-embed-text-v1.5" => (M::NomicEmbedTextV15, 768),
            "multilingual-e5-small" => (M::MultilingualE5Small, 384),
            "multilingual-e5-base" => (M::MultilingualE5Base, 768),
            "multilingual-e5-large" => (M::MultilingualE5Large, 1024),
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, \
                     bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                     nomic-embed-text-v1, nomic-embed-text-v1.5, multilingual-e5-small, \
                     multilingual-e5-base, multilingual-e5-large",
                    other
                )))
            }
        };
        Ok(resolved)
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let loaded = Arc::clone(&self.loaded);
            let model = self.model.clone();
            let texts = texts.to_vec();

            tokio::task::spawn_blocking(move || {
                let mut guard = loaded.lock();
                if guard.is_none() {
                    let init = fastembed::InitOptions::new(model).with_show_download_progress(true);
                    let created = fastembed::TextEmbedding::try_new(init).map_err(|e| {
                        EmbeddingError::Rejected(format!("failed to load local model: {}", e))
                    })?;
                    *guard = Some(created);
                }
                let Some(embedder) = guard.as_mut() else {
                    return Err(EmbeddingError::Rejected("local model not loaded".into()));
                };
                let batch = texts.len();
                embedder
                    .embed(texts, Some(batch))
                    .map_err(|e| EmbeddingError::Transient(format!("local embedding failed: {}", e)))
            })
            .await
            .map_err(|e| EmbeddingError::Transient(format!("embedding task panicked: {}", e)))?
        }
    }
}

// ============ Feature hashing ============

/// Deterministic bag-of-words embedder.
///
/// Each lower-cased alphanumeric token is hashed (FNV-1a) into one of `dims`
/// buckets with a sign taken from the hash, then the vector is L2-normalized.
/// Texts sharing vocabulary score high; disjoint texts score near zero.
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims: dims.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

// ============ Vector helpers ============

/// Encode a float vector as a BLOB of little-endian `f32` bytes.
///
/// ```rust
/// use docsift::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(DEFAULT_HASH_MODEL, 64);
        let texts = vec!["Rust borrow checker".to_string(), "rust BORROW checker".to_string()];
        let out = e.embed(&texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 64);
        assert_eq!(out[0], out[1]);
        let norm: f32 = out[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_separates_vocabularies() {
        let e = HashEmbedder::new(DEFAULT_HASH_MODEL, DEFAULT_DIMS);
        let q = e.embed_text("kubernetes deployment rollout");
        let near = e.embed_text("the deployment rollout on kubernetes failed");
        let far = e.embed_text("baking sourdough bread at home");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn empty_text_hashes_to_zero_vector() {
        let e = HashEmbedder::new(DEFAULT_HASH_MODEL, 8);
        assert!(e.embed_text("  \n").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn ollama_response_parses() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.5], [1.0, 0.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn non_numeric_values_reject_the_response() {
        let json = serde_json::json!({ "embeddings": [[0.5, "NaN"]] });
        assert!(matches!(
            parse_ollama_response(&json),
            Err(EmbeddingError::Rejected(_))
        ));
        let json = serde_json::json!({ "data": [{"index": 0, "embedding": [1.0, null]}] });
        assert!(matches!(
            parse_openai_response(&json),
            Err(EmbeddingError::Rejected(_))
        ));
    }

    #[test]
    fn status_classification() {
        assert!(classify_status("x", StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_status("x", StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!classify_status("x", StatusCode::BAD_REQUEST, String::new()).is_retryable());
    }

    #[test]
    fn factory_builds_hash_and_rejects_unknown() {
        let cfg = EmbeddingConfig {
            provider: "hash".into(),
            dims: Some(16),
            ..Default::default()
        };
        let e = create_embedder(&cfg).unwrap();
        assert_eq!(e.dims(), 16);
        assert_eq!(e.model_name(), DEFAULT_HASH_MODEL);

        let bad = EmbeddingConfig {
            provider: "nope".into(),
            ..Default::default()
        };
        assert!(matches!(create_embedder(&bad), Err(ConfigError::Provider(_))));
    }
}
