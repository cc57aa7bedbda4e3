//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/docsift.sqlite"
//!
//! [collection]
//! name = "documents"
//!
//! [chunking]
//! max_tokens = 256
//! overlap_tokens = 32
//!
//! [embedding]
//! provider = "local"            # local | openai | ollama | hash
//! model = "all-minilm-l6-v2"
//!
//! [ingest]
//! documents_root = "./documents"
//! code_root = "./documents/code"
//!
//! [retrieval]
//! default_k = 5
//!
//! [server]
//! bind = "127.0.0.1:7331"
//! ```
//!
//! Every section except `[db]` may be omitted. Values are validated once in
//! [`load_config`]; anything that would make the run meaningless is a
//! [`ConfigError`] before a single file is read.

use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Approximate chars-per-token ratio used to turn token budgets into byte budgets.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Upper bound on a single store write or query.
    #[serde(default = "default_db_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transient write failures (locks, pool exhaustion).
    #[serde(default = "default_db_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_db_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_db_timeout_secs() -> u64 {
    30
}
fn default_db_max_retries() -> u32 {
    3
}
fn default_db_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_collection_name")]
    pub name: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: default_collection_name(),
        }
    }
}

fn default_collection_name() -> String {
    "documents".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

impl ChunkingConfig {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_tokens,
        }
    }

    /// Chunk budget `C` in bytes.
    pub fn max_chars(&self) -> usize {
        self.max_tokens * CHARS_PER_TOKEN
    }

    /// Overlap window `O` in bytes.
    pub fn overlap_chars(&self) -> usize {
        self.overlap_tokens * CHARS_PER_TOKEN
    }
}

fn default_max_tokens() -> usize {
    256
}
fn default_overlap_tokens() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for `ollama`, or an OpenAI-compatible endpoint for `openai`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Maximum embedding calls in flight across all pipelines.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_ms: default_backoff_ms(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub documents_root: Option<PathBuf>,
    /// Each immediate subdirectory is ingested as one repository.
    #[serde(default)]
    pub code_root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Extensions (without the dot) that are never read.
    #[serde(default = "default_ignore_extensions")]
    pub ignore_extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub skip_hidden: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Delete records of paths that no longer exist under their root.
    #[serde(default)]
    pub prune_missing: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            documents_root: None,
            code_root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            ignore_extensions: default_ignore_extensions(),
            skip_hidden: true,
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
            prune_missing: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_ignore_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "mp3", "mp4", "wav", "mov",
        "avi", "zip", "gz", "tgz", "bz2", "xz", "7z", "tar", "rar", "jar", "class", "pyc", "o",
        "a", "so", "dylib", "dll", "exe", "bin", "woff", "woff2", "ttf", "otf", "eot", "sqlite",
        "db", "lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_max_k() -> usize {
    50
}
fn default_search_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.collection.name.trim().is_empty() {
            return invalid("collection.name must not be empty".into());
        }

        // Chunking
        if self.chunking.max_tokens == 0 {
            return invalid("chunking.max_tokens must be > 0".into());
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return invalid(format!(
                "chunking.overlap_tokens ({}) must be smaller than chunking.max_tokens ({})",
                self.chunking.overlap_tokens, self.chunking.max_tokens
            ));
        }

        // Embedding
        let emb = &self.embedding;
        match emb.provider.as_str() {
            "local" | "hash" => {}
            "openai" | "ollama" => {
                if emb.model.is_none() {
                    return invalid(format!(
                        "embedding.model must be specified when provider is '{}'",
                        emb.provider
                    ));
                }
                if emb.dims.is_none() {
                    return invalid(format!(
                        "embedding.dims must be specified when provider is '{}'",
                        emb.provider
                    ));
                }
            }
            other => {
                return invalid(format!(
                    "unknown embedding provider: '{}'. Must be local, openai, ollama, or hash.",
                    other
                ))
            }
        }
        if emb.dims == Some(0) {
            return invalid("embedding.dims must be > 0".into());
        }
        if emb.batch_size == 0 {
            return invalid("embedding.batch_size must be > 0".into());
        }
        if emb.concurrency == 0 {
            return invalid("embedding.concurrency must be > 0".into());
        }
        if emb.timeout_secs == 0 {
            return invalid("embedding.timeout_secs must be > 0".into());
        }

        // Ingest
        if let (Some(docs), Some(code)) = (&self.ingest.documents_root, &self.ingest.code_root) {
            if docs == code {
                return invalid(format!(
                    "ingest.documents_root and ingest.code_root must differ (both are {})",
                    docs.display()
                ));
            }
        }
        for pattern in self
            .ingest
            .include_globs
            .iter()
            .chain(self.ingest.exclude_globs.iter())
        {
            if let Err(e) = Glob::new(pattern) {
                return invalid(format!("invalid glob '{}': {}", pattern, e));
            }
        }

        // Retrieval
        if self.retrieval.default_k == 0 {
            return invalid("retrieval.default_k must be >= 1".into());
        }
        if self.retrieval.max_k < self.retrieval.default_k {
            return invalid(format!(
                "retrieval.max_k ({}) must be >= retrieval.default_k ({})",
                self.retrieval.max_k, self.retrieval.default_k
            ));
        }
        if self.db.timeout_secs == 0 || self.retrieval.timeout_secs == 0 {
            return invalid("timeouts must be > 0".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/docsift.sqlite"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.collection.name, "documents");
        assert_eq!(cfg.chunking.max_chars(), 256 * CHARS_PER_TOKEN);
        assert_eq!(cfg.chunking.overlap_chars(), 32 * CHARS_PER_TOKEN);
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.embedding.batch_size, 64);
        assert_eq!(cfg.retrieval.default_k, 5);
        assert!(cfg.ingest.skip_hidden);
        assert!(!cfg.ingest.prune_missing);
        assert_eq!(cfg.ingest.include_globs, vec!["**/*".to_string()]);
    }

    #[test]
    fn overlap_must_be_smaller_than_budget() {
        let toml = format!("{}\n[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n", MINIMAL);
        let err = parse_config(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("overlap_tokens")));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let toml = format!("{}\n[embedding]\nprovider = \"magic\"\n", MINIMAL);
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::Invalid(m)) if m.contains("magic")
        ));
    }

    #[test]
    fn remote_providers_need_model_and_dims() {
        let toml = format!(
            "{}\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
            MINIMAL
        );
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::Invalid(m)) if m.contains("dims")
        ));
    }

    #[test]
    fn identical_roots_are_rejected() {
        let toml = format!(
            "{}\n[ingest]\ndocuments_root = \"./docs\"\ncode_root = \"./docs\"\n",
            MINIMAL
        );
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn bad_glob_is_rejected() {
        let toml = format!("{}\n[ingest]\nexclude_globs = [\"a[\"]\n", MINIMAL);
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn missing_db_section_is_parse_error() {
        assert!(matches!(
            parse_config("[collection]\nname = \"x\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn unreadable_file_is_read_error() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
