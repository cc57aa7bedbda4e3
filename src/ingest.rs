//! Ingestion pipeline orchestration.
//!
//! One run discovers the documents root and every repository under the code
//! root, then drives each of those as an independent tokio task. Within a
//! pipeline every source moves through the same steps:
//!
//! ```text
//! Discovered → FingerprintChecked → Unchanged
//!                                 → Skipped (binary, undecodable, too large, empty)
//!                                 → Chunked → Embedded → Replaced → Fingerprinted
//! ```
//!
//! The fingerprint is written last. A crash or failure anywhere before it
//! leaves the previous records in place and the source is retried on the next
//! run. Per-source failures are recorded in the pipeline's [`IngestSummary`];
//! summaries are merged only after every task has finished.

use anyhow::Result;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chunk::chunk_source;
use crate::config::{ChunkingConfig, Config, IngestConfig};
use crate::discover::{Discovery, Walker};
use crate::embedding::{create_embedder, BatchEmbedder};
use crate::error::{ConfigError, SourceError, StoreError};
use crate::extract::{extract, Extracted};
use crate::fingerprint::{self, FingerprintStore, SqliteFingerprints};
use crate::models::{
    EmbeddingRecord, FailedSource, Fingerprint, IngestSummary, SkipReason, SkippedSource,
    SourceFile, SourceKind,
};
use crate::progress::{ProgressEvent, ProgressMode, SyncProgressReporter};
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::store::{CollectionStore, SqliteStore};

/// How often a pipeline reports `Ingesting` progress, in sources.
const PROGRESS_EVERY: u64 = 25;

/// Which roots an ingest run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestScope {
    All,
    Documents,
    Code,
}

impl IngestScope {
    fn covers(self, kind: SourceKind) -> bool {
        match self {
            IngestScope::All => true,
            IngestScope::Documents => kind == SourceKind::Document,
            IngestScope::Code => kind == SourceKind::Code,
        }
    }
}

impl std::str::FromStr for IngestScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(IngestScope::All),
            "documents" | "docs" => Ok(IngestScope::Documents),
            "code" => Ok(IngestScope::Code),
            other => Err(format!(
                "unknown ingest scope '{}'. Must be all, documents, or code.",
                other
            )),
        }
    }
}

/// Everything a pipeline task needs, shared by all tasks of a run.
pub struct IngestContext {
    pub collection: String,
    pub store: Arc<dyn CollectionStore>,
    pub fingerprints: Arc<dyn FingerprintStore>,
    pub embedder: Arc<BatchEmbedder>,
    pub chunking: ChunkingConfig,
    pub max_file_bytes: u64,
    /// Retry policy and per-attempt timeout for store writes.
    pub store_policy: RetryPolicy,
    pub store_timeout: Duration,
    pub progress: Arc<dyn SyncProgressReporter>,
    /// Check fingerprints and chunk, but never embed or write.
    pub dry_run: bool,
}

/// Merged result of one run, split by source kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestReport {
    pub documents: IngestSummary,
    pub code: IngestSummary,
    /// Pipelines that ran, in label order.
    pub pipelines: Vec<String>,
}

impl IngestReport {
    pub fn total(&self) -> IngestSummary {
        let mut total = self.documents.clone();
        total.merge(self.code.clone());
        total
    }

    fn summary_mut(&mut self, kind: SourceKind) -> &mut IngestSummary {
        match kind {
            SourceKind::Document => &mut self.documents,
            SourceKind::Code => &mut self.code,
        }
    }
}

/// What happened to one source.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Indexed { chunks: usize },
    Unchanged,
    Planned { chunks: usize },
    Skipped(SkipReason),
}

/// Run a store operation with a per-attempt timeout and bounded retries.
async fn with_store_retry<T, F, Fut>(ctx: &IngestContext, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let timeout = ctx.store_timeout;
    let attempt = || {
        let fut = op();
        async move {
            tokio::time::timeout(timeout, fut)
                .await
                .unwrap_or(Err(StoreError::Timeout(timeout)))
        }
    };
    retry(&ctx.store_policy, what, StoreError::is_transient, attempt)
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => StoreError::Exhausted {
                attempts,
                last: Box::new(last),
            },
        })
}

/// Drop the records and fingerprint of a source that can no longer be indexed.
///
/// A no-op in dry runs.
async fn forget_source(ctx: &IngestContext, file: &SourceFile) -> Result<(), SourceError> {
    if ctx.dry_run {
        return Ok(());
    }
    let removed = with_store_retry(ctx, "delete stale source", || {
        ctx.store.delete_by_source(&ctx.collection, &file.rel_path)
    })
    .await?;
    ctx.fingerprints.remove(&ctx.collection, &file.rel_path).await?;
    debug!(path = %file.rel_path, removed, "dropped stale records");
    Ok(())
}

/// Drive one source through the state machine.
async fn ingest_source(ctx: &IngestContext, file: &SourceFile) -> Result<Outcome, SourceError> {
    let meta = tokio::fs::metadata(&file.abs_path)
        .await
        .map_err(SourceError::Unreadable)?;
    if meta.len() > ctx.max_file_bytes {
        if ctx.fingerprints.get(&ctx.collection, &file.rel_path).await?.is_some() {
            forget_source(ctx, file).await?;
        }
        return Ok(Outcome::Skipped(SkipReason::TooLarge {
            bytes: meta.len(),
            limit: ctx.max_file_bytes,
        }));
    }
    let bytes = tokio::fs::read(&file.abs_path)
        .await
        .map_err(SourceError::Unreadable)?;

    let digest = fingerprint::digest(&bytes);
    let model = ctx.embedder.model_name().to_string();
    let previous = ctx.fingerprints.get(&ctx.collection, &file.rel_path).await?;
    if previous
        .as_ref()
        .is_some_and(|fp| fp.digest == digest && fp.model == model)
    {
        return Ok(Outcome::Unchanged);
    }

    let abs_path = file.abs_path.clone();
    let extracted = tokio::task::spawn_blocking(move || extract(&abs_path, &bytes))
        .await
        .map_err(|e| SourceError::Unparseable(e.to_string()))?
        .map_err(|e| SourceError::Unparseable(e.to_string()))?;
    let text = match extracted {
        Extracted::Text(text) => text,
        Extracted::Skip(reason) => {
            if previous.is_some() {
                forget_source(ctx, file).await?;
            }
            return Ok(Outcome::Skipped(reason));
        }
    };

    let chunks = chunk_source(&file.rel_path, &text, file.kind, &ctx.chunking);
    if ctx.dry_run {
        return Ok(Outcome::Planned {
            chunks: chunks.len(),
        });
    }

    if chunks.is_empty() {
        // a source that emptied out must not keep serving its old chunks
        if previous.is_some() {
            forget_source(ctx, file).await?;
        }
        return Ok(Outcome::Skipped(SkipReason::Empty));
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = ctx.embedder.embed_all(&texts).await?;
    let records: Vec<EmbeddingRecord> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| EmbeddingRecord::new(chunk, vector))
        .collect();

    let written = with_store_retry(ctx, "replace source", || {
        ctx.store
            .replace_source(&ctx.collection, &file.rel_path, &records)
    })
    .await?;

    let fp = Fingerprint {
        path: file.rel_path.clone(),
        kind: file.kind,
        digest,
        model,
        chunk_count: written as u32,
        updated_at: chrono::Utc::now().timestamp(),
    };
    with_store_retry(ctx, "write fingerprint", || {
        ctx.fingerprints.put(&ctx.collection, &fp)
    })
    .await?;

    Ok(Outcome::Indexed { chunks: written })
}

/// Run every discovered source of one pipeline and summarize.
pub async fn run_pipeline(ctx: Arc<IngestContext>, label: String, discovery: Discovery) -> IngestSummary {
    let total = discovery.files.len() as u64;
    let mut summary = IngestSummary {
        discovered: total + discovery.failures.len() as u64,
        failed: discovery.failures,
        ..Default::default()
    };
    info!(pipeline = %label, sources = total, "pipeline started");

    for (i, file) in discovery.files.iter().enumerate() {
        match ingest_source(&ctx, file).await {
            Ok(Outcome::Indexed { chunks }) => {
                debug!(path = %file.rel_path, chunks, "indexed");
                summary.succeeded += 1;
                summary.chunks_written += chunks as u64;
            }
            Ok(Outcome::Unchanged) => summary.unchanged += 1,
            Ok(Outcome::Planned { chunks }) => {
                summary.planned += 1;
                summary.planned_chunks += chunks as u64;
            }
            Ok(Outcome::Skipped(reason)) => {
                debug!(path = %file.rel_path, %reason, "skipped");
                summary.skipped.push(SkippedSource {
                    path: file.rel_path.clone(),
                    reason,
                });
            }
            Err(err) => {
                warn!(path = %file.rel_path, error = %err, "source failed");
                summary.failed.push(FailedSource {
                    path: file.rel_path.clone(),
                    reason: err.to_string(),
                });
            }
        }

        let n = i as u64 + 1;
        if n % PROGRESS_EVERY == 0 || n == total {
            ctx.progress.report(ProgressEvent::Ingesting {
                pipeline: label.clone(),
                n,
                total,
            });
        }
    }

    ctx.progress.report(ProgressEvent::done(&label, &summary));
    info!(
        pipeline = %label,
        succeeded = summary.succeeded,
        unchanged = summary.unchanged,
        skipped = summary.skipped.len(),
        failed = summary.failed.len(),
        "pipeline finished"
    );
    summary
}

/// Delete records and fingerprints of `kind` paths that were not seen this run.
///
/// Without `prune`, only counts and logs them.
async fn prune_missing(
    ctx: &IngestContext,
    kind: SourceKind,
    seen: &HashSet<String>,
    prune: bool,
) -> Result<u64, StoreError> {
    let stale: Vec<String> = ctx
        .fingerprints
        .paths(&ctx.collection, kind)
        .await?
        .into_iter()
        .filter(|p| !seen.contains(p))
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }
    if !prune || ctx.dry_run {
        warn!(
            kind = %kind,
            stale = stale.len(),
            "indexed paths no longer exist; run with --prune to remove them"
        );
        return Ok(0);
    }

    for path in &stale {
        with_store_retry(ctx, "prune source", || {
            ctx.store.delete_by_source(&ctx.collection, path)
        })
        .await?;
        ctx.fingerprints.remove(&ctx.collection, path).await?;
        info!(path = %path, "pruned");
    }
    Ok(stale.len() as u64)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown cause".to_string()
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ConfigError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConfigError::Invalid(format!("discovery task failed: {}", e)))
}

fn require_dir(root: &Path, what: &str) -> Result<(), ConfigError> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} does not exist or is not a directory: {}",
            what,
            root.display()
        )))
    }
}

/// Discover the configured roots and run every pipeline concurrently.
pub async fn ingest_roots(
    ctx: Arc<IngestContext>,
    config: &IngestConfig,
    scope: IngestScope,
    prune: bool,
) -> Result<IngestReport, ConfigError> {
    let walker = Arc::new(Walker::new(config)?);
    let mut report = IngestReport::default();
    let mut pipelines: Vec<(String, SourceKind, Discovery)> = Vec::new();

    let docs_root = config
        .documents_root
        .clone()
        .filter(|_| scope.covers(SourceKind::Document));
    let code_root = config
        .code_root
        .clone()
        .filter(|_| scope.covers(SourceKind::Code));

    if let Some(root) = docs_root.clone() {
        require_dir(&root, "documents_root")?;
        ctx.progress.report(ProgressEvent::Discovering {
            pipeline: "documents".to_string(),
        });
        let walker = walker.clone();
        let nested_code = config.code_root.clone();
        let discovery = blocking(move || walker.documents(&root, nested_code.as_deref())).await?;
        pipelines.push(("documents".to_string(), SourceKind::Document, discovery));
    }

    if let Some(root) = code_root.clone() {
        require_dir(&root, "code_root")?;
        let repos = {
            let walker = walker.clone();
            let dir = root.clone();
            blocking(move || walker.repositories(&dir))
                .await?
                .map_err(|e| {
                    ConfigError::Invalid(format!("cannot list code_root {}: {}", root.display(), e))
                })?
        };
        for repo in repos {
            ctx.progress.report(ProgressEvent::Discovering {
                pipeline: repo.label.clone(),
            });
            let walker = walker.clone();
            let label = repo.label.clone();
            let discovery = blocking(move || walker.repository(&repo)).await?;
            pipelines.push((label, SourceKind::Code, discovery));
        }
    }

    // Paths seen per kind, for pruning. Collided code files count as seen.
    let mut seen_docs: HashSet<String> = HashSet::new();
    let mut seen_code: HashSet<String> = HashSet::new();
    for (_, kind, discovery) in &pipelines {
        let seen = match kind {
            SourceKind::Document => &mut seen_docs,
            SourceKind::Code => &mut seen_code,
        };
        seen.extend(discovery.seen_paths().map(str::to_string));
    }

    // Document and code paths share one namespace; a code file must not
    // overwrite a document's records.
    let mut doc_paths = seen_docs.clone();
    if docs_root.is_none() {
        doc_paths.extend(
            ctx.fingerprints
                .paths(&ctx.collection, SourceKind::Document)
                .await
                .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?,
        );
    }
    for (_, kind, discovery) in pipelines.iter_mut() {
        if *kind != SourceKind::Code {
            continue;
        }
        let (keep, collided): (Vec<SourceFile>, Vec<SourceFile>) = std::mem::take(&mut discovery.files)
            .into_iter()
            .partition(|f| !doc_paths.contains(&f.rel_path));
        discovery.files = keep;
        for file in collided {
            warn!(path = %file.rel_path, "code path collides with a document path");
            discovery.failures.push(FailedSource {
                path: file.rel_path,
                reason: "collides with a document of the same path".to_string(),
            });
        }
    }

    let mut tasks = JoinSet::new();
    for (label, kind, discovery) in pipelines {
        report.pipelines.push(label.clone());
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(run_pipeline(ctx, label.clone(), discovery))
                .catch_unwind()
                .await;
            (label, kind, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, kind, Ok(summary))) => report.summary_mut(kind).merge(summary),
            Ok((label, kind, Err(panic))) => {
                // the pipeline's own sources are unaccounted for; surface it as a failure
                let cause = panic_message(&*panic);
                error!(pipeline = %label, cause = %cause, "pipeline panicked");
                report.summary_mut(kind).failed.push(FailedSource {
                    path: label.clone(),
                    reason: format!("pipeline {} panicked: {}", label, cause),
                });
            }
            Err(err) => error!(error = %err, "pipeline task did not finish"),
        }
    }
    report.pipelines.sort();

    for (kind, root_walked, seen) in [
        (SourceKind::Document, docs_root.is_some(), &seen_docs),
        (SourceKind::Code, code_root.is_some(), &seen_code),
    ] {
        if !root_walked {
            continue;
        }
        match prune_missing(&ctx, kind, seen, prune).await {
            Ok(pruned) => report.summary_mut(kind).pruned += pruned,
            Err(err) => {
                warn!(kind = %kind, error = %err, "pruning failed");
                report.summary_mut(kind).failed.push(FailedSource {
                    path: String::new(),
                    reason: format!("pruning failed: {}", err),
                });
            }
        }
    }

    Ok(report)
}

/// Options for `docsift ingest`.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub scope: IngestScope,
    pub dry_run: bool,
    pub prune: bool,
    pub progress: ProgressMode,
}

/// Open the store, check the collection, run the pipelines and print the summary.
pub async fn run_ingest(config: &Config, opts: IngestOptions) -> Result<()> {
    if config.ingest.documents_root.is_none() && config.ingest.code_root.is_none() {
        return Err(ConfigError::Invalid(
            "nothing to ingest: set [ingest] documents_root and/or code_root".to_string(),
        )
        .into());
    }

    let store = SqliteStore::open(&config.db).await?;
    let embedder = create_embedder(&config.embedding)?;
    store
        .ensure_collection(&config.collection.name, embedder.dims(), embedder.model_name())
        .await?;

    let ctx = Arc::new(IngestContext {
        collection: config.collection.name.clone(),
        fingerprints: Arc::new(SqliteFingerprints::new(store.pool().clone())),
        store: Arc::new(store),
        embedder: Arc::new(BatchEmbedder::new(embedder, &config.embedding)),
        chunking: config.chunking.clone(),
        max_file_bytes: config.ingest.max_file_bytes,
        store_policy: RetryPolicy::new(
            config.db.max_retries,
            Duration::from_millis(config.db.backoff_ms),
        ),
        store_timeout: Duration::from_secs(config.db.timeout_secs),
        progress: opts.progress.reporter(),
        dry_run: opts.dry_run,
    });

    let prune = opts.prune || config.ingest.prune_missing;
    let report = ingest_roots(ctx.clone(), &config.ingest, opts.scope, prune).await?;
    print_report(&report, opts.dry_run, &ctx);
    Ok(())
}

fn print_report(report: &IngestReport, dry_run: bool, ctx: &IngestContext) {
    let sections = [
        ("documents", &report.documents),
        ("code", &report.code),
    ];
    for (name, s) in sections {
        if s.discovered == 0 && s.pruned == 0 {
            continue;
        }
        if dry_run {
            println!("ingest {} (dry-run)", name);
            println!("  sources found: {}", s.discovered);
            println!("  would index: {}", s.planned);
            println!("  estimated chunks: {}", s.planned_chunks);
        } else {
            println!("ingest {}", name);
            println!("  sources found: {}", s.discovered);
            println!("  indexed: {}", s.succeeded);
            println!("  chunks written: {}", s.chunks_written);
        }
        println!("  unchanged: {}", s.unchanged);
        println!("  skipped: {}", s.skipped.len());
        for skip in &s.skipped {
            println!("    {}  ({})", skip.path, skip.reason);
        }
        println!("  failed: {}", s.failed.len());
        for fail in &s.failed {
            println!("    {}  ({})", fail.path, fail.reason);
        }
        if s.pruned > 0 {
            println!("  pruned: {}", s.pruned);
        }
    }
    if !dry_run {
        println!(
            "embedding calls: {} (cache hits: {})",
            ctx.embedder.backend_calls(),
            ctx.embedder.cache_hits()
        );
    }
    if report.total().is_clean() {
        println!("ok");
    } else {
        println!("completed with failures");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, HashEmbedder};
    use crate::error::EmbeddingError;
    use crate::fingerprint::MemoryFingerprints;
    use crate::progress::NoProgress;
    use crate::store::InMemoryStore;
    use std::fs;

    fn context(store: Arc<InMemoryStore>, dry_run: bool) -> Arc<IngestContext> {
        context_with(
            store,
            Arc::new(MemoryFingerprints::new()),
            Arc::new(HashEmbedder::new("hash-test", 32)),
            Arc::new(NoProgress),
            dry_run,
        )
    }

    fn context_with(
        store: Arc<InMemoryStore>,
        fingerprints: Arc<MemoryFingerprints>,
        embedder: Arc<dyn Embedder>,
        progress: Arc<dyn SyncProgressReporter>,
        dry_run: bool,
    ) -> Arc<IngestContext> {
        let embedder = Arc::new(BatchEmbedder::with_settings(
            embedder,
            8,
            2,
            Duration::from_secs(5),
            RetryPolicy::none(),
        ));
        Arc::new(IngestContext {
            collection: "documents".into(),
            store,
            fingerprints,
            embedder,
            chunking: ChunkingConfig::new(64, 8),
            max_file_bytes: 1024,
            store_policy: RetryPolicy::new(2, Duration::from_millis(1)),
            store_timeout: Duration::from_secs(5),
            progress,
            dry_run,
        })
    }

    /// Same model and dimension as the test embedder, but every call fails.
    struct Down;

    #[async_trait::async_trait]
    impl Embedder for Down {
        fn model_name(&self) -> &str {
            "hash-test"
        }
        fn dims(&self) -> usize {
            32
        }
        async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Transient("backend down".into()))
        }
    }

    /// Panics once the named pipeline starts reporting progress.
    struct PanicOn(&'static str);

    impl SyncProgressReporter for PanicOn {
        fn report(&self, event: ProgressEvent) {
            if let ProgressEvent::Ingesting { pipeline, .. } = event {
                if pipeline == self.0 {
                    panic!("boom in {}", pipeline);
                }
            }
        }
    }

    fn roots(tmp: &Path) -> IngestConfig {
        IngestConfig {
            documents_root: Some(tmp.join("docs")),
            code_root: Some(tmp.join("code")),
            ..Default::default()
        }
    }

    fn write(path: &Path, body: impl AsRef<[u8]>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    async fn ready(store: &Arc<InMemoryStore>) {
        store.ensure_collection("documents", 32, "hash-test").await.unwrap();
    }

    #[tokio::test]
    async fn skips_binary_oversized_and_empty_sources() {
        let tmp = tempfile::TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        write(&docs.join("ok.txt"), "plain words");
        write(&docs.join("blob.txt"), b"\x00\x01\x02");
        write(&docs.join("big.txt"), "x".repeat(2048));
        write(&docs.join("blank.txt"), "   \n\n");
        fs::create_dir_all(tmp.path().join("code")).unwrap();

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let ctx = context(store.clone(), false);
        let report = ingest_roots(ctx, &roots(tmp.path()), IngestScope::All, false)
            .await
            .unwrap();

        let s = &report.documents;
        assert_eq!(s.discovered, 4);
        assert_eq!(s.succeeded, 1);
        assert!(s.failed.is_empty());
        let mut reasons: Vec<(String, SkipReason)> = s
            .skipped
            .iter()
            .map(|k| (k.path.clone(), k.reason.clone()))
            .collect();
        reasons.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            reasons,
            vec![
                (
                    "big.txt".to_string(),
                    SkipReason::TooLarge {
                        bytes: 2048,
                        limit: 1024
                    }
                ),
                ("blank.txt".to_string(), SkipReason::Empty),
                ("blob.txt".to_string(), SkipReason::Binary),
            ]
        );
    }

    #[tokio::test]
    async fn code_repositories_run_as_separate_pipelines() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(&tmp.path().join("docs/guide.md"), "# Guide\n\nRead me.");
        write(&tmp.path().join("code/api/src/lib.rs"), "pub fn api() -> u8 { 1 }\n");
        write(&tmp.path().join("code/web/app.py"), "def app():\n    return 2\n");

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let report = ingest_roots(context(store.clone(), false), &roots(tmp.path()), IngestScope::All, false)
            .await
            .unwrap();

        assert_eq!(report.pipelines, vec!["code/api", "code/web", "documents"]);
        assert_eq!(report.documents.succeeded, 1);
        assert_eq!(report.code.succeeded, 2);
        let chunks = store.source_chunks("documents", "code/api/src/lib.rs").await.unwrap();
        assert_eq!(chunks[0].kind, SourceKind::Code);
        assert_eq!(chunks[0].symbol.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(&tmp.path().join("docs/a.txt"), "alpha beta gamma");
        fs::create_dir_all(tmp.path().join("code")).unwrap();

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let ctx = context(store.clone(), true);
        let report = ingest_roots(ctx.clone(), &roots(tmp.path()), IngestScope::All, true)
            .await
            .unwrap();

        assert_eq!(report.documents.planned, 1);
        assert_eq!(report.documents.planned_chunks, 1);
        assert_eq!(report.documents.succeeded, 0);
        assert_eq!(store.write_calls(), 0);
        assert_eq!(ctx.embedder.backend_calls(), 0);
    }

    #[tokio::test]
    async fn prune_removes_vanished_sources_only_when_asked() {
        let tmp = tempfile::TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        write(&docs.join("keep.txt"), "kept text");
        write(&docs.join("gone.txt"), "doomed text");
        fs::create_dir_all(tmp.path().join("code")).unwrap();

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let ctx = context(store.clone(), false);
        let config = roots(tmp.path());
        ingest_roots(ctx.clone(), &config, IngestScope::All, false).await.unwrap();
        fs::remove_file(docs.join("gone.txt")).unwrap();

        let report = ingest_roots(ctx.clone(), &config, IngestScope::All, false).await.unwrap();
        assert_eq!(report.documents.pruned, 0);
        assert_eq!(store.source_chunks("documents", "gone.txt").await.unwrap().len(), 1);

        let report = ingest_roots(ctx.clone(), &config, IngestScope::All, true).await.unwrap();
        assert_eq!(report.documents.pruned, 1);
        assert!(store.source_chunks("documents", "gone.txt").await.unwrap().is_empty());
        assert!(ctx.fingerprints.get("documents", "gone.txt").await.unwrap().is_none());
        assert_eq!(store.source_chunks("documents", "keep.txt").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(&tmp.path().join("docs/a.txt"), "retry me");
        fs::create_dir_all(tmp.path().join("code")).unwrap();

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        store.inject_write_failures(2);
        let report = ingest_roots(context(store.clone(), false), &roots(tmp.path()), IngestScope::All, false)
            .await
            .unwrap();
        assert_eq!(report.documents.succeeded, 1);
        assert_eq!(store.write_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_store_retries_fail_the_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(&tmp.path().join("docs/a.txt"), "never lands");
        fs::create_dir_all(tmp.path().join("code")).unwrap();

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        store.inject_write_failures(10);
        let ctx = context(store.clone(), false);
        let report = ingest_roots(ctx.clone(), &roots(tmp.path()), IngestScope::All, false)
            .await
            .unwrap();
        assert_eq!(report.documents.failed.len(), 1);
        assert!(report.documents.failed[0].reason.contains("3 attempts"));
        assert!(ctx.fingerprints.get("documents", "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn colliding_code_path_is_reported_not_written() {
        let tmp = tempfile::TempDir::new().unwrap();
        // documents root contains a file whose path equals a code path
        write(&tmp.path().join("docs/code/r/x.py"), "prose about x");
        write(&tmp.path().join("code/r/x.py"), "def x():\n    pass\n");

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let config = IngestConfig {
            documents_root: Some(tmp.path().join("docs")),
            code_root: Some(tmp.path().join("code")),
            ..Default::default()
        };
        let report = ingest_roots(context(store.clone(), false), &config, IngestScope::All, false)
            .await
            .unwrap();
        assert_eq!(report.documents.succeeded, 1);
        assert_eq!(report.code.failed.len(), 1);
        assert!(report.code.failed[0].reason.contains("collides"));
        let chunks = store.source_chunks("documents", "code/r/x.py").await.unwrap();
        assert_eq!(chunks[0].kind, SourceKind::Document);
    }

    #[tokio::test]
    async fn missing_root_is_a_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let config = IngestConfig {
            documents_root: Some(tmp.path().join("nope")),
            ..Default::default()
        };
        let err = ingest_roots(context(store, false), &config, IngestScope::All, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn source_that_becomes_unindexable_loses_its_records() {
        let tmp = tempfile::TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        write(&docs.join("a.txt"), "secret roadmap text about widgets");
        write(&docs.join("b.txt"), "small notes about gadgets");
        fs::create_dir_all(tmp.path().join("code")).unwrap();

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let fps = Arc::new(MemoryFingerprints::new());
        let hash = || -> Arc<dyn Embedder> { Arc::new(HashEmbedder::new("hash-test", 32)) };
        let config = roots(tmp.path());
        let live = context_with(store.clone(), fps.clone(), hash(), Arc::new(NoProgress), false);
        ingest_roots(live.clone(), &config, IngestScope::All, false).await.unwrap();

        write(&docs.join("a.txt"), b"\x00\x01binary");
        write(&docs.join("b.txt"), "y".repeat(2048));

        // a dry run reports the skips but leaves the old records alone
        let dry = context_with(store.clone(), fps.clone(), hash(), Arc::new(NoProgress), true);
        ingest_roots(dry, &config, IngestScope::All, false).await.unwrap();
        assert_eq!(store.source_chunks("documents", "a.txt").await.unwrap().len(), 1);

        let report = ingest_roots(live, &config, IngestScope::All, true).await.unwrap();
        let mut skipped: Vec<&str> = report.documents.skipped.iter().map(|s| s.path.as_str()).collect();
        skipped.sort();
        assert_eq!(skipped, vec!["a.txt", "b.txt"]);
        for path in ["a.txt", "b.txt"] {
            assert!(store.source_chunks("documents", path).await.unwrap().is_empty());
            assert!(fps.get("documents", path).await.unwrap().is_none());
        }

        let svc_hits = store
            .query(
                "documents",
                &HashEmbedder::new("hash-test", 32).embed_text("secret roadmap widgets"),
                5,
                &Default::default(),
            )
            .await
            .unwrap();
        assert!(svc_hits.is_empty());
    }

    #[tokio::test]
    async fn exhausted_embedding_retries_keep_previous_records() {
        let tmp = tempfile::TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        write(&docs.join("a.txt"), "original words");
        fs::create_dir_all(tmp.path().join("code")).unwrap();

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let fps = Arc::new(MemoryFingerprints::new());
        let config = roots(tmp.path());
        let working = || {
            context_with(
                store.clone(),
                fps.clone(),
                Arc::new(HashEmbedder::new("hash-test", 32)),
                Arc::new(NoProgress),
                false,
            )
        };
        ingest_roots(working(), &config, IngestScope::All, false).await.unwrap();
        let before = fps.get("documents", "a.txt").await.unwrap().unwrap();

        write(&docs.join("a.txt"), "changed words");
        let down = context_with(store.clone(), fps.clone(), Arc::new(Down), Arc::new(NoProgress), false);
        let report = ingest_roots(down, &config, IngestScope::All, false).await.unwrap();
        assert_eq!(report.documents.failed.len(), 1);
        assert_eq!(report.documents.failed[0].path, "a.txt");
        assert!(report.documents.failed[0].reason.starts_with("embedding failed"));
        let chunks = store.source_chunks("documents", "a.txt").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "original words");
        assert_eq!(fps.get("documents", "a.txt").await.unwrap().unwrap().digest, before.digest);

        let report = ingest_roots(working(), &config, IngestScope::All, false).await.unwrap();
        assert_eq!(report.documents.succeeded, 1);
        let chunks = store.source_chunks("documents", "a.txt").await.unwrap();
        assert_eq!(chunks[0].text, "changed words");
        assert_ne!(fps.get("documents", "a.txt").await.unwrap().unwrap().digest, before.digest);
    }

    #[tokio::test]
    async fn panicking_pipeline_is_charged_to_its_own_kind() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(&tmp.path().join("docs/guide.md"), "# Guide\n\nRead me.");
        write(&tmp.path().join("code/api/lib.rs"), "pub fn api() {}\n");

        let store = Arc::new(InMemoryStore::new());
        ready(&store).await;
        let ctx = context_with(
            store.clone(),
            Arc::new(MemoryFingerprints::new()),
            Arc::new(HashEmbedder::new("hash-test", 32)),
            Arc::new(PanicOn("documents")),
            false,
        );
        let report = ingest_roots(ctx, &roots(tmp.path()), IngestScope::All, false)
            .await
            .unwrap();

        assert_eq!(report.documents.failed.len(), 1);
        assert_eq!(report.documents.failed[0].path, "documents");
        assert!(report.documents.failed[0].reason.contains("boom in documents"));
        assert!(report.code.failed.is_empty());
        assert_eq!(report.code.succeeded, 1);
    }

    #[test]
    fn parses_scope() {
        assert_eq!("code".parse::<IngestScope>().unwrap(), IngestScope::Code);
        assert_eq!("docs".parse::<IngestScope>().unwrap(), IngestScope::Documents);
        assert!("images".parse::<IngestScope>().is_err());
    }
}
