//! Source retrieval by path.
//!
//! Lists the chunks stored for one source path and rebuilds the indexed text
//! from them. Used by `docsift get` to inspect exactly what was ingested.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::chunk::reconstruct;
use crate::config::Config;
use crate::fingerprint::{FingerprintStore, SqliteFingerprints};
use crate::models::SourceKind;
use crate::store::{CollectionStore, SqliteStore};

#[derive(Debug, Clone, Serialize)]
pub struct SourceResponse {
    pub path: String,
    pub kind: SourceKind,
    pub digest: Option<String>,
    pub model: Option<String>,
    pub updated_at: Option<String>, // ISO8601
    /// The normalized text as rebuilt from the stored chunks.
    pub text: String,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub ordinal: u32,
    pub start_line: u32,
    pub end_line: u32,
    pub overlap: usize,
    pub symbol: Option<String>,
    pub text: String,
}

/// Stored chunks and fingerprint of `path`.
pub async fn get_source(
    store: &dyn CollectionStore,
    fingerprints: &dyn FingerprintStore,
    collection: &str,
    path: &str,
) -> Result<SourceResponse> {
    let chunks = store.source_chunks(collection, path).await?;
    let Some(first) = chunks.first() else {
        bail!("source not found: {}", path);
    };
    let kind = first.kind;
    let fp = fingerprints.get(collection, path).await?;

    Ok(SourceResponse {
        path: path.to_string(),
        kind,
        digest: fp.as_ref().map(|f| f.digest.clone()),
        model: fp.as_ref().map(|f| f.model.clone()),
        updated_at: fp.as_ref().map(|f| format_ts_iso(f.updated_at)),
        text: reconstruct(&chunks),
        chunks: chunks
            .into_iter()
            .map(|c| ChunkResponse {
                ordinal: c.ordinal,
                start_line: c.span.start_line,
                end_line: c.span.end_line,
                overlap: c.overlap,
                symbol: c.symbol,
                text: c.text,
            })
            .collect(),
    })
}

/// CLI entry point for `docsift get`.
pub async fn run_get(config: &Config, path: &str, json: bool) -> Result<()> {
    let store = SqliteStore::open(&config.db).await?;
    let fingerprints = SqliteFingerprints::new(store.pool().clone());
    let source = get_source(&store, &fingerprints, &config.collection.name, path).await?;
    store.pool().close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&source)?);
        return Ok(());
    }

    println!("--- Source ---");
    println!("path:         {}", source.path);
    println!("kind:         {}", source.kind);
    if let Some(ref digest) = source.digest {
        println!("digest:       {}", digest);
    }
    if let Some(ref model) = source.model {
        println!("model:        {}", model);
    }
    if let Some(ref ts) = source.updated_at {
        println!("updated_at:   {}", ts);
    }
    println!();

    println!("--- Chunks ({}) ---", source.chunks.len());
    for chunk in &source.chunks {
        match chunk.symbol {
            Some(ref symbol) => println!(
                "[chunk {}] lines {}-{} ({})",
                chunk.ordinal, chunk.start_line, chunk.end_line, symbol
            ),
            None => println!(
                "[chunk {}] lines {}-{}",
                chunk.ordinal, chunk.start_line, chunk.end_line
            ),
        }
        println!("{}", chunk.text);
        println!();
    }

    println!("--- Text ---");
    println!("{}", source.text);
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
