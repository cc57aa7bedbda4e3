//! Collection statistics.
//!
//! A quick look at what is indexed: the collection's model and dimension,
//! source and chunk counts per kind, and when each kind was last ingested.
//! Used by `docsift stats` to confirm that ingest runs are landing.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::store::{CollectionStore, SqliteStore};

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.db).await?;
    let collection = &config.collection.name;

    let info = store.collection_info(collection).await?;
    let stats = store.stats(collection).await?;

    let last_rows = sqlx::query(
        "SELECT kind, MAX(updated_at) AS last FROM fingerprints WHERE collection = ? GROUP BY kind",
    )
    .bind(collection)
    .fetch_all(store.pool())
    .await?;
    let mut last_document = None;
    let mut last_code = None;
    for row in &last_rows {
        let kind: String = row.try_get("kind")?;
        let last: Option<i64> = row.try_get("last")?;
        match kind.as_str() {
            "document" => last_document = last,
            "code" => last_code = last,
            _ => {}
        }
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docsift: collection stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Collection:  {}", collection);
    match info {
        Some(ref info) => {
            println!("  Model:       {}", info.model);
            println!("  Dimension:   {}", info.dims);
            println!("  Records:     {}", info.records);
        }
        None => println!("  (not created yet; run `docsift init` or `docsift ingest`)"),
    }

    if info.is_some() {
        println!();
        println!(
            "  {:<12} {:>8} {:>8}   {}",
            "KIND", "SOURCES", "CHUNKS", "LAST INGEST"
        );
        println!("  {}", "-".repeat(48));
        for (kind, sources, chunks, last) in [
            ("document", stats.document_sources, stats.document_chunks, last_document),
            ("code", stats.code_sources, stats.code_chunks, last_code),
        ] {
            let last_display = match last {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<12} {:>8} {:>8}   {}",
                kind, sources, chunks, last_display
            );
        }
    }

    println!();
    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else {
        format!("{:.2} GB", b / (KB * KB * KB))
    }
}

/// Unix timestamp as "3 hours ago", or a date once it is older than a month.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    let ago = |n: i64, unit: &str| format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" });
    match delta {
        d if d < 0 => format_ts_date(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => ago(d / 60, "min"),
        d if d < 86_400 => ago(d / 3600, "hour"),
        d if d < 86_400 * 30 => ago(d / 86_400, "day"),
        _ => format_ts_date(ts),
    }
}

fn format_ts_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
