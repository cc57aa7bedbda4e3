use sqlx::SqlitePool;

/// Create the collection, record and fingerprint tables. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // One row per collection; dimension and model are fixed at creation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            dims INTEGER NOT NULL,
            model TEXT NOT NULL,
            distance TEXT NOT NULL DEFAULT 'cosine',
            next_seq INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedding records, keyed by the stable (path, ordinal) id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            source_path TEXT NOT NULL,
            kind TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            overlap INTEGER NOT NULL,
            language TEXT,
            symbol TEXT,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            seq INTEGER NOT NULL,
            PRIMARY KEY (collection, id),
            FOREIGN KEY (collection) REFERENCES collections(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Last successful ingestion per path
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fingerprints (
            collection TEXT NOT NULL,
            path TEXT NOT NULL,
            kind TEXT NOT NULL,
            digest TEXT NOT NULL,
            model TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_source ON records(collection, source_path)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind ON records(collection, kind)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_fingerprints_kind ON fingerprints(collection, kind)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
