//! SQLite-backed [`CollectionStore`].
//!
//! Vectors are stored as little-endian `f32` BLOBs next to the chunk text and
//! metadata. Queries load the candidate rows (narrowed by kind and path prefix
//! in SQL) and score cosine similarity in Rust, which is exact and fast enough
//! for collections of a few hundred thousand chunks.
//!
//! Every write runs in its own transaction. Recency for tie-breaking comes
//! from a per-collection sequence counter bumped inside that transaction.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;

use super::{to_result, top_k, CollectionStats, CollectionStore, Scored};
use crate::config::DbConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{ConfigError, StoreError};
use crate::models::{
    Chunk, CollectionInfo, EmbeddingRecord, SearchFilter, SearchResult, SourceKind, Span,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an already-migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect, run migrations and wrap the pool.
    pub async fn open(config: &DbConfig) -> Result<Self, ConfigError> {
        let pool = crate::db::connect(config).await.map_err(|e| {
            ConfigError::StoreUnavailable(format!("{}: {}", config.path.display(), e))
        })?;
        crate::migrate::run_migrations(&pool)
            .await
            .map_err(|e| ConfigError::StoreUnavailable(format!("migration failed: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn collection_dims(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
) -> Result<usize, StoreError> {
    let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
        .bind(collection)
        .fetch_optional(&mut **tx)
        .await?;
    dims.map(|d| d as usize)
        .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))
}

fn check_dims(collection: &str, dims: usize, records: &[EmbeddingRecord]) -> Result<(), StoreError> {
    match records.iter().find(|r| r.vector.len() != dims) {
        Some(bad) => Err(StoreError::DimensionMismatch {
            collection: collection.to_string(),
            got: bad.vector.len(),
            want: dims,
        }),
        None => Ok(()),
    }
}

/// Reserve `n` sequence numbers and return the first.
async fn reserve_seq(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    n: usize,
) -> Result<i64, StoreError> {
    let last: i64 = sqlx::query_scalar(
        "UPDATE collections SET next_seq = next_seq + ? WHERE name = ? RETURNING next_seq",
    )
    .bind(n as i64)
    .bind(collection)
    .fetch_one(&mut **tx)
    .await?;
    Ok(last - n as i64 + 1)
}

async fn insert_records(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    records: &[EmbeddingRecord],
) -> Result<usize, StoreError> {
    if records.is_empty() {
        return Ok(0);
    }
    let first_seq = reserve_seq(tx, collection, records.len()).await?;

    for (i, record) in records.iter().enumerate() {
        let c = &record.chunk;
        sqlx::query(
            r#"
            INSERT INTO records (collection, id, source_path, kind, ordinal,
                                 start_offset, end_offset, start_line, end_line, overlap,
                                 language, symbol, text, embedding, seq)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                source_path = excluded.source_path,
                kind = excluded.kind,
                ordinal = excluded.ordinal,
                start_offset = excluded.start_offset,
                end_offset = excluded.end_offset,
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                overlap = excluded.overlap,
                language = excluded.language,
                symbol = excluded.symbol,
                text = excluded.text,
                embedding = excluded.embedding,
                seq = excluded.seq
            "#,
        )
        .bind(collection)
        .bind(&record.id)
        .bind(&c.source_path)
        .bind(c.kind.as_str())
        .bind(c.ordinal as i64)
        .bind(c.span.start as i64)
        .bind(c.span.end as i64)
        .bind(c.span.start_line as i64)
        .bind(c.span.end_line as i64)
        .bind(c.overlap as i64)
        .bind(&c.language)
        .bind(&c.symbol)
        .bind(&c.text)
        .bind(vec_to_blob(&record.vector))
        .bind(first_seq + i as i64)
        .execute(&mut **tx)
        .await?;
    }

    Ok(records.len())
}

async fn delete_source(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    source_path: &str,
) -> Result<usize, StoreError> {
    let result = sqlx::query("DELETE FROM records WHERE collection = ? AND source_path = ?")
        .bind(collection)
        .bind(source_path)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() as usize)
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let kind = SourceKind::from_str(&kind).map_err(|e| sqlx::Error::Decode(e.into()))?;
    Ok(Chunk {
        source_path: row.try_get("source_path")?,
        ordinal: row.try_get::<i64, _>("ordinal")? as u32,
        kind,
        language: row.try_get("language")?,
        symbol: row.try_get("symbol")?,
        span: Span {
            start: row.try_get::<i64, _>("start_offset")? as usize,
            end: row.try_get::<i64, _>("end_offset")? as usize,
            start_line: row.try_get::<i64, _>("start_line")? as u32,
            end_line: row.try_get::<i64, _>("end_line")? as u32,
        },
        overlap: row.try_get::<i64, _>("overlap")? as usize,
        text: row.try_get("text")?,
    })
}

const CHUNK_COLUMNS: &str = "id, source_path, kind, ordinal, start_offset, end_offset, \
                             start_line, end_line, overlap, language, symbol, text";

#[async_trait]
impl CollectionStore for SqliteStore {
    async fn ensure_collection(
        &self,
        name: &str,
        dims: usize,
        model: &str,
    ) -> Result<CollectionInfo, ConfigError> {
        let unavailable = |e: sqlx::Error| ConfigError::StoreUnavailable(e.to_string());

        sqlx::query(
            "INSERT INTO collections (name, dims, model, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(dims as i64)
        .bind(model)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        let info = self
            .collection_info(name)
            .await
            .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?
            .ok_or_else(|| {
                ConfigError::StoreUnavailable(format!("collection '{}' vanished after create", name))
            })?;

        if info.dims != dims {
            return Err(ConfigError::DimensionMismatch {
                name: name.to_string(),
                existing: info.dims,
                requested: dims,
            });
        }
        if info.model != model {
            return Err(ConfigError::ModelMismatch {
                name: name.to_string(),
                existing: info.model,
                requested: model.to_string(),
            });
        }
        Ok(info)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT c.dims, c.model,
                   (SELECT COUNT(*) FROM records r WHERE r.collection = c.name) AS records
            FROM collections c
            WHERE c.name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CollectionInfo {
            name: name.to_string(),
            dims: row.try_get::<i64, _>("dims")? as usize,
            model: row.try_get("model")?,
            records: row.try_get::<i64, _>("records")? as u64,
        }))
    }

    async fn upsert(
        &self,
        collection: &str,
        records: &[EmbeddingRecord],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let dims = collection_dims(&mut tx, collection).await?;
        check_dims(collection, dims, records)?;
        let n = insert_records(&mut tx, collection, records).await?;
        tx.commit().await?;
        Ok(n)
    }

    async fn delete_by_source(
        &self,
        collection: &str,
        source_path: &str,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let n = delete_source(&mut tx, collection, source_path).await?;
        tx.commit().await?;
        Ok(n)
    }

    async fn replace_source(
        &self,
        collection: &str,
        source_path: &str,
        records: &[EmbeddingRecord],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let dims = collection_dims(&mut tx, collection).await?;
        check_dims(collection, dims, records)?;
        delete_source(&mut tx, collection, source_path).await?;
        let n = insert_records(&mut tx, collection, records).await?;
        tx.commit().await?;
        Ok(n)
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let Some(info) = self.collection_info(collection).await? else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != info.dims {
            return Err(StoreError::DimensionMismatch {
                collection: collection.to_string(),
                got: vector.len(),
                want: info.dims,
            });
        }

        let kind = filter.kind.map(|k| k.as_str());
        let prefix = filter.path_prefix.as_deref();
        let sql = format!(
            r#"
            SELECT {CHUNK_COLUMNS}, embedding, seq
            FROM records
            WHERE collection = ?
              AND (? IS NULL OR kind = ?)
              AND (? IS NULL OR substr(source_path, 1, length(?)) = ?)
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(collection)
            .bind(kind)
            .bind(kind)
            .bind(prefix)
            .bind(prefix)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            let id: String = row.try_get("id")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            let seq: i64 = row.try_get("seq")?;
            let score = cosine_similarity(vector, &blob_to_vec(&blob));
            scored.push(Scored {
                score,
                seq: seq as u64,
                result: to_result(&id, &chunk, score),
            });
        }
        Ok(top_k(scored, k))
    }

    async fn source_chunks(
        &self,
        collection: &str,
        source_path: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM records
             WHERE collection = ? AND source_path = ?
             ORDER BY ordinal"
        );
        let rows = sqlx::query(&sql)
            .bind(collection)
            .bind(source_path)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row_to_chunk(row).map_err(StoreError::from))
            .collect()
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT kind, COUNT(DISTINCT source_path) AS sources, COUNT(*) AS chunks
            FROM records
            WHERE collection = ?
            GROUP BY kind
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = CollectionStats::default();
        for row in &rows {
            let kind: String = row.try_get("kind")?;
            let sources = row.try_get::<i64, _>("sources")? as u64;
            let chunks = row.try_get::<i64, _>("chunks")? as u64;
            match SourceKind::from_str(&kind) {
                Ok(SourceKind::Document) => {
                    stats.document_sources = sources;
                    stats.document_chunks = chunks;
                }
                Ok(SourceKind::Code) => {
                    stats.code_sources = sources;
                    stats.code_chunks = chunks;
                }
                Err(_) => {}
            }
        }
        Ok(stats)
    }
}
