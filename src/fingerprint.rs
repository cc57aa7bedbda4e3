//! Persisted per-path fingerprints of the last successful ingestion.
//!
//! A fingerprint pairs the SHA-256 of a source's raw bytes with the embedding
//! model that produced its chunks. The pipeline reads it before doing any
//! work and writes it only after the source's records were replaced, so a
//! crash in between makes the next run redo that source.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::StoreError;
use crate::models::{Fingerprint, SourceKind};

/// SHA-256 hex digest of raw source bytes.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get(&self, collection: &str, path: &str) -> Result<Option<Fingerprint>, StoreError>;

    /// Insert or replace the fingerprint for `fp.path`.
    async fn put(&self, collection: &str, fp: &Fingerprint) -> Result<(), StoreError>;

    async fn remove(&self, collection: &str, path: &str) -> Result<(), StoreError>;

    /// Every fingerprinted path of one kind, sorted.
    async fn paths(&self, collection: &str, kind: SourceKind) -> Result<Vec<String>, StoreError>;
}

/// Fingerprints in the `fingerprints` table of the store's database.
#[derive(Clone)]
pub struct SqliteFingerprints {
    pool: SqlitePool,
}

impl SqliteFingerprints {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FingerprintStore for SqliteFingerprints {
    async fn get(&self, collection: &str, path: &str) -> Result<Option<Fingerprint>, StoreError> {
        let row = sqlx::query(
            "SELECT kind, digest, model, chunk_count, updated_at
             FROM fingerprints WHERE collection = ? AND path = ?",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind: String = row.try_get("kind")?;
        let kind = SourceKind::from_str(&kind)
            .map_err(|e| StoreError::Backend(sqlx::Error::Decode(e.into())))?;
        Ok(Some(Fingerprint {
            path: path.to_string(),
            kind,
            digest: row.try_get("digest")?,
            model: row.try_get("model")?,
            chunk_count: row.try_get::<i64, _>("chunk_count")? as u32,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn put(&self, collection: &str, fp: &Fingerprint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fingerprints (collection, path, kind, digest, model, chunk_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, path) DO UPDATE SET
                kind = excluded.kind,
                digest = excluded.digest,
                model = excluded.model,
                chunk_count = excluded.chunk_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(&fp.path)
        .bind(fp.kind.as_str())
        .bind(&fp.digest)
        .bind(&fp.model)
        .bind(fp.chunk_count as i64)
        .bind(fp.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, collection: &str, path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM fingerprints WHERE collection = ? AND path = ?")
            .bind(collection)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn paths(&self, collection: &str, kind: SourceKind) -> Result<Vec<String>, StoreError> {
        let paths = sqlx::query_scalar(
            "SELECT path FROM fingerprints WHERE collection = ? AND kind = ? ORDER BY path",
        )
        .bind(collection)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }
}

/// In-memory fingerprints for tests.
#[derive(Default)]
pub struct MemoryFingerprints {
    entries: Mutex<HashMap<(String, String), Fingerprint>>,
}

impl MemoryFingerprints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprints {
    async fn get(&self, collection: &str, path: &str) -> Result<Option<Fingerprint>, StoreError> {
        Ok(self
            .entries
            .lock()
            .get(&(collection.to_string(), path.to_string()))
            .cloned())
    }

    async fn put(&self, collection: &str, fp: &Fingerprint) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert((collection.to_string(), fp.path.clone()), fp.clone());
        Ok(())
    }

    async fn remove(&self, collection: &str, path: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .remove(&(collection.to_string(), path.to_string()));
        Ok(())
    }

    async fn paths(&self, collection: &str, kind: SourceKind) -> Result<Vec<String>, StoreError> {
        let mut paths: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|((c, _), fp)| c == collection && fp.kind == kind)
            .map(|((_, p), _)| p.clone())
            .collect();
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::store::SqliteStore;

    fn fp(path: &str, kind: SourceKind, digest: &str) -> Fingerprint {
        Fingerprint {
            path: path.to_string(),
            kind,
            digest: digest.to_string(),
            model: "hash".to_string(),
            chunk_count: 2,
            updated_at: 1_700_000_000,
        }
    }

    async fn exercise(store: &dyn FingerprintStore) {
        assert!(store.get("c", "a.txt").await.unwrap().is_none());

        store.put("c", &fp("a.txt", SourceKind::Document, "d1")).await.unwrap();
        store.put("c", &fp("a.txt", SourceKind::Document, "d2")).await.unwrap();
        store.put("c", &fp("code/r/x.rs", SourceKind::Code, "d3")).await.unwrap();
        store.put("other", &fp("b.txt", SourceKind::Document, "d4")).await.unwrap();

        let got = store.get("c", "a.txt").await.unwrap().unwrap();
        assert_eq!(got.digest, "d2");
        assert_eq!(got.kind, SourceKind::Document);

        assert_eq!(
            store.paths("c", SourceKind::Document).await.unwrap(),
            vec!["a.txt".to_string()]
        );
        assert_eq!(
            store.paths("c", SourceKind::Code).await.unwrap(),
            vec!["code/r/x.rs".to_string()]
        );

        store.remove("c", "a.txt").await.unwrap();
        assert!(store.get("c", "a.txt").await.unwrap().is_none());
        assert!(store.get("other", "b.txt").await.unwrap().is_some());
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn memory_fingerprints() {
        exercise(&MemoryFingerprints::new()).await;
    }

    #[tokio::test]
    async fn sqlite_fingerprints() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = DbConfig {
            path: tmp.path().join("fp.sqlite"),
            timeout_secs: 5,
            max_retries: 0,
            backoff_ms: 0,
        };
        let store = SqliteStore::open(&config).await.unwrap();
        exercise(&SqliteFingerprints::new(store.pool().clone())).await;
    }
}
