//! On-disk [`VectorStore`] backed by SQLite.
//!
//! A store is a directory holding `index.sqlite`. Embeddings are stored
//! as little-endian `f32` blobs and searched by a full scan of the
//! collection, which is exact and fast enough for a local corpus.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;

use super::{rank, Metric, ScoredRecord, VectorStore};
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::StoreError;
use crate::migrate;
use crate::models::{Metadata, VectorRecord};

const INDEX_FILE: &str = "index.sqlite";

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Open the store rooted at `dir`, creating it on first use.
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create store directory {}", dir.display()))?;
        let pool = db::connect(&dir.join(INDEX_FILE)).await?;
        migrate::migrate_vector_store(&pool).await?;
        Ok(Self { pool })
    }

    /// Names of all collections, sorted.
    pub async fn collections(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    /// Every record must match the collection's dimension, or the first
    /// record's when none is fixed yet. Returns the dimension to record
    /// for a collection that has none.
    async fn check_dims<'a>(
        &self,
        collection: &str,
        records: impl IntoIterator<Item = &'a VectorRecord>,
    ) -> Result<Option<usize>> {
        let (_, dims) = self
            .collection_info(collection)
            .await?
            .with_context(|| format!("Unknown collection '{}'", collection))?;

        let mut expected = dims.map(|d| d as usize);
        for record in records {
            let len = record.embedding.len();
            match expected {
                None => expected = Some(len),
                Some(want) if want != len => {
                    return Err(StoreError::DimensionMismatch {
                        collection: collection.to_string(),
                        expected: want,
                        got: len,
                    }
                    .into());
                }
                Some(_) => {}
            }
        }
        Ok(if dims.is_none() { expected } else { None })
    }

    async fn collection_info(&self, name: &str) -> Result<Option<(Metric, Option<i64>)>> {
        let row = sqlx::query("SELECT metric, dims FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let metric: String = row.get("metric");
                Ok(Some((Metric::parse(&metric)?, row.get("dims"))))
            }
            None => Ok(None),
        }
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<VectorRecord> {
    let id: String = row.get("id");
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)
        .with_context(|| format!("Corrupt metadata for record '{}'", id))?;
    let blob: Vec<u8> = row.get("embedding");
    Ok(VectorRecord {
        id,
        document_id: row.get("document_id"),
        text: row.get("text"),
        embedding: blob_to_vec(&blob),
        metadata,
    })
}

async fn set_dims(conn: &mut SqliteConnection, collection: &str, dims: usize) -> Result<()> {
    sqlx::query("UPDATE collections SET dims = ? WHERE name = ?")
        .bind(dims as i64)
        .bind(collection)
        .execute(conn)
        .await?;
    Ok(())
}

async fn insert_record(
    conn: &mut SqliteConnection,
    collection: &str,
    record: &VectorRecord,
    now: i64,
) -> Result<()> {
    let metadata_json = serde_json::to_string(&record.metadata)?;
    sqlx::query(
        r#"
        INSERT INTO records (collection, id, document_id, text, metadata_json, embedding, hash, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(collection, id) DO UPDATE SET
            document_id = excluded.document_id,
            text = excluded.text,
            metadata_json = excluded.metadata_json,
            embedding = excluded.embedding,
            hash = excluded.hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(collection)
    .bind(&record.id)
    .bind(&record.document_id)
    .bind(&record.text)
    .bind(&metadata_json)
    .bind(vec_to_blob(&record.embedding))
    .bind(content_hash(&record.text))
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn ensure_collection(&self, name: &str, metric: Metric) -> Result<()> {
        if let Some((existing, _)) = self.collection_info(name).await? {
            if existing != metric {
                return Err(StoreError::MetricMismatch {
                    collection: name.to_string(),
                    existing: existing.as_str().to_string(),
                    requested: metric.as_str().to_string(),
                }
                .into());
            }
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO collections (name, metric, dims, created_at) VALUES (?, ?, NULL, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(metric.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let fix_dims = self.check_dims(collection, &records).await?;

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        if let Some(dims) = fix_dims {
            set_dims(&mut *tx, collection, dims).await?;
        }
        for record in &records {
            insert_record(&mut *tx, collection, record, now).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn replace_documents(
        &self,
        collection: &str,
        documents: Vec<(String, Vec<VectorRecord>)>,
    ) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        let all: Vec<&VectorRecord> = documents.iter().flat_map(|(_, records)| records).collect();
        let fix_dims = self.check_dims(collection, all.iter().copied()).await?;

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        if let Some(dims) = fix_dims {
            set_dims(&mut *tx, collection, dims).await?;
        }
        for (document_id, records) in &documents {
            sqlx::query("DELETE FROM records WHERE collection = ? AND document_id = ?")
                .bind(collection)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
            for record in records {
                insert_record(&mut *tx, collection, record, now).await?;
            }
        }
        tx.commit().await?;
        Ok(all.len())
    }

    async fn delete_document(&self, collection: &str, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND document_id = ?")
            .bind(collection)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>> {
        let row = sqlx::query(
            "SELECT id, document_id, text, metadata_json, embedding
             FROM records WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        let Some((metric, _)) = self.collection_info(collection).await? else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT id, document_id, text, metadata_json, embedding
             FROM records WHERE collection = ? ORDER BY rowid",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            let score = metric.similarity(vector, &record.embedding);
            scored.push(ScoredRecord { record, score });
        }
        Ok(rank(scored, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn record(id: &str, doc: &str, text: &str, embedding: Vec<f32>) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), Value::from(doc));
        VectorRecord {
            id: id.into(),
            document_id: Some(doc.into()),
            text: text.into(),
            embedding,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_reopen_reconstructs_collection() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteVectorStore::open(dir.path()).await.unwrap();
            store.ensure_collection("kb", Metric::Cosine).await.unwrap();
            store
                .upsert("kb", vec![record("a#0", "a", "alpha", vec![1.0, 0.0])])
                .await
                .unwrap();
        }
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        assert_eq!(store.count("kb").await.unwrap(), 1);
        assert_eq!(store.collections().await.unwrap(), vec!["kb"]);
        let got = store.get("kb", "a#0").await.unwrap().unwrap();
        assert_eq!(got.text, "alpha");
        assert_eq!(got.embedding, vec![1.0, 0.0]);
        assert_eq!(got.metadata["source"], "a");
    }

    #[tokio::test]
    async fn test_metric_is_fixed_per_collection() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        let err = store.ensure_collection("kb", Metric::L2).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::MetricMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_query_ranks() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        store
            .upsert(
                "kb",
                vec![
                    record("a#0", "a", "old", vec![1.0, 0.0]),
                    record("b#0", "b", "bee", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        store
            .upsert("kb", vec![record("a#0", "a", "new", vec![0.6, 0.8])])
            .await
            .unwrap();

        assert_eq!(store.count("kb").await.unwrap(), 2);
        let hits = store.query("kb", &[0.0, 1.0], 5).await.unwrap();
        assert_eq!(hits[0].record.id, "b#0");
        assert_eq!(hits[1].record.text, "new");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        store
            .upsert("kb", vec![record("a#0", "a", "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        let err = store
            .upsert("kb", vec![record("b#0", "b", "y", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("3"));
    }

    #[tokio::test]
    async fn test_delete_document_and_ids() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::L2).await.unwrap();
        store
            .upsert(
                "kb",
                vec![
                    record("a#0", "a", "x", vec![1.0]),
                    record("a#1", "a", "y", vec![2.0]),
                    record("b#0", "b", "z", vec![3.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.delete_document("kb", "a").await.unwrap(), 2);
        assert_eq!(store.delete("kb", &["b#0".to_string()]).await.unwrap(), 1);
        assert_eq!(store.count("kb").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_documents_drops_stale_chunks() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        store
            .upsert(
                "kb",
                vec![
                    record("a#0", "a", "old", vec![1.0, 0.0]),
                    record("a#1", "a", "old tail", vec![0.0, 1.0]),
                    record("b#0", "b", "other", vec![1.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let written = store
            .replace_documents("kb", vec![("a".into(), vec![record("a#0", "a", "new", vec![1.0, 0.0])])])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.count("kb").await.unwrap(), 2);
        assert!(store.get("kb", "a#1").await.unwrap().is_none());
        assert_eq!(store.get("kb", "a#0").await.unwrap().unwrap().text, "new");
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_previous_chunks() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        store
            .upsert(
                "kb",
                vec![
                    record("a#0", "a", "kept a", vec![1.0, 0.0]),
                    record("b#0", "b", "kept b", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let err = store
            .replace_documents(
                "kb",
                vec![
                    ("a".into(), vec![record("a#0", "a", "fresh a", vec![1.0, 0.0])]),
                    ("b".into(), vec![record("b#0", "b", "fresh b", vec![1.0, 0.0, 0.0])]),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DimensionMismatch { expected: 2, got: 3, .. })
        ));
        assert_eq!(store.count("kb").await.unwrap(), 2);
        assert_eq!(store.get("kb", "a#0").await.unwrap().unwrap().text, "kept a");
        assert_eq!(store.get("kb", "b#0").await.unwrap().unwrap().text, "kept b");
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        store
            .upsert("kb", vec![record("a#0", "a", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        sqlx::query("UPDATE records SET metadata_json = '{not json' WHERE id = 'a#0'")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.get("kb", "a#0").await.unwrap_err();
        assert!(err.to_string().contains("Corrupt metadata for record 'a#0'"));
        assert!(store.query("kb", &[1.0, 0.0], 1).await.is_err());
    }

    #[tokio::test]
    async fn test_query_unknown_collection_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        assert!(store.query("nope", &[1.0], 3).await.unwrap().is_empty());
    }
}
