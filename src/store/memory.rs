//! In-memory [`VectorStore`] for tests and throwaway pipelines.
//!
//! Records live in insertion order behind a `tokio::sync::RwLock`;
//! queries are a brute-force scan like the SQLite backend.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{rank, Metric, ScoredRecord, VectorStore};
use crate::error::StoreError;
use crate::models::VectorRecord;

struct MemoryCollection {
    metric: Metric,
    dims: Option<usize>,
    records: Vec<VectorRecord>,
}

impl MemoryCollection {
    /// Validate a write against the collection's dimension, fixing it on
    /// the first write. Nothing changes when a record is rejected.
    fn admit<'a>(&mut self, name: &str, records: impl IntoIterator<Item = &'a VectorRecord>) -> Result<()> {
        let mut expected = self.dims;
        for record in records {
            let len = record.embedding.len();
            match expected {
                None => expected = Some(len),
                Some(want) if want != len => {
                    return Err(StoreError::DimensionMismatch {
                        collection: name.to_string(),
                        expected: want,
                        got: len,
                    }
                    .into());
                }
                Some(_) => {}
            }
        }
        self.dims = expected;
        Ok(())
    }

    fn put(&mut self, record: VectorRecord) {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, name: &str, metric: Metric) -> Result<()> {
        let mut collections = self.collections.write().await;
        match collections.get(name) {
            Some(existing) if existing.metric != metric => Err(StoreError::MetricMismatch {
                collection: name.to_string(),
                existing: existing.metric.as_str().to_string(),
                requested: metric.as_str().to_string(),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    name.to_string(),
                    MemoryCollection {
                        metric,
                        dims: None,
                        records: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .with_context(|| format!("Unknown collection '{}'", collection))?;

        target.admit(collection, &records)?;
        let written = records.len();
        for record in records {
            target.put(record);
        }
        Ok(written)
    }

    async fn replace_documents(
        &self,
        collection: &str,
        documents: Vec<(String, Vec<VectorRecord>)>,
    ) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .with_context(|| format!("Unknown collection '{}'", collection))?;

        target.admit(collection, documents.iter().flat_map(|(_, records)| records))?;
        let mut written = 0;
        for (document_id, records) in documents {
            target
                .records
                .retain(|r| r.document_id.as_deref() != Some(document_id.as_str()));
            written += records.len();
            for record in records {
                target.put(record);
            }
        }
        Ok(written)
    }

    async fn delete_document(&self, collection: &str, document_id: &str) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = target.records.len();
        target
            .records
            .retain(|r| r.document_id.as_deref() != Some(document_id));
        Ok((before - target.records.len()) as u64)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = target.records.len();
        target.records.retain(|r| !ids.contains(&r.id));
        Ok((before - target.records.len()) as u64)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|c| c.records.iter().find(|r| r.id == id).cloned()))
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, |c| c.records.len()))
    }

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        let collections = self.collections.read().await;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let scored = target
            .records
            .iter()
            .map(|record| ScoredRecord {
                score: target.metric.similarity(vector, &record.embedding),
                record: record.clone(),
            })
            .collect();
        Ok(rank(scored, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn record(id: &str, doc: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            document_id: Some(doc.into()),
            text: id.into(),
            embedding,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_replace_in_place_keeps_order() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        store
            .upsert("kb", vec![record("a", "d", vec![1.0, 0.0]), record("b", "d", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.upsert("kb", vec![record("a", "d", vec![1.0, 0.0])]).await.unwrap();
        let hits = store.query("kb", &[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_upsert_unknown_collection_errors() {
        let store = InMemoryVectorStore::new();
        assert!(store.upsert("nope", vec![record("a", "d", vec![1.0])]).await.is_err());
        assert_eq!(store.count("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_document() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("kb", Metric::L2).await.unwrap();
        store
            .upsert("kb", vec![record("a", "d1", vec![1.0]), record("b", "d2", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(store.delete_document("kb", "d1").await.unwrap(), 1);
        assert!(store.get("kb", "a").await.unwrap().is_none());
        assert!(store.get("kb", "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replace_documents_is_all_or_nothing() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("kb", Metric::Cosine).await.unwrap();
        store
            .upsert(
                "kb",
                vec![record("d1#0", "d1", vec![1.0, 0.0]), record("d1#1", "d1", vec![0.0, 1.0])],
            )
            .await
            .unwrap();

        let rejected = store
            .replace_documents(
                "kb",
                vec![
                    ("d1".into(), vec![record("d1#0", "d1", vec![1.0, 1.0])]),
                    ("d2".into(), vec![record("d2#0", "d2", vec![1.0])]),
                ],
            )
            .await;
        assert!(rejected.is_err());
        assert_eq!(store.count("kb").await.unwrap(), 2);

        let written = store
            .replace_documents("kb", vec![("d1".into(), vec![record("d1#0", "d1", vec![1.0, 1.0])])])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.count("kb").await.unwrap(), 1);
        assert_eq!(store.get("kb", "d1#0").await.unwrap().unwrap().embedding, vec![1.0, 1.0]);
    }
}
