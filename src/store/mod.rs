//! Vector store abstraction.
//!
//! The [`VectorStore`] trait persists [`VectorRecord`]s in named
//! collections and answers nearest-neighbour queries. [`Collection`] binds
//! a store, a collection name and an [`EmbeddingProvider`] together so
//! callers can upsert and query by text.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`sqlite::SqliteVectorStore`] | On-disk directory, survives restarts |
//! | [`memory::InMemoryVectorStore`] | Tests and throwaway pipelines |
//!
//! Similarity is always "higher is better": cosine similarity for
//! [`Metric::Cosine`], `1 / (1 + distance)` for [`Metric::L2`]. The
//! metric is fixed when a collection is created.

pub mod lock;
pub mod memory;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::embedding::{self, EmbeddingProvider};
use crate::error::StoreError;
use crate::models::{Metadata, RetrievalResult, SourceTag, VectorRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    L2,
}

impl Metric {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "cosine" => Ok(Self::Cosine),
            "l2" => Ok(Self::L2),
            other => bail!("Unknown metric: '{}'", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
        }
    }

    /// Similarity of `a` and `b`; higher is closer.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Self::Cosine => embedding::cosine_similarity(a, b) as f64,
            Self::L2 => 1.0 / (1.0 + embedding::l2_distance(a, b) as f64),
        }
    }
}

/// A stored record with its similarity to a query.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: VectorRecord,
    pub score: f64,
}

impl ScoredRecord {
    pub fn into_result(self) -> RetrievalResult {
        RetrievalResult {
            id: self.record.id,
            text: self.record.text,
            score: self.score,
            source: SourceTag::Local,
            metadata: self.record.metadata,
        }
    }
}

/// Sort by descending score, keeping input order for ties, and keep `k`.
pub fn rank(mut scored: Vec<ScoredRecord>, k: usize) -> Vec<ScoredRecord> {
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    scored
}

/// Storage backend for embedded records.
///
/// Writers must be serialized per collection by the caller (see
/// [`lock::IngestLock`]); readers may run concurrently.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if missing. Fails if it exists with another metric.
    async fn ensure_collection(&self, name: &str, metric: Metric) -> Result<()>;

    /// Insert or overwrite records by id. Returns the number written.
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize>;

    /// Swap each document's records for the given ones: every old record
    /// of a listed document is removed and the new ones written. The whole
    /// batch lands or none of it does. Returns the number written.
    async fn replace_documents(
        &self,
        collection: &str,
        documents: Vec<(String, Vec<VectorRecord>)>,
    ) -> Result<usize>;

    /// Remove every record belonging to `document_id`.
    async fn delete_document(&self, collection: &str, document_id: &str) -> Result<u64>;

    /// Remove records by id.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<u64>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>>;

    async fn count(&self, collection: &str) -> Result<usize>;

    /// The `k` most similar records, best first. Unknown or empty
    /// collections yield an empty list.
    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>>;
}

/// What to search with.
#[derive(Debug, Clone, Copy)]
pub enum QueryInput<'a> {
    Text(&'a str),
    Vector(&'a [f32]),
}

/// Outcome of [`Collection::upsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub written: usize,
    /// Records stored with a zero vector because embedding failed.
    pub zero_vectors: usize,
}

/// The chunks of one document, written together by
/// [`Collection::replace_documents`].
#[derive(Debug, Clone, Default)]
pub struct DocumentChunks {
    pub document_id: String,
    pub ids: Vec<String>,
    pub texts: Vec<String>,
    pub metadata: Vec<Metadata>,
}

/// A named collection bound to its store and embedding provider.
#[derive(Clone)]
pub struct Collection {
    name: String,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Collection {
    /// Open (creating if needed) `name` in `store`.
    pub async fn open(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        name: &str,
        metric: Metric,
    ) -> Result<Self> {
        store.ensure_collection(name, metric).await?;
        Ok(Self {
            name: name.to_string(),
            store,
            embedder,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Embed `texts` and upsert them under `ids`.
    ///
    /// A string `source` entry in a record's metadata becomes its document id.
    pub async fn upsert(
        &self,
        ids: &[String],
        texts: &[String],
        metadata: &[Metadata],
    ) -> Result<UpsertReport> {
        if ids.len() != texts.len() || ids.len() != metadata.len() {
            return Err(StoreError::LengthMismatch {
                ids: ids.len(),
                texts: texts.len(),
                metadata: metadata.len(),
            }
            .into());
        }
        if ids.is_empty() {
            return Ok(UpsertReport::default());
        }

        let embedded = embedding::embed_texts(self.embedder.as_ref(), texts).await;
        let zero_vectors = embedded.failed.len();

        let records: Vec<VectorRecord> = ids
            .iter()
            .zip(texts)
            .zip(metadata)
            .zip(embedded.vectors)
            .map(|(((id, text), meta), vector)| VectorRecord {
                id: id.clone(),
                document_id: meta.get("source").and_then(Value::as_str).map(String::from),
                text: text.clone(),
                embedding: vector,
                metadata: meta.clone(),
            })
            .collect();

        let written = self.store.upsert(&self.name, records).await?;
        Ok(UpsertReport {
            written,
            zero_vectors,
        })
    }

    /// Embed every chunk of `documents` and atomically replace what the
    /// store holds for those documents.
    ///
    /// On error the previously stored chunks of every listed document are
    /// left untouched.
    pub async fn replace_documents(&self, documents: &[DocumentChunks]) -> Result<UpsertReport> {
        for doc in documents {
            if doc.ids.len() != doc.texts.len() || doc.ids.len() != doc.metadata.len() {
                return Err(StoreError::LengthMismatch {
                    ids: doc.ids.len(),
                    texts: doc.texts.len(),
                    metadata: doc.metadata.len(),
                }
                .into());
            }
        }
        if documents.is_empty() {
            return Ok(UpsertReport::default());
        }

        let texts: Vec<String> = documents.iter().flat_map(|d| d.texts.iter().cloned()).collect();
        let embedded = embedding::embed_texts(self.embedder.as_ref(), &texts).await;
        let zero_vectors = embedded.failed.len();
        let mut vectors = embedded.vectors.into_iter();

        let mut batch = Vec::with_capacity(documents.len());
        for doc in documents {
            let records: Vec<VectorRecord> = doc
                .ids
                .iter()
                .zip(&doc.texts)
                .zip(&doc.metadata)
                .zip(vectors.by_ref())
                .map(|(((id, text), meta), vector)| VectorRecord {
                    id: id.clone(),
                    document_id: Some(doc.document_id.clone()),
                    text: text.clone(),
                    embedding: vector,
                    metadata: meta.clone(),
                })
                .collect();
            batch.push((doc.document_id.clone(), records));
        }

        let written = self.store.replace_documents(&self.name, batch).await?;
        Ok(UpsertReport {
            written,
            zero_vectors,
        })
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        self.store.delete_document(&self.name, document_id).await
    }

    pub async fn delete(&self, ids: &[String]) -> Result<u64> {
        self.store.delete(&self.name, ids).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        self.store.get(&self.name, id).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count(&self.name).await
    }

    /// The `k` nearest records to a text (embedded first) or a vector.
    pub async fn query(&self, input: QueryInput<'_>, k: usize) -> Result<Vec<ScoredRecord>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        match input {
            QueryInput::Vector(vector) => self.store.query(&self.name, vector, k).await,
            QueryInput::Text(text) => {
                let vector = embedding::embed_query(self.embedder.as_ref(), text).await;
                if embedding::is_zero_vector(&vector) {
                    tracing::warn!(collection = %self.name, "query embedding unavailable, no local results");
                    return Ok(Vec::new());
                }
                self.store.query(&self.name, &vector, k).await
            }
        }
    }

    /// Up to `k` hits scoring at least `min_score`, best first.
    pub async fn similarity_search_with_threshold(
        &self,
        query: &str,
        k: usize,
        min_score: f64,
    ) -> Result<Vec<RetrievalResult>> {
        let hits = self.query(QueryInput::Text(query), k).await?;
        let kept: Vec<RetrievalResult> = hits
            .into_iter()
            .filter(|hit| hit.score >= min_score)
            .map(ScoredRecord::into_result)
            .collect();
        tracing::debug!(collection = %self.name, k, hits = kept.len(), "threshold search");
        Ok(kept)
    }
}
