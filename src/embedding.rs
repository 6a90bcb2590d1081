//! Embedding provider abstraction, the Ollama implementation, and vector
//! utilities.
//!
//! A provider embeds one text per call ([`EmbeddingProvider::embed_one`])
//! and reports failures as [`BackendError`]. Batch embedding goes through
//! [`embed_texts`], which never fails as a whole: a text whose call fails
//! is replaced by a zero vector of the provider's dimension, logged, and
//! recorded in [`EmbeddingBatch::failed`].
//!
//! The configured dimension is only a starting point. The Ollama provider
//! adopts the length of the first vector the model returns, so switching
//! `EMBEDDING_MODEL` without touching `embedding.dims` still yields real
//! vectors; a later response of another length is a decode error.
//!
//! # Retry Strategy
//!
//! The Ollama provider retries transient errors with exponential backoff
//! (1s, 2s, 4s, ... capped at 32s):
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::BackendError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. `"nomic-embed-text"`.
    fn model_name(&self) -> &str;
    /// Length of every vector this provider returns. May change once, when
    /// a provider learns its model's real dimension.
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, BackendError>;
    /// Release provider-side caches between ingestion batches.
    async fn release(&self) {}
}

/// Vectors for a batch, in input order, plus the indices that fell back
/// to the zero vector.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub failed: Vec<usize>,
}

/// Embed every text independently; failures degrade to zero vectors.
pub async fn embed_texts(provider: &dyn EmbeddingProvider, texts: &[String]) -> EmbeddingBatch {
    let mut batch = EmbeddingBatch {
        vectors: Vec::with_capacity(texts.len()),
        failed: Vec::new(),
    };

    for (index, text) in texts.iter().enumerate() {
        match provider.embed_one(text).await {
            Ok(vector) if vector.len() == provider.dims() => batch.vectors.push(vector),
            Ok(vector) => {
                tracing::warn!(
                    model = provider.model_name(),
                    expected = provider.dims(),
                    got = vector.len(),
                    "embedding has wrong dimension, substituting zero vector"
                );
                batch.vectors.push(Vec::new());
                batch.failed.push(index);
            }
            Err(e) => {
                tracing::warn!(
                    model = provider.model_name(),
                    error = %e,
                    "embedding failed, substituting zero vector"
                );
                batch.vectors.push(Vec::new());
                batch.failed.push(index);
            }
        }
    }

    // Sized after the loop: the provider may have learned its dimension
    // from a text that came after a failure.
    let dims = provider.dims();
    for &index in &batch.failed {
        batch.vectors[index] = vec![0.0; dims];
    }
    batch
}

/// Embed a single query text with the same fallback as [`embed_texts`].
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Vec<f32> {
    let batch = embed_texts(provider, &[text.to_string()]).await;
    batch
        .vectors
        .into_iter()
        .next()
        .unwrap_or_else(|| vec![0.0; provider.dims()])
}

/// True for the sentinel produced when embedding failed.
pub fn is_zero_vector(vector: &[f32]) -> bool {
    vector.iter().all(|v| *v == 0.0)
}

// ============ Ollama Provider ============

/// Calls `POST {url}/api/embeddings` with `{model, prompt}` and reads
/// `{embedding: [...]}` back.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    /// Configured until the first successful response, then the model's.
    dims: AtomicUsize,
    learned: AtomicBool,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build embedding HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embeddings", config.url.trim_end_matches('/')),
            model: config.model.clone(),
            dims: AtomicUsize::new(config.dims),
            learned: AtomicBool::new(false),
            max_retries: config.max_retries,
        })
    }

    /// Adopt the first returned length as the dimension; reject any other
    /// length after that.
    fn check_dims(&self, got: usize) -> Result<(), BackendError> {
        let current = self.dims.load(Ordering::Acquire);
        if self
            .learned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if got != current {
                tracing::warn!(
                    model = %self.model,
                    configured = current,
                    actual = got,
                    "embedding model dimension differs from embedding.dims, using the model's"
                );
                self.dims.store(got, Ordering::Release);
            }
            return Ok(());
        }
        if got == current {
            Ok(())
        } else {
            Err(BackendError::decode(
                &self.endpoint,
                format!("embedding has {} dimensions, model returned {} before", got, current),
            ))
        }
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::transport(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| BackendError::decode(&self.endpoint, e.to_string()))?;
        parse_ollama_response(&json).map_err(|reason| BackendError::decode(&self.endpoint, reason))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims.load(Ordering::Acquire)
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let mut attempt = 0;
        loop {
            match self.request(text).await {
                Ok(vector) => {
                    self.check_dims(vector.len())?;
                    return Ok(vector);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                    tracing::debug!(attempt, error = %e, "retrying embedding request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Extract `embedding` from an Ollama response body.
fn parse_ollama_response(json: &Value) -> Result<Vec<f32>, String> {
    let values = json
        .get("embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing embedding array".to_string())?;

    if values.is_empty() {
        return Err("empty embedding array".to_string());
    }

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| format!("non-numeric embedding value: {}", v))
        })
        .collect()
}

/// Build the configured embedding provider.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    Ok(Arc::new(OllamaEmbedder::new(config)?))
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty, mismatched, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Euclidean distance; `f32::INFINITY` for mismatched lengths.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
