//! Second-stage reranking of retrieved passages.
//!
//! A [`Reranker`] wraps an optional [`RerankModel`] that scores
//! `(query, passage)` pairs. The output is always a reordered subset of
//! the input of size `min(top_k, candidates)`:
//!
//! - scores sort descending with a stable sort, so equal scores keep
//!   their input order;
//! - each returned passage gets `rerank_score` (and its original
//!   `retrieval_score`) in metadata;
//! - with no model, or when the model fails, the first `top_k`
//!   candidates are returned unchanged.
//!
//! | Provider | Model |
//! |----------|-------|
//! | `embedding` | [`EmbeddingRerankModel`]: cosine of query and passage embeddings |
//! | `http` | [`HttpRerankModel`]: cross-encoder service (`/rerank`-style API) |
//! | `term` | [`TermOverlapModel`]: query term coverage, no backend needed |

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RerankerConfig;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::BackendError;
use crate::models::RetrievalResult;

#[async_trait]
pub trait RerankModel: Send + Sync {
    fn name(&self) -> &str;
    /// One relevance score per passage, in input order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, BackendError>;
}

#[derive(Clone, Default)]
pub struct Reranker {
    model: Option<Arc<dyn RerankModel>>,
}

impl Reranker {
    pub fn new(model: Arc<dyn RerankModel>) -> Self {
        Self { model: Some(model) }
    }

    /// A reranker that always passes candidates through.
    pub fn unavailable() -> Self {
        Self { model: None }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<RetrievalResult>,
        top_k: usize,
    ) -> Vec<RetrievalResult> {
        let Some(model) = &self.model else {
            candidates.truncate(top_k);
            return candidates;
        };
        if candidates.is_empty() || top_k == 0 {
            candidates.truncate(top_k);
            return candidates;
        }

        let passages: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let scores = match model.score(query, &passages).await {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                tracing::warn!(
                    model = model.name(),
                    expected = candidates.len(),
                    got = scores.len(),
                    "reranker returned wrong number of scores, keeping original order"
                );
                candidates.truncate(top_k);
                return candidates;
            }
            Err(e) => {
                tracing::warn!(model = model.name(), error = %e, "reranking failed, keeping original order");
                candidates.truncate(top_k);
                return candidates;
            }
        };

        let mut order: Vec<(usize, f64)> = scores
            .into_iter()
            .map(|s| if s.is_finite() { s } else { f64::MIN })
            .enumerate()
            .collect();
        // `sort_by` is stable: equal scores keep input order.
        order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        order.truncate(top_k);

        let mut slots: Vec<Option<RetrievalResult>> = candidates.into_iter().map(Some).collect();
        let reranked: Vec<RetrievalResult> = order
            .into_iter()
            .filter_map(|(index, score)| {
                let mut result = slots[index].take()?;
                result
                    .metadata
                    .insert("retrieval_score".into(), Value::from(result.score));
                result.metadata.insert("rerank_score".into(), Value::from(score));
                result.score = score;
                Some(result)
            })
            .collect();

        tracing::debug!(model = model.name(), kept = reranked.len(), "reranked candidates");
        reranked
    }
}

// ============ Embedding model ============

/// Bi-encoder reranking with the pipeline's embedding provider.
pub struct EmbeddingRerankModel {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingRerankModel {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl RerankModel for EmbeddingRerankModel {
    fn name(&self) -> &str {
        "embedding"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, BackendError> {
        // Strict: any failed embedding fails the whole rerank so the
        // caller falls back instead of ranking against zero vectors.
        let query_vec = self.embedder.embed_one(query).await?;
        let mut scores = Vec::with_capacity(passages.len());
        for passage in passages {
            let vec = self.embedder.embed_one(passage).await?;
            scores.push(cosine_similarity(&query_vec, &vec) as f64);
        }
        Ok(scores)
    }
}

// ============ HTTP cross-encoder ============

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f64,
}

/// Cross-encoder served over HTTP (Jina/Cohere-compatible request shape).
pub struct HttpRerankModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpRerankModel {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build reranker HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl RerankModel for HttpRerankModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": passages,
            "top_n": passages.len(),
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::transport(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| BackendError::decode(&self.endpoint, e.to_string()))?;

        let mut scores = vec![None; passages.len()];
        for item in parsed.results {
            match scores.get_mut(item.index) {
                Some(slot) => *slot = Some(item.relevance_score),
                None => {
                    return Err(BackendError::decode(
                        &self.endpoint,
                        format!("result index {} out of range", item.index),
                    ))
                }
            }
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| BackendError::decode(&self.endpoint, format!("no score for passage {}", i)))
            })
            .collect()
    }
}

// ============ Term overlap ============

/// Fraction of distinct query terms found in the passage.
pub struct TermOverlapModel;

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl RerankModel for TermOverlapModel {
    fn name(&self) -> &str {
        "term-overlap"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, BackendError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }
        Ok(passages
            .iter()
            .map(|p| {
                let passage_terms = terms(p);
                let hits = query_terms.intersection(&passage_terms).count();
                hits as f64 / query_terms.len() as f64
            })
            .collect())
    }
}

/// Build the configured reranker, or `None` when reranking is off.
///
/// A misconfigured provider disables reranking with a warning.
pub fn create_reranker(
    config: &RerankerConfig,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<Option<Reranker>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "embedding" => Ok(Some(Reranker::new(Arc::new(EmbeddingRerankModel::new(embedder))))),
        "term" => Ok(Some(Reranker::new(Arc::new(TermOverlapModel)))),
        "http" => match &config.url {
            Some(url) => {
                let model = HttpRerankModel::new(
                    url,
                    &config.model,
                    config.api_key.clone(),
                    Duration::from_secs(config.timeout_secs),
                )?;
                Ok(Some(Reranker::new(Arc::new(model))))
            }
            None => {
                tracing::warn!("reranker.provider = \"http\" but reranker.url is not set; reranking disabled");
                Ok(None)
            }
        },
        other => anyhow::bail!("Unknown reranker provider: '{}'", other),
    }
}
