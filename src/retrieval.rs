//! The retrieval entry point: `query(text, k) -> ranked passages`.
//!
//! [`RetrievalOrchestrator`] composes a [`Collection`] with an optional
//! [`Reranker`] and [`WebSearchAugmenter`]. Which path a query takes is
//! decided by [`RetrievalPlan::for_query`]:
//!
//! | Web | Reranker | Path |
//! |-----|----------|------|
//! | off | off | threshold search for `k` |
//! | off | on | threshold search for `min(3k, cap)`, rerank to `k` |
//! | on | off | `k` local + `min(3, k)` web, concatenated |
//! | on | on | `max(1, k/2)` local + the rest from web, reranked to `k` |
//!
//! Local and web retrieval run concurrently. Results are always ordered
//! by descending score with ties in input order.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::models::{Metadata, RetrievalResult, SourceTag, WebResult};
use crate::rerank::Reranker;
use crate::store::Collection;
use crate::web::WebSearchAugmenter;

const WEB_SHARE_WITHOUT_RERANK: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPlan {
    Threshold { k: usize },
    RerankOnly { candidates: usize, k: usize },
    /// Local and web results pooled. With a reranker the local share is
    /// `max(1, k/2)`, so `k = 1` leaves `web_k = 0` and the web is not
    /// queried at all.
    Augmented { local_k: usize, web_k: usize, rerank_to: Option<usize> },
}

impl RetrievalPlan {
    pub fn for_query(k: usize, rerank: bool, web: bool, candidate_cap: usize) -> Self {
        match (web, rerank) {
            (false, false) => Self::Threshold { k },
            (false, true) => Self::RerankOnly {
                candidates: (k * 3).min(candidate_cap).max(k),
                k,
            },
            (true, false) => Self::Augmented {
                local_k: k,
                web_k: k.min(WEB_SHARE_WITHOUT_RERANK),
                rerank_to: None,
            },
            (true, true) => {
                let local_k = (k / 2).max(1).min(k);
                Self::Augmented {
                    local_k,
                    web_k: k - local_k,
                    rerank_to: Some(k),
                }
            }
        }
    }
}

pub struct RetrievalOrchestrator {
    collection: Collection,
    min_score: f64,
    candidate_cap: usize,
    reranker: Option<Reranker>,
    web: Option<Arc<WebSearchAugmenter>>,
}

impl RetrievalOrchestrator {
    pub fn new(collection: Collection, min_score: f64) -> Self {
        Self {
            collection,
            min_score,
            candidate_cap: 20,
            reranker: None,
            web: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_web_search(mut self, web: Arc<WebSearchAugmenter>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn with_candidate_cap(mut self, cap: usize) -> Self {
        self.candidate_cap = cap;
        self
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn web(&self) -> Option<&Arc<WebSearchAugmenter>> {
        self.web.as_ref()
    }

    /// Local hits scoring at least the configured minimum, up to `k`.
    pub async fn similarity_search_with_threshold(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        self.collection
            .similarity_search_with_threshold(query, k, self.min_score)
            .await
    }

    pub fn plan(&self, k: usize) -> RetrievalPlan {
        RetrievalPlan::for_query(
            k,
            self.reranker.is_some(),
            self.web.is_some(),
            self.candidate_cap,
        )
    }

    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        let plan = self.plan(k);
        tracing::debug!(?plan, "retrieval plan");

        match plan {
            RetrievalPlan::Threshold { k } => self.similarity_search_with_threshold(text, k).await,
            RetrievalPlan::RerankOnly { candidates, k } => {
                let pool = self.similarity_search_with_threshold(text, candidates).await?;
                Ok(self.rerank(text, pool, k).await)
            }
            RetrievalPlan::Augmented {
                local_k,
                web_k,
                rerank_to,
            } => {
                if web_k == 0 {
                    tracing::debug!(k, "no web share left at this k, local results only");
                }
                let (local, web) = tokio::join!(
                    self.similarity_search_with_threshold(text, local_k),
                    self.search_web(text, web_k)
                );
                let mut pool = local?;
                pool.extend(web);
                match rerank_to {
                    Some(k) => Ok(self.rerank(text, pool, k).await),
                    None => {
                        pool.truncate(local_k + web_k);
                        Ok(pool)
                    }
                }
            }
        }
    }

    async fn rerank(&self, text: &str, pool: Vec<RetrievalResult>, k: usize) -> Vec<RetrievalResult> {
        match &self.reranker {
            Some(reranker) => reranker.rerank(text, pool, k).await,
            None => pool.into_iter().take(k).collect(),
        }
    }

    async fn search_web(&self, text: &str, n: usize) -> Vec<RetrievalResult> {
        match &self.web {
            Some(web) if n > 0 => web
                .search_and_fetch(text, n)
                .await
                .into_iter()
                .filter_map(web_to_result)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Web results have no similarity score; they rank after local hits
/// unless a reranker scores them.
fn web_to_result(web: WebResult) -> Option<RetrievalResult> {
    let text = web.best_text().trim().to_string();
    if text.is_empty() {
        return None;
    }
    let mut metadata = Metadata::new();
    metadata.insert("source".into(), Value::from(web.url.clone()));
    metadata.insert("title".into(), Value::from(web.title));
    metadata.insert("snippet".into(), Value::from(web.snippet));
    metadata.insert("full_text".into(), Value::from(!web.full_text.is_empty()));
    Some(RetrievalResult {
        id: web.url,
        text,
        score: 0.0,
        source: SourceTag::Web,
        metadata,
    })
}

/// Join passages into the context block handed to generation.
pub fn format_context(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .map(|r| match r.source {
            SourceTag::Local => r.text.clone(),
            SourceTag::Web => format!("[Web: {}]\n{}", r.origin(), r.text),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::models::SearchHit;
    use crate::rerank::TermOverlapModel;
    use crate::store::memory::InMemoryVectorStore;
    use crate::store::testing::{meta, WordHashEmbedder};
    use crate::store::Metric;
    use crate::web::{PageFetcher, SearchProvider};
    use async_trait::async_trait;
    use std::time::Duration;

    struct CannedSearch;

    #[async_trait]
    impl SearchProvider for CannedSearch {
        fn name(&self) -> &str {
            "canned"
        }
        async fn search(&self, _: &str, n: usize) -> Result<Vec<SearchHit>, BackendError> {
            Ok((0..n)
                .map(|i| SearchHit {
                    title: format!("web {}", i),
                    // Nothing listens on port 9; fetches fail fast.
                    url: format!("http://127.0.0.1:9/page{}", i),
                    snippet: format!("eigenvalues on the web {}", i),
                })
                .collect())
        }
    }

    fn augmenter() -> Arc<WebSearchAugmenter> {
        Arc::new(WebSearchAugmenter::new(
            Box::new(CannedSearch),
            PageFetcher::new(Duration::from_secs(2), 10_000, 1_000).unwrap(),
            Duration::from_secs(2),
            3,
        ))
    }

    async fn orchestrator() -> RetrievalOrchestrator {
        let collection = Collection::open(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(WordHashEmbedder { dims: 64 }),
            "kb",
            Metric::Cosine,
        )
        .await
        .unwrap();
        let texts: Vec<String> = [
            "eigenvalues of symmetric matrices are real",
            "eigenvalues and eigenvectors of a matrix",
            "the matrix determinant equals the product of eigenvalues",
            "photosynthesis converts light into chemical energy",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let ids: Vec<String> = (0..texts.len()).map(|i| format!("d{}#0", i)).collect();
        let metas: Vec<Metadata> = (0..texts.len()).map(|i| meta(&format!("d{}", i))).collect();
        collection.upsert(&ids, &texts, &metas).await.unwrap();
        RetrievalOrchestrator::new(collection, 0.1)
    }

    #[test]
    fn test_plans() {
        assert_eq!(RetrievalPlan::for_query(3, false, false, 20), RetrievalPlan::Threshold { k: 3 });
        assert_eq!(
            RetrievalPlan::for_query(3, true, false, 20),
            RetrievalPlan::RerankOnly { candidates: 9, k: 3 }
        );
        assert_eq!(
            RetrievalPlan::for_query(10, true, false, 20),
            RetrievalPlan::RerankOnly { candidates: 20, k: 10 }
        );
        assert_eq!(
            RetrievalPlan::for_query(5, false, true, 20),
            RetrievalPlan::Augmented { local_k: 5, web_k: 3, rerank_to: None }
        );
        assert_eq!(
            RetrievalPlan::for_query(4, true, true, 20),
            RetrievalPlan::Augmented { local_k: 2, web_k: 2, rerank_to: Some(4) }
        );
        assert_eq!(
            RetrievalPlan::for_query(1, true, true, 20),
            RetrievalPlan::Augmented { local_k: 1, web_k: 0, rerank_to: Some(1) }
        );
    }

    #[tokio::test]
    async fn test_default_path_ranks_descending() {
        let orch = orchestrator().await;
        let results = orch.query("eigenvalues of symmetric matrices are real", 3).await.unwrap();
        assert_eq!(results[0].id, "d0#0");
        assert!(results.len() <= 3);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_rerank_only_path() {
        let orch = orchestrator()
            .await
            .with_reranker(Reranker::new(Arc::new(TermOverlapModel)));
        let results = orch.query("matrix determinant product", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "d2#0");
        assert!(results[0].rerank_score().is_some());
    }

    #[tokio::test]
    async fn test_augmented_without_reranker_appends_web() {
        let orch = orchestrator().await.with_web_search(augmenter());
        let results = orch.query("eigenvalues", 2).await.unwrap();
        let sources: Vec<SourceTag> = results.iter().map(|r| r.source).collect();
        assert_eq!(
            sources,
            vec![SourceTag::Local, SourceTag::Local, SourceTag::Web, SourceTag::Web]
        );
        assert_eq!(results[2].text, "eigenvalues on the web 0");
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_augmented_with_reranker_caps_at_k() {
        let orch = orchestrator()
            .await
            .with_web_search(augmenter())
            .with_reranker(Reranker::new(Arc::new(TermOverlapModel)));
        let results = orch.query("eigenvalues web", 4).await.unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().any(|r| r.source == SourceTag::Web));
        assert!(results.iter().all(|r| r.rerank_score().is_some()));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_augmented_with_reranker_at_k_one_stays_local() {
        let orch = orchestrator()
            .await
            .with_web_search(augmenter())
            .with_reranker(Reranker::new(Arc::new(TermOverlapModel)));
        assert_eq!(
            orch.plan(1),
            RetrievalPlan::Augmented { local_k: 1, web_k: 0, rerank_to: Some(1) }
        );
        let results = orch.query("eigenvalues web", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, SourceTag::Local);
    }

    #[tokio::test]
    async fn test_empty_collection_returns_empty() {
        let collection = Collection::open(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(WordHashEmbedder { dims: 16 }),
            "empty",
            Metric::Cosine,
        )
        .await
        .unwrap();
        let orch = RetrievalOrchestrator::new(collection, 0.2);
        assert!(orch.similarity_search_with_threshold("q", 3).await.unwrap().is_empty());
    }

    #[test]
    fn test_format_context_labels_web() {
        let web = web_to_result(WebResult {
            title: "t".into(),
            url: "https://x.test/a".into(),
            snippet: "snip".into(),
            full_text: String::new(),
        })
        .unwrap();
        let local = RetrievalResult {
            id: "a#0".into(),
            text: "local text".into(),
            score: 0.9,
            source: SourceTag::Local,
            metadata: Metadata::new(),
        };
        assert_eq!(
            format_context(&[local, web]),
            "local text\n\n[Web: https://x.test/a]\nsnip"
        );
    }
}
