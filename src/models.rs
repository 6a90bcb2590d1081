//! Core data models used throughout the retrieval pipeline.
//!
//! These types represent the documents, chunks, stored vector records, and
//! ranked retrieval results that flow from ingestion through to synthesis.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form metadata attached to records and results.
pub type Metadata = Map<String, Value>;

/// A logical source unit read at ingestion time (a file or a web page).
///
/// Immutable once read; chunking borrows its text.
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable identifier, e.g. the path relative to the ingestion root.
    pub id: String,
    pub text: String,
    /// Path or URL the document was read from.
    pub source: String,
    /// Lower-cased file extension or content kind (`"md"`, `"txt"`, `"html"`).
    pub format: String,
}

/// A contiguous slice of a [`Document`]'s text with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `<document id>#<chunk index>`; stable across re-ingestion.
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    /// Character offsets (not bytes) into the document text, end exclusive.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// The persisted unit of a vector store collection.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    /// Owning document; used to replace all chunks of a re-ingested document.
    pub document_id: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// Where a retrieval result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Local,
    Web,
}

/// One ranked passage returned by a query.
///
/// Ephemeral: built per query and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// Record id for local hits, URL for web hits.
    pub id: String,
    pub text: String,
    /// Relevance score; higher is better. After reranking this is the rerank score.
    pub score: f64,
    pub source: SourceTag,
    pub metadata: Metadata,
}

impl RetrievalResult {
    /// Human-readable origin: the `source` metadata entry, or the id.
    pub fn origin(&self) -> &str {
        self.metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }

    /// Rerank score recorded in metadata, if this result went through a reranker.
    pub fn rerank_score(&self) -> Option<f64> {
        self.metadata.get("rerank_score").and_then(Value::as_f64)
    }
}

/// A result from a web search provider before page extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A search hit after the fetch phase.
///
/// `full_text` is empty when extraction failed; callers fall back to the snippet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub full_text: String,
}

impl WebResult {
    /// The best available text: the extracted page, else the snippet.
    pub fn best_text(&self) -> &str {
        if self.full_text.trim().is_empty() {
            &self.snippet
        } else {
            &self.full_text
        }
    }
}

/// Summary of a retrieved passage surfaced alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub score: f64,
    pub document: String,
    pub content_preview: String,
    pub reranked: bool,
}

impl From<&RetrievalResult> for SourceSummary {
    fn from(result: &RetrievalResult) -> Self {
        let preview: String = result.text.chars().take(256).collect();
        let reranked = result.rerank_score().is_some();
        Self {
            score: (result.score * 1000.0).round() / 1000.0,
            document: result.origin().to_string(),
            content_preview: format!("{}...", preview),
            reranked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_text_prefers_full_text() {
        let mut r = WebResult {
            title: "t".into(),
            url: "http://x".into(),
            snippet: "short".into(),
            full_text: "the whole page".into(),
        };
        assert_eq!(r.best_text(), "the whole page");
        r.full_text = "   ".into();
        assert_eq!(r.best_text(), "short");
    }

    #[test]
    fn test_source_summary_marks_reranked() {
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), Value::from("notes/a.md"));
        metadata.insert("rerank_score".into(), Value::from(0.91234));
        let result = RetrievalResult {
            id: "notes/a.md#0".into(),
            text: "abc".into(),
            score: 0.91234,
            source: SourceTag::Local,
            metadata,
        };
        let summary = SourceSummary::from(&result);
        assert!(summary.reranked);
        assert_eq!(summary.document, "notes/a.md");
        assert_eq!(summary.score, 0.912);
        assert_eq!(summary.content_preview, "abc...");
    }
}
