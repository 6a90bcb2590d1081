//! Live web augmentation: search, then fetch and extract each result.
//!
//! [`WebSearchAugmenter::search_and_fetch`] runs in two phases. A
//! [`SearchProvider`] returns ranked `{title, url, snippet}` hits; then
//! every hit's page is fetched concurrently, each under its own timeout.
//! A page that times out, errors, is too large, or is not HTML/text gets
//! an empty `full_text`, and callers use the snippet instead. Fetches are
//! never retried and one failure never affects the others.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::WebSearchConfig;
use crate::error::BackendError;
use crate::models::{SearchHit, WebResult};

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<SearchHit>, BackendError>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("axiom-rag/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build web HTTP client")
}

async fn get_json(client: &reqwest::Client, url: &str, endpoint: &str) -> Result<Value, BackendError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| BackendError::transport(endpoint, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    response
        .json()
        .await
        .map_err(|e| BackendError::decode(endpoint, e.to_string()))
}

// ============ DuckDuckGo ============

/// DuckDuckGo instant-answer API; needs no key.
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    base_url: String,
}

impl DuckDuckGoSearch {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url
                .unwrap_or("https://api.duckduckgo.com")
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

fn collect_ddg_topics(items: &[Value], hits: &mut Vec<SearchHit>) {
    for item in items {
        if let Some(topics) = item.get("Topics").and_then(Value::as_array) {
            collect_ddg_topics(topics, hits);
            continue;
        }
        let text = item.get("Text").and_then(Value::as_str).unwrap_or("");
        let url = item.get("FirstURL").and_then(Value::as_str).unwrap_or("");
        if text.is_empty() || url.is_empty() {
            continue;
        }
        hits.push(SearchHit {
            title: text.split(" - ").next().unwrap_or(text).to_string(),
            url: url.to_string(),
            snippet: text.to_string(),
        });
    }
}

fn parse_ddg(payload: &Value) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    let abstract_text = payload.get("AbstractText").and_then(Value::as_str).unwrap_or("");
    let abstract_url = payload.get("AbstractURL").and_then(Value::as_str).unwrap_or("");
    if !abstract_text.is_empty() && !abstract_url.is_empty() {
        let heading = payload.get("Heading").and_then(Value::as_str).unwrap_or(abstract_text);
        hits.push(SearchHit {
            title: heading.to_string(),
            url: abstract_url.to_string(),
            snippet: abstract_text.to_string(),
        });
    }
    for key in ["Results", "RelatedTopics"] {
        if let Some(items) = payload.get(key).and_then(Value::as_array) {
            collect_ddg_topics(items, &mut hits);
        }
    }
    hits
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<SearchHit>, BackendError> {
        let url = format!(
            "{}/?q={}&format=json&no_redirect=1&no_html=1",
            self.base_url,
            urlencoding::encode(query)
        );
        let payload = get_json(&self.client, &url, &self.base_url).await?;
        let mut hits = parse_ddg(&payload);
        hits.truncate(num_results);
        Ok(hits)
    }
}

// ============ SerpAPI ============

/// Google results through SerpAPI; requires an API key.
pub struct SerpApiSearch {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SerpApiSearch {
    pub fn new(base_url: Option<&str>, api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url
                .unwrap_or("https://serpapi.com")
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
        })
    }
}

fn parse_serpapi(payload: &Value) -> Vec<SearchHit> {
    payload
        .get("organic_results")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let title = item.get("title").and_then(Value::as_str)?;
                    let link = item.get("link").and_then(Value::as_str)?;
                    Some(SearchHit {
                        title: title.to_string(),
                        url: link.to_string(),
                        snippet: item
                            .get("snippet")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SearchProvider for SerpApiSearch {
    fn name(&self) -> &str {
        "serpapi"
    }

    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<SearchHit>, BackendError> {
        let endpoint = format!("{}/search.json", self.base_url);
        let url = format!(
            "{}?engine=google&q={}&num={}&api_key={}",
            endpoint,
            urlencoding::encode(query),
            num_results,
            urlencoding::encode(&self.api_key)
        );
        let payload = get_json(&self.client, &url, &endpoint).await?;
        let mut hits = parse_serpapi(&payload);
        hits.truncate(num_results);
        Ok(hits)
    }
}

// ============ Page fetching ============

/// Downloads a page with a byte cap and extracts readable text.
pub struct PageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
    max_chars: usize,
}

impl PageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize, max_chars: usize) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            max_bytes,
            max_chars,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<String, BackendError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BackendError::transport(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint: url.to_string(),
                status: status.as_u16(),
                body: String::new(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let is_html = content_type.contains("html");
        if !is_html && !content_type.starts_with("text/") {
            return Err(BackendError::decode(
                url,
                format!("unsupported content type '{}'", content_type),
            ));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BackendError::transport(url, e))?
        {
            if bytes.len().saturating_add(chunk.len()) > self.max_bytes {
                return Err(BackendError::decode(
                    url,
                    format!("page exceeds {} bytes", self.max_bytes),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes);
        let text = if is_html {
            extract_text(&body)
        } else {
            body.trim().to_string()
        };
        Ok(text.chars().take(self.max_chars).collect())
    }
}

fn regexes() -> &'static HtmlRegexes {
    static RE: OnceLock<HtmlRegexes> = OnceLock::new();
    RE.get_or_init(HtmlRegexes::new)
}

struct HtmlRegexes {
    main_regions: Vec<Regex>,
    dropped_blocks: Vec<Regex>,
    comment: Regex,
    line_break: Regex,
    tag: Regex,
    spaces: Regex,
}

impl HtmlRegexes {
    fn new() -> Self {
        // Patterns are literals; a failure here is a programming error.
        let re = |p: &str| Regex::new(p).unwrap_or_else(|e| panic!("invalid regex {}: {}", p, e));
        Self {
            main_regions: ["article", "main", "body"]
                .iter()
                .map(|t| re(&format!(r"(?is)<{t}\b[^>]*>(.*?)</{t}>")))
                .collect(),
            dropped_blocks: ["script", "style", "noscript", "nav", "header", "footer", "aside", "form"]
                .iter()
                .map(|t| re(&format!(r"(?is)<{t}\b[^>]*>.*?</{t}>")))
                .collect(),
            comment: re(r"(?s)<!--.*?-->"),
            line_break: re(r"(?i)<(br|/p|/div|/h[1-6]|/li|/tr|/section)\b[^>]*>"),
            tag: re(r"<[^>]*>"),
            spaces: re(r"[ \t\u{a0}]+"),
        }
    }
}

/// Readable text of an HTML page: the `<article>`, `<main>` or `<body>`
/// content with scripts, navigation, and markup removed.
pub fn extract_text(html: &str) -> String {
    let re = regexes();
    let region = re
        .main_regions
        .iter()
        .find_map(|r| r.captures(html).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .unwrap_or(html);

    let mut text = re.comment.replace_all(region, "").into_owned();
    for block in &re.dropped_blocks {
        text = block.replace_all(&text, " ").into_owned();
    }
    text = re.line_break.replace_all(&text, "\n").into_owned();
    text = re.tag.replace_all(&text, " ").into_owned();
    let text = decode_entities(&text);

    text.lines()
        .map(|line| re.spaces.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ============ Augmenter ============

pub struct WebSearchAugmenter {
    provider: Box<dyn SearchProvider>,
    fetcher: PageFetcher,
    fetch_timeout: Duration,
    default_results: usize,
}

impl WebSearchAugmenter {
    pub fn new(
        provider: Box<dyn SearchProvider>,
        fetcher: PageFetcher,
        fetch_timeout: Duration,
        default_results: usize,
    ) -> Self {
        Self {
            provider,
            fetcher,
            fetch_timeout,
            default_results,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn default_results(&self) -> usize {
        self.default_results
    }

    /// Search, then fetch every hit concurrently. A failed search yields
    /// no results; a failed fetch yields an empty `full_text`.
    pub async fn search_and_fetch(&self, query: &str, num_results: usize) -> Vec<WebResult> {
        if num_results == 0 {
            return Vec::new();
        }
        let mut hits = match self.provider.search(query, num_results).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(provider = self.provider.name(), error = %e, "web search failed");
                return Vec::new();
            }
        };
        hits.truncate(num_results);

        let fetches = hits.into_iter().map(|hit| async move {
            let full_text = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(&hit.url)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    tracing::warn!(url = %hit.url, error = %e, "page fetch failed, using snippet");
                    String::new()
                }
                Err(_) => {
                    tracing::warn!(url = %hit.url, timeout = ?self.fetch_timeout, "page fetch timed out, using snippet");
                    String::new()
                }
            };
            WebResult {
                title: hit.title,
                url: hit.url,
                snippet: hit.snippet,
                full_text,
            }
        });

        join_all(fetches).await
    }
}

/// Build the configured augmenter, or `None` when web search is off.
///
/// `serpapi` without an API key disables web search with a warning.
pub fn create_augmenter(config: &WebSearchConfig) -> Result<Option<WebSearchAugmenter>> {
    let timeout = Duration::from_secs(config.fetch_timeout_secs);
    let provider: Box<dyn SearchProvider> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "duckduckgo" => Box::new(DuckDuckGoSearch::new(config.base_url.as_deref(), timeout)?),
        "serpapi" => match config.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Box::new(SerpApiSearch::new(config.base_url.as_deref(), key, timeout)?),
            None => {
                tracing::warn!("web search provider is serpapi but SERPAPI_KEY is not set; web search disabled");
                return Ok(None);
            }
        },
        other => anyhow::bail!("Unknown web_search provider: '{}'", other),
    };

    let fetcher = PageFetcher::new(timeout, config.max_page_bytes, config.max_page_chars)?;
    Ok(Some(WebSearchAugmenter::new(
        provider,
        fetcher,
        timeout,
        config.num_results,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, routing::get, Router};

    #[test]
    fn test_extract_text_prefers_article() {
        let html = r#"<html><head><title>T</title><style>p{color:red}</style></head>
            <body><nav>Home | About</nav>
            <article><h1>Limits</h1><p>A limit describes &amp; bounds behaviour.</p>
            <script>track()</script><p>Second   paragraph.</p></article>
            <footer>(c) site</footer></body></html>"#;
        let text = extract_text(html);
        assert_eq!(text, "Limits\nA limit describes & bounds behaviour.\nSecond paragraph.");
    }

    #[test]
    fn test_extract_text_without_body() {
        assert_eq!(extract_text("plain <b>bold</b> words"), "plain bold words");
    }

    #[test]
    fn test_parse_ddg_nested_topics() {
        let payload = serde_json::json!({
            "Heading": "Calculus",
            "AbstractText": "Calculus is the study of change.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Calculus",
            "RelatedTopics": [
                { "Text": "Integral - area under a curve", "FirstURL": "https://ddg.example/Integral" },
                { "Topics": [ { "Text": "Limit - value approached", "FirstURL": "https://ddg.example/Limit" } ] },
                { "Text": "", "FirstURL": "https://ddg.example/empty" }
            ]
        });
        let hits = parse_ddg(&payload);
        let titles: Vec<&str> = hits.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["Calculus", "Integral", "Limit"]);
    }

    #[test]
    fn test_parse_serpapi() {
        let payload = serde_json::json!({
            "organic_results": [
                { "title": "A", "link": "https://a", "snippet": "sa" },
                { "title": "no link" },
                { "title": "B", "link": "https://b" }
            ]
        });
        let hits = parse_serpapi(&payload);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].snippet, "");
    }

    struct FixedSearch {
        base: String,
    }

    #[async_trait]
    impl SearchProvider for FixedSearch {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn search(&self, _: &str, _: usize) -> Result<Vec<SearchHit>, BackendError> {
            Ok(["ok", "missing", "slow", "binary"]
                .iter()
                .map(|p| SearchHit {
                    title: p.to_string(),
                    url: format!("{}/{}", self.base, p),
                    snippet: format!("{} snippet", p),
                })
                .collect())
        }
    }

    struct BrokenSearch;

    #[async_trait]
    impl SearchProvider for BrokenSearch {
        fn name(&self) -> &str {
            "broken"
        }
        async fn search(&self, _: &str, _: usize) -> Result<Vec<SearchHit>, BackendError> {
            Err(BackendError::Disabled("search".into()))
        }
    }

    async fn serve_pages() -> String {
        let app = Router::new()
            .route(
                "/ok",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                        "<html><body><p>Full article text.</p></body></html>",
                    )
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    ([(header::CONTENT_TYPE, "text/html")], "<p>too late</p>")
                }),
            )
            .route(
                "/binary",
                get(|| async { ([(header::CONTENT_TYPE, "application/pdf")], "%PDF-1.4") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_failures_are_isolated() {
        let base = serve_pages().await;
        let timeout = Duration::from_millis(800);
        let augmenter = WebSearchAugmenter::new(
            Box::new(FixedSearch { base }),
            PageFetcher::new(Duration::from_secs(10), 100_000, 1_000).unwrap(),
            timeout,
            3,
        );

        let started = std::time::Instant::now();
        let results = augmenter.search_and_fetch("anything", 4).await;
        assert!(started.elapsed() < Duration::from_secs(4), "fetches ran sequentially");

        let titles: Vec<&str> = results.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["ok", "missing", "slow", "binary"]);
        assert_eq!(results[0].full_text, "Full article text.");
        for r in &results[1..] {
            assert!(r.full_text.is_empty(), "{} should have no full text", r.title);
            assert_eq!(r.best_text(), format!("{} snippet", r.title));
        }
    }

    #[tokio::test]
    async fn test_num_results_caps_hits() {
        let base = serve_pages().await;
        let augmenter = WebSearchAugmenter::new(
            Box::new(FixedSearch { base }),
            PageFetcher::new(Duration::from_secs(2), 100_000, 1_000).unwrap(),
            Duration::from_secs(2),
            3,
        );
        assert_eq!(augmenter.search_and_fetch("q", 1).await.len(), 1);
        assert!(augmenter.search_and_fetch("q", 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_search_is_empty() {
        let augmenter = WebSearchAugmenter::new(
            Box::new(BrokenSearch),
            PageFetcher::new(Duration::from_secs(1), 1_000, 100).unwrap(),
            Duration::from_secs(1),
            3,
        );
        assert!(augmenter.search_and_fetch("q", 3).await.is_empty());
    }

    #[test]
    fn test_serpapi_without_key_disables() {
        let config = WebSearchConfig {
            provider: "serpapi".into(),
            api_key: None,
            ..WebSearchConfig::default()
        };
        assert!(create_augmenter(&config).unwrap().is_none());
        let ddg = WebSearchConfig {
            provider: "duckduckgo".into(),
            ..WebSearchConfig::default()
        };
        assert_eq!(create_augmenter(&ddg).unwrap().unwrap().provider_name(), "duckduckgo");
    }
}
