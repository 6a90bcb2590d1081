//! Built-in tools: calculator, clock, knowledge-base search, web search
//! and a sandboxed directory listing.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::calc;
use super::{Tool, ToolRegistry};
use crate::retrieval::RetrievalOrchestrator;
use crate::web::WebSearchAugmenter;

const KB_PREVIEW_CHARS: usize = 500;
const WEB_SNIPPET_CHARS: usize = 300;
const WEB_CONTENT_CHARS: usize = 500;

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("parameter '{}' must be a string", name))
}

fn count_param(params: &Value, name: &str, fallback: usize) -> usize {
    params
        .get(name)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(fallback)
}

fn prefix(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports + - * / % ^, parentheses, sqrt, abs, ln, log, exp, sin, cos, tan, pi and e."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": { "type": "string", "description": "Expression to evaluate, e.g. (2 + 3) * 4" }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let expression = str_param(&params, "expression")?;
        let value = calc::evaluate(expression).with_context(|| format!("cannot evaluate '{}'", expression))?;
        Ok(format!("Result: {}", calc::format_number(value)))
    }
}

pub struct CurrentDateTool;

#[async_trait]
impl Tool for CurrentDateTool {
    fn name(&self) -> &str {
        "get_current_date"
    }

    fn description(&self) -> &str {
        "Get the current local date and time."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        let now = chrono::Local::now();
        Ok(format!("Current date and time: {}", now.format("%Y-%m-%d %H:%M:%S")))
    }
}

/// Searches the local collection only; web augmentation is a separate tool.
pub struct KnowledgeBaseTool {
    retrieval: Arc<RetrievalOrchestrator>,
}

impl KnowledgeBaseTool {
    pub fn new(retrieval: Arc<RetrievalOrchestrator>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl Tool for KnowledgeBaseTool {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> &str {
        "Search the local knowledge base for passages relevant to a query."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "k": { "type": "integer", "description": "Number of passages", "default": 5 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let query = str_param(&params, "query")?;
        let k = count_param(&params, "k", 5);
        let results = self.retrieval.similarity_search_with_threshold(query, k).await?;
        if results.is_empty() {
            return Ok("No relevant information found in knowledge base.".to_string());
        }
        Ok(results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("Document {}: {}...", i + 1, prefix(&r.text, KB_PREVIEW_CHARS)))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

pub struct WebSearchTool {
    web: Arc<WebSearchAugmenter>,
}

impl WebSearchTool {
    pub fn new(web: Arc<WebSearchAugmenter>) -> Self {
        Self { web }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "search_web"
    }

    fn description(&self) -> &str {
        "Search the web and read the top result pages."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "num_results": { "type": "integer", "description": "Pages to fetch", "default": 3 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let query = str_param(&params, "query")?;
        let n = count_param(&params, "num_results", self.web.default_results());
        let results = self.web.search_and_fetch(query, n).await;
        if results.is_empty() {
            return Ok("No web search results found.".to_string());
        }

        let mut lines = Vec::new();
        for (i, result) in results.iter().enumerate() {
            lines.push(format!("Web Result {}: {}", i + 1, result.title));
            lines.push(format!("Snippet: {}", prefix(&result.snippet, WEB_SNIPPET_CHARS)));
            if !result.full_text.is_empty() {
                lines.push(format!("Content: {}...", prefix(&result.full_text, WEB_CONTENT_CHARS)));
            }
            lines.push(String::new());
        }
        Ok(lines.join("\n"))
    }
}

/// Lists a directory, but only beneath the configured roots.
pub struct ListFilesTool {
    roots: Vec<PathBuf>,
}

impl ListFilesTool {
    /// Roots are made absolute against the current directory at
    /// construction time.
    pub fn new(roots: &[PathBuf]) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let roots = roots
            .iter()
            .map(|root| {
                let absolute = normalize(&cwd.join(root));
                std::fs::canonicalize(&absolute).unwrap_or(absolute)
            })
            .collect();
        Ok(Self { roots })
    }

    fn permitted(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List the entries of a directory inside the allowed workspace folders."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list", "default": "." }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let requested = str_param(&params, "path")?;
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let lexical = normalize(&cwd.join(requested));
        let denied = format!("Access denied: Path '{}' is outside allowed directories.", requested);
        if !self.permitted(&lexical) {
            return Ok(denied);
        }
        // Symlinks may point outside the roots.
        let resolved = tokio::fs::canonicalize(&lexical)
            .await
            .with_context(|| format!("cannot access '{}'", requested))?;
        if !self.permitted(&resolved) {
            return Ok(denied);
        }
        if !resolved.is_dir() {
            bail!("'{}' is not a directory", requested);
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&resolved).await?;
        while let Some(entry) = dir.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        if entries.is_empty() {
            return Ok(format!("Directory '{}' is empty.", requested));
        }
        Ok(entries.join("\n"))
    }
}

impl ToolRegistry {
    /// Registry with every built-in tool. `search_web` is only present
    /// when web search is enabled.
    pub fn with_builtins(
        retrieval: Arc<RetrievalOrchestrator>,
        web: Option<Arc<WebSearchAugmenter>>,
        allowed_roots: &[PathBuf],
    ) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(CalculatorTool));
        registry.register(Box::new(CurrentDateTool));
        registry.register(Box::new(KnowledgeBaseTool::new(retrieval)));
        if let Some(web) = web {
            registry.register(Box::new(WebSearchTool::new(web)));
        }
        registry.register(Box::new(ListFilesTool::new(allowed_roots)?));
        Ok(registry)
    }
}
