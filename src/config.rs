//! TOML configuration with environment overrides.
//!
//! Every section and field has a default, so an absent file produces a
//! working local setup pointed at an Ollama server on `localhost:11434`.
//! After parsing, [`Config::apply_env`] lets `OLLAMA_URL`,
//! `EMBEDDING_MODEL`, `SERPAPI_KEY` and `RERANK_API_KEY` override the file.
//!
//! ```toml
//! [store]
//! path = "./data/rag_db"
//! collection = "math_knowledge"
//!
//! [chunking]
//! chunk_size = 512
//! overlap = 50
//!
//! [web_search]
//! provider = "duckduckgo"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ============ Store ============

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// `"cosine"` or `"l2"`; fixed per collection at creation.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            collection: default_collection(),
            metric: default_metric(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/rag_db")
}
fn default_collection() -> String {
    "math_knowledge".to_string()
}
fn default_metric() -> String {
    "cosine".to_string()
}

// ============ Chunking ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    /// How far back from the hard edge to look for a sentence or word break.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            lookback: default_lookback(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}
fn default_lookback() -> usize {
    50
}

// ============ Ingest ============

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    /// Documents per embed-and-upsert flush.
    #[serde(default = "default_ingest_batch")]
    pub batch_size: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            batch_size: default_ingest_batch(),
            max_file_bytes: default_max_file_bytes(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("./data/rag_data")
}
fn default_ingest_batch() -> usize {
    10
}
fn default_max_file_bytes() -> u64 {
    500_000
}
fn default_include_globs() -> Vec<String> {
    ["txt", "md", "tex", "rst"]
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_embedding_model(),
            dims: default_dims(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_max_retries() -> u32 {
    2
}
fn default_embedding_timeout() -> u64 {
    30
}

// ============ Generation ============

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// The two independent solvers of the tandem debate.
    #[serde(default = "default_math_models")]
    pub math_models: [String; 2],
    /// Judge of the tandem debate.
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    /// Model driving tool-calling chat and the agent loop.
    #[serde(default = "default_tool_model")]
    pub tool_model: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            timeout_secs: default_generation_timeout(),
            temperature: default_temperature(),
            math_models: default_math_models(),
            judge_model: default_judge_model(),
            tool_model: default_tool_model(),
        }
    }
}

fn default_generation_timeout() -> u64 {
    120
}
fn default_temperature() -> f64 {
    0.3
}
fn default_math_models() -> [String; 2] {
    ["phi3".to_string(), "qwen2:1.5b".to_string()]
}
fn default_judge_model() -> String {
    "gemma2:2b".to_string()
}
fn default_tool_model() -> String {
    "phi3".to_string()
}

// ============ Retrieval ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    /// Hits scoring below this are dropped by the threshold search.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Upper bound on the expanded candidate set handed to the reranker.
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            min_score: default_min_score(),
            candidate_cap: default_candidate_cap(),
        }
    }
}

fn default_k() -> usize {
    3
}
fn default_min_score() -> f64 {
    0.25
}
fn default_candidate_cap() -> usize {
    20
}

// ============ Reranker ============

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `"disabled"`, `"embedding"`, `"http"` or `"term"`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    /// Endpoint of an HTTP cross-encoder service (`provider = "http"`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            model: default_rerank_model(),
            api_key: None,
            timeout_secs: default_rerank_timeout(),
        }
    }
}

impl RerankerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_rerank_model() -> String {
    "ms-marco-MiniLM-L-12-v2".to_string()
}
fn default_rerank_timeout() -> u64 {
    30
}

// ============ Web search ============

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    /// `"disabled"`, `"duckduckgo"` or `"serpapi"`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    /// Override for the search API base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: usize,
    /// Extracted page text is cut to this many characters.
    #[serde(default = "default_max_page_chars")]
    pub max_page_chars: usize,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            base_url: None,
            api_key: None,
            num_results: default_num_results(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_page_bytes: default_max_page_bytes(),
            max_page_chars: default_max_page_chars(),
        }
    }
}

impl WebSearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_num_results() -> usize {
    3
}
fn default_fetch_timeout() -> u64 {
    10
}
fn default_max_page_bytes() -> usize {
    2_000_000
}
fn default_max_page_chars() -> usize {
    4_000
}

// ============ Agent ============

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Number of trailing history messages shown to the planner.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Per-message character budget inside the planning prompt.
    #[serde(default = "default_history_chars")]
    pub history_chars: usize,
    /// Directories the `list_files` tool may read.
    #[serde(default = "default_allowed_roots")]
    pub allowed_roots: Vec<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_window: default_history_window(),
            history_chars: default_history_chars(),
            allowed_roots: default_allowed_roots(),
        }
    }
}

fn default_max_iterations() -> usize {
    5
}
fn default_history_window() -> usize {
    6
}
fn default_history_chars() -> usize {
    200
}
fn default_allowed_roots() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

// ============ Memory ============

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_path")]
    pub path: PathBuf,
    /// Per-user cap enforced by cleanup.
    #[serde(default = "default_max_memories")]
    pub max_memories: usize,
    /// Minimum importance for a conversation turn to be remembered.
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_memory_path(),
            max_memories: default_max_memories(),
            importance_threshold: default_importance_threshold(),
        }
    }
}

fn default_memory_path() -> PathBuf {
    PathBuf::from("./data/memory/memory.sqlite")
}
fn default_max_memories() -> usize {
    1000
}
fn default_importance_threshold() -> f64 {
    0.6
}

// ============ Safety ============

#[derive(Debug, Deserialize, Clone)]
pub struct SafetyConfig {
    /// `"disabled"`, `"keyword"` or `"ollama"` (a guard model served by
    /// `[generation].url`).
    #[serde(default = "default_disabled")]
    pub provider: String,
    /// Guard model for `provider = "ollama"`.
    #[serde(default = "default_guard_model")]
    pub model: String,
    /// Category name to trigger phrases, matched on word boundaries
    /// ignoring case (`provider = "keyword"`).
    #[serde(default = "default_safety_categories")]
    pub categories: BTreeMap<String, Vec<String>>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_guard_model(),
            categories: default_safety_categories(),
        }
    }
}

impl SafetyConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_guard_model() -> String {
    "llama-guard3:1b".to_string()
}
fn default_safety_categories() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 6] = [
        (
            "Violence & Hate",
            &["kill", "murder", "racist", "terrorism", "extremist", "supremacist"],
        ),
        (
            "Sexual Content",
            &["sexual abuse", "child exploitation", "porn", "rape", "molest"],
        ),
        (
            "Criminal Planning",
            &["launder money", "break in", "robbery", "steal", "fraud"],
        ),
        ("Guns & Weapons", &["bomb", "explosive", "firearm"]),
        ("Self-Harm", &["suicide", "kill myself", "self-harm", "overdose"]),
        (
            "Privacy Violation",
            &["social security number", "ssn", "private data"],
        ),
    ];
    table
        .iter()
        .map(|(category, phrases)| {
            (
                category.to_string(),
                phrases.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect()
}

// ============ Server ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OLLAMA_URL").filter(|v| !v.is_empty()) {
            self.embedding.url = url.clone();
            self.generation.url = url;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL").filter(|v| !v.is_empty()) {
            self.embedding.model = model;
        }
        if let Some(key) = lookup("SERPAPI_KEY").filter(|v| !v.is_empty()) {
            self.web_search.api_key = Some(key);
        }
        if let Some(key) = lookup("RERANK_API_KEY").filter(|v| !v.is_empty()) {
            self.reranker.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap,
                self.chunking.chunk_size
            );
        }
        if self.ingest.batch_size == 0 {
            bail!("ingest.batch_size must be > 0");
        }
        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        if self.retrieval.k == 0 {
            bail!("retrieval.k must be >= 1");
        }
        if self.retrieval.min_score < 0.0 {
            bail!("retrieval.min_score must be >= 0.0");
        }
        if self.agent.max_iterations == 0 {
            bail!("agent.max_iterations must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.memory.importance_threshold) {
            bail!("memory.importance_threshold must be in [0.0, 1.0]");
        }
        match self.store.metric.as_str() {
            "cosine" | "l2" => {}
            other => bail!("Unknown store.metric: '{}'. Must be cosine or l2.", other),
        }
        match self.reranker.provider.as_str() {
            "disabled" | "embedding" | "http" | "term" => {}
            other => bail!(
                "Unknown reranker provider: '{}'. Must be disabled, embedding, http, or term.",
                other
            ),
        }
        match self.safety.provider.as_str() {
            "disabled" | "ollama" => {}
            "keyword" => {
                if self.safety.categories.values().all(|phrases| phrases.is_empty()) {
                    bail!("safety.categories must list at least one phrase for the keyword provider");
                }
            }
            other => bail!(
                "Unknown safety provider: '{}'. Must be disabled, keyword, or ollama.",
                other
            ),
        }
        match self.web_search.provider.as_str() {
            "disabled" | "duckduckgo" | "serpapi" => {}
            other => bail!(
                "Unknown web_search provider: '{}'. Must be disabled, duckduckgo, or serpapi.",
                other
            ),
        }
        Ok(())
    }
}

/// Parse a config from TOML text, without environment overrides.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Load the config at `path` (defaults if the file does not exist), then
/// apply environment overrides and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")?
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.ingest.batch_size, 10);
        assert_eq!(config.ingest.max_file_bytes, 500_000);
        assert_eq!(config.embedding.dims, 768);
        assert_eq!(config.embedding.model, "nomic-embed-text");
        assert_eq!(config.generation.math_models[1], "qwen2:1.5b");
        assert_eq!(config.agent.max_iterations, 5);
        assert!(!config.web_search.is_enabled());
        assert!(!config.reranker.is_enabled());
        assert!(!config.safety.is_enabled());
        assert_eq!(config.safety.categories.len(), 6);
    }

    #[test]
    fn test_safety_section() {
        let config = parse_config(
            "[safety]\nprovider = \"keyword\"\n[safety.categories]\nSpoilers = [\"ending\"]\n",
        )
        .unwrap();
        assert!(config.safety.is_enabled());
        assert_eq!(config.safety.categories["Spoilers"], vec!["ending"]);
        assert_eq!(config.safety.categories.len(), 1);

        assert!(parse_config("[safety]\nprovider = \"llama\"\n").is_err());
        let err = parse_config("[safety]\nprovider = \"keyword\"\ncategories = {}\n").unwrap_err();
        assert!(err.to_string().contains("safety.categories"));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = parse_config("[chunking]\nchunk_size = 200\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 200);
        assert_eq!(config.chunking.overlap, 50);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let err = parse_config("[chunking]\nchunk_size = 50\noverlap = 50\n").unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(parse_config("[web_search]\nprovider = \"altavista\"\n").is_err());
        assert!(parse_config("[store]\nmetric = \"manhattan\"\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OLLAMA_URL", "http://gpu-box:11434"),
            ("EMBEDDING_MODEL", "mxbai-embed-large"),
            ("SERPAPI_KEY", ""),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.embedding.url, "http://gpu-box:11434");
        assert_eq!(config.generation.url, "http://gpu-box:11434");
        assert_eq!(config.embedding.model, "mxbai-embed-large");
        assert!(config.web_search.api_key.is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.store.collection, "math_knowledge");
    }
}
