//! # Axiom CLI (`axiom`)
//!
//! Ingest a folder of documents, query it, and ask questions answered
//! over the retrieved context.
//!
//! ## Usage
//!
//! ```bash
//! axiom --config ./config/axiom.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `axiom init` | Create the vector store and collection |
//! | `axiom ingest [FOLDER]` | Chunk, embed and store a folder (default `[ingest].source_dir`) |
//! | `axiom query "<text>"` | Print ranked passages |
//! | `axiom ask "<text>"` | Answer a question (`--mode auto|math|chat|agent`) |
//! | `axiom memory ...` | Inspect and manage long-term memory |
//! | `axiom serve` | Start the HTTP API |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use axiom_rag::assistant::{ChatRequest, Mode};
use axiom_rag::config::{self, Config};
use axiom_rag::embedding;
use axiom_rag::ingest::IngestOutcome;
use axiom_rag::logging;
use axiom_rag::memory::{LongTermMemory, CONVERSATION};
use axiom_rag::models::{Metadata, SourceSummary, SourceTag};
use axiom_rag::pipeline::Pipeline;
use axiom_rag::server;

/// Axiom: retrieval-augmented question answering over a local corpus.
///
/// All commands accept a `--config` flag pointing to a TOML file. A
/// missing file means built-in defaults; `OLLAMA_URL`, `EMBEDDING_MODEL`,
/// `SERPAPI_KEY` and `RERANK_API_KEY` override the file.
#[derive(Parser)]
#[command(name = "axiom", version, about = "Retrieval-augmented question answering over a local corpus")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/axiom.toml")]
    config: PathBuf,

    /// Debug-level logging for this crate (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vector store and the configured collection.
    ///
    /// Idempotent: running it against an existing store changes nothing.
    Init,

    /// Ingest a folder of text documents.
    ///
    /// Oversized, empty and non-UTF-8 files are skipped and logged; the
    /// run continues. Exits 0 when another ingest is already running.
    Ingest {
        /// Folder to ingest. Defaults to `[ingest].source_dir`.
        folder: Option<PathBuf>,
    },

    /// Retrieve ranked passages for a query.
    Query {
        text: String,

        /// Number of passages. Defaults to `[retrieval].k`.
        #[arg(long)]
        k: Option<usize>,
    },

    /// Answer a question over the retrieved context.
    Ask {
        text: String,

        #[arg(long, value_enum, default_value = "auto")]
        mode: Mode,

        /// User id for long-term memory.
        #[arg(long)]
        user: Option<String>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Manage long-term memory.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Store a memory.
    Remember {
        #[arg(long)]
        user: String,
        /// `preference`, `fact`, `conversation`, `conversation_summary` or any other label.
        #[arg(long = "type", default_value = CONVERSATION)]
        memory_type: String,
        content: String,
    },
    /// Print memories relevant to a query.
    Recall {
        #[arg(long)]
        user: String,
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Keep only the most important memories of a user.
    Cleanup {
        #[arg(long)]
        user: String,
        /// Defaults to `[memory].max_memories`.
        #[arg(long)]
        max: Option<usize>,
    },
    /// Print a summary of a user's memories.
    Profile {
        #[arg(long)]
        user: String,
    },
    /// Summarize a user's stored conversation turns into one memory.
    Summarize {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Ingest { folder } => run_ingest(&cfg, folder).await?,
        Commands::Query { text, k } => run_query(&cfg, &text, k).await?,
        Commands::Ask {
            text,
            mode,
            user,
            json,
        } => run_ask(&cfg, text, mode, user, json).await?,
        Commands::Memory { action } => run_memory(&cfg, action).await?,
        Commands::Serve => {
            let pipeline = Pipeline::build(&cfg).await?;
            server::run_server(std::sync::Arc::new(pipeline)).await?;
        }
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> Result<()> {
    let pipeline = Pipeline::build(cfg).await?;
    let count = pipeline.retrieval.collection().count().await?;
    println!("Store initialized at {}", cfg.store.path.display());
    println!("  collection: {} ({})", cfg.store.collection, cfg.store.metric);
    println!("  records: {}", count);
    if pipeline.memory.is_some() {
        println!("  memory: {}", cfg.memory.path.display());
    }
    Ok(())
}

async fn run_ingest(cfg: &Config, folder: Option<PathBuf>) -> Result<()> {
    let pipeline = Pipeline::build(cfg).await?;
    let folder = folder.unwrap_or_else(|| cfg.ingest.source_dir.clone());

    match pipeline.ingestor.ingest_folder(&folder).await? {
        IngestOutcome::InProgress => {
            println!(
                "ingest {}: already in progress for collection '{}'",
                folder.display(),
                cfg.store.collection
            );
        }
        IngestOutcome::Completed(report) => {
            println!("ingest {}", folder.display());
            println!("  files found: {}", report.files_found);
            println!("  files stored: {}", report.files_stored);
            println!("  files skipped: {}", report.files_skipped);
            println!("  files failed: {}", report.files_failed);
            println!("  chunks written: {}", report.chunks_written);
            if report.zero_vectors > 0 {
                println!("  zero vectors: {}", report.zero_vectors);
            }
            println!("  batches: {}", report.batches);
        }
    }
    Ok(())
}

async fn run_query(cfg: &Config, text: &str, k: Option<usize>) -> Result<()> {
    let pipeline = Pipeline::build(cfg).await?;
    let k = k.unwrap_or(cfg.retrieval.k).max(1);
    let results = pipeline.retrieval.query(text, k).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let summary = SourceSummary::from(result);
        println!("{}. [{:.3}] {}", i + 1, summary.score, summary.document);
        let origin = match result.source {
            SourceTag::Local => "local",
            SourceTag::Web => "web",
        };
        println!("    source: {}", origin);
        if summary.reranked {
            println!("    reranked: yes");
        }
        println!("    excerpt: \"{}\"", summary.content_preview.replace('\n', " ").trim());
        println!("    id: {}", result.id);
        println!();
    }
    Ok(())
}

async fn run_ask(cfg: &Config, text: String, mode: Mode, user: Option<String>, json: bool) -> Result<()> {
    let pipeline = Pipeline::build(cfg).await?;
    let mut request = ChatRequest::new(text);
    request.mode = mode;
    request.user_id = user;
    let response = pipeline.assistant.respond(request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.response);
    if response.mode == Mode::Math {
        if let Some(details) = &response.details {
            for key in ["solution_1", "solution_2"] {
                if let Some(solution) = details.get(key).and_then(|v| v.as_str()) {
                    println!();
                    println!("--- {} ---", key);
                    println!("{}", solution);
                }
            }
        }
    }
    if !response.sources.is_empty() {
        println!();
        println!("sources:");
        for source in &response.sources {
            println!("  [{:.3}] {}", source.score, source.document);
        }
    }
    Ok(())
}

async fn run_memory(cfg: &Config, action: MemoryAction) -> Result<()> {
    let embedder = embedding::create_provider(&cfg.embedding)?;
    let memory = LongTermMemory::open(&cfg.memory.path).await?.with_embedder(embedder);

    match action {
        MemoryAction::Remember {
            user,
            memory_type,
            content,
        } => {
            let item = memory.remember(&user, &content, &memory_type, Metadata::new()).await?;
            println!("remembered {} (importance {:.2})", item.id, item.importance);
        }
        MemoryAction::Recall { user, query, limit } => {
            let found = memory.retrieve(&user, &query, limit, None).await?;
            if found.is_empty() {
                println!("No memories.");
            }
            for item in found {
                println!("- [{}] {}", item.memory_type, item.content.replace('\n', " / "));
            }
        }
        MemoryAction::Cleanup { user, max } => {
            let max = max.unwrap_or(cfg.memory.max_memories);
            let removed = memory.cleanup(&user, max).await?;
            println!("removed {} memories (keeping at most {})", removed, max);
        }
        MemoryAction::Profile { user } => {
            let profile = memory.user_profile(&user).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        MemoryAction::Summarize { user } => {
            let conversation = memory.stored_conversation(&user).await?;
            let summary = memory.summarize_conversation(&user, &conversation).await?;
            if summary.is_empty() {
                println!("No conversation to summarize.");
            } else {
                println!("summary: {}", summary);
            }
        }
    }
    Ok(())
}
