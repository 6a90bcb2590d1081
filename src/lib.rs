//! # Axiom
//!
//! A retrieval-augmented question answering pipeline over a local corpus.
//!
//! Documents from a folder are chunked, embedded and stored in a
//! SQLite-backed vector store. Queries are answered from the nearest
//! chunks, optionally reranked and augmented with web search, and handed
//! to one of three answer strategies: a tool-calling chat, a reasoning
//! agent, or a two-solver debate for math.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌───────────┐
//! │  Folder  │──▶│   Ingest    │──▶│  SQLite   │
//! │  (.txt)  │   │ Chunk+Embed │   │  vectors  │
//! └──────────┘   └─────────────┘   └─────┬─────┘
//!                                        │
//!                 ┌──────────────────────┤ Retrieval (+rerank, +web)
//!                 ▼                      ▼
//!            ┌──────────┐   ┌────────────────────────────┐
//!            │   CLI    │   │ Assistant: chat/agent/math │
//!            │ (axiom)  │◀─▶│        + memory            │
//!            └──────────┘   └─────────────┬──────────────┘
//!                                         ▼
//!                                   ┌──────────┐
//!                                   │   HTTP   │
//!                                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! axiom init
//! axiom ingest ./data
//! axiom query "spectral theorem" --k 5
//! axiom ask "solve 2x + 3 = 11"
//! axiom serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`models`] | Core data types |
//! | [`error`] | Backend error taxonomy |
//! | [`chunk`] | Recursive character text splitting |
//! | [`embedding`] | Embedding provider abstraction (Ollama) |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`store`] | Vector store, collections, ingest lock |
//! | [`ingest`] | Folder ingestion |
//! | [`rerank`] | Cross-encoder and embedding rerankers |
//! | [`web`] | Web search augmentation |
//! | [`retrieval`] | Threshold search, rerank and web merge |
//! | [`llm`] | Generation client (Ollama) |
//! | [`synthesis`] | Two-solver debate with a judge |
//! | [`tools`] | Tool trait, registry and built-in tools |
//! | [`agent`] | Reason/act loop over the tool registry |
//! | [`memory`] | Long-term per-user memory |
//! | [`safety`] | Input and output content screening |
//! | [`assistant`] | Mode routing and response assembly |
//! | [`pipeline`] | Component wiring |
//! | [`server`] | HTTP API |
//! | [`logging`] | Tracing subscriber setup |

pub mod agent;
pub mod assistant;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod rerank;
pub mod retrieval;
pub mod safety;
pub mod server;
pub mod store;
pub mod synthesis;
pub mod tools;
pub mod web;
