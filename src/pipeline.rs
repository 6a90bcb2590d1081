//! Wiring: build every component from a [`Config`].
//!
//! Clients are constructed once here and handed to the components that
//! use them; nothing holds global state. [`Pipeline::build_with`] takes
//! the embedding and generation backends as arguments so tests and
//! embedders of the library can substitute their own.

use anyhow::Result;
use std::sync::Arc;

use crate::agent::Agent;
use crate::assistant::Assistant;
use crate::chunk::ChunkSplitter;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::ingest::Ingestor;
use crate::llm::{Generator, OllamaClient};
use crate::memory::{LongTermMemory, MemoryManager};
use crate::rerank::create_reranker;
use crate::retrieval::RetrievalOrchestrator;
use crate::safety::create_guard;
use crate::store::sqlite::SqliteVectorStore;
use crate::store::{Collection, Metric};
use crate::synthesis::TandemDebate;
use crate::tools::ToolRegistry;
use crate::web::create_augmenter;

pub struct Pipeline {
    pub config: Config,
    pub ingestor: Arc<Ingestor>,
    pub retrieval: Arc<RetrievalOrchestrator>,
    pub tools: Arc<ToolRegistry>,
    pub assistant: Arc<Assistant>,
    pub memory: Option<Arc<LongTermMemory>>,
}

impl Pipeline {
    /// Build with the Ollama embedding and generation clients.
    pub async fn build(config: &Config) -> Result<Self> {
        let embedder = embedding::create_provider(&config.embedding)?;
        let generator: Arc<dyn Generator> = Arc::new(OllamaClient::new(&config.generation)?);
        Self::build_with(config, embedder, generator).await
    }

    pub async fn build_with(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let store = Arc::new(SqliteVectorStore::open(&config.store.path).await?);
        let metric = Metric::parse(&config.store.metric)?;
        let collection = Collection::open(store, embedder.clone(), &config.store.collection, metric).await?;

        let splitter = ChunkSplitter::from_config(&config.chunking)?;
        let ingestor = Arc::new(Ingestor::new(
            collection.clone(),
            splitter,
            config.ingest.clone(),
            &config.store.path,
        ));

        let mut retrieval = RetrievalOrchestrator::new(collection, config.retrieval.min_score)
            .with_candidate_cap(config.retrieval.candidate_cap);
        let reranker = create_reranker(&config.reranker, embedder.clone())?;
        let reranking = reranker.is_some();
        if let Some(reranker) = reranker {
            retrieval = retrieval.with_reranker(reranker);
        }
        let web = create_augmenter(&config.web_search)?.map(Arc::new);
        if let Some(web) = &web {
            retrieval = retrieval.with_web_search(web.clone());
        }
        let retrieval = Arc::new(retrieval);

        let tools = Arc::new(ToolRegistry::with_builtins(
            retrieval.clone(),
            web.clone(),
            &config.agent.allowed_roots,
        )?);

        let generation = &config.generation;
        let debate = TandemDebate::new(
            generator.clone(),
            generation.math_models.clone(),
            generation.judge_model.clone(),
        );
        let agent = Agent::new(generator.clone(), tools.clone(), generation.tool_model.clone(), &config.agent);
        let safety = create_guard(&config.safety, generator.clone())?;
        let mut assistant = Assistant::new(
            retrieval.clone(),
            generator,
            tools.clone(),
            debate,
            agent,
            generation.tool_model.clone(),
            config.retrieval.k,
        );
        let screening = safety.is_some();
        if let Some(guard) = safety {
            assistant = assistant.with_safety(guard);
        }

        let memory = if config.memory.enabled {
            let memory = Arc::new(LongTermMemory::open(&config.memory.path).await?.with_embedder(embedder));
            assistant = assistant.with_memory(MemoryManager::new(memory.clone(), config.memory.importance_threshold));
            Some(memory)
        } else {
            None
        };

        tracing::info!(
            collection = %config.store.collection,
            metric = metric.as_str(),
            reranking,
            web_search = web.is_some(),
            memory = memory.is_some(),
            safety = screening,
            tools = tools.len(),
            "pipeline ready"
        );

        Ok(Self {
            config: config.clone(),
            ingestor,
            retrieval,
            tools,
            assistant: Arc::new(assistant),
            memory,
        })
    }
}
