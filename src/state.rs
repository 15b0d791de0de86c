use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::llm::chat_stream::{ChatProvider, LlmGateway, OpenAiCompatibleClient};
use crate::llm::embeddings::{self, EmbeddingClient};
use crate::llm::rate_limit::ProviderRateLimiter;
use crate::llm::rerank::Reranker;
use crate::llm::router::ProviderRouter;
use crate::llm::streaming::StreamingOrchestrator;
use crate::memory::ChatMemory;
use crate::retrieval::RetrievalOrchestrator;
use crate::search::encoder::QueryEncoder;
use crate::search::hybrid::{HybridSearchEngine, HybridSearchSettings};
use crate::search::qdrant::{QdrantRestStore, VectorStore};

const MAX_RERANKER_TIMEOUT_SECS: u64 = 60;
const MAX_CONCURRENT_CHATS: usize = 3;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub http_client: reqwest::Client,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub store: Arc<dyn VectorStore>,
    pub search: Arc<HybridSearchEngine>,
    pub retrieval: Arc<RetrievalOrchestrator>,
    pub router: Arc<ProviderRouter>,
    pub streaming: Arc<StreamingOrchestrator>,
    pub cache: Arc<EmbeddingCache>,
    pub memory: Arc<ChatMemory>,
    pub chat_semaphore: Arc<tokio::sync::Semaphore>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        let embedder = embeddings::from_config(http_client.clone(), &config.embedding);
        let store: Arc<dyn VectorStore> = Arc::new(QdrantRestStore::new(
            http_client.clone(),
            &config.qdrant.url,
            config.qdrant.api_key.clone(),
            &config.qdrant.dense_vector_name,
            &config.qdrant.sparse_vector_name,
        ));

        let chat_client: Arc<dyn ChatProvider> =
            Arc::new(OpenAiCompatibleClient::new(http_client.clone(), config.llm.clone()));
        let limiter = Arc::new(ProviderRateLimiter::new(Some(config.rate_limit_state_path())));
        let router = Arc::new(ProviderRouter::new(&config.llm, limiter));

        let encoder = Arc::new(QueryEncoder::new(embedder.clone()));
        let search = Arc::new(HybridSearchEngine::new(
            store.clone(),
            encoder,
            HybridSearchSettings::from(&config.qdrant),
        ));
        let reranker = Arc::new(Reranker::new(
            Arc::new(LlmGateway::new(router.clone(), chat_client.clone())),
            Duration::from_secs(config.rag.reranker_timeout_secs.min(MAX_RERANKER_TIMEOUT_SECS)),
        ));
        let retrieval = Arc::new(RetrievalOrchestrator::new(search.clone(), reranker, &config.rag));
        let streaming = Arc::new(StreamingOrchestrator::new(
            router.clone(),
            chat_client,
            config.stream.clone(),
        ));

        let cache = EmbeddingCache::open(
            &config.embedding.cache_dir,
            embedder.clone(),
            store.clone(),
            &config.qdrant.upload_collection,
        )
        .context("Failed to open embedding cache")?;

        Ok(Self {
            config,
            http_client,
            embedder,
            store,
            search,
            retrieval,
            router,
            streaming,
            cache: Arc::new(cache),
            memory: Arc::new(ChatMemory::new()),
            chat_semaphore: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_CHATS)),
        })
    }
}
