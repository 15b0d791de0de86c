use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where rate-limit state and other runtime data are stored
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// Vector store (Qdrant) configuration
    pub qdrant: QdrantConfig,
    /// Retrieval sizing
    pub rag: RagConfig,
    /// Embedding provider and cache configuration
    pub embedding: EmbeddingConfig,
    /// Chat LLM providers
    pub llm: LlmConfig,
    /// SSE streaming tuning
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Collections queried on every search, in priority order.
    pub collections: Vec<String>,
    /// Named dense vector inside each collection.
    pub dense_vector_name: String,
    /// Named sparse vector inside each collection.
    pub sparse_vector_name: String,
    /// Per-leg prefetch size before fusion.
    pub prefetch_limit: usize,
    /// Reciprocal Rank Fusion constant.
    pub rrf_k: u32,
    /// Timeout for a single collection query, in milliseconds.
    pub query_timeout_ms: u64,
    /// When true, any collection failure aborts the whole search.
    pub fail_on_partial_search_error: bool,
    /// Collection that receives cached embeddings on upload.
    pub upload_collection: String,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collections: vec![
                "java-chat-books".to_string(),
                "java-docs".to_string(),
                "java-articles".to_string(),
                "java-pdfs".to_string(),
            ],
            dense_vector_name: "dense".to_string(),
            sparse_vector_name: "bm25".to_string(),
            prefetch_limit: 20,
            rrf_k: 60,
            query_timeout_ms: 5000,
            fail_on_partial_search_error: false,
            upload_collection: "java-docs".to_string(),
        }
    }
}

impl QdrantConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Candidates pulled from hybrid search before reranking.
    pub search_top_k: usize,
    /// Documents kept after reranking.
    pub search_return_k: usize,
    /// Citations surfaced to the client.
    pub search_citations: usize,
    /// Reranker LLM call timeout in seconds (capped at 60).
    pub reranker_timeout_secs: u64,
    /// Document cap for token-constrained models.
    pub limit_constrained: usize,
    /// Per-document token cap for token-constrained models.
    pub token_limit_constrained: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            search_top_k: 12,
            search_return_k: 6,
            search_citations: 3,
            reranker_timeout_secs: 12,
            limit_constrained: 3,
            token_limit_constrained: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    /// Expected vector size; every returned embedding is checked against it.
    pub dimensions: usize,
    pub local_base_url: String,
    pub local_model: String,
    /// Max inputs per local embedding request.
    pub batch_size: usize,
    pub remote_base_url: String,
    pub remote_api_key: Option<String>,
    pub remote_model: String,
    pub cache_dir: PathBuf,
    pub upload_batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            dimensions: 4096,
            local_base_url: "http://127.0.0.1:8088".to_string(),
            local_model: "text-embedding-qwen3-embedding-8b".to_string(),
            batch_size: 32,
            remote_base_url: "https://api.openai.com/v1".to_string(),
            remote_api_key: None,
            remote_model: "text-embedding-3-small".to_string(),
            cache_dir: PathBuf::from("./data/embeddings-cache"),
            upload_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// GitHub Models token
    pub github_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub github_models_base_url: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub github_models_model: String,
    /// "github_models" or "openai"
    pub primary_provider: String,
    /// How long the primary stays disabled after a backoff-eligible failure
    pub primary_backoff_secs: u64,
    pub reasoning_effort: Option<String>,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            openai_api_key: None,
            github_models_base_url: "https://models.github.ai/inference".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-5.2".to_string(),
            github_models_model: "gpt-5".to_string(),
            primary_provider: "github_models".to_string(),
            primary_backoff_secs: 600,
            reasoning_effort: None,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub heartbeat_secs: u64,
    /// Bounded buffer between the provider reader and the SSE writer.
    pub buffer_capacity: usize,
    pub coalesce_window_ms: u64,
    pub coalesce_max_items: usize,
    /// Log one line per this many dropped chunks.
    pub drop_log_interval: u64,
    /// Abort a provider stream when no chunk arrives within this window.
    pub idle_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 20,
            buffer_capacity: 512,
            coalesce_window_ms: 40,
            coalesce_max_items: 16,
            drop_log_interval: 100,
            idle_timeout_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8085".to_string(),
            qdrant: QdrantConfig::default(),
            rag: RagConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Parse an env var into `target`, leaving the default in place when unset or malformed.
fn parse_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(v) = val.trim().parse() {
            *target = v;
        }
    }
}

/// Non-blank env var.
fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("DOC_CHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("DOC_CHAT_BIND_ADDR") {
            config.bind_addr = addr;
        }

        // Qdrant
        if let Some(url) = env_string("QDRANT_URL") {
            config.qdrant.url = url.trim_end_matches('/').to_string();
        }
        if let Some(key) = env_string("QDRANT_API_KEY") {
            config.qdrant.api_key = Some(key);
        }
        if let Some(list) = env_string("QDRANT_COLLECTIONS") {
            let collections: Vec<String> = list
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if !collections.is_empty() {
                config.qdrant.collections = collections;
            }
        }
        if let Some(name) = env_string("QDRANT_DENSE_VECTOR_NAME") {
            config.qdrant.dense_vector_name = name;
        }
        if let Some(name) = env_string("QDRANT_SPARSE_VECTOR_NAME") {
            config.qdrant.sparse_vector_name = name;
        }
        parse_env("QDRANT_PREFETCH_LIMIT", &mut config.qdrant.prefetch_limit);
        parse_env("QDRANT_RRF_K", &mut config.qdrant.rrf_k);
        parse_env("QDRANT_QUERY_TIMEOUT_MS", &mut config.qdrant.query_timeout_ms);
        parse_env(
            "QDRANT_FAIL_ON_PARTIAL_SEARCH_ERROR",
            &mut config.qdrant.fail_on_partial_search_error,
        );
        if let Some(name) = env_string("QDRANT_UPLOAD_COLLECTION") {
            config.qdrant.upload_collection = name;
        }

        // Retrieval
        parse_env("RAG_SEARCH_TOP_K", &mut config.rag.search_top_k);
        parse_env("RAG_SEARCH_RETURN_K", &mut config.rag.search_return_k);
        parse_env("RAG_SEARCH_CITATIONS", &mut config.rag.search_citations);
        if let Ok(val) = std::env::var("RAG_RERANKER_TIMEOUT_SECS") {
            if let Ok(v) = val.parse::<u64>() {
                config.rag.reranker_timeout_secs = v.min(60); // Cap at 60s
            }
        }
        parse_env("RAG_LIMIT_CONSTRAINED", &mut config.rag.limit_constrained);
        parse_env(
            "RAG_TOKEN_LIMIT_CONSTRAINED",
            &mut config.rag.token_limit_constrained,
        );

        // Embeddings
        if let Some(provider) = env_string("EMBEDDING_PROVIDER") {
            match provider.to_ascii_lowercase().as_str() {
                "local" => config.embedding.provider = EmbeddingProviderKind::Local,
                "remote" | "openai" => config.embedding.provider = EmbeddingProviderKind::Remote,
                other => tracing::warn!("Unknown EMBEDDING_PROVIDER '{other}', keeping default"),
            }
        }
        parse_env("EMBEDDING_DIMENSIONS", &mut config.embedding.dimensions);
        if let Some(url) = env_string("LOCAL_EMBEDDING_BASE_URL") {
            config.embedding.local_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = env_string("LOCAL_EMBEDDING_MODEL") {
            config.embedding.local_model = model;
        }
        parse_env("LOCAL_EMBEDDING_BATCH_SIZE", &mut config.embedding.batch_size);
        if let Some(url) = env_string("REMOTE_EMBEDDING_BASE_URL") {
            config.embedding.remote_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(key) = env_string("REMOTE_EMBEDDING_API_KEY") {
            config.embedding.remote_api_key = Some(key);
        }
        if let Some(model) = env_string("REMOTE_EMBEDDING_MODEL") {
            config.embedding.remote_model = model;
        }
        if let Ok(dir) = std::env::var("EMBEDDING_CACHE_DIR") {
            config.embedding.cache_dir = PathBuf::from(dir);
        }
        parse_env(
            "EMBEDDING_UPLOAD_BATCH_SIZE",
            &mut config.embedding.upload_batch_size,
        );

        // LLM providers
        config.llm.github_token = env_string("GITHUB_TOKEN");
        config.llm.openai_api_key = env_string("OPENAI_API_KEY");
        if let Some(url) = env_string("GITHUB_MODELS_BASE_URL") {
            config.llm.github_models_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = env_string("OPENAI_BASE_URL") {
            config.llm.openai_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = env_string("OPENAI_MODEL") {
            config.llm.openai_model = model;
        }
        if let Some(model) = env_string("GITHUB_MODELS_CHAT_MODEL") {
            config.llm.github_models_model = model;
        }
        if let Some(provider) = env_string("LLM_PRIMARY_PROVIDER") {
            config.llm.primary_provider = provider;
        }
        parse_env(
            "LLM_PRIMARY_BACKOFF_SECONDS",
            &mut config.llm.primary_backoff_secs,
        );
        config.llm.reasoning_effort = env_string("OPENAI_REASONING_EFFORT");
        parse_env("LLM_TEMPERATURE", &mut config.llm.temperature);

        // Streaming
        parse_env("STREAM_HEARTBEAT_SECONDS", &mut config.stream.heartbeat_secs);
        parse_env("STREAM_BUFFER_CAPACITY", &mut config.stream.buffer_capacity);
        parse_env(
            "STREAM_COALESCE_WINDOW_MS",
            &mut config.stream.coalesce_window_ms,
        );
        parse_env(
            "STREAM_COALESCE_MAX_ITEMS",
            &mut config.stream.coalesce_max_items,
        );

        config.normalize();
        config
    }

    /// Clamp sizes that must stay at least 1.
    fn normalize(&mut self) {
        self.rag.search_top_k = self.rag.search_top_k.max(1);
        self.rag.search_return_k = self.rag.search_return_k.clamp(1, self.rag.search_top_k);
        self.embedding.batch_size = self.embedding.batch_size.max(1);
        self.embedding.upload_batch_size = self.embedding.upload_batch_size.max(1);
        self.stream.buffer_capacity = self.stream.buffer_capacity.max(1);
        self.stream.coalesce_max_items = self.stream.coalesce_max_items.max(1);
        self.stream.drop_log_interval = self.stream.drop_log_interval.max(1);
    }

    pub fn rate_limit_state_path(&self) -> PathBuf {
        self.data_dir.join("rate-limit-state.json")
    }
}
