//! Integration tests for the doc-chat pipeline.
//!
//! These tests drive retrieval, the embedding cache and the streaming
//! orchestrator end to end with in-process fakes; no Qdrant or LLM needed.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use doc_chat::cache::{EmbeddingCache, EmbeddingMetadata};
use doc_chat::config::{LlmConfig, RagConfig, StreamConfig};
use doc_chat::llm::chat_stream::{
    ChatProvider, ChatStream, CompletionRequest, LlmError, LlmGateway, OpenAiCompatibleClient,
};
use doc_chat::llm::embeddings::{EmbeddingClient, EmbeddingServiceUnavailable};
use doc_chat::llm::prompt::StructuredPrompt;
use doc_chat::llm::rate_limit::{Provider, ProviderRateLimiter};
use doc_chat::llm::rerank::{Reranker, TextCompleter};
use doc_chat::llm::router::ProviderRouter;
use doc_chat::llm::streaming::{StreamEvent, StreamRequest, StreamingOrchestrator};
use doc_chat::retrieval::{to_citations, RetrievalError, RetrievalOrchestrator};
use doc_chat::search::encoder::QueryEncoder;
use doc_chat::search::hybrid::{HybridSearchEngine, HybridSearchSettings};
use doc_chat::search::qdrant::{HybridQuery, ScoredPoint, UpsertPoint, VectorStore, VectorStoreError};

// ─── Fakes ───────────────────────────────────────────────

struct CountingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingClient for CountingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
    }
    fn dimensions(&self) -> usize {
        3
    }
    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Serves canned points per collection and records every query and upsert.
#[derive(Default)]
struct CorpusStore {
    points: Vec<(String, Vec<ScoredPoint>)>,
    failing: Vec<String>,
    queries: Mutex<Vec<HybridQuery>>,
    upserts: Mutex<Vec<(String, Vec<UpsertPoint>)>>,
}

#[async_trait]
impl VectorStore for CorpusStore {
    async fn query(&self, query: &HybridQuery) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        self.queries.lock().push(query.clone());
        if self.failing.contains(&query.collection) {
            return Err(VectorStoreError::Transport("connection refused".into()));
        }
        Ok(self
            .points
            .iter()
            .find(|(c, _)| *c == query.collection)
            .map(|(_, p)| p.clone())
            .unwrap_or_default())
    }

    async fn upsert(&self, collection: &str, points: Vec<UpsertPoint>) -> Result<(), VectorStoreError> {
        self.upserts.lock().push((collection.to_string(), points));
        Ok(())
    }
}

struct FixedOrder(&'static str);

#[async_trait]
impl TextCompleter for FixedOrder {
    async fn complete(&self, _prompt: &str, _temperature: f32) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
    fn is_available(&self) -> bool {
        true
    }
}

fn point(id: &str, score: f32, url: &str, hash: &str, text: &str) -> ScoredPoint {
    let mut payload = Map::new();
    payload.insert("doc_content".into(), json!(text));
    payload.insert("url".into(), json!(url));
    payload.insert("title".into(), json!(format!("Title {id}")));
    payload.insert("hash".into(), json!(hash));
    ScoredPoint {
        id: id.to_string(),
        score,
        payload,
    }
}

fn java_corpus() -> CorpusStore {
    CorpusStore {
        points: vec![
            (
                "java-docs".to_string(),
                vec![
                    point("d1", 0.91, "https://docs.oracle.com/records#intro", "h-records", "Records are transparent carriers."),
                    point("d2", 0.55, "https://docs.oracle.com/sealed", "h-sealed", "Sealed classes restrict subclasses."),
                ],
            ),
            (
                "java-articles".to_string(),
                vec![
                    // Same chunk indexed twice; merged by hash.
                    point("a1", 0.70, "https://blog.example/records", "h-records", "Records are transparent carriers."),
                    point("a2", 0.62, "https://blog.example/patterns", "h-patterns", "Pattern matching for switch."),
                ],
            ),
        ],
        ..CorpusStore::default()
    }
}

fn settings(collections: &[&str], strict: bool) -> HybridSearchSettings {
    HybridSearchSettings {
        collections: collections.iter().map(|c| c.to_string()).collect(),
        prefetch_limit: 20,
        rrf_k: 60,
        query_timeout: Duration::from_secs(2),
        strict,
    }
}

fn pipeline(store: Arc<CorpusStore>, strict: bool, order: &'static str) -> RetrievalOrchestrator {
    let embedder = Arc::new(CountingEmbedder {
        calls: AtomicUsize::new(0),
    });
    let engine = Arc::new(HybridSearchEngine::new(
        store,
        Arc::new(QueryEncoder::new(embedder)),
        settings(&["java-docs", "java-articles", "java-pdfs"], strict),
    ));
    let reranker = Arc::new(Reranker::new(Arc::new(FixedOrder(order)), Duration::from_secs(2)));
    RetrievalOrchestrator::new(engine, reranker, &RagConfig::default())
}

// ─── Retrieval pipeline ──────────────────────────────────

#[tokio::test]
async fn test_version_query_filters_merges_and_reranks() {
    let store = Arc::new(java_corpus());
    let retrieval = pipeline(store.clone(), false, r#"{"order":[2,0]}"#);

    let outcome = retrieval.retrieve("How do records work in Java 21?").await.unwrap();
    let ids: Vec<&str> = outcome.documents.iter().map(|d| d.id.as_str()).collect();
    // Merged order by score: d1 (0.91), a2 (0.62), d2 (0.55); reranked [2, 0] then fill.
    assert_eq!(ids, vec!["d2", "d1", "a2"]);
    assert!(outcome.notices.is_empty());

    let queries = store.queries.lock();
    assert_eq!(queries.len(), 3);
    for q in queries.iter() {
        let filter = q.filter.as_ref().expect("version filter");
        assert_eq!(filter["must"][0]["key"], "docVersion");
        assert_eq!(filter["must"][0]["match"]["value"], "21");
        assert!(!q.sparse.is_empty());
    }

    let cited = to_citations(&outcome.documents);
    assert_eq!(cited.failed_conversion_count, 0);
    assert_eq!(cited.citations[1].anchor, "intro");
}

#[tokio::test]
async fn test_lenient_mode_reports_failed_collection() {
    let mut corpus = java_corpus();
    corpus.failing.push("java-pdfs".to_string());
    let retrieval = pipeline(Arc::new(corpus), false, r#"{"order":[0,1,2]}"#);

    let outcome = retrieval.retrieve("pattern matching").await.unwrap();
    assert_eq!(outcome.documents.len(), 3);
    assert_eq!(outcome.notices.len(), 1);
    assert!(outcome.notices[0].summary.contains("java-pdfs"));
    assert!(outcome.notices[0].details.starts_with("transport"));
}

#[tokio::test]
async fn test_strict_mode_fails_whole_search() {
    let mut corpus = java_corpus();
    corpus.failing.push("java-articles".to_string());
    let retrieval = pipeline(Arc::new(corpus), true, r#"{"order":[0]}"#);

    let err = retrieval.retrieve("sealed classes").await.unwrap_err();
    assert!(matches!(err, RetrievalError::Search(_)));
    assert!(err.to_string().contains("java-articles"));
}

#[tokio::test]
async fn test_unusable_rerank_reply_is_an_error() {
    let retrieval = pipeline(Arc::new(java_corpus()), false, "I think the first one is best.");
    let err = retrieval.retrieve("records").await.unwrap_err();
    assert!(matches!(err, RetrievalError::Rerank(_)));
}

#[tokio::test]
async fn test_empty_version_match_adds_notice() {
    let retrieval = pipeline(Arc::new(CorpusStore::default()), false, r#"{"order":[0]}"#);
    let outcome = retrieval.retrieve("virtual threads in Java 25").await.unwrap();
    assert!(outcome.documents.is_empty());
    assert!(outcome.notices.iter().any(|n| n.summary == "No documents matched Java 25"));
}

// ─── Embedding cache ─────────────────────────────────────

#[tokio::test]
async fn test_cache_persists_and_uploads_once() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder {
        calls: AtomicUsize::new(0),
    });
    let store = Arc::new(CorpusStore::default());

    let meta = EmbeddingMetadata {
        url: Some("https://docs.oracle.com/records".to_string()),
        chunk_index: Some(0),
        ..EmbeddingMetadata::default()
    };
    let items = vec![
        ("Records are transparent carriers.".to_string(), meta.clone()),
        ("Sealed classes restrict subclasses.".to_string(), meta.clone()),
    ];

    {
        let cache = EmbeddingCache::open(dir.path(), embedder.clone(), store.clone(), "java-docs").unwrap();
        let vectors = cache.get_or_compute(&items).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0][0], "Records are transparent carriers.".len() as f32);
        cache.save().unwrap();
    }

    let cache = EmbeddingCache::open(dir.path(), embedder.clone(), store.clone(), "java-docs").unwrap();
    assert_eq!(cache.len(), 2);
    cache.get_or_compute(&items).await.unwrap();
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let report = cache.upload_pending(1).await.unwrap();
    assert_eq!(report.uploaded, 2);
    assert_eq!(report.batches, 2);
    let again = cache.upload_pending(10).await.unwrap();
    assert_eq!(again.uploaded, 0);

    let upserts = store.upserts.lock();
    assert_eq!(upserts.len(), 2);
    let payload = &upserts[0].1[0].payload;
    assert_eq!(upserts[0].0, "java-docs");
    assert_eq!(payload["url"], Value::String("https://docs.oracle.com/records".into()));
    assert!(payload.contains_key("doc_content"));
    assert_eq!(cache.stats().pending, 0);
}

// ─── Rate-limit persistence ──────────────────────────────

#[test]
fn test_rate_limit_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rate-limit-state.json");

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("retry-after", reqwest::header::HeaderValue::from_static("300"));
    {
        let limiter = ProviderRateLimiter::new(Some(path.clone()));
        limiter.record_rate_limit(Provider::OpenAi, &headers).unwrap();
        assert!(!limiter.is_available(Provider::OpenAi));
    }

    let restored = ProviderRateLimiter::new(Some(path));
    let state = restored.state(Provider::OpenAi);
    assert_eq!(state.consecutive_failures, 1);
    assert_eq!(state.backoff_secs, 300);
    assert!(!restored.is_available(Provider::OpenAi));
    assert!(restored.is_available(Provider::GithubModels));
}

// ─── Streaming with failover ─────────────────────────────

struct RateLimitedThenOk;

#[async_trait]
impl ChatProvider for RateLimitedThenOk {
    async fn stream_completion(&self, provider: Provider, request: &CompletionRequest) -> Result<ChatStream, LlmError> {
        match provider {
            Provider::GithubModels => {
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert("retry-after", reqwest::header::HeaderValue::from_static("60"));
                Err(LlmError::Http {
                    status: 429,
                    message: "rate limited".into(),
                    headers,
                })
            }
            Provider::OpenAi => {
                assert_eq!(request.model, "gpt-5.2");
                let chunks: Vec<Result<String, LlmError>> = vec![Ok("Use ".into()), Ok("records.".into())];
                Ok(Box::pin(futures_util::stream::iter(chunks)))
            }
        }
    }

    async fn complete(&self, _provider: Provider, _request: &CompletionRequest) -> Result<String, LlmError> {
        Err(LlmError::Unavailable)
    }
}

#[tokio::test]
async fn test_rate_limited_primary_fails_over_and_backs_off() {
    let config = LlmConfig {
        github_token: Some("gh".into()),
        openai_api_key: Some("sk".into()),
        ..LlmConfig::default()
    };
    let limiter = Arc::new(ProviderRateLimiter::in_memory());
    let router = Arc::new(ProviderRouter::new(&config, limiter.clone()));
    let orchestrator = StreamingOrchestrator::new(router.clone(), Arc::new(RateLimitedThenOk), StreamConfig::default());

    let events: Vec<StreamEvent> = orchestrator
        .stream(StreamRequest {
            prompt: StructuredPrompt::new("system", "question"),
            temperature: 0.2,
            preamble: Vec::new(),
            trailer: Vec::new(),
            on_complete: None,
        })
        .collect()
        .await;

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Use records.");
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error(_))));

    assert_eq!(limiter.state(Provider::GithubModels).consecutive_failures, 1);
    assert_eq!(router.candidates(), vec![Provider::OpenAi]);
}

// ─── Reranking through the HTTP gateway ──────────────────

async fn spawn_stub(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_rerank_via_gateway_falls_back_to_openai() {
    use axum::http::StatusCode;
    use axum::routing::post;

    let app = axum::Router::new()
        .route(
            "/github/chat/completions",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "upstream overloaded") }),
        )
        .route(
            "/openai/chat/completions",
            post(|| async {
                axum::Json(json!({
                    "choices": [{ "message": { "content": "```json\n{\"order\":[1,0]}\n```" } }]
                }))
            }),
        );
    let base = spawn_stub(app).await;

    let config = LlmConfig {
        github_token: Some("gh".into()),
        openai_api_key: Some("sk".into()),
        github_models_base_url: format!("{base}/github"),
        openai_base_url: format!("{base}/openai"),
        ..LlmConfig::default()
    };
    let router = Arc::new(ProviderRouter::new(&config, Arc::new(ProviderRateLimiter::in_memory())));
    let client = Arc::new(OpenAiCompatibleClient::new(reqwest::Client::new(), config));
    let gateway = Arc::new(LlmGateway::new(router.clone(), client));

    let store = Arc::new(CorpusStore {
        points: vec![(
            "java-docs".to_string(),
            vec![
                point("first", 0.9, "https://docs.oracle.com/a", "h-a", "Alpha"),
                point("second", 0.4, "https://docs.oracle.com/b", "h-b", "Beta"),
            ],
        )],
        ..CorpusStore::default()
    });
    let engine = Arc::new(HybridSearchEngine::new(
        store,
        Arc::new(QueryEncoder::new(Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        }))),
        settings(&["java-docs"], false),
    ));
    let retrieval = RetrievalOrchestrator::new(
        engine,
        Arc::new(Reranker::new(gateway, Duration::from_secs(5))),
        &RagConfig::default(),
    );

    let outcome = retrieval.retrieve("streams api").await.unwrap();
    let ids: Vec<&str> = outcome.documents.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["second", "first"]);
    assert!(router.is_primary_backed_off());
}
