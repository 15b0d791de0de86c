use axum::routing::{get, post};
use axum::Router;
use tracing_subscriber::EnvFilter;

use doc_chat::api;
use doc_chat::config::Config;
use doc_chat::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!(
        "Qdrant: {} ({} collections)",
        config.qdrant.url,
        config.qdrant.collections.len()
    );
    tracing::info!("Primary LLM provider: {}", config.llm.primary_provider);

    let state = AppState::new(config.clone())?;
    let providers: Vec<&str> = state.router.configured().iter().map(|p| p.id()).collect();
    tracing::info!("Configured LLM providers: {:?}", providers);

    let app = Router::new()
        .route("/api/chat/stream", post(api::chat::stream_chat))
        .route("/api/chat/citations", get(api::chat::citations))
        .route("/api/chat/diagnostics/retrieval", get(api::chat::retrieval_diagnostics))
        .route("/api/chat/export/last", get(api::chat::export_last))
        .route("/api/chat/clear", post(api::chat::clear_session))
        .route("/api/search", post(api::search::search))
        .route("/api/embeddings/cache/stats", get(api::embeddings::cache_stats))
        .route("/api/embeddings/cache/upload", post(api::embeddings::upload))
        .route("/api/embeddings/cache/snapshot", post(api::embeddings::snapshot))
        .route("/api/embeddings/cache/export", post(api::embeddings::export))
        .route("/api/embeddings/cache/import", post(api::embeddings::import))
        .route("/api/embeddings/health", get(api::embeddings::health))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = state.cache.save() {
        tracing::warn!("[CACHE] final save failed: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
