use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{CacheStats, EmbeddingCache, EmbeddingCacheError, UploadReport};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    pub batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct FileParams {
    pub filename: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub path: String,
    pub entries: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingsHealth {
    pub provider: &'static str,
    pub dimensions: usize,
    pub alive: bool,
    pub cached_embeddings: usize,
}

fn cache_error(err: EmbeddingCacheError) -> (StatusCode, String) {
    let status = match &err {
        EmbeddingCacheError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
        EmbeddingCacheError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND
        }
        EmbeddingCacheError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        EmbeddingCacheError::Format { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EmbeddingCacheError::Upload { .. } => StatusCode::BAD_GATEWAY,
        EmbeddingCacheError::Embedding(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    tracing::warn!("[CACHE] request failed: {err}");
    (status, err.to_string())
}

/// Run a blocking cache file operation off the async runtime.
async fn blocking<T, F>(cache: Arc<EmbeddingCache>, op: F) -> Result<T, (StatusCode, String)>
where
    T: Send + 'static,
    F: FnOnce(&EmbeddingCache) -> Result<T, EmbeddingCacheError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&cache))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Cache task failed: {e}")))?
        .map_err(cache_error)
}

/// GET /api/embeddings/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

/// POST /api/embeddings/cache/upload?batchSize=
pub async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
) -> Result<Json<UploadReport>, (StatusCode, String)> {
    let batch_size = params
        .batch_size
        .unwrap_or(state.config.embedding.upload_batch_size)
        .clamp(1, 1000);
    let report = state.cache.upload_pending(batch_size).await.map_err(cache_error)?;
    Ok(Json(report))
}

/// POST /api/embeddings/cache/snapshot
pub async fn snapshot(State(state): State<AppState>) -> Result<Json<FileResponse>, (StatusCode, String)> {
    let entries = state.cache.len();
    let path = blocking(state.cache.clone(), |cache| cache.save_snapshot()).await?;
    Ok(Json(FileResponse {
        path: path.display().to_string(),
        entries,
    }))
}

/// POST /api/embeddings/cache/export?filename=
pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<FileParams>,
) -> Result<Json<FileResponse>, (StatusCode, String)> {
    let entries = state.cache.len();
    let path = blocking(state.cache.clone(), move |cache| cache.export(&params.filename)).await?;
    Ok(Json(FileResponse {
        path: path.display().to_string(),
        entries,
    }))
}

/// POST /api/embeddings/cache/import?filename=
pub async fn import(
    State(state): State<AppState>,
    Query(params): Query<FileParams>,
) -> Result<Json<FileResponse>, (StatusCode, String)> {
    let filename = params.filename.clone();
    let entries = blocking(state.cache.clone(), move |cache| cache.import(&params.filename)).await?;
    Ok(Json(FileResponse {
        path: state.cache.dir().join(filename.trim()).display().to_string(),
        entries,
    }))
}

/// GET /api/embeddings/health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<EmbeddingsHealth>) {
    let alive = state.embedder.is_alive().await;
    let body = EmbeddingsHealth {
        provider: state.embedder.name(),
        dimensions: state.embedder.dimensions(),
        alive,
        cached_embeddings: state.cache.len(),
    };
    let status = if alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
