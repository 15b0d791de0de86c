use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::models::{SearchRequest, SearchResponse};
use crate::search::constraint::{boost_query_for_version, extract_version, RetrievalConstraint};
use crate::search::hybrid::SearchError;
use crate::state::AppState;

const MAX_LIMIT: usize = 50;

pub fn search_error_status(err: &SearchError) -> StatusCode {
    match err {
        SearchError::PartialFailure(_) => StatusCode::BAD_GATEWAY,
        SearchError::Encoding(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// POST /api/search - Hybrid search without reranking:
///   1. Version constraint from the query ("Java 21" → docVersion filter)
///   2. Dense + sparse query per collection, fused server-side with RRF
///   3. Cross-collection dedupe, score order
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    let query = req.query.trim().to_string();
    if query.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query is required".to_string()));
    }
    let limit = req.limit.clamp(1, MAX_LIMIT);

    let (constraint, search_query) = match extract_version(&query) {
        Some(v) => (RetrievalConstraint::for_version(v.as_str()), boost_query_for_version(&query, &v)),
        None => (RetrievalConstraint::none(), query.clone()),
    };

    let outcome = state
        .search
        .search(&search_query, limit, &constraint)
        .await
        .map_err(|e| {
            tracing::warn!("Search failed: {e}");
            (search_error_status(&e), e.to_string())
        })?;

    tracing::info!("Search '{}' returned {} documents", query, outcome.documents.len());
    Ok(Json(SearchResponse {
        query,
        results: outcome.documents,
        notices: outcome.notices,
    }))
}
