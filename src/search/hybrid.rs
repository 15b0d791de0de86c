use futures_util::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::QdrantConfig;
use crate::llm::embeddings::EmbeddingServiceUnavailable;
use crate::models::{CandidateDocument, RetrievalNotice};
use crate::search::constraint::RetrievalConstraint;
use crate::search::encoder::{EncodedQuery, QueryEncoder};
use crate::search::qdrant::{HybridQuery, ScoredPoint, VectorStore};
use crate::text::single_line;

/// Failure details are flattened and cut to this length.
const MAX_FAILURE_DETAIL_CHARS: usize = 240;

/// Payload fields copied onto documents as strings.
const STRING_PAYLOAD_FIELDS: &[&str] = &[
    "url",
    "title",
    "hash",
    "package",
    "docSet",
    "docPath",
    "docType",
    "docVersion",
    "sourceName",
    "sourceKind",
    "filePath",
    "language",
    "repoUrl",
    "repoOwner",
    "repoName",
    "repoBranch",
    "retrievalSource",
];

/// Payload fields copied onto documents as integers.
const INTEGER_PAYLOAD_FIELDS: &[&str] = &["chunkIndex", "pageStart", "pageEnd"];

/// Payload field holding the chunk text.
const CONTENT_FIELD: &str = "doc_content";

// ─── Errors ──────────────────────────────────────────────

/// One collection that did not answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionFailure {
    pub collection: String,
    /// Short classification: `timeout`, `http`, `transport`, `decode`.
    pub failure_type: String,
    pub details: String,
    pub elapsed: Duration,
}

/// Raised in strict mode; lists every collection that failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Hybrid search failed in {} collection(s): {}", .failures.len(), failed_names(.failures))]
pub struct HybridSearchPartialFailure {
    pub failures: Vec<CollectionFailure>,
}

fn failed_names(failures: &[CollectionFailure]) -> String {
    failures
        .iter()
        .map(|f| f.collection.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    PartialFailure(#[from] HybridSearchPartialFailure),
    #[error("Query encoding failed: {0}")]
    Encoding(#[from] EmbeddingServiceUnavailable),
}

// ─── Results ─────────────────────────────────────────────

/// Fused documents plus non-fatal per-collection notices (lenient mode).
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub documents: Vec<CandidateDocument>,
    pub notices: Vec<RetrievalNotice>,
}

#[derive(Debug, Clone)]
pub struct HybridSearchSettings {
    pub collections: Vec<String>,
    pub prefetch_limit: usize,
    pub rrf_k: u32,
    pub query_timeout: Duration,
    /// Abort on any collection failure instead of reporting notices.
    pub strict: bool,
}

impl From<&QdrantConfig> for HybridSearchSettings {
    fn from(cfg: &QdrantConfig) -> Self {
        Self {
            collections: cfg.collections.clone(),
            prefetch_limit: cfg.prefetch_limit,
            rrf_k: cfg.rrf_k,
            query_timeout: cfg.query_timeout(),
            strict: cfg.fail_on_partial_search_error,
        }
    }
}

/// Fused dense + sparse search across every configured collection.
///
/// Pipeline:
/// 1. Encode the query once (dense embedding + sparse term vector).
/// 2. Query each collection concurrently with its own timeout; both legs share
///    the constraint filter and RRF fusion happens in the store.
/// 3. Merge by content hash (point id when no hash), keeping the best score.
/// 4. Stable sort by score descending and cut to `limit`.
pub struct HybridSearchEngine {
    store: Arc<dyn VectorStore>,
    encoder: Arc<QueryEncoder>,
    settings: HybridSearchSettings,
}

impl HybridSearchEngine {
    pub fn new(store: Arc<dyn VectorStore>, encoder: Arc<QueryEncoder>, settings: HybridSearchSettings) -> Self {
        Self {
            store,
            encoder,
            settings,
        }
    }

    pub fn settings(&self) -> &HybridSearchSettings {
        &self.settings
    }

    /// Prefetch is always wider than the final limit so fusion has room to reorder.
    fn effective_prefetch(&self, limit: usize) -> usize {
        self.settings.prefetch_limit.max(limit.saturating_mul(2))
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        constraint: &RetrievalConstraint,
    ) -> Result<SearchOutcome, SearchError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(SearchOutcome::default());
        }

        let encoded = self.encoder.encode(query).await?;
        let filter = constraint.to_filter();
        if filter.is_some() {
            tracing::debug!("[QDRANT] applying constraint filter {:?}", constraint.fields());
        }

        let futures = self.settings.collections.iter().map(|collection| {
            let hybrid = self.build_query(collection, &encoded, filter.clone(), limit);
            self.query_collection(hybrid)
        });
        let results = join_all(futures).await;

        let mut per_collection: Vec<(String, Vec<ScoredPoint>)> = Vec::new();
        let mut failures: Vec<CollectionFailure> = Vec::new();
        for (collection, result) in self.settings.collections.iter().zip(results) {
            match result {
                Ok(points) => per_collection.push((collection.clone(), points)),
                Err(failure) => {
                    tracing::warn!(
                        "[QDRANT] collection {} failed after {}ms ({}): {}",
                        failure.collection,
                        failure.elapsed.as_millis(),
                        failure.failure_type,
                        failure.details
                    );
                    failures.push(failure);
                }
            }
        }

        if self.settings.strict && !failures.is_empty() {
            return Err(HybridSearchPartialFailure { failures }.into());
        }

        let documents = merge_points(per_collection, limit);
        let notices = failures.iter().map(failure_notice).collect();
        Ok(SearchOutcome { documents, notices })
    }

    fn build_query(
        &self,
        collection: &str,
        encoded: &EncodedQuery,
        filter: Option<Value>,
        limit: usize,
    ) -> HybridQuery {
        HybridQuery {
            collection: collection.to_string(),
            dense: encoded.dense.clone(),
            sparse: encoded.sparse.clone(),
            filter,
            prefetch_limit: self.effective_prefetch(limit),
            limit,
            rrf_k: self.settings.rrf_k,
        }
    }

    async fn query_collection(&self, hybrid: HybridQuery) -> Result<Vec<ScoredPoint>, CollectionFailure> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.settings.query_timeout, self.store.query(&hybrid)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(points)) => {
                tracing::debug!(
                    "[QDRANT] {} returned {} points in {}ms",
                    hybrid.collection,
                    points.len(),
                    elapsed.as_millis()
                );
                Ok(points)
            }
            Ok(Err(e)) => Err(CollectionFailure {
                collection: hybrid.collection,
                failure_type: e.kind().to_string(),
                details: single_line(&e.to_string(), MAX_FAILURE_DETAIL_CHARS),
                elapsed,
            }),
            Err(_) => Err(CollectionFailure {
                collection: hybrid.collection,
                failure_type: "timeout".to_string(),
                details: format!("no response within {}ms", self.settings.query_timeout.as_millis()),
                elapsed,
            }),
        }
    }
}

pub fn failure_notice(failure: &CollectionFailure) -> RetrievalNotice {
    RetrievalNotice {
        summary: format!("Partial retrieval failure in collection {}", failure.collection),
        details: format!("{}: {}", failure.failure_type, failure.details),
    }
}

/// Turn a scored point into a document, keeping only recognised payload fields.
pub fn point_to_document(point: &ScoredPoint, collection: &str) -> CandidateDocument {
    let payload = &point.payload;
    let text = payload
        .get(CONTENT_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut metadata = Map::new();
    for key in STRING_PAYLOAD_FIELDS {
        if let Some(Value::String(v)) = payload.get(*key) {
            metadata.insert((*key).to_string(), Value::String(v.clone()));
        }
    }
    for key in INTEGER_PAYLOAD_FIELDS {
        if let Some(n) = payload.get(*key).and_then(Value::as_i64) {
            metadata.insert((*key).to_string(), Value::from(n));
        }
    }
    metadata.insert("score".to_string(), Value::from(point.score as f64));
    metadata.insert("collection".to_string(), Value::String(collection.to_string()));

    CandidateDocument {
        id: point.id.clone(),
        text,
        metadata,
    }
}

/// Cross-collection merge: one document per hash (or point id), best score wins,
/// first-seen position is kept so equal scores stay in input order.
fn merge_points(per_collection: Vec<(String, Vec<ScoredPoint>)>, limit: usize) -> Vec<CandidateDocument> {
    let mut merged: Vec<CandidateDocument> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for (collection, points) in &per_collection {
        for point in points {
            let doc = point_to_document(point, collection);
            let key = doc.hash().map(str::to_string).unwrap_or_else(|| format!("id:{}", doc.id));
            match position.get(&key) {
                Some(&idx) => {
                    if doc.score() > merged[idx].score() {
                        merged[idx] = doc;
                    }
                }
                None => {
                    position.insert(key, merged.len());
                    merged.push(doc);
                }
            }
        }
    }

    // sort_by is stable
    merged.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);
    merged
}
