//! Vector store access: the [`VectorStore`] seam and its Qdrant REST implementation.
//!
//! A hybrid query is one `points/query` call per collection with two prefetch
//! legs (dense + sparse) fused server-side by Reciprocal Rank Fusion. The same
//! filter is attached to both legs and to the fused query.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::search::sparse::SparseVector;
use crate::text::single_line;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub collection: String,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub filter: Option<Value>,
    pub prefetch_limit: usize,
    pub limit: usize,
    pub rrf_k: u32,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct UpsertPoint {
    pub id: Uuid,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub payload: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Decode(String),
}

impl VectorStoreError {
    /// Short label used in failure notices.
    pub fn kind(&self) -> &'static str {
        match self {
            VectorStoreError::Http { .. } => "http",
            VectorStoreError::Transport(_) => "transport",
            VectorStoreError::Decode(_) => "decode",
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(&self, query: &HybridQuery) -> Result<Vec<ScoredPoint>, VectorStoreError>;

    async fn upsert(&self, collection: &str, points: Vec<UpsertPoint>) -> Result<(), VectorStoreError>;
}

/// Request body for a fused dense + sparse query.
///
/// The sparse leg is left out when the query produced no terms.
pub fn build_query_body(query: &HybridQuery, dense_name: &str, sparse_name: &str) -> Value {
    let mut dense_leg = json!({
        "query": query.dense,
        "using": dense_name,
        "limit": query.prefetch_limit,
    });
    let mut prefetch = Vec::with_capacity(2);
    if let Some(filter) = &query.filter {
        dense_leg["filter"] = filter.clone();
    }
    prefetch.push(dense_leg);

    if !query.sparse.is_empty() {
        let mut sparse_leg = json!({
            "query": {
                "indices": query.sparse.indices,
                "values": query.sparse.values,
            },
            "using": sparse_name,
            "limit": query.prefetch_limit,
        });
        if let Some(filter) = &query.filter {
            sparse_leg["filter"] = filter.clone();
        }
        prefetch.push(sparse_leg);
    }

    let mut body = json!({
        "prefetch": prefetch,
        "query": { "rrf": { "k": query.rrf_k } },
        "limit": query.limit,
        "with_payload": true,
    });
    if let Some(filter) = &query.filter {
        body["filter"] = filter.clone();
    }
    body
}

/// Point ids may be unsigned integers or UUID strings.
fn point_id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Qdrant REST ─────────────────────────────────────────

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    points: Vec<RawPoint>,
}

#[derive(Deserialize)]
struct RawPoint {
    id: Value,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

pub struct QdrantRestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    dense_name: String,
    sparse_name: String,
}

impl QdrantRestStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        dense_name: &str,
        sparse_name: &str,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            dense_name: dense_name.to_string(),
            sparse_name: sparse_name.to_string(),
        }
    }

    fn with_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, VectorStoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(VectorStoreError::Http {
            status: status.as_u16(),
            body: single_line(&body, MAX_ERROR_BODY_CHARS),
        })
    }
}

#[async_trait]
impl VectorStore for QdrantRestStore {
    async fn query(&self, query: &HybridQuery) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let url = format!("{}/collections/{}/points/query", self.base_url, query.collection);
        let body = build_query_body(query, &self.dense_name, &self.sparse_name);

        let resp = self
            .with_key(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorStoreError::Transport(e.to_string()))?;
        let resp = Self::check(resp).await?;

        let parsed: QueryResponse = resp
            .json()
            .await
            .map_err(|e| VectorStoreError::Decode(format!("Failed to parse query response: {e}")))?;

        Ok(parsed
            .result
            .points
            .into_iter()
            .map(|p| ScoredPoint {
                id: point_id_to_string(&p.id),
                score: p.score,
                payload: p.payload.unwrap_or_default(),
            })
            .collect())
    }

    async fn upsert(&self, collection: &str, points: Vec<UpsertPoint>) -> Result<(), VectorStoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let url = format!("{}/collections/{collection}/points?wait=true", self.base_url);
        let count = points.len();

        let points: Vec<Value> = points
            .into_iter()
            .map(|p| {
                let mut vector = Map::new();
                vector.insert(self.dense_name.clone(), json!(p.dense));
                if !p.sparse.is_empty() {
                    vector.insert(
                        self.sparse_name.clone(),
                        json!({ "indices": p.sparse.indices, "values": p.sparse.values }),
                    );
                }
                json!({ "id": p.id.to_string(), "vector": vector, "payload": p.payload })
            })
            .collect();

        let resp = self
            .with_key(self.client.put(&url))
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(|e| VectorStoreError::Transport(e.to_string()))?;
        Self::check(resp).await?;

        tracing::debug!("[QDRANT] upserted {count} points into {collection}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(filter: Option<Value>, sparse: SparseVector) -> HybridQuery {
        HybridQuery {
            collection: "java-docs".into(),
            dense: vec![0.1, 0.2],
            sparse,
            filter,
            prefetch_limit: 20,
            limit: 5,
            rrf_k: 60,
        }
    }

    #[test]
    fn test_body_has_rrf_and_two_legs() {
        let sparse = SparseVector { indices: vec![3, 9], values: vec![1.0, 2.0] };
        let body = build_query_body(&query(None, sparse), "dense", "bm25");
        assert_eq!(body["query"]["rrf"]["k"], 60);
        assert_eq!(body["limit"], 5);
        let legs = body["prefetch"].as_array().unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0]["using"], "dense");
        assert_eq!(legs[1]["using"], "bm25");
        assert_eq!(legs[1]["query"]["indices"], json!([3, 9]));
        assert!(body.get("filter").is_none());
        assert!(legs.iter().all(|l| l.get("filter").is_none()));
    }

    #[test]
    fn test_filter_attached_to_every_leg() {
        let filter = json!({"must":[{"key":"docVersion","match":{"value":"21"}}]});
        let sparse = SparseVector { indices: vec![1], values: vec![1.0] };
        let body = build_query_body(&query(Some(filter.clone()), sparse), "dense", "bm25");
        assert_eq!(body["filter"], filter);
        for leg in body["prefetch"].as_array().unwrap() {
            assert_eq!(leg["filter"], filter);
        }
    }

    #[test]
    fn test_empty_sparse_leg_omitted() {
        let body = build_query_body(&query(None, SparseVector::default()), "dense", "bm25");
        assert_eq!(body["prefetch"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_point_id_forms() {
        assert_eq!(point_id_to_string(&json!(42)), "42");
        assert_eq!(point_id_to_string(&json!("abc")), "abc");
    }
}
