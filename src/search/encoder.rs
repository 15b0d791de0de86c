use std::sync::Arc;

use crate::llm::embeddings::{EmbeddingClient, EmbeddingServiceUnavailable};
use crate::search::sparse::{SparseEncoder, SparseVector};

/// Both representations of one query, computed once per search.
#[derive(Debug, Clone)]
pub struct EncodedQuery {
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
}

pub struct QueryEncoder {
    embedder: Arc<dyn EmbeddingClient>,
    sparse: SparseEncoder,
}

impl QueryEncoder {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            embedder,
            sparse: SparseEncoder::new(),
        }
    }

    pub fn sparse_encoder(&self) -> &SparseEncoder {
        &self.sparse
    }

    pub async fn encode(&self, query: &str) -> Result<EncodedQuery, EmbeddingServiceUnavailable> {
        let dense = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                EmbeddingServiceUnavailable::new(
                    format!("{} embedding provider returned no vector for query", self.embedder.name()),
                    None,
                )
            })?;

        Ok(EncodedQuery {
            dense,
            sparse: self.sparse.encode(query),
        })
    }
}
