use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A retrieved document chunk.
///
/// Built once by the search engine and passed by value through reranking and
/// citation conversion. `metadata` always mirrors the store payload fields that
/// were recognised, plus `score` and `collection`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CandidateDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Map::new(),
        }
    }

    /// Builder-style metadata insert (used by tests and fixtures).
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Metadata value as a non-blank string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn url(&self) -> Option<&str> {
        self.meta_str("url")
    }

    pub fn title(&self) -> Option<&str> {
        self.meta_str("title")
    }

    pub fn hash(&self) -> Option<&str> {
        self.meta_str("hash")
    }

    pub fn score(&self) -> f32 {
        self.metadata
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32
    }
}

/// Source reference returned to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub anchor: String,
    pub snippet: String,
}

/// Non-fatal degradation surfaced next to results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalNotice {
    pub summary: String,
    pub details: String,
}

/// Ranked documents plus the notices collected along the way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalOutcome {
    pub documents: Vec<CandidateDocument>,
    pub notices: Vec<RetrievalNotice>,
}

/// Citations plus the number of documents that could not be converted.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationOutcome {
    pub citations: Vec<Citation>,
    pub failed_conversion_count: usize,
}

/// Search request
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// Search response
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<CandidateDocument>,
    pub notices: Vec<RetrievalNotice>,
}

/// Chat request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single chat turn (user or assistant)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}
