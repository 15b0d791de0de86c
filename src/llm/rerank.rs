use async_trait::async_trait;
use moka::sync::Cache;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::models::CandidateDocument;
use crate::text::{snippet, truncate_chars};

/// Characters of each document shown to the judge.
const DOC_PREVIEW_CHARS: usize = 500;
const RERANK_TEMPERATURE: f32 = 0.0;
const CACHE_CAPACITY: u64 = 512;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// One-shot, non-streaming completion used for judgment calls.
#[async_trait]
pub trait TextCompleter: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32) -> anyhow::Result<String>;

    /// Whether any backend could take a call right now.
    fn is_available(&self) -> bool;
}

/// Reranking could not produce an ordering. Never downgraded to "keep original order".
#[derive(Debug, Clone, thiserror::Error)]
#[error("Reranking failed: {message}")]
pub struct RerankingFailure {
    pub message: String,
}

impl RerankingFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct OrderResponse {
    order: Vec<Value>,
}

/// LLM judgment reranker.
///
/// The model sees each candidate as `[i] title | url` plus a short preview and
/// answers `{"order":[...]}` with 0-based indices, most relevant first.
/// Orderings are cached per (query, candidate set, return count).
pub struct Reranker {
    completer: Arc<dyn TextCompleter>,
    timeout: Duration,
    cache: Cache<String, Vec<usize>>,
}

impl Reranker {
    pub fn new(completer: Arc<dyn TextCompleter>, timeout: Duration) -> Self {
        Self {
            completer,
            timeout,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    pub async fn rerank(
        &self,
        query: &str,
        docs: Vec<CandidateDocument>,
        return_k: usize,
    ) -> Result<Vec<CandidateDocument>, RerankingFailure> {
        if docs.len() <= 1 {
            return Ok(docs);
        }

        let key = cache_key(query, &docs, return_k);
        if let Some(order) = self.cache.get(&key) {
            tracing::debug!("[RERANK] cache hit for {} candidates", docs.len());
            return Ok(apply_order(docs, &order, return_k));
        }

        if !self.completer.is_available() {
            return Err(RerankingFailure::new("no LLM provider is available for reranking"));
        }

        let prompt = build_prompt(query, &docs, return_k);
        let response = tokio::time::timeout(self.timeout, self.completer.complete(&prompt, RERANK_TEMPERATURE))
            .await
            .map_err(|_| RerankingFailure::new(format!("reranker timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| RerankingFailure::new(format!("reranker call failed: {e:#}")))?;

        if response.trim().is_empty() {
            return Err(RerankingFailure::new("reranker returned an empty response"));
        }

        let order = parse_order(&response, docs.len())?;
        tracing::debug!("[RERANK] model ordering {:?}", order);
        self.cache.insert(key, order.clone());
        Ok(apply_order(docs, &order, return_k))
    }
}

fn cache_key(query: &str, docs: &[CandidateDocument], return_k: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(query.as_bytes());
    hasher.update(&(return_k as u64).to_le_bytes());
    for doc in docs {
        hasher.update(b"\0");
        hasher.update(doc.hash().unwrap_or(&doc.id).as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn build_prompt(query: &str, docs: &[CandidateDocument], return_k: usize) -> String {
    let mut prompt = format!(
        "Rank the documents below by how well they answer the question.\n\
         Question: {query}\n\n\
         Return ONLY a JSON object of the form {{\"order\": [indices]}} listing the {return_k} most relevant \
         document indices (0-based), most relevant first.\n\n"
    );
    for (i, doc) in docs.iter().enumerate() {
        prompt.push_str(&format!(
            "[{i}] {} | {}\n{}\n\n",
            doc.title().unwrap_or("Untitled"),
            doc.url().unwrap_or("-"),
            snippet(doc.text.trim(), DOC_PREVIEW_CHARS)
        ));
    }
    prompt
}

/// Body of the first fenced code block, or the whole text.
fn strip_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip an optional language tag on the fence line.
    let body = match after.find('\n') {
        Some(nl) if !after[..nl].contains('{') => &after[nl + 1..],
        _ => after,
    };
    match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    }
}

/// First balanced `{...}` object, skipping braces inside string literals.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Valid, de-duplicated indices in model order.
fn parse_order(response: &str, candidate_count: usize) -> Result<Vec<usize>, RerankingFailure> {
    let body = strip_fence(response);
    let json = first_json_object(body).ok_or_else(|| {
        RerankingFailure::new(format!(
            "reranker response has no JSON object: {}",
            truncate_chars(response.trim(), 120)
        ))
    })?;
    let parsed: OrderResponse = serde_json::from_str(json)
        .map_err(|e| RerankingFailure::new(format!("reranker JSON is malformed: {e}")))?;

    let mut seen = HashSet::new();
    let order: Vec<usize> = parsed
        .order
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|idx| *idx < candidate_count && seen.insert(*idx))
        .collect();

    if order.is_empty() {
        return Err(RerankingFailure::new("reranker returned no usable indices"));
    }
    Ok(order)
}

/// Ranked documents first, then any the model left out (in original order), cut to `return_k`.
fn apply_order(docs: Vec<CandidateDocument>, order: &[usize], return_k: usize) -> Vec<CandidateDocument> {
    let mut slots: Vec<Option<CandidateDocument>> = docs.into_iter().map(Some).collect();
    let mut ranked = Vec::with_capacity(return_k.min(slots.len()));
    for &idx in order {
        if let Some(doc) = slots.get_mut(idx).and_then(Option::take) {
            ranked.push(doc);
        }
    }
    ranked.extend(slots.into_iter().flatten());
    ranked.truncate(return_k);
    ranked
}
