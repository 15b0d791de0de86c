use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::text::single_line;

/// Upstream error bodies are cut to this many characters in messages.
const MAX_ERROR_BODY_CHARS: usize = 512;
const REMOTE_MAX_ATTEMPTS: u32 = 4;
const REMOTE_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const REMOTE_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// The embedding backend could not produce valid vectors.
///
/// `status` carries the HTTP status when the failure came from a response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EmbeddingServiceUnavailable {
    pub message: String,
    pub status: Option<u16>,
}

impl EmbeddingServiceUnavailable {
    pub fn new(message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }
}

/// "Embed a list of strings into a list of vectors", one vector per input, in order.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceUnavailable>;

    /// Expected vector length.
    fn dimensions(&self) -> usize;

    fn name(&self) -> &'static str;

    /// Cheap liveness check.
    async fn is_alive(&self) -> bool {
        true
    }
}

/// Build the configured provider.
pub fn from_config(client: reqwest::Client, config: &EmbeddingConfig) -> Arc<dyn EmbeddingClient> {
    match config.provider {
        EmbeddingProviderKind::Local => Arc::new(LocalEmbeddingClient::new(client, config)),
        EmbeddingProviderKind::Remote => Arc::new(RemoteEmbeddingClient::new(client, config)),
    }
}

// ─── Wire types ──────────────────────────────────────────

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
    index: Option<usize>,
}

/// Put response vectors back into request order and validate their size.
///
/// Entries without an `index` are taken positionally.
fn reassemble(
    provider: &str,
    data: Vec<EmbedData>,
    expected_count: usize,
    dimensions: usize,
    status: u16,
) -> Result<Vec<Vec<f32>>, EmbeddingServiceUnavailable> {
    if data.len() != expected_count {
        return Err(EmbeddingServiceUnavailable::new(
            format!(
                "{provider} returned {} embeddings for {expected_count} inputs (HTTP {status})",
                data.len()
            ),
            Some(status),
        ));
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected_count];
    for (pos, item) in data.into_iter().enumerate() {
        let idx = item.index.unwrap_or(pos);
        if idx >= expected_count {
            return Err(EmbeddingServiceUnavailable::new(
                format!("{provider} returned out-of-range embedding index {idx} for {expected_count} inputs (HTTP {status})"),
                Some(status),
            ));
        }
        if item.embedding.len() != dimensions {
            let received = item.embedding.len();
            let delta = received as i64 - dimensions as i64;
            return Err(EmbeddingServiceUnavailable::new(
                format!(
                    "{provider} embedding dimension mismatch at index {idx}: expected {dimensions}, received {received} (HTTP {status}, delta {delta:+})"
                ),
                Some(status),
            ));
        }
        if slots[idx].is_some() {
            return Err(EmbeddingServiceUnavailable::new(
                format!("{provider} returned duplicate embedding index {idx} (HTTP {status})"),
                Some(status),
            ));
        }
        slots[idx] = Some(item.embedding);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.ok_or_else(|| {
                EmbeddingServiceUnavailable::new(
                    format!("{provider} response is missing embedding index {idx} (HTTP {status})"),
                    Some(status),
                )
            })
        })
        .collect()
}

// ─── Local (OpenAI-compatible server on the LAN) ─────────

pub struct LocalEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl LocalEmbeddingClient {
    pub fn new(client: reqwest::Client, config: &EmbeddingConfig) -> Self {
        Self {
            client,
            base_url: config.local_base_url.trim_end_matches('/').to_string(),
            model: config.local_model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size.max(1),
        }
    }

    async fn embed_chunk(&self, chunk: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceUnavailable> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input: chunk,
            })
            .send()
            .await
            .map_err(|e| {
                EmbeddingServiceUnavailable::new(format!("Local embedding server unreachable: {e}"), None)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingServiceUnavailable::new(
                format!(
                    "Local embedding server returned HTTP {}: {}",
                    status.as_u16(),
                    single_line(&body, MAX_ERROR_BODY_CHARS)
                ),
                Some(status.as_u16()),
            ));
        }

        let body: EmbedResponse = resp.json().await.map_err(|e| {
            EmbeddingServiceUnavailable::new(
                format!("Failed to parse local embedding response (HTTP {}): {e}", status.as_u16()),
                Some(status.as_u16()),
            )
        })?;

        reassemble("Local embedding server", body.data, chunk.len(), self.dimensions, status.as_u16())
    }
}

#[async_trait]
impl EmbeddingClient for LocalEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceUnavailable> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            all.extend(self.embed_chunk(chunk).await?);
        }
        tracing::debug!("[EMBEDDING] local embedded {} texts", all.len());
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "local"
    }

    async fn is_alive(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("[EMBEDDING] liveness check failed: {e}");
                false
            }
        }
    }
}

// ─── Remote (API key) ────────────────────────────────────

pub struct RemoteEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

fn is_retryable_status(code: u16) -> bool {
    matches!(code, 408 | 409 | 425 | 429) || (500..600).contains(&code)
}

impl RemoteEmbeddingClient {
    pub fn new(client: reqwest::Client, config: &EmbeddingConfig) -> Self {
        Self {
            client,
            base_url: config.remote_base_url.trim_end_matches('/').to_string(),
            api_key: config.remote_api_key.clone(),
            model: config.remote_model.clone(),
            dimensions: config.dimensions,
        }
    }

    async fn attempt(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, (EmbeddingServiceUnavailable, bool)> {
        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(&url).json(&EmbedRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            (
                EmbeddingServiceUnavailable::new(format!("Remote embedding API unreachable: {e}"), None),
                true,
            )
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let code = status.as_u16();
            return Err((
                EmbeddingServiceUnavailable::new(
                    format!(
                        "Remote embedding API returned HTTP {code}: {}",
                        single_line(&body, MAX_ERROR_BODY_CHARS)
                    ),
                    Some(code),
                ),
                is_retryable_status(code),
            ));
        }

        let body: EmbedResponse = resp.json().await.map_err(|e| {
            (
                EmbeddingServiceUnavailable::new(
                    format!("Failed to parse remote embedding response (HTTP {}): {e}", status.as_u16()),
                    Some(status.as_u16()),
                ),
                false,
            )
        })?;

        reassemble("Remote embedding API", body.data, texts.len(), self.dimensions, status.as_u16())
            .map_err(|e| (e, false))
    }
}

#[async_trait]
impl EmbeddingClient for RemoteEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceUnavailable> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.api_key.is_none() {
            return Err(EmbeddingServiceUnavailable::new(
                "Remote embedding API key is not configured",
                None,
            ));
        }

        let mut backoff = REMOTE_INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.attempt(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err((err, retryable)) if retryable && attempt < REMOTE_MAX_ATTEMPTS => {
                    tracing::warn!(
                        "[EMBEDDING] remote attempt {attempt}/{REMOTE_MAX_ATTEMPTS} failed, retrying in {}s: {err}",
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(REMOTE_MAX_BACKOFF);
                    attempt += 1;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
