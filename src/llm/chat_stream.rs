use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::llm::prompt::ModelFamily;
use crate::llm::rate_limit::Provider;
use crate::llm::rerank::TextCompleter;
use crate::llm::router::{is_completion_fallback_eligible, ProviderRouter};
use crate::text::single_line;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

const GPT5_MAX_COMPLETION_TOKENS: u32 = 4000;
/// A single SSE line longer than this is treated as a broken stream.
const MAX_LINE_BYTES: usize = 1024 * 1024;
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);
const ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        headers: HeaderMap,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid stream: {0}")]
    Stream(String),
    #[error("stream buffer overflow: {0}")]
    Overflow(String),
    #[error("stream idle timeout after {0}s")]
    IdleTimeout(u64),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0} is not configured")]
    NotConfigured(Provider),
    #[error("no LLM provider is available")]
    Unavailable,
}

impl LlmError {
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Transport(format!("request timed out: {e}"))
        } else if e.is_builder() {
            LlmError::Validation(e.to_string())
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

/// Everything a provider needs for one call. The model id is already
/// namespaced for the target provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub reasoning_effort: Option<String>,
}

/// `o1`, `o3-mini`, `o4-mini`... reject a temperature like GPT-5 does.
fn is_reasoning_model(model: &str) -> bool {
    let name = model.rsplit('/').next().unwrap_or(model);
    let mut chars = name.chars();
    matches!(chars.next(), Some('o') | Some('O')) && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// OpenAI chat-completions body for `request`.
pub fn request_body(request: &CompletionRequest, stream: bool) -> Value {
    let gpt5 = ModelFamily::of(&request.model) == ModelFamily::Gpt5;
    let mut body = json!({
        "model": request.model,
        "messages": [{"role": "user", "content": request.prompt}],
        "stream": stream,
    });
    if gpt5 {
        body["max_completion_tokens"] = json!(GPT5_MAX_COMPLETION_TOKENS);
        if let Some(effort) = request.reasoning_effort.as_deref().filter(|e| !e.trim().is_empty()) {
            body["reasoning_effort"] = json!(effort.trim());
        }
    }
    if !gpt5 && !is_reasoning_model(&request.model) {
        body["temperature"] = json!(request.temperature);
    }
    body
}

/// A chat backend speaking to one of the configured providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stream content deltas. Errors before the first delta come back as `Err`.
    async fn stream_completion(&self, provider: Provider, request: &CompletionRequest) -> Result<ChatStream, LlmError>;

    async fn complete(&self, provider: Provider, request: &CompletionRequest) -> Result<String, LlmError>;
}

// ─── OpenAI-compatible HTTP client ───────────────────────

/// GitHub Models and OpenAI both expose `POST {base}/chat/completions`.
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiCompatibleClient {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self, provider: Provider) -> Result<(String, &str), LlmError> {
        let (base, key) = match provider {
            Provider::GithubModels => (&self.config.github_models_base_url, self.config.github_token.as_deref()),
            Provider::OpenAi => (&self.config.openai_base_url, self.config.openai_api_key.as_deref()),
        };
        let key = key
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::NotConfigured(provider))?;
        Ok((format!("{}/chat/completions", base.trim_end_matches('/')), key))
    }

    async fn send(&self, provider: Provider, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        if request.prompt.trim().is_empty() {
            return Err(LlmError::Validation("prompt is empty".to_string()));
        }
        let (url, key) = self.endpoint(provider)?;
        let mut builder = self.client.post(&url).bearer_auth(key).json(&request_body(request, stream));
        if stream {
            builder = builder.timeout(STREAM_TIMEOUT);
        }
        let resp = builder.send().await.map_err(LlmError::from_reqwest)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!("[LLM] {provider} returned HTTP {status}");
            return Err(LlmError::Http {
                status,
                message: single_line(&body, ERROR_BODY_CHARS),
                headers,
            });
        }
        Ok(resp)
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleClient {
    async fn stream_completion(&self, provider: Provider, request: &CompletionRequest) -> Result<ChatStream, LlmError> {
        let resp = self.send(provider, request, true).await?;
        let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
            match line_result {
                Ok(line) => parse_openai_line(&line),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn complete(&self, provider: Provider, request: &CompletionRequest) -> Result<String, LlmError> {
        let resp = self.send(provider, request, false).await?;
        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Stream(format!("malformed completion response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Stream(format!("{provider} completion has no content")))
    }
}

// ─── SSE parsing ─────────────────────────────────────────

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

/// Parse a single OpenAI SSE line. Returns:
/// - Some(Ok(content)) for content deltas (whitespace preserved)
/// - Some(Err(e)) for malformed chunks and in-band error objects
/// - None to skip (blank lines, comments, [DONE], role-only chunks)
fn parse_openai_line(line: &str) -> Option<Result<String, LlmError>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return Some(Err(LlmError::Stream(format!(
                    "provider sent an error event: {}",
                    single_line(&error.to_string(), ERROR_BODY_CHARS)
                ))));
            }
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            if content.is_empty() {
                return None;
            }
            Some(Ok(content))
        }
        Err(e) => Some(Err(LlmError::Stream(format!("malformed chunk: {e}")))),
    }
}

// ─── Line buffering ──────────────────────────────────────

/// Convert a byte stream into a stream of complete lines.
fn stream_lines<E: std::fmt::Display>(
    byte_stream: impl Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
) -> impl Stream<Item = Result<String, LlmError>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), String::new(), false),
        |(mut stream, mut buffer, failed)| async move {
            if failed {
                return None;
            }
            loop {
                if let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].to_string();
                    buffer.drain(..=newline_pos);
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer, false)));
                    }
                    continue;
                }

                if buffer.len() > MAX_LINE_BYTES {
                    let err = LlmError::Overflow(format!("line exceeded {MAX_LINE_BYTES} bytes"));
                    return Some((Err(err), (stream, String::new(), true)));
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        let err = LlmError::Stream(format!("stream read error: {e}"));
                        return Some((Err(err), (stream, String::new(), true)));
                    }
                    None => {
                        if !buffer.trim().is_empty() {
                            let remaining = std::mem::take(&mut buffer);
                            return Some((Ok(remaining), (stream, buffer, false)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

// ─── Routed one-shot completions ─────────────────────────

/// Non-streaming completions through the router, failing over between
/// providers on eligible errors. Backs the reranker.
pub struct LlmGateway {
    router: Arc<ProviderRouter>,
    client: Arc<dyn ChatProvider>,
}

impl LlmGateway {
    pub fn new(router: Arc<ProviderRouter>, client: Arc<dyn ChatProvider>) -> Self {
        Self { router, client }
    }
}

#[async_trait]
impl TextCompleter for LlmGateway {
    async fn complete(&self, prompt: &str, temperature: f32) -> anyhow::Result<String> {
        let mut tried: Vec<Provider> = Vec::new();
        let mut last_error: Option<(Provider, LlmError)> = None;

        while let Some(provider) = self.router.next_candidate(&tried) {
            tried.push(provider);
            let request = self.router.request_for(provider, prompt.to_string(), temperature);
            self.router.record_request(provider);
            match self.client.complete(provider, &request).await {
                Ok(text) => {
                    self.router.record_success(provider);
                    return Ok(text);
                }
                Err(err) => {
                    if let Err(decision) = self.router.record_failure(provider, &err) {
                        tracing::error!("[LLM] {decision}");
                    }
                    if !is_completion_fallback_eligible(&err) {
                        return Err(anyhow!(err).context(format!("{provider} completion failed")));
                    }
                    tracing::warn!("[LLM] {provider} completion failed ({err}); trying next provider");
                    last_error = Some((provider, err));
                }
            }
        }

        match last_error {
            Some((provider, err)) => Err(anyhow!(err).context(format!("all providers failed; last was {provider}"))),
            None => Err(anyhow!(LlmError::Unavailable)),
        }
    }

    fn is_available(&self) -> bool {
        self.router.next_candidate(&[]).is_some()
    }
}
