//! Streaming answer pipeline.
//!
//! A producer task reads provider chunks, coalesces them into small batches
//! and pushes [`StreamEvent`]s into a bounded [`DropOldestBuffer`]. The
//! consumer side ([`StreamingOrchestrator::stream`]) pops events and
//! interleaves keepalives when the producer is quiet. Dropping the consumer
//! aborts the producer.
//!
//! Failover to the next provider happens only while no text has been emitted;
//! once output has started a failure ends the stream with a single error event.

use futures_util::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::llm::chat_stream::{ChatProvider, LlmError};
use crate::llm::prompt::{PromptTruncator, StructuredPrompt};
use crate::llm::rate_limit::Provider;
use crate::llm::router::{is_streaming_fallback_eligible, ProviderRouter};
use crate::models::Citation;
use crate::text::single_line;

pub const CODE_FALLBACK: &str = "stream.provider.fallback";
pub const CODE_RETRYABLE: &str = "stream.provider.retryable-error";
pub const CODE_FATAL: &str = "stream.provider.fatal-error";
pub const CODE_UNAVAILABLE: &str = "stream.provider.unavailable";

const DETAILS_CHARS: usize = 500;

// ─── Events ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamNotice {
    pub message: String,
    pub details: String,
    pub code: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<usize>,
}

impl StreamNotice {
    pub fn new(message: impl Into<String>, details: impl Into<String>, code: &str, stage: &str) -> Self {
        Self {
            message: message.into(),
            details: details.into(),
            code: code.to_string(),
            stage: stage.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Provider(ProviderInfo),
    Status(StreamNotice),
    Text(String),
    Citation(Vec<Citation>),
    Error(StreamNotice),
    Keepalive,
}

impl StreamEvent {
    /// SSE event name. Keepalives are written as comments and have none.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            StreamEvent::Provider(_) => Some("provider"),
            StreamEvent::Status(_) => Some("status"),
            StreamEvent::Text(_) => Some("text"),
            StreamEvent::Citation(_) => Some("citation"),
            StreamEvent::Error(_) => Some("error"),
            StreamEvent::Keepalive => None,
        }
    }

    /// JSON payload for the SSE `data:` field.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            StreamEvent::Provider(info) => serde_json::to_value(info).unwrap_or_default(),
            StreamEvent::Status(n) | StreamEvent::Error(n) => serde_json::to_value(n).unwrap_or_default(),
            StreamEvent::Text(text) => serde_json::json!({ "text": text }),
            StreamEvent::Citation(c) => serde_json::to_value(c).unwrap_or_default(),
            StreamEvent::Keepalive => serde_json::Value::Null,
        }
    }

    /// Only text may be discarded under backpressure.
    fn is_droppable(&self) -> bool {
        matches!(self, StreamEvent::Text(_))
    }
}

// ─── Drop-oldest buffer ──────────────────────────────────

struct BufferState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Bounded single-consumer queue. When full, the oldest droppable item is
/// discarded to make room; items that aren't droppable are always kept.
pub struct DropOldestBuffer<T> {
    state: Mutex<BufferState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    log_interval: u64,
}

impl<T> DropOldestBuffer<T> {
    pub fn new(capacity: usize, log_interval: u64) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            log_interval: log_interval.max(1),
        }
    }

    pub fn push(&self, item: T, droppable: impl Fn(&T) -> bool) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.queue.len() >= self.capacity {
                if let Some(pos) = state.queue.iter().position(&droppable) {
                    state.queue.remove(pos);
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total == 1 || total % self.log_interval == 0 {
                        tracing::warn!("[STREAM] client is slow; dropped {total} chunks so far");
                    }
                }
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// No more items will be pushed; the consumer drains what's left.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Next item, or `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aborts the producer task when the consumer goes away.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─── Orchestrator ────────────────────────────────────────

pub type CompletionCallback = Box<dyn FnOnce(String) + Send>;

pub struct StreamRequest {
    pub prompt: StructuredPrompt,
    pub temperature: f32,
    /// Emitted before the first provider attempt (e.g. retrieval notices).
    pub preamble: Vec<StreamEvent>,
    /// Emitted after the answer completes successfully (e.g. citations).
    pub trailer: Vec<StreamEvent>,
    /// Receives the full answer text on success only.
    pub on_complete: Option<CompletionCallback>,
}

pub struct StreamingOrchestrator {
    router: Arc<ProviderRouter>,
    client: Arc<dyn ChatProvider>,
    settings: StreamConfig,
}

struct Producer {
    router: Arc<ProviderRouter>,
    client: Arc<dyn ChatProvider>,
    settings: StreamConfig,
    buffer: Arc<DropOldestBuffer<StreamEvent>>,
}

impl StreamingOrchestrator {
    pub fn new(router: Arc<ProviderRouter>, client: Arc<dyn ChatProvider>, settings: StreamConfig) -> Self {
        Self {
            router,
            client,
            settings,
        }
    }

    /// Start producing and return the event stream. The stream ends after the
    /// trailer on success, or after exactly one error event.
    pub fn stream(&self, request: StreamRequest) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let buffer = Arc::new(DropOldestBuffer::new(
            self.settings.buffer_capacity,
            self.settings.drop_log_interval,
        ));
        let producer = Producer {
            router: self.router.clone(),
            client: self.client.clone(),
            settings: self.settings.clone(),
            buffer: buffer.clone(),
        };
        let guard = AbortOnDrop(tokio::spawn(producer.run(request)));

        let period = Duration::from_secs(self.settings.heartbeat_secs.max(1));
        let heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        futures_util::stream::unfold(
            (buffer, heartbeat, guard),
            |(buffer, mut heartbeat, guard)| async move {
                let next = tokio::select! {
                    biased;
                    event = buffer.pop() => event,
                    _ = heartbeat.tick() => Some(StreamEvent::Keepalive),
                };
                next.map(|event| (event, (buffer, heartbeat, guard)))
            },
        )
    }
}

impl Producer {
    fn emit(&self, event: StreamEvent) {
        self.buffer.push(event, StreamEvent::is_droppable);
    }

    async fn run(self, request: StreamRequest) {
        let StreamRequest {
            prompt,
            temperature,
            preamble,
            trailer,
            mut on_complete,
        } = request;
        for event in preamble {
            self.emit(event);
        }

        let max_attempts = self.router.configured().len();
        let mut tried: Vec<Provider> = Vec::new();
        let mut last_error: Option<(Provider, LlmError)> = None;

        while let Some(provider) = self.router.next_candidate(&tried) {
            tried.push(provider);
            let attempt = tried.len();
            let mut answer = String::new();

            match self.attempt(provider, &prompt, temperature, &mut answer).await {
                Ok(()) => {
                    self.router.record_success(provider);
                    for event in trailer {
                        self.emit(event);
                    }
                    if let Some(callback) = on_complete.take() {
                        callback(answer);
                    }
                    self.buffer.close();
                    return;
                }
                Err(err) => {
                    let mut details = single_line(&err.to_string(), DETAILS_CHARS);
                    if let Err(decision) = self.router.record_failure(provider, &err) {
                        tracing::error!("[LLM] {decision}");
                        details = format!("{details}; {decision}");
                    }
                    let retryable = is_streaming_fallback_eligible(&err);
                    let next = self.router.next_candidate(&tried);

                    if retryable && answer.is_empty() {
                        if let Some(next) = next {
                            tracing::warn!("[LLM] {provider} stream failed before output ({err}); falling back to {next}");
                            self.emit(StreamEvent::Status(StreamNotice {
                                provider: Some(provider.id().to_string()),
                                retryable: true,
                                attempt: Some(attempt),
                                max_attempts: Some(max_attempts),
                                ..StreamNotice::new(
                                    format!("{provider} is unavailable; switching to {next}"),
                                    details,
                                    CODE_FALLBACK,
                                    "provider",
                                )
                            }));
                            last_error = Some((provider, err));
                            continue;
                        }
                    }

                    tracing::error!("[LLM] {provider} stream failed: {err}");
                    let code = if retryable { CODE_RETRYABLE } else { CODE_FATAL };
                    self.emit(StreamEvent::Error(StreamNotice {
                        provider: Some(provider.id().to_string()),
                        retryable,
                        attempt: Some(attempt),
                        max_attempts: Some(max_attempts),
                        ..StreamNotice::new(
                            "The AI provider failed while generating a response. Please try again.",
                            details,
                            code,
                            "stream",
                        )
                    }));
                    self.buffer.close();
                    return;
                }
            }
        }

        let (message, details, provider) = match last_error {
            Some((provider, err)) => (
                "All AI providers failed to respond. Please try again shortly.",
                single_line(&err.to_string(), DETAILS_CHARS),
                Some(provider.id().to_string()),
            ),
            None => (
                "No AI provider is available right now. Please try again later.",
                "every configured provider is missing credentials, rate limited or backed off".to_string(),
                None,
            ),
        };
        self.emit(StreamEvent::Error(StreamNotice {
            provider,
            retryable: true,
            attempt: Some(tried.len()),
            max_attempts: Some(max_attempts),
            ..StreamNotice::new(message, details, CODE_UNAVAILABLE, "provider")
        }));
        self.buffer.close();
    }

    /// One provider attempt. Emitted text is appended to `answer`.
    async fn attempt(
        &self,
        provider: Provider,
        prompt: &StructuredPrompt,
        temperature: f32,
        answer: &mut String,
    ) -> Result<(), LlmError> {
        let model = self.router.model_for(provider);
        let truncated = PromptTruncator::for_model(&model).truncate(prompt);
        if truncated.truncated {
            tracing::info!(
                "[LLM] prompt truncated for {model}: {} context docs, {} turns kept",
                truncated.prompt.context.len(),
                truncated.prompt.conversation.len()
            );
        }
        let completion = self.router.request_for(provider, truncated.render(), temperature);

        self.emit(StreamEvent::Provider(ProviderInfo {
            id: provider.id(),
            name: provider.display_name(),
            model: completion.model.clone(),
        }));
        self.router.record_request(provider);

        let mut chunks = self.client.stream_completion(provider, &completion).await?;

        let idle = Duration::from_secs(self.settings.idle_timeout_secs.max(1));
        let window = Duration::from_millis(self.settings.coalesce_window_ms);
        let max_items = self.settings.coalesce_max_items.max(1);

        let mut batch = String::new();
        let mut batch_items = 0usize;
        let mut batch_started: Option<Instant> = None;

        loop {
            let wait = match batch_started {
                Some(start) => window.saturating_sub(start.elapsed()),
                None => idle,
            };
            match tokio::time::timeout(wait, chunks.next()).await {
                Ok(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    batch_started.get_or_insert_with(Instant::now);
                    batch.push_str(&chunk);
                    batch_items += 1;
                    if batch_items >= max_items {
                        self.flush(&mut batch, answer);
                        batch_items = 0;
                        batch_started = None;
                    }
                }
                Ok(Some(Err(err))) => {
                    self.flush(&mut batch, answer);
                    return Err(err);
                }
                Ok(None) => {
                    self.flush(&mut batch, answer);
                    return Ok(());
                }
                Err(_) if batch_started.is_some() => {
                    self.flush(&mut batch, answer);
                    batch_items = 0;
                    batch_started = None;
                }
                Err(_) => return Err(LlmError::IdleTimeout(idle.as_secs())),
            }
        }
    }

    fn flush(&self, batch: &mut String, answer: &mut String) {
        if batch.is_empty() {
            return;
        }
        let text = std::mem::take(batch);
        answer.push_str(&text);
        self.emit(StreamEvent::Text(text));
    }
}
