use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};

use crate::llm::prompt::{ModelFamily, StructuredPrompt, TextSegment};
use crate::llm::streaming::{CompletionCallback, StreamEvent, StreamNotice, StreamRequest};
use crate::models::{CandidateDocument, ChatMessage, ChatRequest, Citation, RetrievalNotice, RetrievalOutcome};
use crate::retrieval::{to_citations, RetrievalError};
use crate::state::AppState;
use crate::text::{sanitize_for_prompt, truncate_chars};

const MAX_CHAT_MESSAGE_LEN: usize = 4000;
const MAX_HISTORY_TURNS: usize = 10;
const DEFAULT_SESSION: &str = "default";

pub const CODE_RETRIEVAL_PARTIAL: &str = "retrieval.partial-failure";
pub const CODE_RETRIEVAL_FAILED: &str = "retrieval.failed";
pub const CODE_CITATION_PARTIAL: &str = "citation.partial-failure";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub q: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalDiagnostics {
    pub query: String,
    pub citations: Vec<Citation>,
    pub document_count: usize,
    pub failed_conversion_count: usize,
    pub notices: Vec<RetrievalNotice>,
    pub summary: String,
}

fn session_id(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| truncate_chars(s, 128).to_string())
        .unwrap_or_else(|| DEFAULT_SESSION.to_string())
}

fn retrieval_status(err: &RetrievalError) -> StatusCode {
    match err {
        RetrievalError::Search(_) => StatusCode::BAD_GATEWAY,
        RetrievalError::Rerank(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Retrieval sized for the primary model: GPT-5 class models get the
/// constrained document count and per-document token cap.
async fn retrieve_for_chat(state: &AppState, query: &str) -> Result<RetrievalOutcome, RetrievalError> {
    let model = state.router.model_for(state.router.primary());
    if ModelFamily::of(&model) == ModelFamily::Gpt5 {
        state
            .retrieval
            .retrieve_with_limit(query, state.config.rag.limit_constrained, state.config.rag.token_limit_constrained)
            .await
    } else {
        state.retrieval.retrieve(query).await
    }
}

/// POST /api/chat/stream: grounded answer over SSE.
pub async fn stream_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // ── Step 1: Validate and sanitize input ───────────────
    let message = req.message.trim();
    if message.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message is required".to_string()));
    }
    let message = sanitize_for_prompt(truncate_chars(message, MAX_CHAT_MESSAGE_LEN));
    let session = session_id(req.session_id.as_deref());
    let temperature = req.temperature.unwrap_or(state.config.llm.temperature).clamp(0.0, 2.0);

    // ── Step 2: Acquire semaphore ─────────────────────────
    let permit = state
        .chat_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| (StatusCode::SERVICE_UNAVAILABLE, "Chat service at capacity".to_string()))?;

    // ── Step 3: Record the user turn ──────────────────────
    let history = recent_history(state.memory.history(&session));
    state.memory.add_user(&session, message.clone());

    // ── Step 4: Retrieve context ──────────────────────────
    let mut preamble = Vec::new();
    let mut trailer = Vec::new();
    let documents = match retrieve_for_chat(&state, &message).await {
        Ok(outcome) => {
            for notice in &outcome.notices {
                preamble.push(StreamEvent::Status(StreamNotice {
                    retryable: true,
                    ..StreamNotice::new(&notice.summary, &notice.details, CODE_RETRIEVAL_PARTIAL, "retrieval")
                }));
            }
            outcome.documents
        }
        Err(e) => {
            tracing::error!("Retrieval failed for chat request: {e}");
            let event = StreamEvent::Error(StreamNotice {
                retryable: matches!(e, RetrievalError::Search(_)),
                ..StreamNotice::new(
                    "Could not retrieve documentation for this question. Please try again.",
                    e.to_string(),
                    CODE_RETRIEVAL_FAILED,
                    "retrieval",
                )
            });
            let events = futures_util::stream::iter(vec![event]);
            return Ok(sse_response(events.boxed(), permit));
        }
    };

    // ── Step 5: Citations go out after the answer ─────────
    let mut cited = to_citations(&documents);
    if cited.failed_conversion_count > 0 {
        trailer.push(StreamEvent::Status(StreamNotice::new(
            format!("{} source(s) could not be cited", cited.failed_conversion_count),
            "documents without a usable url were skipped",
            CODE_CITATION_PARTIAL,
            "citation",
        )));
    }
    cited.citations.truncate(state.config.rag.search_citations);
    trailer.push(StreamEvent::Citation(cited.citations));

    // ── Step 6: Stream the answer ─────────────────────────
    let prompt = build_prompt(&message, &history, &documents);
    let memory = state.memory.clone();
    let on_complete: CompletionCallback = Box::new(move |answer: String| {
        memory.add_assistant(&session, answer);
    });

    let events = state.streaming.stream(StreamRequest {
        prompt,
        temperature,
        preamble,
        trailer,
        on_complete: Some(on_complete),
    });

    Ok(sse_response(events.boxed(), permit))
}

fn sse_response(
    events: futures_util::stream::BoxStream<'static, StreamEvent>,
    permit: tokio::sync::OwnedSemaphorePermit,
) -> impl IntoResponse {
    // Hold the semaphore permit for the lifetime of the stream
    let sse_events = events.map(move |event| {
        let _permit = &permit;
        Ok::<Event, Infallible>(to_sse_event(&event))
    });
    (
        [
            (HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform")),
        ],
        Sse::new(sse_events),
    )
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match event.name() {
        Some(name) => Event::default().event(name).data(event.payload().to_string()),
        None => Event::default().comment("keepalive"),
    }
}

/// GET /api/chat/citations?q=
pub async fn citations(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Vec<Citation>>, (StatusCode, String)> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query is required".to_string()));
    }
    let outcome = state
        .retrieval
        .retrieve(query)
        .await
        .map_err(|e| (retrieval_status(&e), e.to_string()))?;
    let mut cited = to_citations(&outcome.documents);
    cited.citations.truncate(state.config.rag.search_citations);
    Ok(Json(cited.citations))
}

/// GET /api/chat/diagnostics/retrieval?q=
pub async fn retrieval_diagnostics(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<RetrievalDiagnostics>, (StatusCode, String)> {
    let query = params.q.trim().to_string();
    if query.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query is required".to_string()));
    }
    let outcome = state
        .retrieval
        .retrieve(&query)
        .await
        .map_err(|e| (retrieval_status(&e), e.to_string()))?;
    let cited = to_citations(&outcome.documents);
    let summary = if outcome.notices.is_empty() {
        format!("{} documents retrieved", outcome.documents.len())
    } else {
        let parts: Vec<&str> = outcome.notices.iter().map(|n| n.summary.as_str()).collect();
        format!("{} documents retrieved; {}", outcome.documents.len(), parts.join("; "))
    };

    Ok(Json(RetrievalDiagnostics {
        query,
        document_count: outcome.documents.len(),
        citations: cited.citations,
        failed_conversion_count: cited.failed_conversion_count,
        notices: outcome.notices,
        summary,
    }))
}

/// GET /api/chat/export/last?sessionId=
pub async fn export_last(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Result<String, (StatusCode, String)> {
    let session = session_id(params.session_id.as_deref());
    state
        .memory
        .last_assistant(&session)
        .ok_or((StatusCode::NOT_FOUND, "No assistant response for this session".to_string()))
}

/// POST /api/chat/clear?sessionId=
pub async fn clear_session(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Json<serde_json::Value> {
    let session = session_id(params.session_id.as_deref());
    let cleared = state.memory.clear(&session);
    Json(serde_json::json!({ "sessionId": session, "cleared": cleared }))
}

// ─── Helper functions ────────────────────────────────────

fn recent_history(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let skip = history.len().saturating_sub(MAX_HISTORY_TURNS);
    history.into_iter().skip(skip).collect()
}

fn system_prompt() -> &'static str {
    "You are a Java learning assistant. Answer using the documentation excerpts provided.\n\
     Each excerpt is labelled [CTX n] followed by its source URL.\n\
     Cite excerpts inline with their [CTX n] marker when you rely on them.\n\
     If the excerpts do not answer the question, say so and explain what is missing.\n\
     Use markdown code blocks with language tags for code."
}

fn build_prompt(message: &str, history: &[ChatMessage], documents: &[CandidateDocument]) -> StructuredPrompt {
    let mut prompt = StructuredPrompt::new(system_prompt(), format!("Question: {message}"));
    for doc in documents {
        let url = doc.url().unwrap_or("unknown source");
        prompt.push_context(url, TextSegment::new(sanitize_for_prompt(doc.text.trim())));
    }
    for turn in history {
        prompt.push_turn(turn.role, TextSegment::new(turn.content.clone()));
    }
    prompt
}
