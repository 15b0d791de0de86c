//! # doc-chat
//!
//! A Rust web service that answers questions about a documentation corpus.
//! It retrieves relevant chunks from a Qdrant vector store with hybrid
//! dense + sparse search, reranks them with an LLM judgment call, and
//! streams a grounded answer from GitHub Models or OpenAI with failover.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────┐
//!                        │  User Query  │
//!                        └──────┬───────┘
//!                               │
//!                  ┌────────────┴─────────────┐
//!                  ▼                          ▼
//!        ┌──────────────────┐       ┌───────────────────┐
//!        │ Version filter   │       │  Query encoding   │
//!        │ "Java 21" → 21   │       │ dense + sparse    │
//!        └────────┬─────────┘       └─────────┬─────────┘
//!                 └─────────────┬─────────────┘
//!                               │ one query per collection
//!          ┌──────────────┬─────┴────────┬──────────────┐
//!          ▼              ▼              ▼              ▼
//!     ┌─────────┐    ┌─────────┐    ┌─────────┐    ┌─────────┐
//!     │  books  │    │  docs   │    │articles │    │  pdfs   │
//!     │ RRF(k)  │    │ RRF(k)  │    │ RRF(k)  │    │ RRF(k)  │
//!     └────┬────┘    └────┬────┘    └────┬────┘    └────┬────┘
//!          └──────────────┴──────┬───────┴──────────────┘
//!                                │ merge, dedupe, score order
//!                                ▼
//!                   ┌────────────────────────┐
//!                   │   LLM reranking        │
//!                   │  {"order":[...]}       │
//!                   └───────────┬────────────┘
//!                               ▼
//!                   ┌────────────────────────┐
//!                   │  Prompt truncation     │
//!                   │  history, then context │
//!                   └───────────┬────────────┘
//!                               ▼
//!                   ┌────────────────────────┐
//!                   │  Provider router       │
//!                   │  primary → secondary   │
//!                   └───────────┬────────────┘
//!                               ▼
//!                   ┌────────────────────────┐
//!                   │  SSE: provider, text,  │
//!                   │  citation, error       │
//!                   └────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration with defaults
//! - [`models`] - Shared data types: `CandidateDocument`, `Citation`, request/response types
//! - [`text`] - Char-safe truncation, snippets, prompt sanitizing
//! - [`search::constraint`] - Metadata filters and Java version extraction
//! - [`search::sparse`] - Murmur3 term hashing into sparse vectors
//! - [`search::encoder`] - Dense + sparse query encoding
//! - [`search::qdrant`] - `VectorStore` trait and Qdrant REST client
//! - [`search::hybrid`] - Concurrent per-collection hybrid search with strict/lenient failure handling
//! - [`retrieval`] - Search → dedupe → rerank pipeline and citation conversion
//! - [`cache`] - Persistent embedding cache with upload to the vector store
//! - [`llm::embeddings`] - Local and remote embedding providers
//! - [`llm::rerank`] - LLM judgment reranker
//! - [`llm::rate_limit`] - Per-provider rate-limit windows and backoff state
//! - [`llm::router`] - Provider selection and failure classification
//! - [`llm::prompt`] - Structured prompts and token-budget truncation
//! - [`llm::chat_stream`] - OpenAI-compatible chat client (streaming and one-shot)
//! - [`llm::streaming`] - Streaming orchestration with coalescing, backpressure and heartbeats
//! - [`memory`] - Per-session conversation history
//! - [`api`] - Axum HTTP handlers
//! - [`state`] - Shared application state

pub mod api;
pub mod cache;
pub mod config;
pub mod llm;
pub mod memory;
pub mod models;
pub mod retrieval;
pub mod search;
pub mod state;
pub mod text;
