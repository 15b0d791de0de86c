pub mod chat_stream;
pub mod embeddings;
pub mod prompt;
pub mod rate_limit;
pub mod rerank;
pub mod router;
pub mod streaming;
