//! Retrieval pipeline: constraint resolution → hybrid search → dedupe → rerank,
//! plus conversion of documents into client-facing citations.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RagConfig;
use crate::llm::rerank::{Reranker, RerankingFailure};
use crate::models::{CandidateDocument, Citation, CitationOutcome, RetrievalNotice, RetrievalOutcome};
use crate::search::constraint::{boost_query_for_version, extract_version, RetrievalConstraint};
use crate::search::hybrid::{HybridSearchEngine, SearchError};
use crate::text::{snippet, truncate_chars};

/// Rough characters-per-token ratio used for length caps.
const CHARS_PER_TOKEN: usize = 4;
const SNIPPET_CHARS: usize = 500;
const TRUNCATION_MARKER: &str = "\n[...content truncated for token limits...]";

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Rerank(#[from] RerankingFailure),
}

pub struct RetrievalOrchestrator {
    engine: Arc<HybridSearchEngine>,
    reranker: Arc<Reranker>,
    top_k: usize,
    return_k: usize,
}

impl RetrievalOrchestrator {
    pub fn new(engine: Arc<HybridSearchEngine>, reranker: Arc<Reranker>, rag: &RagConfig) -> Self {
        Self {
            engine,
            reranker,
            top_k: rag.search_top_k.max(1),
            return_k: rag.search_return_k.max(1),
        }
    }

    pub async fn retrieve(&self, query: &str) -> Result<RetrievalOutcome, RetrievalError> {
        if query.trim().is_empty() {
            return Ok(RetrievalOutcome::default());
        }

        let version = extract_version(query);
        let (constraint, search_query) = match &version {
            Some(v) => (RetrievalConstraint::for_version(v.as_str()), boost_query_for_version(query, v)),
            None => (RetrievalConstraint::none(), query.to_string()),
        };

        let outcome = self.engine.search(&search_query, self.top_k, &constraint).await?;
        let mut notices = outcome.notices;
        let candidates = dedupe(outcome.documents);

        if candidates.is_empty() {
            if let Some(v) = &version {
                notices.push(RetrievalNotice {
                    summary: format!("No documents matched Java {v}"),
                    details: format!("Search was restricted to docVersion={v}"),
                });
            }
            return Ok(RetrievalOutcome {
                documents: Vec::new(),
                notices,
            });
        }

        let found = candidates.len();
        let documents = self.reranker.rerank(query, candidates, self.return_k).await?;
        tracing::info!(
            "Retrieved {} documents ({} candidates, version filter: {})",
            documents.len(),
            found,
            version.as_deref().unwrap_or("none")
        );

        Ok(RetrievalOutcome { documents, notices })
    }

    /// Variant for token-constrained models: at most `max_docs` documents, each
    /// cut to roughly `max_tokens_per_doc` tokens.
    pub async fn retrieve_with_limit(
        &self,
        query: &str,
        max_docs: usize,
        max_tokens_per_doc: usize,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        let outcome = self.retrieve(query).await?;
        let documents = outcome
            .documents
            .into_iter()
            .take(max_docs.max(1))
            .map(|doc| truncate_for_tokens(doc, max_tokens_per_doc))
            .collect();
        Ok(RetrievalOutcome {
            documents,
            notices: outcome.notices,
        })
    }
}

/// Hashed documents dedupe by `hash` only; hashless ones by `url`; documents
/// with neither are kept. Output groups them in that order, first-seen wins.
fn dedupe(docs: Vec<CandidateDocument>) -> Vec<CandidateDocument> {
    let mut hashes = HashSet::new();
    let mut urls = HashSet::new();
    let mut by_hash = Vec::with_capacity(docs.len());
    let mut by_url = Vec::new();
    let mut unidentified = Vec::new();

    for doc in docs {
        if let Some(hash) = doc.hash() {
            if hashes.insert(hash.to_string()) {
                by_hash.push(doc);
            }
        } else if let Some(url) = doc.url() {
            if urls.insert(url.to_string()) {
                by_url.push(doc);
            }
        } else {
            tracing::warn!("Document {} has neither hash nor url; keeping without dedupe", doc.id);
            unidentified.push(doc);
        }
    }

    by_hash.extend(by_url);
    by_hash.extend(unidentified);
    by_hash
}

/// Cap text at `max_tokens * 4` chars, preferring a sentence or line break in
/// the last fifth of the window.
pub fn truncate_for_tokens(mut doc: CandidateDocument, max_tokens: usize) -> CandidateDocument {
    let max_chars = max_tokens.max(1).saturating_mul(CHARS_PER_TOKEN);
    let original_len = doc.text.chars().count();
    if original_len <= max_chars {
        return doc;
    }

    let cut = truncate_chars(&doc.text, max_chars);
    let min_break = cut.len() * 4 / 5;
    let cut = match cut.rfind(['.', '\n']) {
        Some(pos) if pos > min_break => &cut[..=pos],
        _ => cut,
    };

    doc.text = format!("{cut}{TRUNCATION_MARKER}");
    doc.metadata.insert("truncated".to_string(), Value::Bool(true));
    doc.metadata.insert("originalLength".to_string(), Value::from(original_len));
    doc
}

fn is_valid_citation_url(url: &str) -> bool {
    if url.starts_with('/') {
        return true;
    }
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

fn to_citation(doc: &CandidateDocument) -> Result<Citation, String> {
    let url = match doc.metadata.get("url") {
        None | Some(Value::Null) => return Err("missing url".to_string()),
        Some(Value::String(s)) if s.trim().is_empty() => return Err("blank url".to_string()),
        Some(Value::String(s)) => s.trim(),
        Some(other) => return Err(format!("url is not a string: {other}")),
    };
    if !is_valid_citation_url(url) {
        return Err(format!("invalid url '{}'", truncate_chars(url, 120)));
    }

    let anchor = url.split_once('#').map(|(_, frag)| frag.to_string()).unwrap_or_default();
    Ok(Citation {
        url: url.to_string(),
        title: doc.title().unwrap_or_default().to_string(),
        anchor,
        snippet: snippet(doc.text.trim(), SNIPPET_CHARS),
    })
}

/// Convert documents to citations. A document that fails conversion is
/// dropped and counted; this never fails as a whole.
pub fn to_citations(docs: &[CandidateDocument]) -> CitationOutcome {
    let mut outcome = CitationOutcome::default();
    for doc in docs {
        match to_citation(doc) {
            Ok(citation) => outcome.citations.push(citation),
            Err(reason) => {
                outcome.failed_conversion_count += 1;
                tracing::warn!("Skipping citation for document {}: {reason}", doc.id);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, url: Option<&str>, hash: Option<&str>) -> CandidateDocument {
        let mut d = CandidateDocument::new(id, format!("text of {id}"));
        if let Some(u) = url {
            d = d.with_meta("url", u);
        }
        if let Some(h) = hash {
            d = d.with_meta("hash", h);
        }
        d
    }

    // ─── Citations ───

    #[test]
    fn test_mixed_batch_counts_one_failure() {
        let docs = vec![
            doc("good", Some("https://docs.oracle.com/en/java/#streams"), None).with_meta("title", "Streams"),
            doc("bad", None, None),
        ];
        let outcome = to_citations(&docs);
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(outcome.failed_conversion_count, 1);
        assert_eq!(outcome.citations[0].title, "Streams");
        assert_eq!(outcome.citations[0].anchor, "streams");
    }

    #[test]
    fn test_citation_url_rules() {
        assert!(is_valid_citation_url("https://example.com/a"));
        assert!(is_valid_citation_url("/pdfs/thinking-in-java.pdf"));
        assert!(!is_valid_citation_url("ftp://example.com/a"));
        assert!(!is_valid_citation_url("not a url"));

        let numeric = CandidateDocument::new("n", "t").with_meta("url", 12);
        assert_eq!(to_citations(&[numeric]).failed_conversion_count, 1);
    }

    #[test]
    fn test_citation_snippet_is_capped() {
        let long = CandidateDocument::new("l", "x".repeat(800)).with_meta("url", "https://e.com");
        let outcome = to_citations(&[long]);
        assert_eq!(outcome.citations[0].snippet.chars().count(), SNIPPET_CHARS + 1);
        assert!(outcome.citations[0].snippet.ends_with('…'));
    }

    // ─── Dedupe ───

    #[test]
    fn test_dedupe_keeps_chunks_of_same_page() {
        let docs = vec![
            doc("a", Some("https://e.com/1"), Some("h1")),
            doc("b", Some("https://e.com/2"), Some("h1")),
            doc("c", Some("https://e.com/1"), Some("h2")),
        ];
        let kept: Vec<String> = dedupe(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(kept, vec!["a", "c"]);
    }

    #[test]
    fn test_dedupe_groups_hashed_then_url_then_unidentified() {
        let docs = vec![
            doc("n1", None, None),
            doc("u1", Some("https://e.com/3"), None),
            doc("h1", Some("https://e.com/3"), Some("x1")),
            doc("u2", Some("https://e.com/3"), Some("  ")),
            doc("n2", None, None),
            doc("u3", Some("https://e.com/4"), None),
            doc("h2", None, Some("x2")),
            doc("h3", Some("https://e.com/9"), Some("x1")),
        ];
        let kept: Vec<String> = dedupe(docs).into_iter().map(|d| d.id).collect();
        // Blank hash counts as no hash, so u2 collides with u1 on url.
        assert_eq!(kept, vec!["h1", "h2", "u1", "u3", "n1", "n2"]);
    }

    // ─── Token truncation ───

    #[test]
    fn test_truncate_prefers_sentence_break() {
        let text = format!("{}. {}", "a".repeat(36), "b".repeat(20));
        let out = truncate_for_tokens(CandidateDocument::new("t", text), 10);
        assert!(out.text.starts_with(&format!("{}.", "a".repeat(36))));
        assert!(out.text.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.metadata["truncated"], Value::Bool(true));
        assert_eq!(out.metadata["originalLength"], Value::from(58));
    }

    #[test]
    fn test_truncate_hard_cut_when_break_too_early() {
        let text = format!("ab. {}", "c".repeat(100));
        let out = truncate_for_tokens(CandidateDocument::new("t", text), 10);
        assert_eq!(out.text, format!("ab. {}{TRUNCATION_MARKER}", "c".repeat(36)));
    }

    #[test]
    fn test_zero_token_budget_keeps_some_text() {
        let out = truncate_for_tokens(CandidateDocument::new("t", "abcdefghij"), 0);
        assert_eq!(out.text, format!("abcd{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_short_text_untouched() {
        let out = truncate_for_tokens(CandidateDocument::new("t", "short"), 10);
        assert_eq!(out.text, "short");
        assert!(!out.metadata.contains_key("truncated"));
    }
}
