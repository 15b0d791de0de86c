//! Structured retrieval filters and query-side version detection.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;

/// Optional payload filters applied identically to every leg of a hybrid query.
///
/// Blank strings count as unset; a constraint with nothing set produces no filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalConstraint {
    pub doc_version: Option<String>,
    pub source_kind: Option<String>,
    pub doc_type: Option<String>,
    /// Collection / source-name hint.
    pub source_name: Option<String>,
}

impl RetrievalConstraint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_version(version: impl Into<String>) -> Self {
        Self {
            doc_version: Some(version.into()),
            ..Self::default()
        }
    }

    /// Payload key / value pairs that are actually set, in a fixed order.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("docVersion", &self.doc_version),
            ("sourceKind", &self.source_kind),
            ("docType", &self.doc_type),
            ("sourceName", &self.source_name),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Qdrant `must` filter with one keyword match per set field, or `None`.
    pub fn to_filter(&self) -> Option<Value> {
        let must: Vec<Value> = self
            .fields()
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
            .collect();
        if must.is_empty() {
            None
        } else {
            Some(json!({ "must": must }))
        }
    }
}

fn version_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\b(?:java\s*se|javase|java|jdk)[\s-]*(\d{1,2})\b").ok())
        .as_ref()
}

/// Detect an explicit Java version mentioned in the query ("Java 21", "jdk-17").
pub fn extract_version(query: &str) -> Option<String> {
    version_pattern()?
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_start_matches('0').to_string())
        .filter(|v| !v.is_empty())
}

/// Prefix the query with version synonyms so both legs lean toward that release.
pub fn boost_query_for_version(query: &str, version: &str) -> String {
    format!("JDK {version} Java SE {version} Java {version} release features documentation: {query}")
}
