//! Provider selection and failure classification.
//!
//! The router orders the configured providers (primary first), skips any the
//! rate limiter reports as unavailable, and keeps a separate short backoff
//! for the primary after health-related failures.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::llm::chat_stream::{CompletionRequest, LlmError};
pub use crate::llm::rate_limit::Provider;
use crate::llm::rate_limit::{ProviderRateLimiter, RateLimitDecisionError};

const MESSAGE_HINTS: [&str; 6] = [
    "invalid stream",
    "malformed",
    "timeout",
    "temporarily unavailable",
    "connection reset",
    "closed",
];
const TIMEOUT_HINTS: [&str; 4] = ["timeout", "timed out", "connection reset", "connection refused"];

// ─── Classification ──────────────────────────────────────

/// Transport/IO errors and 401, 403, 404, 429, 5xx say something about the
/// provider's health. Anything else is a request problem and must not move
/// traffic away from the primary.
pub fn should_backoff_primary(err: &LlmError) -> bool {
    match err {
        LlmError::Transport(_) => true,
        LlmError::Http { status, .. } => matches!(status, 401 | 403 | 404 | 429) || (500..600).contains(status),
        _ => false,
    }
}

/// Whether a failed stream may be retried on the other provider.
pub fn is_streaming_fallback_eligible(err: &LlmError) -> bool {
    if should_backoff_primary(err) {
        return true;
    }
    match err {
        LlmError::Http { status: 408 | 409, .. } => true,
        LlmError::Stream(_) | LlmError::Overflow(_) | LlmError::IdleTimeout(_) => true,
        LlmError::Validation(_) | LlmError::NotConfigured(_) | LlmError::Unavailable => false,
        other => {
            let message = other.to_string().to_ascii_lowercase();
            MESSAGE_HINTS.iter().any(|hint| message.contains(hint))
        }
    }
}

/// Whether a failed one-shot completion may be retried on the other provider.
pub fn is_completion_fallback_eligible(err: &LlmError) -> bool {
    if should_backoff_primary(err) {
        return true;
    }
    match err {
        LlmError::Http { status: 408, .. } | LlmError::IdleTimeout(_) => true,
        LlmError::Validation(_) | LlmError::NotConfigured(_) | LlmError::Unavailable => false,
        other => {
            let message = other.to_string().to_ascii_lowercase();
            TIMEOUT_HINTS.iter().any(|hint| message.contains(hint))
        }
    }
}

// ─── Router ──────────────────────────────────────────────

pub struct ProviderRouter {
    primary: Provider,
    /// Providers with credentials, primary first.
    configured: Vec<Provider>,
    limiter: Arc<ProviderRateLimiter>,
    primary_backoff: Duration,
    primary_disabled_until: Mutex<Option<Instant>>,
    github_models_model: String,
    openai_model: String,
    reasoning_effort: Option<String>,
}

fn has_key(key: &Option<String>) -> bool {
    key.as_deref().is_some_and(|k| !k.trim().is_empty())
}

impl ProviderRouter {
    pub fn new(config: &LlmConfig, limiter: Arc<ProviderRateLimiter>) -> Self {
        let primary = Provider::parse(&config.primary_provider).unwrap_or_else(|| {
            tracing::warn!(
                "[LLM] unknown primary provider '{}'; using {}",
                config.primary_provider,
                Provider::GithubModels
            );
            Provider::GithubModels
        });

        let configured: Vec<Provider> = [primary, primary.other()]
            .into_iter()
            .filter(|p| match p {
                Provider::GithubModels => has_key(&config.github_token),
                Provider::OpenAi => has_key(&config.openai_api_key),
            })
            .collect();
        if configured.is_empty() {
            tracing::warn!("[LLM] no provider credentials configured; chat and reranking are disabled");
        }

        Self {
            primary,
            configured,
            limiter,
            primary_backoff: Duration::from_secs(config.primary_backoff_secs),
            primary_disabled_until: Mutex::new(None),
            github_models_model: config.github_models_model.clone(),
            openai_model: config.openai_model.clone(),
            reasoning_effort: config.reasoning_effort.clone(),
        }
    }

    pub fn primary(&self) -> Provider {
        self.primary
    }

    pub fn configured(&self) -> &[Provider] {
        &self.configured
    }

    pub fn limiter(&self) -> &Arc<ProviderRateLimiter> {
        &self.limiter
    }

    pub fn is_primary_backed_off(&self) -> bool {
        let mut until = self.primary_disabled_until.lock();
        match *until {
            Some(t) if Instant::now() < t => true,
            Some(_) => {
                *until = None;
                false
            }
            None => false,
        }
    }

    fn is_usable(&self, provider: Provider) -> bool {
        if provider == self.primary && self.is_primary_backed_off() {
            return false;
        }
        self.limiter.is_available(provider)
    }

    /// Usable providers, in priority order. Recomputed on every call.
    pub fn candidates(&self) -> Vec<Provider> {
        self.configured.iter().copied().filter(|p| self.is_usable(*p)).collect()
    }

    pub fn next_candidate(&self, tried: &[Provider]) -> Option<Provider> {
        self.configured
            .iter()
            .copied()
            .filter(|p| !tried.contains(p))
            .find(|p| self.is_usable(*p))
    }

    /// Model id as the provider expects it. GitHub Models wants `publisher/model`.
    pub fn model_for(&self, provider: Provider) -> String {
        match provider {
            Provider::GithubModels if !self.github_models_model.contains('/') => {
                format!("openai/{}", self.github_models_model)
            }
            Provider::GithubModels => self.github_models_model.clone(),
            Provider::OpenAi => self.openai_model.clone(),
        }
    }

    pub fn request_for(&self, provider: Provider, prompt: String, temperature: f32) -> CompletionRequest {
        CompletionRequest {
            model: self.model_for(provider),
            prompt,
            temperature,
            reasoning_effort: self.reasoning_effort.clone(),
        }
    }

    pub fn record_request(&self, provider: Provider) {
        self.limiter.record_request(provider);
    }

    pub fn record_success(&self, provider: Provider) {
        self.limiter.record_success(provider);
        if provider == self.primary {
            *self.primary_disabled_until.lock() = None;
        }
    }

    /// Feed a failure into routing state. A 429 whose headers cannot be
    /// interpreted is reported back instead of guessing a window.
    pub fn record_failure(&self, provider: Provider, err: &LlmError) -> Result<(), RateLimitDecisionError> {
        if provider == self.primary && should_backoff_primary(err) {
            *self.primary_disabled_until.lock() = Some(Instant::now() + self.primary_backoff);
            tracing::warn!(
                "[LLM] primary {provider} disabled for {}s after: {err}",
                self.primary_backoff.as_secs()
            );
        }
        if let LlmError::Http {
            status: 429, headers, ..
        } = err
        {
            self.limiter.record_rate_limit(provider, headers)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn config(primary: &str, github: bool, openai: bool) -> LlmConfig {
        LlmConfig {
            github_token: github.then(|| "gh".to_string()),
            openai_api_key: openai.then(|| "sk".to_string()),
            primary_provider: primary.to_string(),
            ..LlmConfig::default()
        }
    }

    fn router(cfg: &LlmConfig) -> ProviderRouter {
        ProviderRouter::new(cfg, Arc::new(ProviderRateLimiter::in_memory()))
    }

    fn http(status: u16) -> LlmError {
        LlmError::Http {
            status,
            message: String::new(),
            headers: HeaderMap::new(),
        }
    }

    // ─── Classification ──────────────────────────────────

    #[test]
    fn test_backoff_classification() {
        for status in [401, 403, 404, 429, 500, 503] {
            assert!(should_backoff_primary(&http(status)), "{status}");
        }
        assert!(should_backoff_primary(&LlmError::Transport("connection refused".into())));
        assert!(!should_backoff_primary(&http(400)));
        assert!(!should_backoff_primary(&LlmError::Validation("bad".into())));
        assert!(!should_backoff_primary(&LlmError::Stream("malformed chunk".into())));
    }

    #[test]
    fn test_streaming_fallback_classification() {
        assert!(is_streaming_fallback_eligible(&http(408)));
        assert!(is_streaming_fallback_eligible(&http(409)));
        assert!(is_streaming_fallback_eligible(&LlmError::Overflow("big".into())));
        assert!(is_streaming_fallback_eligible(&LlmError::IdleTimeout(30)));
        assert!(is_streaming_fallback_eligible(&LlmError::Stream("anything".into())));
        assert!(!is_streaming_fallback_eligible(&LlmError::Validation("prompt is empty".into())));
        assert!(!is_streaming_fallback_eligible(&http(400)));
        assert!(is_streaming_fallback_eligible(&LlmError::Http {
            status: 400,
            message: "upstream temporarily unavailable".into(),
            headers: HeaderMap::new(),
        }));
    }

    #[test]
    fn test_completion_fallback_classification() {
        assert!(is_completion_fallback_eligible(&http(408)));
        assert!(is_completion_fallback_eligible(&http(502)));
        assert!(!is_completion_fallback_eligible(&http(409)));
        assert!(!is_completion_fallback_eligible(&LlmError::Stream("malformed completion".into())));
        assert!(is_completion_fallback_eligible(&LlmError::Stream("read timed out".into())));
    }

    // ─── Candidates ──────────────────────────────────────

    #[test]
    fn test_candidates_follow_primary_and_credentials() {
        assert_eq!(router(&config("openai", true, true)).candidates(), vec![Provider::OpenAi, Provider::GithubModels]);
        assert_eq!(router(&config("github", true, false)).candidates(), vec![Provider::GithubModels]);
        assert!(router(&config("openai", false, false)).candidates().is_empty());
    }

    #[test]
    fn test_unknown_primary_falls_back_to_github_models() {
        let r = router(&config("anthropic", true, true));
        assert_eq!(r.primary(), Provider::GithubModels);
    }

    #[test]
    fn test_primary_failure_moves_traffic_to_secondary() {
        let r = router(&config("github_models", true, true));
        r.record_failure(Provider::GithubModels, &http(401)).unwrap();
        assert!(r.is_primary_backed_off());
        assert_eq!(r.candidates(), vec![Provider::OpenAi]);

        r.record_success(Provider::GithubModels);
        assert_eq!(r.candidates(), vec![Provider::GithubModels, Provider::OpenAi]);
    }

    #[test]
    fn test_caller_errors_do_not_poison_routing() {
        let r = router(&config("github_models", true, true));
        r.record_failure(Provider::GithubModels, &LlmError::Validation("prompt is empty".into()))
            .unwrap();
        assert!(!r.is_primary_backed_off());
    }

    #[test]
    fn test_rate_limit_reaches_limiter() {
        let r = router(&config("github_models", true, true));
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        let err = LlmError::Http {
            status: 429,
            message: String::new(),
            headers,
        };
        r.record_failure(Provider::OpenAi, &err).unwrap();
        assert_eq!(r.limiter().state(Provider::OpenAi).consecutive_failures, 1);
        assert_eq!(r.next_candidate(&[]), Some(Provider::GithubModels));
        assert_eq!(r.next_candidate(&[Provider::GithubModels]), None);
    }

    #[test]
    fn test_unparseable_rate_limit_header_is_reported() {
        let r = router(&config("openai", false, true));
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("soon-ish"));
        let err = LlmError::Http {
            status: 429,
            message: String::new(),
            headers,
        };
        assert!(r.record_failure(Provider::OpenAi, &err).is_err());
        assert_eq!(r.limiter().state(Provider::OpenAi).consecutive_failures, 0);
    }

    // ─── Models ──────────────────────────────────────────

    #[test]
    fn test_github_models_ids_are_namespaced() {
        let mut cfg = config("github_models", true, true);
        assert_eq!(router(&cfg).model_for(Provider::GithubModels), "openai/gpt-5");
        cfg.github_models_model = "meta/llama-4".to_string();
        assert_eq!(router(&cfg).model_for(Provider::GithubModels), "meta/llama-4");
        assert_eq!(router(&cfg).model_for(Provider::OpenAi), "gpt-5.2");
    }
}
