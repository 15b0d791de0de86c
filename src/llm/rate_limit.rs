use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on any computed backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MAX_MULTIPLIER: u32 = 32;
/// `X-RateLimit-Reset` values at or above this are epoch seconds, below are a delay.
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "github_models")]
    GithubModels,
    #[serde(rename = "openai")]
    OpenAi,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::GithubModels, Provider::OpenAi];

    pub fn id(self) -> &'static str {
        match self {
            Provider::GithubModels => "github_models",
            Provider::OpenAi => "openai",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Provider::GithubModels => "GitHub Models",
            Provider::OpenAi => "OpenAI",
        }
    }

    /// Accepts the config spellings; `None` for anything else.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "github_models" | "github-models" | "github" => Some(Provider::GithubModels),
            "openai" => Some(Provider::OpenAi),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Provider::GithubModels => Provider::OpenAi,
            Provider::OpenAi => Provider::GithubModels,
        }
    }

    /// Requests allowed per UTC day before the provider is treated as exhausted.
    pub fn daily_limit(self) -> u32 {
        match self {
            Provider::GithubModels => 150,
            Provider::OpenAi => 500,
        }
    }

    /// Window used when a rate-limit response carries no reset hint.
    pub fn default_window(self) -> Duration {
        match self {
            Provider::GithubModels => Duration::from_secs(24 * 60 * 60),
            Provider::OpenAi => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Headers were present but could not be turned into a window.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot derive rate-limit window for {provider}: header {header}={value:?} is not parseable")]
pub struct RateLimitDecisionError {
    pub provider: Provider,
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderState {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub backoff_secs: u64,
    pub next_retry: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub requests_today: u32,
    pub day: Option<NaiveDate>,
}

impl ProviderState {
    fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.next_retry.is_some_and(|t| now < t)
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.requests_today = 0;
        }
    }
}

// ─── Header parsing ──────────────────────────────────────

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<Result<&'a str, String>> {
    headers.get(name).map(|v| {
        v.to_str()
            .map(str::trim)
            .map_err(|_| String::from_utf8_lossy(v.as_bytes()).to_string())
    })
}

fn ceil_secs(millis: f64) -> Duration {
    if millis <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs((millis / 1000.0).ceil() as u64)
    }
}

/// `"20"`, `"1.5s"`, `"250ms"`, `"6m0s"`, `"1h2m"`, `"2d"`. Bare numbers are seconds.
fn parse_duration_value(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        return (secs >= 0.0).then(|| ceil_secs(secs * 1000.0));
    }

    let mut total_ms = 0.0f64;
    let mut rest = value;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let number: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ms" => 1.0,
            "s" => 1000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            _ => return None,
        };
        total_ms += number * factor;
        rest = &rest[unit_len..];
    }
    Some(ceil_secs(total_ms))
}

fn until(target: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Work out how long `provider` should rest after a rate-limit response.
///
/// Order: `Retry-After` (seconds or HTTP-date), then `X-RateLimit-Reset`
/// (epoch seconds or a delay), then the smallest positive OpenAI-style reset
/// duration, then the provider default. A reset time already in the past
/// gives a zero window.
pub fn rate_limit_window(
    provider: Provider,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<Duration, RateLimitDecisionError> {
    let fail = |header: &str, value: &str| RateLimitDecisionError {
        provider,
        header: header.to_string(),
        value: value.to_string(),
    };

    if let Some(raw) = header_str(headers, "retry-after") {
        let value = raw.map_err(|v| fail("Retry-After", &v))?;
        if let Ok(secs) = value.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }
        return DateTime::parse_from_rfc2822(value)
            .map(|at| until(at.with_timezone(&Utc), now))
            .map_err(|_| fail("Retry-After", value));
    }

    if let Some(raw) = header_str(headers, "x-ratelimit-reset") {
        let value = raw.map_err(|v| fail("X-RateLimit-Reset", &v))?;
        if let Ok(n) = value.parse::<u64>() {
            if n >= EPOCH_THRESHOLD {
                let at = DateTime::from_timestamp(n as i64, 0).ok_or_else(|| fail("X-RateLimit-Reset", value))?;
                return Ok(until(at, now));
            }
        }
        return parse_duration_value(value).ok_or_else(|| fail("X-RateLimit-Reset", value));
    }

    let mut seen_any = false;
    let mut shortest: Option<Duration> = None;
    for name in ["x-ratelimit-reset-requests", "x-ratelimit-reset-tokens"] {
        if let Some(raw) = header_str(headers, name) {
            seen_any = true;
            let value = raw.map_err(|v| fail(name, &v))?;
            let window = parse_duration_value(value).ok_or_else(|| fail(name, value))?;
            if !window.is_zero() {
                shortest = Some(shortest.map_or(window, |s| s.min(window)));
            }
        }
    }
    if seen_any {
        return Ok(shortest.unwrap_or(Duration::ZERO));
    }

    Ok(provider.default_window())
}

/// `window * 2^(n-1)`, multiplier capped at 32, result capped at seven days.
pub fn backoff_for(window: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(31);
    let multiplier = 2u32.saturating_pow(exponent).min(MAX_MULTIPLIER);
    window.saturating_mul(multiplier).min(MAX_BACKOFF)
}

// ─── Limiter ─────────────────────────────────────────────

/// Per-provider failure and backoff bookkeeping.
///
/// Each provider's state is mutated under its own map shard lock, so counter
/// updates never interleave. Backoff expiry only makes a provider available
/// again; `consecutive_failures` is cleared solely by [`record_success`].
///
/// [`record_success`]: ProviderRateLimiter::record_success
pub struct ProviderRateLimiter {
    states: DashMap<Provider, ProviderState>,
    persist_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl ProviderRateLimiter {
    /// Load persisted state when `persist_path` points at a readable file.
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let states = DashMap::new();
        if let Some(path) = persist_path.as_ref().filter(|p| p.exists()) {
            match std::fs::read_to_string(path)
                .ok()
                .and_then(|data| serde_json::from_str::<BTreeMap<Provider, ProviderState>>(&data).ok())
            {
                Some(saved) => {
                    for (provider, state) in saved {
                        states.insert(provider, state);
                    }
                    tracing::info!("[LLM] restored rate-limit state from {}", path.display());
                }
                None => tracing::warn!("[LLM] ignoring unreadable rate-limit state at {}", path.display()),
            }
        }
        Self {
            states,
            persist_path,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn state(&self, provider: Provider) -> ProviderState {
        self.states.get(&provider).map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_available(&self, provider: Provider) -> bool {
        self.is_available_at(provider, Utc::now())
    }

    pub fn is_available_at(&self, provider: Provider, now: DateTime<Utc>) -> bool {
        let Some(state) = self.states.get(&provider) else {
            return true;
        };
        if state.in_backoff(now) {
            return false;
        }
        let today = now.date_naive();
        !(state.day == Some(today) && state.requests_today >= provider.daily_limit())
    }

    /// Count an outbound request against the daily budget.
    pub fn record_request(&self, provider: Provider) {
        let now = Utc::now();
        {
            let mut state = self.states.entry(provider).or_default();
            state.roll_day(now);
            state.requests_today += 1;
        }
        self.persist();
    }

    /// Put `provider` into backoff based on a 429's headers. Unparseable
    /// headers leave the state untouched and surface as an error.
    pub fn record_rate_limit(&self, provider: Provider, headers: &HeaderMap) -> Result<Duration, RateLimitDecisionError> {
        self.record_rate_limit_at(provider, headers, Utc::now())
    }

    pub fn record_rate_limit_at(
        &self,
        provider: Provider,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<Duration, RateLimitDecisionError> {
        let window = rate_limit_window(provider, headers, now)?;
        let backoff = {
            let mut state = self.states.entry(provider).or_default();
            state.consecutive_failures += 1;
            state.total_failures += 1;
            let backoff = backoff_for(window, state.consecutive_failures);
            state.backoff_secs = backoff.as_secs();
            state.next_retry = chrono::Duration::from_std(backoff).ok().map(|d| now + d);
            state.last_failure = Some(now);
            tracing::warn!(
                "[LLM] {provider} rate limited ({} consecutive); backing off {}s",
                state.consecutive_failures,
                backoff.as_secs()
            );
            backoff
        };
        self.persist();
        Ok(backoff)
    }

    pub fn record_success(&self, provider: Provider) {
        let now = Utc::now();
        {
            let mut state = self.states.entry(provider).or_default();
            if state.consecutive_failures > 0 {
                tracing::info!("[LLM] {provider} recovered after {} failures", state.consecutive_failures);
            }
            state.consecutive_failures = 0;
            state.backoff_secs = 0;
            state.next_retry = None;
            state.total_successes += 1;
            state.last_success = Some(now);
        }
        self.persist();
    }

    /// Write all states to disk (temp file + rename).
    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        // Snapshot under the lock so a later writer never loses to an older state.
        let _guard = self.persist_lock.lock();
        let snapshot: BTreeMap<Provider, ProviderState> =
            self.states.iter().map(|e| (*e.key(), e.value().clone())).collect();
        if let Ok(data) = serde_json::to_string_pretty(&snapshot) {
            let tmp_path = path.with_extension("json.tmp");
            let written = std::fs::write(&tmp_path, &data).and_then(|_| std::fs::rename(&tmp_path, path));
            if let Err(e) = written {
                tracing::warn!("[LLM] failed to persist rate-limit state to {}: {e}", path.display());
            }
        }
    }
}
