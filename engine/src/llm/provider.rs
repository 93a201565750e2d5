//! Provider contract and the generic rate-limited provider.
//!
//! ```text
//! execute(request)
//!   ├─ discover limits (once per model id, under the discovery lock)
//!   ├─ estimate tokens; reject prompts no candidate model can admit
//!   └─ attempt 0..max_attempts
//!        ├─ acquire slot: cheapest model with request + token headroom
//!        │    (check+consume under the consumption lock, else poll)
//!        ├─ in-flight permit (unmetered backends only)
//!        └─ backend.call under timeout ── fail → sleep base^attempt
//! ```
//!
//! A [`Backend`] speaks one wire protocol. [`RateLimitedProvider`] wraps any
//! backend with the shared metering, retry, and audit behaviour.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::catalog::ModelCatalog;
use super::error::DispatchError;
use super::history::PromptHistory;
use super::resource::{InsufficientCapacity, RateResource, DEFAULT_WINDOW};
use super::retry::RetryPolicy;
use super::types::{CompletionResult, Prompt, SamplingParams, StopReason, TokenLogprobs};

/// Provider family, fixed per model id at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai_chat")]
    OpenAIChat,
    #[serde(rename = "openai_completion")]
    OpenAICompletion,
    AnthropicChat,
}

impl ProviderKind {
    /// Whether one call can return `n` samples.
    pub fn supports_batch(self) -> bool {
        !matches!(self, Self::AnthropicChat)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAIChat => write!(f, "openai_chat"),
            Self::OpenAICompletion => write!(f, "openai_completion"),
            Self::AnthropicChat => write!(f, "anthropic_chat"),
        }
    }
}

/// One logical provider call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Acceptable model ids; all must belong to the provider's family.
    pub model_ids: Vec<String>,
    pub prompt: Prompt,
    pub max_tokens: Option<u32>,
    /// Samples requested from a single call.
    pub n: u32,
    pub max_attempts: u32,
    pub params: SamplingParams,
}

/// Executes completion requests against one model family.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn supports_batch(&self) -> bool {
        self.kind().supports_batch()
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
    ) -> Result<Vec<CompletionResult>, DispatchError>;
}

// ── Backend ─────────────────────────────────────────────────────────────────

/// Rate limits reported by a capacity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbedLimits {
    pub token_limit: u64,
    pub request_limit: u64,
    pub tokens_remaining: u64,
    pub requests_remaining: u64,
}

/// One sample as returned by the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCompletion {
    pub text: String,
    pub stop_reason: StopReason,
    pub completion_tokens: u64,
    pub logprobs: Option<Vec<TokenLogprobs>>,
}

/// A decoded backend response.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub prompt_tokens: u64,
    pub completions: Vec<RawCompletion>,
}

/// Wire protocol for one provider family.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Discover rate limits for `model_id`. `None` means the backend is unmetered.
    async fn probe_limits(&self, model_id: &str) -> Result<Option<ProbedLimits>, DispatchError>;

    /// Token units a call will consume against the token bucket.
    fn estimate_tokens(&self, prompt: &Prompt, max_tokens: Option<u32>, n: u32) -> u64;

    /// Perform the network call. `n` is ignored by backends without batch sampling.
    async fn call(
        &self,
        model_id: &str,
        prompt: &Prompt,
        max_tokens: Option<u32>,
        n: u32,
        params: &SamplingParams,
    ) -> Result<RawResponse, DispatchError>;
}

/// Chat estimate: `max(20, floor(Σ(1 + len/4) + 5) + n * max_tokens)`.
pub fn estimate_chat_tokens(prompt: &Prompt, max_tokens: Option<u32>, n: u32) -> u64 {
    const BUFFER: f64 = 5.0;
    const MIN_TOKENS: u64 = 20;

    let prompt_tokens: f64 = match prompt {
        Prompt::Chat(messages) => messages
            .iter()
            .map(|m| 1.0 + m.content.len() as f64 / 4.0)
            .sum(),
        Prompt::Text(text) => 1.0 + text.len() as f64 / 4.0,
    };
    let completion = u64::from(n.max(1)) * u64::from(max_tokens.unwrap_or(15));
    MIN_TOKENS.max((prompt_tokens + BUFFER) as u64 + completion)
}

/// Text estimate: `len/4 + n * max_tokens`.
pub fn estimate_text_tokens(prompt: &Prompt, max_tokens: Option<u32>, n: u32) -> u64 {
    let prompt_tokens = (prompt.char_len() as u64).div_ceil(4);
    prompt_tokens + u64::from(n.max(1)) * u64::from(max_tokens.unwrap_or(15))
}

// ── Rate-limited provider ───────────────────────────────────────────────────

/// Tunables for [`RateLimitedProvider`].
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Fraction (< 1) of the probed limits actually used.
    pub safety_fraction: f64,
    pub call_timeout: Duration,
    /// Backoff curve between attempts. Its attempt budget caps the request's.
    pub retry: RetryPolicy,
    /// Sleep between headroom polls when every candidate is saturated.
    pub poll_interval: Duration,
    pub probe_attempts: u32,
    pub probe_delay: Duration,
    pub window: Duration,
    /// Concurrent call bound for unmetered backends.
    pub max_in_flight: Option<usize>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            safety_fraction: 0.99,
            call_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(10),
            probe_attempts: 8,
            probe_delay: Duration::from_secs(2),
            window: DEFAULT_WINDOW,
            max_in_flight: None,
        }
    }
}

#[derive(Debug)]
struct ModelLimits {
    requests: RateResource,
    tokens: RateResource,
}

impl ModelLimits {
    /// Take one request and `tokens` tokens if both buckets have headroom.
    fn reserve(&mut self, tokens: f64) -> Result<bool, InsufficientCapacity> {
        if !(self.requests.has_capacity(1.0) && self.tokens.has_capacity(tokens)) {
            return Ok(false);
        }
        self.requests.consume(1.0)?;
        self.tokens.consume(tokens)?;
        Ok(true)
    }
}

#[derive(Debug)]
enum Metering {
    Metered(ModelLimits),
    Unmetered,
}

/// Generic [`Provider`] adding metering, retry, timeout, and audit to a backend.
pub struct RateLimitedProvider<B> {
    backend: B,
    catalog: Arc<ModelCatalog>,
    settings: ProviderSettings,
    /// Consumption lock: limits are only mutated while held.
    limits: Mutex<HashMap<String, Metering>>,
    discovery: Mutex<()>,
    in_flight: Option<Semaphore>,
    history: Option<PromptHistory>,
}

impl<B: Backend> RateLimitedProvider<B> {
    pub fn new(backend: B, catalog: Arc<ModelCatalog>, settings: ProviderSettings) -> Self {
        let in_flight = settings.max_in_flight.map(|n| Semaphore::new(n.max(1)));
        Self {
            backend,
            catalog,
            settings,
            limits: Mutex::new(HashMap::new()),
            discovery: Mutex::new(()),
            in_flight,
            history: None,
        }
    }

    pub fn with_history(mut self, history: PromptHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current (request, token) headroom for a discovered metered model.
    pub async fn headroom(&self, model_id: &str) -> Option<(f64, f64)> {
        let mut limits = self.limits.lock().await;
        match limits.get_mut(model_id) {
            Some(Metering::Metered(l)) => Some((l.requests.available(), l.tokens.available())),
            _ => None,
        }
    }

    async fn discover(&self, model_ids: &[String]) -> Result<(), DispatchError> {
        let _guard = self.discovery.lock().await;
        for model_id in model_ids {
            if self.limits.lock().await.contains_key(model_id) {
                continue;
            }
            let metering = match self.probe_with_retry(model_id).await? {
                Some(probed) => Metering::Metered(self.limits_from_probe(model_id, probed)?),
                None => Metering::Unmetered,
            };
            self.limits.lock().await.insert(model_id.clone(), metering);
        }
        Ok(())
    }

    async fn probe_with_retry(
        &self,
        model_id: &str,
    ) -> Result<Option<ProbedLimits>, DispatchError> {
        let attempts = self.settings.probe_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.backend.probe_limits(model_id).await {
                Ok(probed) => return Ok(probed),
                Err(e) if attempt + 1 < attempts => {
                    warn!(model_id, attempt, error = %e, "Capacity probe failed, retrying");
                    tokio::time::sleep(self.settings.probe_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DispatchError::CapacityProbe {
                        model_id: model_id.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    fn limits_from_probe(
        &self,
        model_id: &str,
        probed: ProbedLimits,
    ) -> Result<ModelLimits, DispatchError> {
        let fraction = self.settings.safety_fraction;
        let token_cap = probed.token_limit as f64 * fraction;
        let request_cap = probed.request_limit as f64 * fraction;
        let tokens_used = probed.token_limit.saturating_sub(probed.tokens_remaining) as f64;
        let requests_used = probed
            .request_limit
            .saturating_sub(probed.requests_remaining) as f64;

        let mut tokens = RateResource::new(token_cap, self.settings.window);
        let mut requests = RateResource::new(request_cap, self.settings.window);
        tokens.consume(token_cap.min(tokens_used))?;
        requests.consume(request_cap.min(requests_used))?;

        info!(
            model_id,
            token_cap,
            request_cap,
            tokens_used,
            requests_used,
            "Discovered model capacity"
        );
        Ok(ModelLimits { requests, tokens })
    }

    /// Reject prompts that no candidate could ever admit.
    async fn check_admissible(
        &self,
        model_ids: &[String],
        token_count: u64,
    ) -> Result<(), DispatchError> {
        let limits = self.limits.lock().await;
        let mut largest = 0.0_f64;
        for model_id in model_ids {
            match limits.get(model_id) {
                Some(Metering::Metered(l)) => {
                    if l.requests.capacity() >= 1.0 {
                        largest = largest.max(l.tokens.capacity());
                    }
                }
                _ => return Ok(()),
            }
        }
        if largest >= token_count as f64 {
            Ok(())
        } else {
            Err(DispatchError::PromptTooLarge {
                required: token_count,
                capacity: largest as u64,
            })
        }
    }

    /// Cheapest model with headroom; consumes one request and `token_count` tokens.
    async fn acquire_slot(
        &self,
        model_ids: &[String],
        token_count: u64,
    ) -> Result<String, DispatchError> {
        let tokens = token_count as f64;
        loop {
            {
                let mut limits = self.limits.lock().await;
                for model_id in model_ids {
                    match limits.get_mut(model_id) {
                        Some(Metering::Metered(l)) => {
                            if l.reserve(tokens)? {
                                return Ok(model_id.clone());
                            }
                        }
                        _ => return Ok(model_id.clone()),
                    }
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn attempt(
        &self,
        model_ids: &[String],
        request: &ProviderRequest,
        token_count: u64,
        start: Instant,
    ) -> Result<Vec<CompletionResult>, DispatchError> {
        let model_id = self.acquire_slot(model_ids, token_count).await?;

        let _permit = match &self.in_flight {
            Some(sem) => Some(
                sem.acquire()
                    .await
                    .map_err(|_| DispatchError::Transient("in-flight limiter closed".into()))?,
            ),
            None => None,
        };

        let api_start = Instant::now();
        let call = self.backend.call(
            &model_id,
            &request.prompt,
            request.max_tokens,
            request.n,
            &request.params,
        );
        let response = tokio::time::timeout(self.settings.call_timeout, call)
            .await
            .map_err(|_| DispatchError::Timeout {
                model_id: model_id.clone(),
                secs: self.settings.call_timeout.as_secs(),
            })??;
        let api_duration_secs = api_start.elapsed().as_secs_f64();
        let duration_secs = start.elapsed().as_secs_f64();

        let spec = self.catalog.resolve(&model_id)?;
        debug!(model_id = %model_id, duration_secs, "Completed provider call");
        Ok(response
            .completions
            .into_iter()
            .map(|c| CompletionResult {
                model_id: model_id.clone(),
                cost: spec.cost(response.prompt_tokens, c.completion_tokens),
                completion: c.text,
                stop_reason: c.stop_reason,
                duration_secs,
                api_duration_secs,
                logprobs: c.logprobs,
            })
            .collect())
    }

    fn ordered_candidates(&self, model_ids: &[String]) -> Result<Vec<String>, DispatchError> {
        let kind = self.backend.kind();
        for model_id in model_ids {
            let other = self.catalog.kind_of(model_id)?;
            if other != kind {
                return Err(DispatchError::MixedProvider {
                    kinds: format!("{kind}, {other}"),
                });
            }
        }
        let mut ordered = model_ids.to_vec();
        ordered.sort_by(|a, b| {
            self.catalog
                .input_price(a)
                .total_cmp(&self.catalog.input_price(b))
        });
        ordered.dedup();
        Ok(ordered)
    }
}

#[async_trait]
impl<B: Backend> Provider for RateLimitedProvider<B> {
    fn kind(&self) -> ProviderKind {
        self.backend.kind()
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
    ) -> Result<Vec<CompletionResult>, DispatchError> {
        let start = Instant::now();
        if request.model_ids.is_empty() {
            return Err(DispatchError::InvalidModel(String::new()));
        }
        let model_ids = self.ordered_candidates(&request.model_ids)?;
        self.discover(&model_ids).await?;

        let token_count = self
            .backend
            .estimate_tokens(&request.prompt, request.max_tokens, request.n);
        self.check_admissible(&model_ids, token_count).await?;

        let history_file = self
            .history
            .as_ref()
            .and_then(|h| h.record_prompt(&request.prompt));

        let retry = &self.settings.retry;
        let max_attempts = request.max_attempts.min(retry.max_attempts).max(1);
        let mut last_error = String::new();
        for attempt in 0..max_attempts {
            match self.attempt(&model_ids, request, token_count, start).await {
                Ok(results) => {
                    if let (Some(history), Some(path)) = (&self.history, &history_file) {
                        history.record_responses(path, &results);
                    }
                    return Ok(results);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        category = %e.retry_category(),
                        error = %e,
                        "Provider call failed"
                    );
                    last_error = e.to_string();
                    if attempt.saturating_add(1) < max_attempts && retry.should_retry(attempt) {
                        tokio::time::sleep(retry.backoff_duration(attempt)).await;
                    }
                }
            }
        }

        Err(DispatchError::ExhaustedRetries {
            model_ids: model_ids.join(", "),
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::catalog::ModelSpec;
    use crate::llm::types::ChatMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(text: &str) -> RawResponse {
        RawResponse {
            prompt_tokens: 10,
            completions: vec![RawCompletion {
                text: text.to_string(),
                stop_reason: StopReason::StopSequence,
                completion_tokens: 5,
                logprobs: None,
            }],
        }
    }

    fn request(model_ids: &[&str], max_attempts: u32) -> ProviderRequest {
        ProviderRequest {
            model_ids: model_ids.iter().map(|s| s.to_string()).collect(),
            prompt: Prompt::Chat(vec![ChatMessage::user("hello")]),
            max_tokens: Some(10),
            n: 1,
            max_attempts,
            params: SamplingParams::default(),
        }
    }

    fn limits(token_limit: u64, tokens_remaining: u64) -> ProbedLimits {
        ProbedLimits {
            token_limit,
            request_limit: 100,
            tokens_remaining,
            requests_remaining: 100,
        }
    }

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(
            ModelCatalog::new()
                .register(
                    "gpt-4",
                    ModelSpec::new(ProviderKind::OpenAIChat).with_prices(0.01, 0.02),
                )
                .register(
                    "gpt-3.5-turbo",
                    ModelSpec::new(ProviderKind::OpenAIChat).with_prices(0.001, 0.002),
                ),
        )
    }

    fn chat_backend() -> MockBackend {
        let mut backend = MockBackend::new();
        backend.expect_kind().return_const(ProviderKind::OpenAIChat);
        backend.expect_estimate_tokens().returning(|_, _, _| 50);
        backend
    }

    #[tokio::test]
    async fn test_discovery_scales_and_consumes_probed_usage() {
        let mut backend = chat_backend();
        backend
            .expect_probe_limits()
            .times(1)
            .returning(|_| Ok(Some(limits(1_000, 900))));
        backend.expect_call().returning(|_, _, _, _, _| Ok(raw("ok")));

        let settings = ProviderSettings {
            safety_fraction: 0.5,
            ..ProviderSettings::default()
        };
        let provider = RateLimitedProvider::new(backend, catalog(), settings);
        provider.execute(&request(&["gpt-4"], 1)).await.unwrap();
        // Second call must not probe again (times(1) above).
        provider.execute(&request(&["gpt-4"], 1)).await.unwrap();

        let (requests, tokens) = provider.headroom("gpt-4").await.unwrap();
        // 500 cap − 100 already used − 2 × 50 consumed, plus a sliver of refill.
        assert!((300.0..301.0).contains(&tokens), "tokens={tokens}");
        assert!((48.0..49.0).contains(&requests), "requests={requests}");
    }

    #[tokio::test]
    async fn test_cheapest_model_is_used_first() {
        let mut backend = chat_backend();
        backend
            .expect_probe_limits()
            .returning(|_| Ok(Some(limits(10_000, 10_000))));
        backend
            .expect_call()
            .withf(|model_id, _, _, _, _| model_id.to_string() == "gpt-3.5-turbo")
            .returning(|_, _, _, _, _| Ok(raw("cheap")));

        let provider = RateLimitedProvider::new(backend, catalog(), ProviderSettings::default());
        let results = provider
            .execute(&request(&["gpt-4", "gpt-3.5-turbo"], 1))
            .await
            .unwrap();
        assert_eq!(results[0].model_id, "gpt-3.5-turbo");
        assert!((results[0].cost - (10.0 * 0.001 + 5.0 * 0.002)).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut backend = chat_backend();
        backend
            .expect_probe_limits()
            .returning(|_| Ok(Some(limits(10_000, 10_000))));
        backend.expect_call().returning(move |_, _, _, _, _| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DispatchError::Transient("overloaded".into()))
            } else {
                Ok(raw("third time"))
            }
        });

        let provider = RateLimitedProvider::new(backend, catalog(), ProviderSettings::default());
        let results = provider.execute(&request(&["gpt-4"], 5)).await.unwrap();
        assert_eq!(results[0].completion, "third time");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_reports_attempts() {
        let mut backend = chat_backend();
        backend
            .expect_probe_limits()
            .returning(|_| Ok(Some(limits(10_000, 10_000))));
        backend
            .expect_call()
            .times(3)
            .returning(|_, _, _, _, _| Err(DispatchError::Transient("down".into())));

        let provider = RateLimitedProvider::new(backend, catalog(), ProviderSettings::default());
        let err = provider.execute(&request(&["gpt-4"], 3)).await.unwrap_err();
        match err {
            DispatchError::ExhaustedRetries {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("down"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_caps_request_attempts() {
        let mut backend = chat_backend();
        backend
            .expect_probe_limits()
            .returning(|_| Ok(Some(limits(10_000, 10_000))));
        backend
            .expect_call()
            .times(1)
            .returning(|_, _, _, _, _| Err(DispatchError::Transient("down".into())));

        let settings = ProviderSettings {
            retry: RetryPolicy::new(1),
            ..ProviderSettings::default()
        };
        let provider = RateLimitedProvider::new(backend, catalog(), settings);
        let err = provider.execute(&request(&["gpt-4"], 4)).await.unwrap_err();
        assert!(
            matches!(err, DispatchError::ExhaustedRetries { attempts: 1, .. }),
            "{err}"
        );
    }

    #[test]
    fn test_reserve_takes_both_buckets_or_neither() {
        let window = Duration::from_secs(60);
        let mut l = ModelLimits {
            requests: RateResource::new(2.0, window),
            tokens: RateResource::new(100.0, window),
        };
        assert!(l.reserve(60.0).unwrap());
        assert!(l.tokens.available() < 41.0);
        assert!(l.requests.available() < 1.1);

        // Not enough tokens: the request bucket is left alone.
        assert!(!l.reserve(60.0).unwrap());
        assert!(l.requests.available() >= 1.0);
    }

    #[tokio::test]
    async fn test_prompt_too_large_fails_fast() {
        let mut backend = chat_backend();
        backend
            .expect_probe_limits()
            .returning(|_| Ok(Some(limits(40, 40))));
        backend.expect_call().never();

        let provider = RateLimitedProvider::new(backend, catalog(), ProviderSettings::default());
        let err = provider.execute(&request(&["gpt-4"], 3)).await.unwrap_err();
        assert!(matches!(err, DispatchError::PromptTooLarge { required: 50, .. }));
    }

    #[tokio::test]
    async fn test_foreign_model_id_is_rejected() {
        let mut backend = chat_backend();
        backend.expect_probe_limits().never();
        let provider = RateLimitedProvider::new(backend, catalog(), ProviderSettings::default());
        let err = provider
            .execute(&request(&["gpt-4", "claude-2.1"], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MixedProvider { .. }));
    }

    #[tokio::test]
    async fn test_unmetered_backend_skips_admission() {
        let mut backend = MockBackend::new();
        backend.expect_kind().return_const(ProviderKind::AnthropicChat);
        backend.expect_estimate_tokens().returning(|_, _, _| 1_000_000);
        backend.expect_probe_limits().returning(|_| Ok(None));
        backend.expect_call().returning(|_, _, _, _, _| Ok(raw("hi")));

        let settings = ProviderSettings {
            max_in_flight: Some(2),
            ..ProviderSettings::default()
        };
        let provider = RateLimitedProvider::new(backend, Arc::new(ModelCatalog::new()), settings);
        let results = provider.execute(&request(&["claude-2.1"], 1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(provider.headroom("claude-2.1").await.is_none());
    }

    #[test]
    fn test_chat_estimate_formula() {
        let prompt = Prompt::Chat(vec![ChatMessage::user("x".repeat(40))]);
        // 1 + 40/4 = 11, + 5 buffer = 16, + 2 × 100
        assert_eq!(estimate_chat_tokens(&prompt, Some(100), 2), 216);
        // Floor at 20 tokens.
        let tiny = Prompt::Chat(vec![ChatMessage::user("")]);
        assert_eq!(estimate_chat_tokens(&tiny, Some(1), 1), 20);
    }

    #[test]
    fn test_text_estimate_defaults_max_tokens() {
        let prompt = Prompt::Text("abcdefgh".into());
        assert_eq!(estimate_text_tokens(&prompt, None, 1), 2 + 15);
    }

    #[test]
    fn test_batch_support_by_kind() {
        assert!(ProviderKind::OpenAIChat.supports_batch());
        assert!(ProviderKind::OpenAICompletion.supports_batch());
        assert!(!ProviderKind::AnthropicChat.supports_batch());
    }
}
