//! OpenAI chat and completion backends over `reqwest`.
//!
//! Capacity is discovered from the `x-ratelimit-*` headers of a one-token
//! request; every later call is metered locally by the provider.

use std::collections::BTreeMap;
use std::env;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::error::DispatchError;
use super::provider::{
    estimate_chat_tokens, estimate_text_tokens, Backend, ProbedLimits, ProviderKind,
    RawCompletion, RawResponse,
};
use super::types::{ChatMessage, Prompt, SamplingParams, StopReason, TokenLogprobs};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const ENV_BASE_URL: &str = "OPENAI_BASE_URL";
const ENV_API_KEY: &str = "OPENAI_API_KEY";
const ENV_ORGANIZATION: &str = "OPENAI_ORGANIZATION";

const LIMIT_TOKENS: &str = "x-ratelimit-limit-tokens";
const LIMIT_REQUESTS: &str = "x-ratelimit-limit-requests";
const REMAINING_TOKENS: &str = "x-ratelimit-remaining-tokens";
const REMAINING_REQUESTS: &str = "x-ratelimit-remaining-requests";

/// Connection settings shared by both OpenAI backends.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub organization: Option<String>,
}

impl OpenAiSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            organization: None,
        }
    }

    /// Settings from `OPENAI_API_KEY`, `OPENAI_ORGANIZATION`, `OPENAI_BASE_URL`.
    pub fn from_env() -> Self {
        Self {
            base_url: env::var(ENV_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            api_key: env::var(ENV_API_KEY).unwrap_or_default(),
            organization: env::var(ENV_ORGANIZATION).ok(),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }
}

/// Backend for `/chat/completions` or `/completions`, chosen at construction.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    kind: ProviderKind,
    settings: OpenAiSettings,
}

impl OpenAiBackend {
    pub fn chat(settings: OpenAiSettings) -> Self {
        Self::with_kind(ProviderKind::OpenAIChat, settings)
    }

    pub fn completion(settings: OpenAiSettings) -> Self {
        Self::with_kind(ProviderKind::OpenAICompletion, settings)
    }

    fn with_kind(kind: ProviderKind, settings: OpenAiSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            kind,
            settings,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        match self.kind {
            ProviderKind::OpenAICompletion => format!("{base}/completions"),
            _ => format!("{base}/chat/completions"),
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, DispatchError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(body);
        if let Some(org) = &self.settings.organization {
            request = request.header("OpenAI-Organization", org);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn request_body(
        &self,
        model_id: &str,
        prompt: &Prompt,
        max_tokens: Option<u32>,
        n: u32,
        params: &SamplingParams,
    ) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(model_id));
        body.insert("n".into(), json!(n.max(1)));
        match self.kind {
            ProviderKind::OpenAICompletion => {
                body.insert("prompt".into(), json!(prompt.to_single_prompt()));
                if let Some(k) = params.logprobs {
                    body.insert("logprobs".into(), json!(k));
                }
            }
            _ => {
                body.insert("messages".into(), json!(chat_messages(prompt)));
                if let Some(k) = params.logprobs {
                    body.insert("logprobs".into(), json!(true));
                    body.insert("top_logprobs".into(), json!(k));
                }
            }
        }
        if let Some(max_tokens) = max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(t) = params.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if !params.stop.is_empty() {
            body.insert("stop".into(), json!(params.stop));
        }
        Value::Object(body)
    }
}

fn chat_messages(prompt: &Prompt) -> Vec<ChatMessage> {
    match prompt {
        Prompt::Chat(messages) => messages.clone(),
        Prompt::Text(text) => vec![ChatMessage::user(text.clone())],
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<u64, String> {
    let value = headers
        .get(name)
        .ok_or_else(|| format!("missing {name} header"))?;
    value
        .to_str()
        .map_err(|e| e.to_string())?
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("{name}: {e}"))
}

/// Parse the four rate-limit headers.
pub fn limits_from_headers(headers: &HeaderMap) -> Result<ProbedLimits, String> {
    Ok(ProbedLimits {
        token_limit: header_u64(headers, LIMIT_TOKENS)?,
        request_limit: header_u64(headers, LIMIT_REQUESTS)?,
        tokens_remaining: header_u64(headers, REMAINING_TOKENS)?,
        requests_remaining: header_u64(headers, REMAINING_REQUESTS)?,
    })
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
    #[serde(default)]
    logprobs: Option<ChatLogprobs>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatLogprobs {
    #[serde(default)]
    content: Option<Vec<ChatTokenLogprob>>,
}

#[derive(Debug, Deserialize)]
struct ChatTokenLogprob {
    #[serde(default)]
    top_logprobs: Vec<TopLogprob>,
}

#[derive(Debug, Deserialize)]
struct TopLogprob {
    token: String,
    logprob: f64,
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    choices: Vec<TextChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct TextChoice {
    text: String,
    finish_reason: Option<String>,
    #[serde(default)]
    logprobs: Option<TextLogprobs>,
}

#[derive(Debug, Deserialize)]
struct TextLogprobs {
    #[serde(default)]
    top_logprobs: Option<Vec<BTreeMap<String, f64>>>,
}

fn stop_reason(raw: Option<&str>) -> Result<StopReason, DispatchError> {
    StopReason::from_provider(raw.unwrap_or_default())
}

fn per_choice(total: u64, choices: usize) -> u64 {
    if choices == 0 {
        0
    } else {
        total / choices as u64
    }
}

fn decode_chat(body: Value) -> Result<RawResponse, DispatchError> {
    let response: ChatResponse =
        serde_json::from_value(body).map_err(|e| DispatchError::Decode(e.to_string()))?;
    let usage = response.usage.unwrap_or_default();
    let each = per_choice(usage.completion_tokens, response.choices.len());
    let completions = response
        .choices
        .into_iter()
        .map(|choice| {
            let logprobs = choice.logprobs.and_then(|l| l.content).map(|positions| {
                positions
                    .into_iter()
                    .map(|p| {
                        p.top_logprobs
                            .into_iter()
                            .map(|t| (t.token, t.logprob))
                            .collect::<TokenLogprobs>()
                    })
                    .collect()
            });
            Ok(RawCompletion {
                text: choice.message.content.unwrap_or_default(),
                stop_reason: stop_reason(choice.finish_reason.as_deref())?,
                completion_tokens: each,
                logprobs,
            })
        })
        .collect::<Result<Vec<_>, DispatchError>>()?;
    Ok(RawResponse {
        prompt_tokens: usage.prompt_tokens,
        completions,
    })
}

fn decode_text(body: Value) -> Result<RawResponse, DispatchError> {
    let response: TextResponse =
        serde_json::from_value(body).map_err(|e| DispatchError::Decode(e.to_string()))?;
    let usage = response.usage.unwrap_or_default();
    let each = per_choice(usage.completion_tokens, response.choices.len());
    let completions = response
        .choices
        .into_iter()
        .map(|choice| {
            Ok(RawCompletion {
                text: choice.text,
                stop_reason: stop_reason(choice.finish_reason.as_deref())?,
                completion_tokens: each,
                logprobs: choice.logprobs.and_then(|l| l.top_logprobs),
            })
        })
        .collect::<Result<Vec<_>, DispatchError>>()?;
    Ok(RawResponse {
        prompt_tokens: usage.prompt_tokens,
        completions,
    })
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn probe_limits(&self, model_id: &str) -> Result<Option<ProbedLimits>, DispatchError> {
        let body = match self.kind {
            ProviderKind::OpenAICompletion => {
                json!({ "model": model_id, "prompt": "a", "max_tokens": 1 })
            }
            _ => json!({
                "model": model_id,
                "messages": [{ "role": "user", "content": "Say 1" }],
                "max_tokens": 1,
            }),
        };
        let response = self.post(&body).await?;
        let limits =
            limits_from_headers(response.headers()).map_err(|reason| DispatchError::CapacityProbe {
                model_id: model_id.to_string(),
                reason,
            })?;
        debug!(model_id, ?limits, "Probed rate-limit headers");
        Ok(Some(limits))
    }

    fn estimate_tokens(&self, prompt: &Prompt, max_tokens: Option<u32>, n: u32) -> u64 {
        match self.kind {
            ProviderKind::OpenAICompletion => estimate_text_tokens(prompt, max_tokens, n),
            _ => estimate_chat_tokens(prompt, max_tokens, n),
        }
    }

    async fn call(
        &self,
        model_id: &str,
        prompt: &Prompt,
        max_tokens: Option<u32>,
        n: u32,
        params: &SamplingParams,
    ) -> Result<RawResponse, DispatchError> {
        let body = self.request_body(model_id, prompt, max_tokens, n, params);
        let response = self.post(&body).await?;
        let value: Value = response.json().await?;
        match self.kind {
            ProviderKind::OpenAICompletion => decode_text(value),
            _ => decode_chat(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_limits_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(LIMIT_TOKENS, HeaderValue::from_static("90000"));
        headers.insert(LIMIT_REQUESTS, HeaderValue::from_static("3500"));
        headers.insert(REMAINING_TOKENS, HeaderValue::from_static("89000"));
        headers.insert(REMAINING_REQUESTS, HeaderValue::from_static("3499"));
        let limits = limits_from_headers(&headers).unwrap();
        assert_eq!(limits.token_limit, 90_000);
        assert_eq!(limits.requests_remaining, 3_499);
    }

    #[test]
    fn test_missing_header_is_reported() {
        let err = limits_from_headers(&HeaderMap::new()).unwrap_err();
        assert!(err.contains(LIMIT_TOKENS));
    }

    #[test]
    fn test_chat_body_maps_logprobs() {
        let backend = OpenAiBackend::chat(OpenAiSettings::new("k"));
        let body = backend.request_body(
            "gpt-4",
            &Prompt::Text("hi".into()),
            Some(5),
            3,
            &SamplingParams::new().logprobs(5).temperature(0.2),
        );
        assert_eq!(body["logprobs"], json!(true));
        assert_eq!(body["top_logprobs"], json!(5));
        assert_eq!(body["n"], json!(3));
        assert_eq!(body["messages"][0]["role"], json!("user"));
    }

    #[test]
    fn test_completion_body_flattens_chat() {
        let backend = OpenAiBackend::completion(OpenAiSettings::new("k"));
        let body = backend.request_body(
            "davinci-002",
            &Prompt::Chat(vec![ChatMessage::user("Q")]),
            None,
            1,
            &SamplingParams::new().logprobs(5),
        );
        assert_eq!(body["prompt"], json!("Human: Q\n\nAssistant:"));
        assert_eq!(body["logprobs"], json!(5));
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_decode_chat_with_logprobs() {
        let body = json!({
            "choices": [{
                "message": { "content": "A" },
                "finish_reason": "stop",
                "logprobs": { "content": [{
                    "token": "A",
                    "logprob": -0.1,
                    "top_logprobs": [
                        { "token": "A", "logprob": -0.1 },
                        { "token": "B", "logprob": -2.4 }
                    ]
                }]}
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 1 }
        });
        let raw = decode_chat(body).unwrap();
        assert_eq!(raw.prompt_tokens, 12);
        let first = &raw.completions[0].logprobs.as_ref().unwrap()[0];
        assert_eq!(first.get("B"), Some(&-2.4));
    }

    #[test]
    fn test_decode_text_length_stop() {
        let body = json!({
            "choices": [{ "text": "abc", "finish_reason": "length", "logprobs": null }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 16 }
        });
        let raw = decode_text(body).unwrap();
        assert_eq!(raw.completions[0].stop_reason, StopReason::MaxTokens);
        assert_eq!(raw.completions[0].completion_tokens, 16);
    }
}
