//! Anthropic messages backend.
//!
//! Unmetered: no capacity probe, one sample per call. Concurrency is bounded
//! by the provider's in-flight semaphore instead of token buckets.

use std::env;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use super::error::DispatchError;
use super::provider::{Backend, ProbedLimits, ProviderKind, RawCompletion, RawResponse};
use super::types::{Prompt, Role, SamplingParams, StopReason};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 2000;
const ENV_BASE_URL: &str = "ANTHROPIC_BASE_URL";
const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone)]
pub struct AnthropicSettings {
    pub base_url: String,
    pub api_key: String,
    pub version: String,
}

impl AnthropicSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            version: DEFAULT_VERSION.to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            base_url: env::var(ENV_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            api_key: env::var(ENV_API_KEY).unwrap_or_default(),
            version: DEFAULT_VERSION.to_string(),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    settings: AnthropicSettings,
}

impl AnthropicBackend {
    pub fn new(settings: AnthropicSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(
        model_id: &str,
        prompt: &Prompt,
        max_tokens: Option<u32>,
        params: &SamplingParams,
    ) -> Value {
        let (system, messages) = split_system(prompt);
        let mut body = Map::new();
        body.insert("model".into(), json!(model_id));
        body.insert(
            "max_tokens".into(),
            json!(max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        body.insert("messages".into(), json!(messages));
        if let Some(system) = system {
            body.insert("system".into(), json!(system));
        }
        if let Some(t) = params.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if !params.stop.is_empty() {
            body.insert("stop_sequences".into(), json!(params.stop));
        }
        Value::Object(body)
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

/// System messages go to the top-level `system` field; the rest become turns.
fn split_system(prompt: &Prompt) -> (Option<String>, Vec<WireMessage>) {
    match prompt {
        Prompt::Text(text) => (
            None,
            vec![WireMessage {
                role: "user",
                content: text.clone(),
            }],
        ),
        Prompt::Chat(messages) => {
            let system: Vec<&str> = messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.as_str())
                .collect();
            let turns = messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| WireMessage {
                    role: if m.role == Role::Assistant {
                        "assistant"
                    } else {
                        "user"
                    },
                    content: m.content.clone(),
                })
                .collect();
            let system = (!system.is_empty()).then(|| system.join("\n\n"));
            (system, turns)
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn decode_messages(body: Value) -> Result<RawResponse, DispatchError> {
    let response: MessagesResponse =
        serde_json::from_value(body).map_err(|e| DispatchError::Decode(e.to_string()))?;
    let text: String = response
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text.as_deref())
        .collect();
    let usage = response.usage.unwrap_or_default();
    Ok(RawResponse {
        prompt_tokens: usage.input_tokens,
        completions: vec![RawCompletion {
            text,
            stop_reason: StopReason::from_provider(response.stop_reason.as_deref().unwrap_or_default())?,
            completion_tokens: usage.output_tokens,
            logprobs: None,
        }],
    })
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AnthropicChat
    }

    async fn probe_limits(&self, _model_id: &str) -> Result<Option<ProbedLimits>, DispatchError> {
        Ok(None)
    }

    fn estimate_tokens(&self, prompt: &Prompt, max_tokens: Option<u32>, _n: u32) -> u64 {
        let words = prompt.joined_text().split_whitespace().count() as u64;
        words + u64::from(max_tokens.unwrap_or(DEFAULT_MAX_TOKENS))
    }

    async fn call(
        &self,
        model_id: &str,
        prompt: &Prompt,
        max_tokens: Option<u32>,
        _n: u32,
        params: &SamplingParams,
    ) -> Result<RawResponse, DispatchError> {
        if params.logprobs.is_some() {
            warn!(model_id, "Log-probabilities are not available from this provider");
        }
        let url = format!("{}/messages", self.settings.base_url.trim_end_matches('/'));
        let body = Self::request_body(model_id, prompt, max_tokens, params);
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", &self.settings.version)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        decode_messages(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    #[test]
    fn test_system_messages_are_lifted() {
        let prompt = Prompt::Chat(vec![
            ChatMessage::system("You are a judge."),
            ChatMessage::user("Decide."),
            ChatMessage::assistant("<thinking>"),
        ]);
        let body = AnthropicBackend::request_body("claude-2.1", &prompt, None, &SamplingParams::new());
        assert_eq!(body["system"], json!("You are a judge."));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][1]["role"], json!("assistant"));
        assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn test_decode_joins_text_blocks() {
        let body = json!({
            "content": [
                { "type": "text", "text": "Hello " },
                { "type": "text", "text": "there" }
            ],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 9, "output_tokens": 2 }
        });
        let raw = decode_messages(body).unwrap();
        assert_eq!(raw.completions[0].text, "Hello there");
        assert_eq!(raw.completions[0].stop_reason, StopReason::StopSequence);
        assert_eq!(raw.prompt_tokens, 9);
    }

    #[tokio::test]
    async fn test_probe_is_unmetered() {
        let backend = AnthropicBackend::new(AnthropicSettings::new("k"));
        assert!(backend.probe_limits("claude-2.1").await.unwrap().is_none());
        assert!(!backend.kind().supports_batch());
    }
}
