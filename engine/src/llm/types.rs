//! Request and result types shared by providers and the dispatcher.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DispatchError;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

const HUMAN_TAG: &str = "\n\nHuman:";
const ASSISTANT_TAG: &str = "\n\nAssistant:";

/// A prompt in either chat form or raw completion form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Chat(Vec<ChatMessage>),
    Text(String),
}

impl Prompt {
    /// Total character count of all message contents.
    pub fn char_len(&self) -> usize {
        match self {
            Self::Chat(messages) => messages.iter().map(|m| m.content.len()).sum(),
            Self::Text(text) => text.len(),
        }
    }

    /// All contents joined by newlines.
    pub fn joined_text(&self) -> String {
        match self {
            Self::Chat(messages) => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Text(text) => text.clone(),
        }
    }

    /// Flatten into a single Human/Assistant prompt for completion-style models.
    ///
    /// A leading system message is merged into the first user message.
    pub fn to_single_prompt(&self) -> String {
        let messages = match self {
            Self::Text(text) => return text.clone(),
            Self::Chat(messages) => messages,
        };

        let mut merged: Vec<ChatMessage> = Vec::with_capacity(messages.len());
        let mut iter = messages.iter().peekable();
        if let (Some(first), Some(second)) = (messages.first(), messages.get(1)) {
            if first.role == Role::System && second.role == Role::User {
                merged.push(ChatMessage::user(format!(
                    "{} {}",
                    first.content, second.content
                )));
                iter.next();
                iter.next();
            }
        }
        merged.extend(iter.cloned());

        let mut prompt = String::new();
        let mut last_was_assistant = false;
        for message in &merged {
            last_was_assistant = message.role == Role::Assistant;
            let tag = if last_was_assistant {
                ASSISTANT_TAG
            } else {
                HUMAN_TAG
            };
            prompt.push_str(tag);
            prompt.push(' ');
            prompt.push_str(&message.content);
        }
        if !last_was_assistant {
            prompt.push_str(ASSISTANT_TAG);
        }
        prompt.trim().to_string()
    }
}

/// Append assistant text, extending the last message when it is already an assistant turn.
pub fn add_assistant_message(messages: &mut Vec<ChatMessage>, text: &str) {
    match messages.last_mut() {
        Some(last) if last.role == Role::Assistant => last.content.push_str(text),
        _ => messages.push(ChatMessage::assistant(text)),
    }
}

/// Normalized reason a completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    MaxTokens,
    StopSequence,
}

impl StopReason {
    /// Map a provider-native stop reason.
    pub fn from_provider(raw: &str) -> Result<Self, DispatchError> {
        match raw {
            "max_tokens" | "length" => Ok(Self::MaxTokens),
            "stop_sequence" | "stop" | "end_turn" => Ok(Self::StopSequence),
            other => Err(DispatchError::Decode(format!(
                "invalid stop reason: {other}"
            ))),
        }
    }
}

/// Top log-probabilities at one generated position.
pub type TokenLogprobs = BTreeMap<String, f64>;

/// One completion returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub model_id: String,
    pub completion: String,
    pub stop_reason: StopReason,
    /// Seconds from the start of the logical call, including rate-limit waits.
    pub duration_secs: f64,
    /// Seconds spent inside the network call.
    pub api_duration_secs: f64,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Vec<TokenLogprobs>>,
}

impl CompletionResult {
    /// Time spent waiting for capacity or retrying before the successful call.
    pub fn wait_secs(&self) -> f64 {
        (self.duration_secs - self.api_duration_secs).max(0.0)
    }

    /// Log-probabilities of the first generated position, when requested.
    pub fn first_logprobs(&self) -> Option<&TokenLogprobs> {
        self.logprobs.as_ref().and_then(|l| l.first())
    }
}

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Number of top log-probabilities to return per position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl SamplingParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn logprobs(mut self, k: u8) -> Self {
        self.logprobs = Some(k);
        self
    }
}

/// What to do when fewer than `n` candidates pass validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallPolicy {
    /// Fail with `InsufficientValidCompletions`.
    #[default]
    Error,
    /// Return only the valid completions.
    Continue,
    /// Fill up to `n` with invalid completions in original order.
    PadInvalids,
}

impl fmt::Display for ShortfallPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Continue => write!(f, "continue"),
            Self::PadInvalids => write!(f, "pad_invalids"),
        }
    }
}
