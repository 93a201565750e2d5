//! Debate participants: debaters and judges.
//!
//! Debaters never own judges. Best-of-N ranking and critique judges are
//! passed in per turn through [`TurnJudges`].

pub mod debater;
pub mod judge;
pub mod prompt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::llm::{CompletionRequest, DispatchError, Prompt, SamplingParams, DEFAULT_MAX_ATTEMPTS};
use crate::transcript::TranscriptError;

pub use debater::{Debater, DebaterConfig, QuoteMode, TurnJudges, TurnOutput, TOKEN_LIMIT_ARGUMENT};
pub use judge::{Decision, Judge, JudgeConfig, CLOSING_QUESTION};
pub use prompt::PromptTemplate;

/// Debate (two debaters) or consultancy (one consultant).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Debate,
    Consultancy,
}

/// Model and sampling settings shared by every agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageModelConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default)]
    pub min_words: usize,
    #[serde(default = "default_candidates")]
    pub num_candidates_per_completion: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_words() -> usize {
    10_000
}

fn default_candidates() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl LanguageModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: None,
            max_words: default_max_words(),
            min_words: 0,
            num_candidates_per_completion: default_candidates(),
            max_attempts: default_max_attempts(),
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams::new()
            .temperature(self.temperature)
            .top_p(self.top_p)
    }

    /// Request for one completion with this model's sampling settings.
    pub fn request(&self, prompt: Prompt) -> CompletionRequest {
        let request = CompletionRequest::new([self.model.as_str()], prompt)
            .max_attempts(self.max_attempts)
            .params(self.sampling());
        match self.max_tokens {
            Some(max_tokens) => request.max_tokens(max_tokens),
            None => request,
        }
    }
}

/// Failure of a single agent turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error("{count} responses are invalid, retry.")]
    ArgumentExtraction { count: usize },

    #[error("no <{tag}> tag in response")]
    MissingTag { tag: &'static str },

    #[error("expected {expected} {what}, got {got}")]
    BudgetMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("a {role} judge must be provided when {setting} is set")]
    MissingJudge {
        role: &'static str,
        setting: &'static str,
    },

    #[error("swap mismatch: {0}")]
    SwapMismatch(&'static str),
}

impl TurnError {
    /// Whether the rollout may record this as an incomplete example and move on.
    ///
    /// Checkpoint failures mean progress can no longer be made durable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Checkpoint(_))
    }
}
