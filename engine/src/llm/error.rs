//! Dispatch error taxonomy with retry classification.
//!
//! Callers can query `retry_category()` / `is_retriable()` without string
//! matching.
//!
//! | Category      | Retriable | Examples                                     |
//! |---------------|-----------|----------------------------------------------|
//! | Transient     | yes       | network failure, timeout, 5xx, decode error  |
//! | RateLimit     | yes       | HTTP 429                                     |
//! | Configuration | no        | unknown model, mixed providers, no provider  |
//! | Policy        | no        | too few valid candidates, retries exhausted  |

use std::fmt;

use thiserror::Error;

use super::provider::ProviderKind;
use super::resource::InsufficientCapacity;

/// Classification used by retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network or backend hiccup; retry with backoff.
    Transient,
    /// Provider rate limit; retry with backoff.
    RateLimit,
    /// Caller configuration error; never retried.
    Configuration,
    /// Deterministic policy outcome; never retried at the provider layer.
    Policy,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Configuration => write!(f, "configuration"),
            Self::Policy => write!(f, "policy"),
        }
    }
}

/// Errors raised while resolving, rate-limiting, and executing completions.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid model id: {0}")]
    InvalidModel(String),

    #[error("all model ids must be of the same provider type, got {kinds}")]
    MixedProvider { kinds: String },

    #[error("no provider registered for {0}")]
    ProviderUnavailable(ProviderKind),

    #[error("only found {valid} valid responses from {candidates} candidates")]
    InsufficientValidCompletions { valid: usize, candidates: usize },

    #[error("failed to get a response from {model_ids} after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        model_ids: String,
        attempts: u32,
        last_error: String,
    },

    #[error("prompt needs {required} tokens but the largest model capacity is {capacity}")]
    PromptTooLarge { required: u64, capacity: u64 },

    #[error("capacity probe for {model_id} failed: {reason}")]
    CapacityProbe { model_id: String, reason: String },

    #[error(transparent)]
    Capacity(#[from] InsufficientCapacity),

    #[error("call to {model_id} timed out after {secs}s")]
    Timeout { model_id: String, secs: u64 },

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed provider response: {0}")]
    Decode(String),

    #[error("transient provider error: {0}")]
    Transient(String),
}

impl DispatchError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::InvalidModel(_)
            | Self::MixedProvider { .. }
            | Self::ProviderUnavailable(_)
            | Self::PromptTooLarge { .. } => RetryCategory::Configuration,
            Self::InsufficientValidCompletions { .. } | Self::ExhaustedRetries { .. } => {
                RetryCategory::Policy
            }
            Self::Status { status: 429, .. } => RetryCategory::RateLimit,
            Self::Status { .. }
            | Self::CapacityProbe { .. }
            | Self::Capacity(_)
            | Self::Timeout { .. }
            | Self::Http(_)
            | Self::Decode(_)
            | Self::Transient(_) => RetryCategory::Transient,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }
}
