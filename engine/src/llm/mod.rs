//! Rate-limited LLM completion layer.
//!
//! ```text
//! CompletionDispatcher ──► Provider (per ProviderKind)
//!                            └─ RateLimitedProvider<B: Backend>
//!                                 ├─ RateResource × 2 per model id
//!                                 ├─ RetryPolicy
//!                                 └─ OpenAiBackend | AnthropicBackend
//! ```

pub mod anthropic;
pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod openai;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod types;

pub use anthropic::{AnthropicBackend, AnthropicSettings};
pub use catalog::{ModelCatalog, ModelSpec};
pub use dispatcher::{CompletionDispatcher, CompletionRequest, DEFAULT_MAX_ATTEMPTS};
pub use error::{DispatchError, RetryCategory};
pub use history::PromptHistory;
pub use openai::{OpenAiBackend, OpenAiSettings};
pub use provider::{
    Backend, ProbedLimits, Provider, ProviderKind, ProviderRequest, ProviderSettings,
    RateLimitedProvider, RawCompletion, RawResponse,
};
pub use resource::{InsufficientCapacity, RateResource};
pub use retry::RetryPolicy;
pub use types::{
    ChatMessage, CompletionResult, Prompt, Role, SamplingParams, ShortfallPolicy, StopReason,
    TokenLogprobs,
};
