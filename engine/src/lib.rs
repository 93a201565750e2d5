//! Resumable LLM debate rollouts.
//!
//! ```text
//! RolloutEngine ── Debater / Judge ── CompletionDispatcher ── Provider ── RateResource
//!       │                                                        │
//!       └── CheckpointStore (one JSON file per example)          └── Backend (OpenAI, Anthropic)
//! ```

pub mod agents;
pub mod checkpoint;
pub mod llm;
pub mod rollout;
pub mod transcript;

pub use agents::{Debater, DebaterConfig, Judge, JudgeConfig, LanguageModelConfig, Method, TurnError};
pub use checkpoint::{CheckpointError, CheckpointStore, ResumePoint};
pub use llm::{CompletionDispatcher, CompletionRequest, DispatchError, ModelCatalog};
pub use rollout::{
    ExampleRow, Participants, RolloutConfig, RolloutEngine, RolloutError, RolloutKind,
    RolloutOutcome, SideJudges,
};
pub use transcript::{Answers, DebaterNames, Round, Side, Transcript, Utterance};
