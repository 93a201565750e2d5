//! Rollout engine: drives the agents through checkpointed steps.

pub mod config;
pub mod engine;
pub mod state;

pub use config::{RolloutConfig, RolloutKind, TokenLimitPolicy};
pub use engine::{
    ExampleRow, Participants, RolloutEngine, RolloutError, RolloutOutcome, SideJudges,
};
pub use state::{StepPhase, StepTracker, StepTransition, TransitionError};
