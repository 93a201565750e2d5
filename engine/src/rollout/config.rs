use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RolloutKind {
    /// Both debaters answer the same prompt each step.
    #[serde(rename = "quality_sim")]
    Simultaneous,
    /// The second debater sees the first debater's argument from the same step.
    #[serde(rename = "quality_seq")]
    Sequential,
}

impl RolloutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simultaneous => "quality_sim",
            Self::Sequential => "quality_seq",
        }
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, Self::Sequential)
    }
}

impl fmt::Display for RolloutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a simultaneous round shows once a debater ran out of prompt budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimitPolicy {
    /// Both sides show the round-ended sentinel.
    #[default]
    OverrideBoth,
    /// The opponent's argument for the round is kept.
    KeepOpponent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub rollout_type: RolloutKind,
    pub num_steps: usize,
    pub name1: String,
    pub name2: String,
    #[serde(default)]
    pub consultant_name: Option<String>,
    #[serde(default)]
    pub cross_examiner_name: Option<String>,
    #[serde(default)]
    pub judge_name: Option<String>,
    #[serde(default)]
    pub token_limit_policy: TokenLimitPolicy,
}

impl RolloutConfig {
    pub fn new(rollout_type: RolloutKind, num_steps: usize) -> Self {
        Self {
            rollout_type,
            num_steps,
            name1: "Debater A".to_string(),
            name2: "Debater B".to_string(),
            consultant_name: None,
            cross_examiner_name: None,
            judge_name: None,
            token_limit_policy: TokenLimitPolicy::default(),
        }
    }

    pub fn cross_examiner_name(mut self, name: impl Into<String>) -> Self {
        self.cross_examiner_name = Some(name.into());
        self
    }

    pub fn consultant_name(mut self, name: impl Into<String>) -> Self {
        self.consultant_name = Some(name.into());
        self
    }

    pub fn token_limit_policy(mut self, policy: TokenLimitPolicy) -> Self {
        self.token_limit_policy = policy;
        self
    }
}
