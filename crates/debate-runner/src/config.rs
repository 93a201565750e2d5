//! Runner configuration, loaded from TOML with environment overrides.
//!
//! ```toml
//! dataset = "data/quality_val.jsonl"
//! method = "debate"
//!
//! [rollout]
//! rollout_type = "quality_sim"
//! num_steps = 3
//! name1 = "Debater A"
//! name2 = "Debater B"
//!
//! [agents.correct]
//! BoN = 4
//! language_model = { model = "gpt-4-1106-preview", max_words = 150 }
//!
//! [agents.preference]
//! language_model = { model = "gpt-4-1106-preview" }
//! ```

use std::io;
use std::path::{Path, PathBuf};

use debate_engine::agents::{DebaterConfig, JudgeConfig, LanguageModelConfig, Method, PromptTemplate};
use debate_engine::llm::{ModelCatalog, ModelSpec, ProviderKind};
use debate_engine::rollout::RolloutConfig;
use serde::Deserialize;
use thiserror::Error;

const ENV_NUM_THREADS: &str = "DEBATE_NUM_THREADS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// JSON Lines dataset, rewritten in place with results.
    pub dataset: PathBuf,
    /// Checkpoint directory; defaults to `<dataset dir>/cache_<dataset stem>`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Only the first `limit` rows are processed.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub method: Method,
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub agents: AgentConfigs,
    /// Extra passes over still-incomplete rows.
    #[serde(default = "default_batch_retries")]
    pub batch_retries: usize,
}

fn default_batch_retries() -> usize {
    2
}

/// Provider-side tunables. Keys and endpoints come from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Share of the probed OpenAI rate limits to use.
    #[serde(default = "default_fraction")]
    pub openai_fraction_rate_limit: f64,
    /// Concurrent examples, divided by the largest BoN.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Concurrent Anthropic calls.
    #[serde(default = "default_num_threads")]
    pub anthropic_num_threads: usize,
    /// Directory for the prompt/response audit log.
    #[serde(default)]
    pub prompt_history_dir: Option<PathBuf>,
    #[serde(default)]
    pub prompt_history_max_age_days: Option<u64>,
}

fn default_fraction() -> f64 {
    0.99
}

fn default_num_threads() -> usize {
    10
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            openai_fraction_rate_limit: default_fraction(),
            num_threads: default_num_threads(),
            anthropic_num_threads: default_num_threads(),
            prompt_history_dir: None,
            prompt_history_max_age_days: None,
        }
    }
}

/// Explicit model registration; unlisted ids fall back to family rules.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
}

/// Judge-like role whose prompt template defaults per role.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    pub language_model: LanguageModelConfig,
    #[serde(default)]
    pub prompts: Option<PromptTemplate>,
    #[serde(default)]
    pub use_logprobs: bool,
    #[serde(default)]
    pub prompt_token_limit: Option<u64>,
}

impl RoleConfig {
    pub fn judge_config(&self, default_prompts: fn() -> PromptTemplate) -> JudgeConfig {
        JudgeConfig {
            language_model: self.language_model.clone(),
            prompts: self.prompts.clone().unwrap_or_else(default_prompts),
            use_logprobs: self.use_logprobs,
            prompt_token_limit: self.prompt_token_limit,
        }
    }
}

/// Every agent role. Absent roles are not run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfigs {
    #[serde(default)]
    pub correct: Option<DebaterConfig>,
    #[serde(default)]
    pub incorrect: Option<DebaterConfig>,
    #[serde(default)]
    pub cross_examiner: Option<RoleConfig>,
    /// Rates Best-of-N candidates.
    #[serde(default)]
    pub preference: Option<RoleConfig>,
    #[serde(default)]
    pub critic: Option<RoleConfig>,
    #[serde(default)]
    pub critique_preference: Option<RoleConfig>,
    /// Final decision judge.
    #[serde(default)]
    pub judge: Option<RoleConfig>,
}

impl AgentConfigs {
    fn debaters(&self) -> impl Iterator<Item = &DebaterConfig> {
        self.correct.iter().chain(self.incorrect.iter())
    }

    /// Largest Best-of-N across debaters, at least 1.
    pub fn max_bon(&self) -> usize {
        self.debaters().map(|d| d.bon).max().unwrap_or(1).max(1)
    }
}

impl RunnerConfig {
    /// Read, parse, apply environment overrides, and validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env(&mut self) {
        if let Some(threads) = std::env::var(ENV_NUM_THREADS)
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.api.num_threads = threads;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.api.openai_fraction_rate_limit;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "openai_fraction_rate_limit must be in (0, 1), got {fraction}"
            )));
        }
        let agents = &self.agents;
        if agents.correct.is_none() && agents.incorrect.is_none() && agents.cross_examiner.is_none()
        {
            return Err(ConfigError::Invalid(
                "at least one debater or a cross-examiner must be configured".into(),
            ));
        }
        for debater in agents.debaters() {
            if debater.bon < 1 {
                return Err(ConfigError::Invalid("BoN must be at least 1".into()));
            }
            if debater.bon > 1 && agents.preference.is_none() {
                return Err(ConfigError::Invalid(
                    "BoN > 1 needs a preference judge".into(),
                ));
            }
            if debater.cbon > 0 && (agents.critic.is_none() || agents.critique_preference.is_none())
            {
                return Err(ConfigError::Invalid(
                    "cBoN > 0 needs a critic and a critique preference judge".into(),
                ));
            }
        }
        Ok(())
    }

    /// Checkpoint directory for the plain or swapped pass.
    pub fn cache_dir(&self, swap: bool) -> PathBuf {
        let base = self.cache_dir.clone().unwrap_or_else(|| {
            let stem = self
                .dataset
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.dataset
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(format!("cache_{stem}"))
        });
        if swap {
            let mut name = base.file_name().unwrap_or_default().to_os_string();
            name.push("_swap");
            base.with_file_name(name)
        } else {
            base
        }
    }

    pub fn catalog(&self) -> ModelCatalog {
        self.models.iter().fold(ModelCatalog::new(), |catalog, m| {
            catalog.register(
                m.id.clone(),
                ModelSpec::new(m.kind).with_prices(m.input_price, m.output_price),
            )
        })
    }
}
