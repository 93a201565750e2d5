//! Wires configuration into providers, a dispatcher, and agents.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use debate_engine::agents::{Debater, DebaterConfig, Judge, PromptTemplate};
use debate_engine::llm::{
    AnthropicBackend, AnthropicSettings, Backend, CompletionDispatcher, ModelCatalog,
    OpenAiBackend, OpenAiSettings, PromptHistory, ProviderSettings, RateLimitedProvider,
};
use debate_engine::rollout::{Participants, SideJudges};
use debate_engine::transcript::Side;
use tracing::info;

use crate::config::{ApiConfig, RoleConfig, RunnerConfig};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

fn history(api: &ApiConfig) -> Result<Option<PromptHistory>> {
    let Some(dir) = &api.prompt_history_dir else {
        return Ok(None);
    };
    let history = PromptHistory::new(dir)
        .with_context(|| format!("Failed to create prompt history dir {}", dir.display()))?;
    if let Some(days) = api.prompt_history_max_age_days {
        let removed = history.prune_older_than(Duration::from_secs(days * SECS_PER_DAY));
        info!(removed, days, "Pruned prompt history");
    }
    Ok(Some(history))
}

fn provider<B: Backend>(
    backend: B,
    catalog: &Arc<ModelCatalog>,
    settings: ProviderSettings,
    history: Option<&PromptHistory>,
) -> RateLimitedProvider<B> {
    let provider = RateLimitedProvider::new(backend, catalog.clone(), settings);
    match history {
        Some(h) => provider.with_history(h.clone()),
        None => provider,
    }
}

/// Dispatcher with every provider family registered, keys read from the environment.
pub fn build_dispatcher(config: &RunnerConfig) -> Result<Arc<CompletionDispatcher>> {
    let catalog = Arc::new(config.catalog());
    let history = history(&config.api)?;

    let metered = ProviderSettings {
        safety_fraction: config.api.openai_fraction_rate_limit,
        ..ProviderSettings::default()
    };
    let unmetered = ProviderSettings {
        max_in_flight: Some(config.api.anthropic_num_threads),
        ..ProviderSettings::default()
    };

    let openai = OpenAiSettings::from_env();
    let history = history.as_ref();
    let dispatcher = CompletionDispatcher::new(catalog.clone())
        .register(Arc::new(provider(
            OpenAiBackend::chat(openai.clone()),
            &catalog,
            metered.clone(),
            history,
        )))
        .register(Arc::new(provider(
            OpenAiBackend::completion(openai),
            &catalog,
            metered,
            history,
        )))
        .register(Arc::new(provider(
            AnthropicBackend::new(AnthropicSettings::from_env()),
            &catalog,
            unmetered,
            history,
        )));
    Ok(Arc::new(dispatcher))
}

fn judge(
    config: &RunnerConfig,
    role: Option<&RoleConfig>,
    default_prompts: fn() -> PromptTemplate,
    dispatcher: &Arc<CompletionDispatcher>,
) -> Option<Judge> {
    role.map(|r| {
        Judge::new(
            config.method,
            r.judge_config(default_prompts),
            dispatcher.clone(),
        )
    })
}

fn side_judges(config: &RunnerConfig, dispatcher: &Arc<CompletionDispatcher>) -> SideJudges {
    let agents = &config.agents;
    SideJudges {
        bon: judge(config, agents.preference.as_ref(), PromptTemplate::judge, dispatcher),
        critic: judge(config, agents.critic.as_ref(), PromptTemplate::critic, dispatcher),
        critique_pm: judge(
            config,
            agents.critique_preference.as_ref(),
            PromptTemplate::critique_preference,
            dispatcher,
        ),
    }
}

/// Debaters, cross-examiner, and the judges each debater borrows.
pub fn build_participants(
    config: &RunnerConfig,
    dispatcher: &Arc<CompletionDispatcher>,
) -> Participants {
    let agents = &config.agents;
    let debater = |side: Side, cfg: &DebaterConfig| {
        Debater::new(side, config.method, cfg.clone(), dispatcher.clone())
    };
    Participants {
        correct: agents.correct.as_ref().map(|c| debater(Side::Correct, c)),
        incorrect: agents.incorrect.as_ref().map(|c| debater(Side::Incorrect, c)),
        cross_examiner: judge(
            config,
            agents.cross_examiner.as_ref(),
            PromptTemplate::cross_examiner,
            dispatcher,
        ),
        correct_judges: side_judges(config, dispatcher),
        incorrect_judges: side_judges(config, dispatcher),
    }
}

/// The decision judge, when one is configured.
pub fn build_judge(config: &RunnerConfig, dispatcher: &Arc<CompletionDispatcher>) -> Option<Judge> {
    judge(config, config.agents.judge.as_ref(), PromptTemplate::judge, dispatcher)
}
