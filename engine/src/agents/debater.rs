//! Debater turn logic.
//!
//! ```text
//! take_turn
//!   ├─ responses_<side>   cached, else BoN completions (all must carry <argument>)
//!   ├─ BoN > 1            rate each via the preference judge, keep the first max
//!   ├─ extract + truncate to max_words (never inside an open quote)
//!   └─ cBoN > 0
//!        ├─ critiques_<side>   cached, else cBoN critiques; pick via critique judge
//!        ├─ refinement_<side>  cached, else BoN refinements; pick via preference judge
//!        └─ malformed refinement → keep the pre-refinement argument
//! ```

use std::sync::{Arc, LazyLock};

use futures::future::try_join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::judge::Judge;
use super::prompt::{self, fill_placeholders, PromptTemplate};
use super::{LanguageModelConfig, Method, TurnError};
use crate::checkpoint::CheckpointStore;
use crate::llm::types::add_assistant_message;
use crate::llm::{ChatMessage, CompletionDispatcher, Prompt, ShortfallPolicy};
use crate::transcript::{Side, Transcript};

/// Sentinel argument used once a debater's prompt no longer fits its model.
pub const TOKEN_LIMIT_ARGUMENT: &str =
    "Round ended so no comment made. Judge - do not count this round.";

const TRUNCATION_MARKER: &str = "... <TRUNCATED>";
const QUOTE_TAGS: [&str; 3] = ["quote", "u_quote", "v_quote"];

static DOUBLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*""#).expect("DOUBLE_QUOTED regex should compile"));
static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"  +").expect("MULTI_SPACE regex should compile"));
static QUOTE_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<quote>.*?</quote>").expect("QUOTE_SPAN regex should compile")
});

/// How quotes in extracted arguments are shown to other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteMode {
    Normal,
    /// Strip double-quoted spans.
    None,
    /// Keep only `<quote>` spans.
    Only,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebaterConfig {
    pub language_model: LanguageModelConfig,
    #[serde(default = "PromptTemplate::debater")]
    pub prompts: PromptTemplate,
    /// Best-of-N candidates per turn.
    #[serde(rename = "BoN", alias = "bon", default = "one")]
    pub bon: usize,
    /// Critiques per refinement cycle; 0 disables refinement.
    #[serde(rename = "cBoN", alias = "cbon", default)]
    pub cbon: usize,
    #[serde(default, alias = "transcript_quotes")]
    pub quote_mode: Option<QuoteMode>,
    /// Above this estimated prompt size the debater concedes the round.
    #[serde(default)]
    pub prompt_token_limit: Option<u64>,
}

impl DebaterConfig {
    pub fn new(language_model: LanguageModelConfig) -> Self {
        Self {
            language_model,
            prompts: PromptTemplate::debater(),
            bon: 1,
            cbon: 0,
            quote_mode: None,
            prompt_token_limit: None,
        }
    }

    pub fn bon(mut self, bon: usize) -> Self {
        self.bon = bon;
        self
    }

    pub fn cbon(mut self, cbon: usize) -> Self {
        self.cbon = cbon;
        self
    }
}

/// Judges lent to a debater for one turn.
#[derive(Clone, Copy, Default)]
pub struct TurnJudges<'a> {
    pub bon: Option<&'a Judge>,
    pub critic: Option<&'a Judge>,
    pub critique_pm: Option<&'a Judge>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    /// Final, truncated argument committed to the round.
    pub argument: String,
    /// Ranked candidates, critique, and refinement for the responses list.
    pub audit: String,
}

pub struct Debater {
    side: Side,
    method: Method,
    config: DebaterConfig,
    dispatcher: Arc<CompletionDispatcher>,
}

impl Debater {
    pub fn new(
        side: Side,
        method: Method,
        config: DebaterConfig,
        dispatcher: Arc<CompletionDispatcher>,
    ) -> Self {
        if config.bon > 1 {
            info!(side = %side, bon = config.bon, "Using best-of-N");
        }
        Self {
            side,
            method,
            config,
            dispatcher,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn config(&self) -> &DebaterConfig {
        &self.config
    }

    // ── Prompt construction ────────────────────────────────────────────────

    fn placeholder(&self, t: &Transcript, name: &str) -> Option<String> {
        let side = self.side;
        let opponent = side.opponent();
        let own_args = t.arguments(side).len();
        let value = match name {
            "QUESTION" => t.question.clone(),
            "STORY" => t.story.clone().unwrap_or_default(),
            "NAME" => t.name(side).unwrap_or_default().to_string(),
            "OPPONENT_NAME" => t.name(opponent).unwrap_or_default().to_string(),
            "ANSWER_DEFENDING" => t.answer(side).trim().to_string(),
            "ANSWER_OPPOSING" => t.answer(opponent).trim().to_string(),
            "ANSWER_DEFENDING_LETTER" => t.letter(side).to_string(),
            "ANSWER_OPPOSING_LETTER" => t.letter(opponent).to_string(),
            "ANSWER_A" => t.answer_a().to_string(),
            "ANSWER_B" => t.answer_b().to_string(),
            "TRANSCRIPT" => prompt::render_for_debater(t, side, self.method),
            "TRANSCRIPT_MESSAGE" if t.rounds().is_empty() => String::new(),
            "TRANSCRIPT_MESSAGE" => self.fill(self.config.prompts.partial("transcript"), t),
            "NEW_ARGUMENT_REQUEST" => {
                let partial = if own_args == 0 {
                    "opening_argument_request"
                } else {
                    "nth_argument_request"
                };
                self.fill(self.config.prompts.partial(partial), t)
            }
            "THINKING_ADVICE" => {
                let partial = match own_args {
                    0 => "first_round_thinking",
                    1 => "second_round_thinking",
                    _ => "nth_round_thinking",
                };
                self.fill(self.config.prompts.partial(partial), t)
            }
            "FEW_SHOT_MESSAGE" | "FEW_SHOTS" => String::new(),
            "WORD_LIMIT" | "WORD_LIMIT_REFINEMENT" => self.config.prompts.word_limit.to_string(),
            _ => return None,
        };
        Some(value)
    }

    fn fill(&self, content: &str, t: &Transcript) -> String {
        fill_placeholders(content, |name| self.placeholder(t, name))
    }

    pub fn construct_messages(&self, t: &Transcript) -> Vec<ChatMessage> {
        PromptTemplate::render(&self.config.prompts.messages, |name| {
            self.placeholder(t, name)
        })
    }

    // ── Argument handling ──────────────────────────────────────────────────

    /// Body of the `<argument>` tag. Non-strict mode wraps untagged text.
    pub fn extract_argument(&self, response: &str, strict: bool) -> Result<String, TurnError> {
        let mut response = response.to_string();
        for tag in ["v_quote", "u_quote"] {
            response = response
                .replace(&format!("<{tag}>"), "<quote>")
                .replace(&format!("</{tag}>"), "</quote>");
        }
        if !response.contains("<argument>") {
            if strict {
                return Err(TurnError::MissingTag { tag: "argument" });
            }
            response = format!("<argument>{response}</argument>");
        }
        let body = response
            .split("<argument>")
            .nth(1)
            .and_then(|rest| rest.split("</argument>").next())
            .unwrap_or_default();
        Ok(match self.config.quote_mode {
            Some(mode) => apply_quote_mode(body, mode),
            None => body.to_string(),
        })
    }

    /// Tagged argument containing a quote and within the word bounds.
    pub fn is_valid(&self, completion: &str) -> bool {
        if !completion.contains("<argument>") {
            return false;
        }
        let Ok(argument) = self.extract_argument(completion, true) else {
            return false;
        };
        if !argument.contains("<quote>") {
            return false;
        }
        let words = argument.split(' ').count();
        let lm = &self.config.language_model;
        words >= lm.min_words && words <= lm.max_words
    }

    fn truncate(&self, argument: &str) -> String {
        truncate(argument, self.config.language_model.max_words)
    }

    // ── Completions ────────────────────────────────────────────────────────

    async fn get_completion(&self, t: &Transcript) -> Result<Vec<String>, TurnError> {
        let messages = self.construct_messages(t);
        let bon = self.config.bon;
        if let Some(limit) = self.config.prompt_token_limit {
            let tokens = prompt::approx_token_count(&messages);
            if tokens > limit {
                warn!(
                    tokens,
                    limit,
                    side = %self.side,
                    "Prompt exceeds the debater's token limit, ending the round"
                );
                return Ok(vec![format!("<argument>{TOKEN_LIMIT_ARGUMENT}</argument>"); bon]);
            }
        }

        let request = self
            .config
            .language_model
            .request(Prompt::Chat(messages))
            .n(bon)
            .candidates_per_completion(self.config.language_model.num_candidates_per_completion)
            .shortfall(ShortfallPolicy::PadInvalids);
        let results = self
            .dispatcher
            .complete(&request, &|c| self.is_valid(c))
            .await?;
        let responses: Vec<String> = results
            .into_iter()
            .map(|r| r.completion.trim().to_string())
            .collect();
        check_count("responses", bon, responses.len())?;
        Ok(responses)
    }

    async fn get_refinements(
        &self,
        t: &Transcript,
        initial_response: &str,
        critique: &str,
    ) -> Result<Vec<String>, TurnError> {
        let mut messages = self.construct_messages(t);
        add_assistant_message(&mut messages, initial_response);
        messages.extend(PromptTemplate::render(
            &self.config.prompts.refinement_messages,
            |name| match name {
                "CRITIQUE" => Some(critique.to_string()),
                other => self.placeholder(t, other),
            },
        ));

        let bon = self.config.bon;
        let request = self
            .config
            .language_model
            .request(Prompt::Chat(messages))
            .n(bon)
            .candidates_per_completion(self.config.language_model.num_candidates_per_completion)
            .shortfall(ShortfallPolicy::PadInvalids);
        let is_valid = |c: &str| self.is_valid(c) && !c.to_lowercase().contains("critique");
        let results = self.dispatcher.complete(&request, &is_valid).await?;
        let refinements: Vec<String> = results
            .into_iter()
            .map(|r| r.completion.trim().to_string())
            .collect();
        check_count("refinements", bon, refinements.len())?;
        Ok(refinements)
    }

    async fn get_critique(
        &self,
        argument: &str,
        t: &Transcript,
        step: usize,
        store: &CheckpointStore,
        critic: &Judge,
        critique_pm: &Judge,
    ) -> Result<String, TurnError> {
        let cbon = self.config.cbon;
        let key = format!("critiques_{}", self.side);
        let critiques: Vec<String> = match store.get_as(step, &key) {
            Some(cached) => cached,
            None => {
                let critiques = critic.critiques(t, self.side, argument, cbon).await?;
                check_count("critiques", cbon, critiques.len())?;
                store.save(step, &key, &critiques)?;
                critiques
            }
        };
        check_count("critiques", cbon, critiques.len())?;

        let word_limit = critic.config().language_model.max_words;
        let chosen = if cbon > 1 {
            let ratings = try_join_all(critiques.iter().map(|c| {
                let truncated = truncate(c, word_limit);
                async move {
                    critique_pm
                        .rate_critique(t, self.side, argument, &truncated)
                        .await
                }
            }))
            .await?;
            select_best(&ratings).unwrap_or(0)
        } else {
            0
        };
        Ok(truncate(&critiques[chosen], word_limit))
    }

    /// Rate every response with `judge` and return the best plus a ranked listing.
    pub async fn judge_preference(
        &self,
        responses: &[String],
        t: &Transcript,
        judge: &Judge,
        strict: bool,
    ) -> Result<(String, String), TurnError> {
        let arguments = responses
            .iter()
            .map(|r| self.extract_argument(r, strict).map(|a| self.truncate(&a)))
            .collect::<Result<Vec<_>, _>>()?;
        let ratings = try_join_all(
            arguments
                .iter()
                .map(|a| judge.rate_argument(t, a, self.side, self.method)),
        )
        .await?;

        let best = select_best(&ratings).unwrap_or(0);
        let mut ranked: Vec<(f64, &String)> = ratings.iter().copied().zip(responses).collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        let listing = ranked
            .iter()
            .enumerate()
            .map(|(i, (rating, response))| {
                format!("{}. rating={rating}, response={response}\n=====================", i + 1)
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok((responses[best].clone(), listing))
    }

    // ── Turn ───────────────────────────────────────────────────────────────

    pub async fn take_turn(
        &self,
        t: &Transcript,
        step: usize,
        store: &CheckpointStore,
        judges: TurnJudges<'_>,
    ) -> Result<TurnOutput, TurnError> {
        let bon = self.config.bon;
        let key = format!("responses_{}", self.side);
        let responses: Vec<String> = match store.get_as(step, &key) {
            Some(cached) => cached,
            None => {
                let responses = self.get_completion(t).await?;
                let invalid = responses
                    .iter()
                    .filter(|r| self.extract_argument(r, true).is_err())
                    .inspect(|r| warn!(side = %self.side, response = %r, "Response could not be extracted"))
                    .count();
                // Only cache a fully extractable batch so a rerun regenerates it.
                if invalid > 0 {
                    return Err(TurnError::ArgumentExtraction { count: invalid });
                }
                store.save(step, &key, &responses)?;
                responses
            }
        };
        check_count("responses", bon, responses.len())?;

        let (response, mut audit) = if bon > 1 {
            let judge = judges.bon.ok_or(TurnError::MissingJudge {
                role: "preference",
                setting: "BoN > 1",
            })?;
            self.judge_preference(&responses, t, judge, true).await?
        } else {
            (responses[0].clone(), responses[0].clone())
        };
        let mut argument = self.truncate(&self.extract_argument(&response, true)?);

        if self.config.cbon > 0 {
            let critic = judges.critic.ok_or(TurnError::MissingJudge {
                role: "critic",
                setting: "cBoN > 0",
            })?;
            let critique_pm = judges.critique_pm.ok_or(TurnError::MissingJudge {
                role: "critique preference",
                setting: "cBoN > 0",
            })?;
            let critique = self
                .get_critique(&argument, t, step, store, critic, critique_pm)
                .await?;

            let key = format!("refinement_{}", self.side);
            let refinements: Vec<String> = match store.get_as(step, &key) {
                Some(cached) => cached,
                None => {
                    let refinements = self.get_refinements(t, &response, &critique).await?;
                    store.save(step, &key, &refinements)?;
                    refinements
                }
            };

            let (refinement, refinements_audit) = if bon > 1 {
                let judge = judges.bon.ok_or(TurnError::MissingJudge {
                    role: "preference",
                    setting: "BoN > 1",
                })?;
                // Non-strict: refusals without tags still get rated.
                self.judge_preference(&refinements, t, judge, false).await?
            } else {
                let first = refinements.first().cloned().unwrap_or_default();
                (first.clone(), first)
            };

            if refinement.contains("<argument>") {
                argument = self.truncate(&self.extract_argument(&refinement, true)?);
            } else {
                warn!(
                    index = t.index,
                    side = %self.side,
                    refinement = %refinement,
                    "Refinement had no argument, keeping the original argument"
                );
            }
            let word_count = argument.split(' ').count();
            audit.push_str(&format!(
                "\n\nCritique:\n\n{critique}\n\nRefinements:{refinements_audit}\n\nFinal argument ({word_count} words):{argument}"
            ));
        }

        Ok(TurnOutput { argument, audit })
    }
}

fn check_count(what: &'static str, expected: usize, got: usize) -> Result<(), TurnError> {
    if expected == got {
        Ok(())
    } else {
        Err(TurnError::BudgetMismatch {
            what,
            expected,
            got,
        })
    }
}

/// Index of the first highest rating.
pub fn select_best(ratings: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, r) in ratings.iter().enumerate() {
        match best {
            Some(b) if ratings[b] >= *r => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Keep the first `word_limit` space-separated words without ending inside a quote.
///
/// A quote left open by the cut is extended to its closing tag (or closed
/// explicitly when the original never closes it), then the truncation marker
/// is appended.
pub fn truncate(argument: &str, word_limit: usize) -> String {
    let words: Vec<&str> = argument.split(' ').collect();
    if words.len() <= word_limit {
        return argument.to_string();
    }
    let mut cut = words[..word_limit].join(" ");
    let mut is_prefix = true;

    for tag in QUOTE_TAGS {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let Some(pos) = cut.rfind(&open) else {
            continue;
        };
        if cut[pos..].contains(&close) {
            continue;
        }
        let remainder = if is_prefix { &argument[cut.len()..] } else { "" };
        match remainder.find(&close) {
            Some(end) => cut.push_str(&remainder[..end + close.len()]),
            None => {
                cut.push_str(&close);
                is_prefix = false;
            }
        }
    }

    if cut.len() == argument.len() {
        cut
    } else {
        format!("{cut}{TRUNCATION_MARKER}")
    }
}

fn apply_quote_mode(argument: &str, mode: QuoteMode) -> String {
    let argument = argument.replace(['\u{201c}', '\u{201d}'], "\"");
    match mode {
        QuoteMode::Normal => argument,
        QuoteMode::None => {
            let stripped = DOUBLE_QUOTED.replace_all(&argument, "");
            MULTI_SPACE.replace_all(&stripped, " ").into_owned()
        }
        QuoteMode::Only => QUOTE_SPAN
            .find_iter(&argument)
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}
