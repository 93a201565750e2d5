//! Judge roles: argument/critique rating, critique writing, cross-examination,
//! and the final decision.
//!
//! One `Judge` type serves every role; the role is decided by which prompt
//! template it was configured with and which operation the caller invokes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::prompt::{self, PromptTemplate};
use super::{LanguageModelConfig, Method, TurnError};
use crate::checkpoint::CheckpointStore;
use crate::llm::{
    ChatMessage, CompletionDispatcher, CompletionRequest, CompletionResult, DispatchError, Prompt,
    ShortfallPolicy, TokenLogprobs,
};
use crate::transcript::{Round, Side, Transcript, TranscriptError, Utterance};

/// Question asked when the transcript no longer fits the cross-examiner's model.
pub const CLOSING_QUESTION: &str = "Can you please write your closing arguments so I can decide?";

/// Opponent line used when rating one side's candidate in isolation.
const DUMMY_ARGUMENT: &str = "My answer is the best choice and my opponent is wrong.";

const TOP_LOGPROBS: u8 = 5;
const MISSING_LOGPROB: f64 = -100.0;
const QUESTION_CACHE_KEY: &str = "response_judge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub language_model: LanguageModelConfig,
    #[serde(default = "PromptTemplate::judge")]
    pub prompts: PromptTemplate,
    /// Decide from A/B log-probabilities instead of free text.
    #[serde(default)]
    pub use_logprobs: bool,
    #[serde(default)]
    pub prompt_token_limit: Option<u64>,
}

impl JudgeConfig {
    pub fn new(language_model: LanguageModelConfig, prompts: PromptTemplate) -> Self {
        Self {
            language_model,
            prompts,
            use_logprobs: false,
            prompt_token_limit: None,
        }
    }
}

/// Final judgement over a (possibly swapped and sliced) transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub judgement: String,
    pub transcript: Transcript,
}

pub struct Judge {
    method: Method,
    config: JudgeConfig,
    dispatcher: Arc<CompletionDispatcher>,
}

impl Judge {
    pub fn new(method: Method, config: JudgeConfig, dispatcher: Arc<CompletionDispatcher>) -> Self {
        Self {
            method,
            config,
            dispatcher,
        }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    // ── Prompt construction ────────────────────────────────────────────────

    fn placeholder(&self, t: &Transcript, name: &str) -> Option<String> {
        let consultant = if t.names.correct.is_some() {
            Side::Correct
        } else {
            Side::Incorrect
        };
        let value = match name {
            "QUESTION" => t.question.clone(),
            "ANSWER_A" => t.answer_a().to_string(),
            "ANSWER_B" => t.answer_b().to_string(),
            "NAME_A" => "Debater A".to_string(),
            "NAME_B" => "Debater B".to_string(),
            "TRANSCRIPT" => prompt::render_for_judge(t),
            "STORY" => t.story.clone().unwrap_or_default(),
            "CONSULTANT_ANSWER" => t.answer(consultant).to_string(),
            "CONSULTANT_ANSWER_LETTER" => t.letter(consultant).to_string(),
            "CONSULTANT_ANSWER_OPPOSING" => t.answer(consultant.opponent()).to_string(),
            "CONSULTANT_ANSWER_OPPOSING_LETTER" => t.letter(consultant.opponent()).to_string(),
            "ANSWER_CORRECT" => t.answers.correct.clone(),
            "ANSWER_INCORRECT" => t.answers.incorrect.clone(),
            "FEW_SHOT_MESSAGE" => String::new(),
            "WORD_LIMIT" => self.config.prompts.word_limit.to_string(),
            _ => return None,
        };
        Some(value)
    }

    pub fn construct_messages(&self, t: &Transcript) -> Vec<ChatMessage> {
        PromptTemplate::render(&self.config.prompts.messages, |name| {
            self.placeholder(t, name)
        })
    }

    /// Critic prompt over `t` with its open round replaced by `side`'s argument alone.
    fn critique_messages(
        &self,
        t: &Transcript,
        side: Side,
        argument: &str,
        critique: Option<&str>,
    ) -> Result<Vec<ChatMessage>, TurnError> {
        let mut view = t.clone();
        let open = view.last_round_mut().ok_or(TranscriptError::NoOpenRound)?;
        let mut round = Round::default();
        round.set_side(side, argument);
        *open = round;

        let round_specific = match t.rounds().len() {
            1 => "first_round",
            2 => "second_round",
            _ => "nth_round",
        };
        let lookup = |name: &str| match name {
            "NAME" => Some(t.name(side).unwrap_or_default().trim().to_string()),
            "ANSWER" => Some(t.answer(side).trim().to_string()),
            "LETTER" => Some(t.letter(side).to_string()),
            "OTHER_LETTER" => Some(t.letter(side.opponent()).to_string()),
            "ROUND_SPECIFIC" => Some(self.config.prompts.partial(round_specific).trim().to_string()),
            "CRITIQUE" => critique.map(|c| c.trim().to_string()),
            other => self.placeholder(&view, other),
        };
        Ok(PromptTemplate::render(&self.config.prompts.messages, lookup))
    }

    fn logprob_request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        let lm = &self.config.language_model;
        lm.request(Prompt::Chat(messages))
            .params(lm.sampling().logprobs(TOP_LOGPROBS))
            .n(1)
            .shortfall(ShortfallPolicy::Error)
    }

    async fn complete_with_logprobs(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<CompletionResult, TurnError> {
        let request = self.logprob_request(messages);
        let mut results = self.dispatcher.complete(&request, &|_| true).await?;
        match results.pop() {
            Some(result) if results.is_empty() => Ok(result),
            _ => Err(DispatchError::InsufficientValidCompletions {
                valid: 0,
                candidates: request.num_candidates(),
            }
            .into()),
        }
    }

    // ── Ratings ────────────────────────────────────────────────────────────

    /// Probability that `side` wins if `argument` were its latest turn.
    pub async fn rate_argument(
        &self,
        t: &Transcript,
        argument: &str,
        side: Side,
        method: Method,
    ) -> Result<f64, TurnError> {
        let mut view = t.clone();
        let open = view.last_round_mut().ok_or(TranscriptError::NoOpenRound)?;
        match method {
            Method::Debate => {
                open.set_side(side, argument);
                open.set_side(side.opponent(), DUMMY_ARGUMENT);
            }
            Method::Consultancy => open.set_side(side, argument),
        }

        let result = self
            .complete_with_logprobs(self.construct_messages(&view))
            .await?;
        let tokens = [view.letter(side), view.letter(side.opponent())];
        let (rating, _, _) = convert_to_prob(result.first_logprobs(), tokens);
        Ok(rating.exp())
    }

    /// `n` critiques of `side`'s candidate argument.
    pub async fn critiques(
        &self,
        t: &Transcript,
        side: Side,
        argument: &str,
        n: usize,
    ) -> Result<Vec<String>, TurnError> {
        let messages = self.critique_messages(t, side, argument, None)?;
        let request = self
            .config
            .language_model
            .request(Prompt::Chat(messages))
            .n(n)
            .shortfall(ShortfallPolicy::Error);
        let critiques: Vec<String> = self
            .dispatcher
            .complete(&request, &|_| true)
            .await?
            .into_iter()
            .map(|r| extract_tag(r.completion.trim(), "critique").unwrap_or(r.completion.trim()).to_string())
            .collect();
        if critiques.len() != n {
            return Err(TurnError::BudgetMismatch {
                what: "critiques",
                expected: n,
                got: critiques.len(),
            });
        }
        Ok(critiques)
    }

    /// Probability that `critique` helps `side` improve `argument`.
    pub async fn rate_critique(
        &self,
        t: &Transcript,
        side: Side,
        argument: &str,
        critique: &str,
    ) -> Result<f64, TurnError> {
        let messages = self.critique_messages(t, side, argument, Some(critique))?;
        let result = self.complete_with_logprobs(messages).await?;
        let (rating, _, _) = convert_to_prob(result.first_logprobs(), ["Y", "N"]);
        Ok(rating.exp())
    }

    // ── Cross-examination ──────────────────────────────────────────────────

    pub async fn ask_question(&self, t: &Transcript) -> Result<String, TurnError> {
        let messages = self.construct_messages(t);
        if let Some(limit) = self.config.prompt_token_limit {
            let tokens = prompt::approx_token_count(&messages);
            if tokens > limit {
                warn!(
                    tokens,
                    limit,
                    question = CLOSING_QUESTION,
                    "Prompt doesn't fit the cross-examiner, using the closing question"
                );
                return Ok(CLOSING_QUESTION.to_string());
            }
        }
        let request = self.config.language_model.request(Prompt::Chat(messages));
        Ok(self.dispatcher.complete_single(&request, &|_| true).await?)
    }

    /// Question for the open round and the raw response it came from.
    pub async fn take_turn(
        &self,
        t: &Transcript,
        step: usize,
        store: &CheckpointStore,
    ) -> Result<(String, String), TurnError> {
        let response = match store.get_as::<String>(step, QUESTION_CACHE_KEY) {
            Some(cached) => cached,
            None => {
                let response = self.ask_question(t).await?;
                store.save(step, QUESTION_CACHE_KEY, &response)?;
                response
            }
        };
        let question = extract_tag(&response, "question")
            .unwrap_or(&response)
            .trim()
            .to_string();
        Ok((question, response))
    }

    // ── Decision ───────────────────────────────────────────────────────────

    /// Present the answers in B/A order: swap names and the cross-examiner's
    /// references to them.
    pub fn swap_transcript(&self, t: &Transcript) -> Transcript {
        let mut swapped = t.clone();
        if self.method == Method::Debate {
            swapped.names.correct = t.names.incorrect.clone();
            swapped.names.incorrect = t.names.correct.clone();
        }
        swapped.swap = true;

        if let (Some(correct), Some(incorrect)) = (&t.names.correct, &t.names.incorrect) {
            for round in swapped.rounds_mut() {
                if let Some(Utterance::Text(text)) = &mut round.cross_examiner {
                    *text = text
                        .replace(correct.as_str(), "<TEMP>")
                        .replace(incorrect.as_str(), correct)
                        .replace("<TEMP>", incorrect);
                }
            }
        }
        swapped
    }

    /// Bring `t` into the requested orientation.
    pub fn maybe_swap(&self, t: Transcript, swap: bool) -> Result<Transcript, TurnError> {
        match (swap, t.swap) {
            (true, false) => {
                let sequential = t.rollout_type.as_deref().is_some_and(|r| r.contains("seq"));
                if sequential {
                    return Err(TurnError::SwapMismatch(
                        "sequential rollouts must be swapped at rollout time",
                    ));
                }
                Ok(self.swap_transcript(&t))
            }
            (true, true) => {
                debug!(index = t.index, "Transcript already swapped");
                Ok(t)
            }
            (false, true) => Err(TurnError::SwapMismatch("expected an unswapped transcript")),
            (false, false) => Ok(t),
        }
    }

    pub async fn decide(
        &self,
        t: Transcript,
        swap: bool,
        round_limit: Option<usize>,
    ) -> Result<Decision, TurnError> {
        let mut transcript = self.maybe_swap(t, swap)?;
        if let Some(limit) = round_limit {
            transcript = transcript.sliced(limit);
        }
        let messages = self.construct_messages(&transcript);

        let judgement = if self.config.use_logprobs {
            let result = self.complete_with_logprobs(messages).await?;
            let (_, logit_a, logit_b) = convert_to_prob(result.first_logprobs(), ["A", "B"]);
            let [prob_a, prob_b] = softmax([logit_a, logit_b]);
            let answer = if logit_a > logit_b { "A" } else { "B" };
            format!(
                "Logit A: {logit_a}, Logit B: {logit_b}, Prob A: {prob_a:.4}, Prob B: {prob_b:.4}\nAnswer: {answer}"
            )
        } else {
            let request = self.config.language_model.request(Prompt::Chat(messages));
            self.dispatcher.complete_single(&request, &|_| true).await?
        };
        Ok(Decision {
            judgement,
            transcript,
        })
    }
}

/// Body of the first `<tag>…</tag>` span; runs to the end when unclosed.
fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let (_, rest) = text.split_once(&open)?;
    Some(rest.split(&close).next().unwrap_or(rest))
}

/// Rating and both logits for `tokens` from the first generated position.
///
/// Missing tokens get a logprob of -100.
pub fn convert_to_prob(logprobs: Option<&TokenLogprobs>, tokens: [&str; 2]) -> (f64, f64, f64) {
    let lookup = |token: &str| logprobs.and_then(|l| l.get(token)).copied();
    let first = lookup(tokens[0]);
    if first.is_none() {
        warn!(token = tokens[0], "Missing token in logprobs, setting rating to -100");
    }
    let logit1 = first.unwrap_or(MISSING_LOGPROB);
    let logit2 = lookup(tokens[1]).unwrap_or(MISSING_LOGPROB);
    (logit1, logit1, logit2)
}

pub fn softmax(logits: [f64; 2]) -> [f64; 2] {
    let max = logits[0].max(logits[1]);
    let exps = logits.map(|l| (l - max).exp());
    let total: f64 = exps.iter().sum();
    exps.map(|e| e / total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelCatalog;
    use crate::transcript::{Answers, DebaterNames, RoundType};

    fn judge(method: Method) -> Judge {
        let dispatcher = Arc::new(CompletionDispatcher::new(Arc::new(ModelCatalog::new())));
        let config = JudgeConfig::new(LanguageModelConfig::new("gpt-4"), PromptTemplate::judge());
        Judge::new(method, config, dispatcher)
    }

    fn transcript() -> Transcript {
        let mut t = Transcript::new(
            1,
            "Who left?",
            Answers {
                correct: "Ann".into(),
                incorrect: "Ben".into(),
            },
            DebaterNames {
                correct: Some("Debater A".into()),
                incorrect: Some("Debater B".into()),
                cross_examiner: Some("Judge".into()),
                judge: None,
            },
        )
        .rollout_type("quality_sim");
        let mut round = Round::new(RoundType::Sim);
        round.set_side(Side::Correct, "a1");
        round.set_side(Side::Incorrect, "b1");
        round.cross_examiner = Some("Debater A, why does Debater B disagree?".into());
        t.push_round(round, Round::new(RoundType::Sim));
        t
    }

    #[test]
    fn test_swap_transcript_swaps_names_and_questions() {
        let t = transcript();
        let swapped = judge(Method::Debate).swap_transcript(&t);
        assert!(swapped.swap);
        assert_eq!(swapped.names.correct.as_deref(), Some("Debater B"));
        assert_eq!(swapped.names.incorrect.as_deref(), Some("Debater A"));
        assert_eq!(
            swapped.rounds()[0].cross_examiner.as_ref().map(ToString::to_string),
            Some("Debater B, why does Debater A disagree?".to_string())
        );
        assert_eq!(swapped.answer_a(), "Ben");
    }

    #[test]
    fn test_consultancy_swap_keeps_names() {
        let mut t = transcript();
        t.names.incorrect = None;
        let swapped = judge(Method::Consultancy).swap_transcript(&t);
        assert_eq!(swapped.names.correct.as_deref(), Some("Debater A"));
        assert!(swapped.swap);
    }

    #[test]
    fn test_maybe_swap_rejects_mismatches() {
        let j = judge(Method::Debate);
        assert!(j.maybe_swap(transcript(), true).unwrap().swap);
        assert!(!j.maybe_swap(transcript(), false).unwrap().swap);

        let seq = transcript().rollout_type("quality_seq");
        assert!(matches!(j.maybe_swap(seq, true), Err(TurnError::SwapMismatch(_))));

        let already = transcript().swapped(true);
        assert!(matches!(j.maybe_swap(already.clone(), false), Err(TurnError::SwapMismatch(_))));
        assert!(j.maybe_swap(already, true).unwrap().swap);
    }

    #[test]
    fn test_convert_to_prob_missing_tokens() {
        let logprobs = TokenLogprobs::from([("A".to_string(), -0.1), ("C".to_string(), -3.0)]);
        assert_eq!(convert_to_prob(Some(&logprobs), ["A", "B"]), (-0.1, -0.1, -100.0));
        assert_eq!(convert_to_prob(Some(&logprobs), ["B", "A"]), (-100.0, -100.0, -0.1));
        assert_eq!(convert_to_prob(None, ["Y", "N"]), (-100.0, -100.0, -100.0));
    }

    #[test]
    fn test_softmax_normalizes() {
        let [a, b] = softmax([0.0, 0.0]);
        assert!((a - 0.5).abs() < 1e-12 && (b - 0.5).abs() < 1e-12);
        let [a, b] = softmax([-0.1, -100.0]);
        assert!(a > 0.999 && (a + b - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_extract_tag() {
        assert_eq!(extract_tag("x <question> why? </question> y", "question"), Some(" why? "));
        assert_eq!(extract_tag("<critique>open", "critique"), Some("open"));
        assert_eq!(extract_tag("plain", "critique"), None);
    }

    #[test]
    fn test_critique_messages_fill_side_tags() {
        let mut config = JudgeConfig::new(LanguageModelConfig::new("gpt-4"), PromptTemplate::critic());
        config.prompts.partials.insert("first_round".into(), "  OPENING  ".into());
        let dispatcher = Arc::new(CompletionDispatcher::new(Arc::new(ModelCatalog::new())));
        let critic = Judge::new(Method::Debate, config, dispatcher);

        let mut t = transcript();
        t.patch_last(Round::new(RoundType::Sim), Round::new(RoundType::Sim))
            .unwrap();
        let messages = critic
            .critique_messages(&t, Side::Incorrect, "my <quote>case</quote>", None)
            .unwrap();
        let text: String = messages.iter().map(|m| m.content.as_str()).collect();
        assert!(text.contains("Debater B, who argues for B: \"Ben\""));
        assert!(text.contains("against A"));
        assert!(text.contains("OPENING\n"));
        assert!(text.contains("Debater B: \"\"\"my <quote>case</quote>\"\"\""));
    }

    #[test]
    fn test_consultant_placeholders() {
        let j = judge(Method::Consultancy);
        let mut t = transcript();
        t.names.correct = None;
        assert_eq!(j.placeholder(&t, "CONSULTANT_ANSWER").as_deref(), Some("Ben"));
        assert_eq!(j.placeholder(&t, "CONSULTANT_ANSWER_LETTER").as_deref(), Some("B"));
        assert_eq!(j.placeholder(&t.clone().swapped(true), "CONSULTANT_ANSWER_LETTER").as_deref(), Some("A"));
        assert_eq!(j.placeholder(&t, "UNKNOWN"), None);
    }
}
