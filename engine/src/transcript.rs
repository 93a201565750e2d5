//! Debate transcript: committed rounds plus a parallel list of raw responses.
//!
//! Rounds are append-then-patch: only the last round may be replaced, and
//! `rounds` and `responses` always have the same length.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const STEP_DURATIONS: &str = "step_durations";
const TOKEN_LIMIT_REACHED: &str = "token_limit_reached";

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("transcript json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transcript has {rounds} rounds but {responses} responses")]
    LengthMismatch { rounds: usize, responses: usize },

    #[error("transcript has no open round to patch")]
    NoOpenRound,
}

/// Which answer an agent defends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Correct,
    Incorrect,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::Incorrect => "incorrect",
        }
    }

    pub fn opponent(self) -> Self {
        match self {
            Self::Correct => Self::Incorrect,
            Self::Incorrect => Self::Correct,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A speaker's contribution: plain text, or a structured payload from elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Utterance {
    Text(String),
    Structured(Value),
}

impl Utterance {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Structured(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Structured(v) => v.is_null(),
        }
    }
}

impl fmt::Display for Utterance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Structured(v) => write!(f, "{v}"),
        }
    }
}

impl From<String> for Utterance {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Utterance {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundType {
    Sim,
    Seq,
}

/// One exchange: both debaters, an optional cross-examiner question and judge note.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Round {
    #[serde(default)]
    pub correct: Option<Utterance>,
    #[serde(default)]
    pub incorrect: Option<Utterance>,
    #[serde(default)]
    pub cross_examiner: Option<Utterance>,
    #[serde(default)]
    pub judge: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<RoundType>,
}

impl Round {
    pub fn new(kind: RoundType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn side(&self, side: Side) -> Option<&Utterance> {
        match side {
            Side::Correct => self.correct.as_ref(),
            Side::Incorrect => self.incorrect.as_ref(),
        }
    }

    pub fn set_side(&mut self, side: Side, utterance: impl Into<Utterance>) {
        let slot = match side {
            Side::Correct => &mut self.correct,
            Side::Incorrect => &mut self.incorrect,
        };
        *slot = Some(utterance.into());
    }

    /// True when no speaker has contributed yet.
    pub fn is_empty(&self) -> bool {
        self.correct.is_none()
            && self.incorrect.is_none()
            && self.cross_examiner.is_none()
            && self.judge.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answers {
    pub correct: String,
    pub incorrect: String,
}

impl Answers {
    pub fn get(&self, side: Side) -> &str {
        match side {
            Side::Correct => &self.correct,
            Side::Incorrect => &self.incorrect,
        }
    }
}

/// Display names, possibly swapped relative to the configured debaters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebaterNames {
    #[serde(default)]
    pub correct: Option<String>,
    #[serde(default)]
    pub incorrect: Option<String>,
    #[serde(default)]
    pub cross_examiner: Option<String>,
    #[serde(default)]
    pub judge: Option<String>,
}

impl DebaterNames {
    pub fn get(&self, side: Side) -> Option<&str> {
        match side {
            Side::Correct => self.correct.as_deref(),
            Side::Incorrect => self.incorrect.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub index: u64,
    pub question: String,
    #[serde(default)]
    pub question_set_id: Option<String>,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub story_title: Option<String>,
    pub answers: Answers,
    pub names: DebaterNames,
    pub swap: bool,
    #[serde(default)]
    pub rollout_type: Option<String>,
    #[serde(default)]
    rounds: Vec<Round>,
    #[serde(default, deserialize_with = "null_as_empty")]
    responses: Vec<Round>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Round>, D::Error> {
    Ok(Option::<Vec<Round>>::deserialize(d)?.unwrap_or_default())
}

impl Transcript {
    pub fn new(index: u64, question: impl Into<String>, answers: Answers, names: DebaterNames) -> Self {
        Self {
            index,
            question: question.into(),
            question_set_id: None,
            story: None,
            story_title: None,
            answers,
            names,
            swap: false,
            rollout_type: None,
            rounds: Vec::new(),
            responses: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn story(mut self, title: Option<String>, story: impl Into<String>) -> Self {
        self.story_title = title;
        self.story = Some(story.into());
        self
    }

    pub fn question_set_id(mut self, id: Option<String>) -> Self {
        self.question_set_id = id;
        self
    }

    pub fn swapped(mut self, swap: bool) -> Self {
        self.swap = swap;
        self
    }

    pub fn rollout_type(mut self, rollout_type: impl Into<String>) -> Self {
        self.rollout_type = Some(rollout_type.into());
        self
    }

    /// Parse and check the rounds/responses invariant.
    ///
    /// Transcripts produced elsewhere may carry no responses at all; those are
    /// given empty response rounds so later appends stay aligned.
    pub fn from_json(json: &str) -> Result<Self, TranscriptError> {
        let mut transcript: Self = serde_json::from_str(json)?;
        if transcript.responses.is_empty() {
            transcript.responses = transcript
                .rounds
                .iter()
                .map(|r| Round {
                    kind: r.kind,
                    ..Round::default()
                })
                .collect();
        }
        if transcript.rounds.len() != transcript.responses.len() {
            return Err(TranscriptError::LengthMismatch {
                rounds: transcript.rounds.len(),
                responses: transcript.responses.len(),
            });
        }
        Ok(transcript)
    }

    pub fn to_json(&self) -> Result<String, TranscriptError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    pub fn responses(&self) -> &[Round] {
        &self.responses
    }

    pub fn last_round(&self) -> Option<&Round> {
        self.rounds.last()
    }

    pub fn push_round(&mut self, round: Round, response: Round) {
        self.rounds.push(round);
        self.responses.push(response);
    }

    /// Replace the open (last) round and its response bundle.
    pub fn patch_last(&mut self, round: Round, response: Round) -> Result<(), TranscriptError> {
        match (self.rounds.last_mut(), self.responses.last_mut()) {
            (Some(r), Some(resp)) => {
                *r = round;
                *resp = response;
                Ok(())
            }
            _ => Err(TranscriptError::NoOpenRound),
        }
    }

    /// Mutable access to the open round, for judge-side rewrites of a private copy.
    pub fn last_round_mut(&mut self) -> Option<&mut Round> {
        self.rounds.last_mut()
    }

    pub fn rounds_mut(&mut self) -> impl Iterator<Item = &mut Round> {
        self.rounds.iter_mut()
    }

    /// Copy holding only the first `num_rounds` rounds.
    pub fn sliced(&self, num_rounds: usize) -> Self {
        let mut t = self.clone();
        t.rounds.truncate(num_rounds);
        t.responses.truncate(num_rounds);
        t
    }

    /// Option letter of `side`: the correct answer is A unless swapped.
    pub fn letter(&self, side: Side) -> &'static str {
        match (side, self.swap) {
            (Side::Correct, false) | (Side::Incorrect, true) => "A",
            _ => "B",
        }
    }

    pub fn answer(&self, side: Side) -> &str {
        self.answers.get(side)
    }

    pub fn answer_a(&self) -> &str {
        if self.swap {
            &self.answers.incorrect
        } else {
            &self.answers.correct
        }
    }

    pub fn answer_b(&self) -> &str {
        if self.swap {
            &self.answers.correct
        } else {
            &self.answers.incorrect
        }
    }

    pub fn name(&self, side: Side) -> Option<&str> {
        self.names.get(side)
    }

    /// Every argument `side` has made so far, in round order.
    pub fn arguments(&self, side: Side) -> Vec<&Utterance> {
        self.rounds.iter().filter_map(|r| r.side(side)).collect()
    }

    pub fn record_step_duration(&mut self, secs: f64) {
        let entry = self
            .extra
            .entry(STEP_DURATIONS)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(durations) = entry {
            durations.push(Value::from(secs));
        }
    }

    pub fn step_durations(&self) -> Vec<f64> {
        self.extra
            .get(STEP_DURATIONS)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default()
    }

    pub fn mark_token_limit_reached(&mut self) {
        self.extra.insert(TOKEN_LIMIT_REACHED.into(), Value::Bool(true));
    }

    pub fn token_limit_reached(&self) -> bool {
        self.extra
            .get(TOKEN_LIMIT_REACHED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
